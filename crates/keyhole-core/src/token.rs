//! Random identifiers: entrance tokens and data-channel quids.
//!
//! Entrance tokens are single-use admission credentials minted by the
//! server and redeemed once at socket upgrade; 256 bits of OS randomness,
//! hex-encoded. Quids identify one data-channel session within a tunnel;
//! 128 bits is plenty for server-side uniqueness.

use ring::rand::{SecureRandom, SystemRandom};

/// Mint a single-use entrance token (64 hex chars).
pub fn entrance_token() -> String {
    random_hex(32)
}

/// Mint a data-channel session id (32 hex chars).
pub fn mint_quid() -> String {
    random_hex(16)
}

fn random_hex(bytes: usize) -> String {
    let rng = SystemRandom::new();
    let mut buf = vec![0u8; bytes];
    rng.fill(&mut buf).expect("RNG failure");
    hex::encode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_shape() {
        let t = entrance_token();
        assert_eq!(t.len(), 64);
        assert!(t.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn tokens_are_unique() {
        let a = entrance_token();
        let b = entrance_token();
        assert_ne!(a, b);
    }

    #[test]
    fn quid_shape() {
        let q = mint_quid();
        assert_eq!(q.len(), 32);
        assert!(q.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
