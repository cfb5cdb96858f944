//! Single-owner server state: live gateways, authorized entrance tokens,
//! and leased ports.
//!
//! Everything sits behind one mutex so token issuance and consumption are
//! linearizable: a token inserted here is visible to every subsequent
//! upgrade check, and removal is atomic with acceptance. Nothing outside
//! the server mutates this state.

use crate::gateway::Gateway;
use keyhole_core::{TunnelError, TunnelResult};
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// A reserved slot and port, produced by [`Registry::lease`].
///
/// Must be settled with [`Registry::commit`] or [`Registry::abort`];
/// dropping it on the floor leaks the reservation.
#[must_use]
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    ephemeral: bool,
}

impl PortLease {
    /// The port to bind; `0` requests an OS-assigned port.
    pub fn port(&self) -> u16 {
        self.port
    }
}

struct Inner {
    /// Live gateways keyed by their entrance token.
    gateways: HashMap<String, Arc<Gateway>>,
    /// Tokens that may still be redeemed at upgrade.
    authorized: HashSet<String>,
    /// Ports currently leased to gateways.
    used_ports: HashSet<u16>,
    /// Gateways mid-creation; counted against the cap so concurrent
    /// creations cannot overshoot it.
    in_flight: usize,
}

pub struct Registry {
    max_tunnels: usize,
    port_min: Option<u16>,
    port_max: u16,
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new(max_tunnels: usize, port_min: Option<u16>, port_max: u16) -> Self {
        Self {
            max_tunnels,
            port_min,
            port_max,
            inner: Mutex::new(Inner {
                gateways: HashMap::new(),
                authorized: HashSet::new(),
                used_ports: HashSet::new(),
                in_flight: 0,
            }),
        }
    }

    /// Reserve a gateway slot and a port.
    ///
    /// Uniform random choice from the free subset of the configured range;
    /// with no lower bound configured, an ephemeral port is requested
    /// instead. Fails with [`TunnelError::TunnelsExhausted`] at the cap and
    /// [`TunnelError::NoFreePort`] when the range is saturated.
    pub fn lease(&self) -> TunnelResult<PortLease> {
        let mut inner = self.lock();
        if inner.gateways.len() + inner.in_flight >= self.max_tunnels {
            return Err(TunnelError::TunnelsExhausted);
        }

        let lease = match self.port_min {
            None => PortLease {
                port: 0,
                ephemeral: true,
            },
            Some(min) => {
                let free: Vec<u16> = (min..=self.port_max)
                    .filter(|p| !inner.used_ports.contains(p))
                    .collect();
                let port = *free
                    .choose(&mut rand::thread_rng())
                    .ok_or(TunnelError::NoFreePort)?;
                inner.used_ports.insert(port);
                PortLease {
                    port,
                    ephemeral: false,
                }
            }
        };

        inner.in_flight += 1;
        Ok(lease)
    }

    /// Record an opened gateway under its token and authorize the token.
    ///
    /// Returns `true` when this commit reaches the gateway cap (the caller
    /// emits `locked`).
    pub fn commit(&self, lease: PortLease, gateway: Arc<Gateway>) -> bool {
        let mut inner = self.lock();
        inner.in_flight -= 1;
        if lease.ephemeral {
            inner.used_ports.insert(gateway.port());
        }
        inner.authorized.insert(gateway.token().to_string());
        inner.gateways.insert(gateway.token().to_string(), gateway);
        inner.gateways.len() == self.max_tunnels
    }

    /// Roll back a lease whose gateway failed to open.
    pub fn abort(&self, lease: PortLease) {
        let mut inner = self.lock();
        inner.in_flight -= 1;
        if !lease.ephemeral {
            inner.used_ports.remove(&lease.port);
        }
    }

    /// Redeem an entrance token; one-shot.
    ///
    /// Called from inside the upgrade callback, so removal is atomic with
    /// acceptance.
    pub fn consume_token(&self, token: &str) -> bool {
        self.lock().authorized.remove(token)
    }

    pub fn gateway(&self, token: &str) -> Option<Arc<Gateway>> {
        self.lock().gateways.get(token).cloned()
    }

    /// Drop a gateway record and free its port.
    ///
    /// The token stays authorized if it was never redeemed: a later upgrade
    /// with it is accepted and then closed with `GATEWAY_CLOSED`. Returns
    /// the gateway (for the caller to close) and whether this release
    /// dropped the count below the cap (the caller emits `unlocked`).
    pub fn release(&self, token: &str) -> Option<(Arc<Gateway>, bool)> {
        let mut inner = self.lock();
        let was_at_cap = inner.gateways.len() == self.max_tunnels;
        let gateway = inner.gateways.remove(token)?;
        inner.used_ports.remove(&gateway.port());
        Some((gateway, was_at_cap))
    }

    pub fn live_gateways(&self) -> usize {
        self.lock().gateways.len()
    }

    /// Tokens of all live gateways.
    pub fn tokens(&self) -> Vec<String> {
        self.lock().gateways.keys().cloned().collect()
    }

    pub fn used_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.lock().used_ports.iter().copied().collect();
        ports.sort_unstable();
        ports
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Lock poisoning means a panic elsewhere; state is plain data.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
