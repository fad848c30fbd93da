//! Ephemeral TCP port reservations for concurrently running servers.
//!
//! A port is free when nothing accepts a connection on it *and* no other
//! live reservation in this process holds it, even one whose server has not
//! bound yet.

use std::collections::BTreeSet;
use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::error::{HarnessError, HarnessResult};

/// First port probed when the caller has no preference.
pub const DEFAULT_START_PORT: u16 = 53589;

const PROBE_TIMEOUT: Duration = Duration::from_millis(250);

/// A port held by this harness process until released.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct PortReservation {
    pub address: String,
    pub port: u16,
}

impl std::fmt::Display for PortReservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// Lock-protected registry of reserved ports. Share it by reference (or
/// `Arc`) between every server instance that may run in parallel.
#[derive(Debug, Default)]
pub struct PortAllocator {
    reserved: Mutex<BTreeSet<u16>>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the first port at or above `start` that is neither accepting
    /// connections on `address` nor already reserved.
    pub fn reserve(&self, address: &str, start: u16) -> HarnessResult<PortReservation> {
        for port in start..=u16::MAX {
            if self.is_reserved(port) {
                continue;
            }
            if port_in_use(address, port)? {
                continue;
            }
            // Another thread may have claimed it while we were probing.
            if self.lock().insert(port) {
                debug!(address, port, "port reserved");
                return Ok(PortReservation {
                    address: address.to_string(),
                    port,
                });
            }
        }

        Err(HarnessError::NoPortAvailable {
            address: address.to_string(),
            start,
        })
    }

    /// Forget a reservation. Releasing an unheld port is a no-op.
    pub fn release(&self, reservation: &PortReservation) {
        if self.lock().remove(&reservation.port) {
            debug!(port = reservation.port, "port released");
        }
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.lock().contains(&port)
    }

    /// Snapshot of the ports currently held.
    pub fn reserved_ports(&self) -> Vec<u16> {
        self.lock().iter().copied().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeSet<u16>> {
        self.reserved.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// True if something accepts TCP connections on `address:port`.
///
/// The address is resolved to at most one IPv6 and one IPv4 candidate;
/// IPv6 is tried first.
pub fn port_in_use(address: &str, port: u16) -> io::Result<bool> {
    let candidates: Vec<SocketAddr> = (address, port).to_socket_addrs()?.collect();
    let v6 = candidates.iter().find(|addr| addr.is_ipv6());
    let v4 = candidates.iter().find(|addr| addr.is_ipv4());

    Ok([v6, v4]
        .into_iter()
        .flatten()
        .any(|addr| TcpStream::connect_timeout(addr, PROBE_TIMEOUT).is_ok()))
}
