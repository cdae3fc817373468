// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Port and channel allocation.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::net::TcpListener;
use thiserror::Error;

/// The device cannot host a dedicated test channel.
///
/// Signals a skip rather than a failure: the environment is too small for
/// the test, not broken.
#[derive(Debug, Error)]
#[error("at least 2 combined channels required, device has {0}")]
pub struct InsufficientChannels(pub u32);

/// How the device's combined channels are divided for a test run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelPlan {
    /// Combined channel count reported by the device.
    pub combined: u32,
    /// The channel reserved exclusively for the test flow.
    ///
    /// Default steering is restricted to the remaining channels, so traffic
    /// arriving here is only ever the test's.
    pub dedicated: u32,
}

impl ChannelPlan {
    /// Plans channel use for a device with `combined` combined channels.
    ///
    /// The last channel is dedicated to the test; at least one other must be
    /// left for default steering.
    pub fn new(combined: u32) -> Result<Self, InsufficientChannels> {
        if combined < 2 {
            return Err(InsufficientChannels(combined));
        }
        Ok(Self {
            combined,
            dedicated: combined - 1,
        })
    }
}

/// Ports currently leased to scenarios in this process.
static CLAIMED_PORTS: Mutex<BTreeSet<u16>> = Mutex::new(BTreeSet::new());

/// A transport port reserved for one scenario.
///
/// The claim is released when the lease drops.
#[derive(Debug)]
pub struct PortLease(u16);

impl PortLease {
    /// The reserved port number.
    pub fn port(&self) -> u16 {
        self.0
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        CLAIMED_PORTS.lock().remove(&self.0);
    }
}

/// Reserves a TCP port that is currently unused on this machine and not
/// leased to any other scenario in this process.
pub fn reserve_port() -> std::io::Result<PortLease> {
    loop {
        // Let the kernel pick a free ephemeral port, then release the socket
        // and keep only the number.
        let listener = TcpListener::bind(("::", 0))?;
        let port = listener.local_addr()?.port();
        drop(listener);
        if CLAIMED_PORTS.lock().insert(port) {
            tracing::debug!(port, "reserved port");
            return Ok(PortLease(port));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::reserve_port;
    use super::ChannelPlan;
    use super::CLAIMED_PORTS;

    #[test]
    fn last_channel_is_dedicated() {
        let plan = ChannelPlan::new(4).unwrap();
        assert_eq!(plan.combined, 4);
        assert_eq!(plan.dedicated, 3);
    }

    #[test]
    fn two_channels_is_the_minimum() {
        assert_eq!(ChannelPlan::new(2).unwrap().dedicated, 1);
        assert!(ChannelPlan::new(1).is_err());
        assert!(ChannelPlan::new(0).is_err());
    }

    #[test]
    fn concurrent_leases_never_share_a_port() {
        let a = reserve_port().unwrap();
        let b = reserve_port().unwrap();
        assert_ne!(a.port(), b.port());
        assert!(CLAIMED_PORTS.lock().contains(&a.port()));
        assert!(CLAIMED_PORTS.lock().contains(&b.port()));
    }

    #[test]
    fn dropping_a_lease_releases_the_claim() {
        let lease = reserve_port().unwrap();
        let port = lease.port();
        drop(lease);
        assert!(!CLAIMED_PORTS.lock().contains(&port));
    }
}
