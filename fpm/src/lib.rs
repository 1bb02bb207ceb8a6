// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A gateway for the Forwarding Plane Manager (FPM) protocol. Routing
//! daemons connect over TCP and stream route add/delete notifications; the
//! gateway reconciles them into a cluster-wide routing table, treating each
//! daemon as a passive source of forwarding intent.

pub mod clock;
pub mod config;
pub mod connection;
pub mod connection_tcp;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod messages;
pub mod session;
pub mod types;

#[cfg(test)]
pub mod connection_channel;


/// The well-known FPM port.
pub const FPM_PORT: u16 = 2620;

/// Default seconds of peer silence tolerated before a keepalive-capable
/// session is closed.
pub const DEFAULT_IDLE_HOLD_TIME: u64 = 5;

/// Poll interval for socket reads and listener accepts.
pub const IO_TIMEOUT: std::time::Duration =
    std::time::Duration::from_millis(100);

/// Fold IPv4-mapped IPv6 addresses down to IPv4 so a daemon connecting over
/// a dual-stack socket gets the same peer identity either way.
pub fn to_canonical(addr: std::net::IpAddr) -> std::net::IpAddr {
    match addr {
        std::net::IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => std::net::IpAddr::V4(v4),
            None => addr,
        },
        std::net::IpAddr::V4(_) => addr,
    }
}
