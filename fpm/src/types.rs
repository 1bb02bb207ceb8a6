// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::error::Error;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::{self, Display, Formatter};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

/// The identity of the cluster node this gateway instance runs on. Stamped
/// into every route the gateway creates so other nodes can attribute route
/// state to its origin.
#[derive(
    Debug,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A remote routing daemon, identified by the source address of its FPM
/// session. Two connections from the same daemon process but different
/// source ports are distinct peers.
#[derive(
    Debug,
    Copy,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
)]
pub struct Peer {
    pub ip: IpAddr,
    pub port: u16,
}

impl From<SocketAddr> for Peer {
    fn from(sa: SocketAddr) -> Peer {
        Peer {
            ip: crate::to_canonical(sa.ip()),
            port: sa.port(),
        }
    }
}

impl Display for Peer {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// One admitted FPM session for a peer. These records are shared through the
/// peer registry so every cluster node can see which node holds a given
/// peer's session.
#[derive(
    Debug,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Serialize,
    Deserialize,
    JsonSchema,
)]
pub struct ConnectionInfo {
    /// The cluster node that accepted the session.
    pub node: NodeId,

    /// The peer the session belongs to.
    pub peer: Peer,

    /// When the session was admitted.
    pub connected_at: DateTime<Utc>,
}

/// An IPv4 destination prefix. Host bits are zeroed on construction so two
/// prefixes covering the same network always compare equal.
#[derive(
    Debug,
    Copy,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
)]
pub struct Prefix4 {
    pub value: Ipv4Addr,
    pub length: u8,
}

impl Prefix4 {
    const HOST_MASK: u8 = 32;

    pub fn new(ip: Ipv4Addr, length: u8) -> Self {
        let mut new = Self {
            value: ip,
            length: length.min(Self::HOST_MASK),
        };
        new.unset_host_bits();
        new
    }

    fn unset_host_bits(&mut self) {
        let host_bits = u32::from(Self::HOST_MASK - self.length);
        let mask = if host_bits >= 32 {
            0
        } else {
            u32::MAX << host_bits
        };
        self.value = Ipv4Addr::from(u32::from(self.value) & mask);
    }
}

impl Display for Prefix4 {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.value, self.length)
    }
}

impl FromStr for Prefix4 {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (value, length) = s
            .split_once('/')
            .ok_or_else(|| Error::InvalidAddress(s.to_string()))?;
        let value: Ipv4Addr = value
            .parse()
            .map_err(|_| Error::InvalidAddress(s.to_string()))?;
        let length: u8 = length
            .parse()
            .map_err(|_| Error::InvalidAddress(s.to_string()))?;
        if length > Self::HOST_MASK {
            return Err(Error::InvalidAddress(s.to_string()));
        }
        Ok(Self::new(value, length))
    }
}

/// Where a route came from. This gateway only ever creates FPM routes, but
/// the tag travels with the route so the routing-table service can tell FPM
/// state apart from other contributors.
#[derive(
    Debug,
    Copy,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Serialize,
    Deserialize,
    JsonSchema,
)]
pub enum RouteSource {
    Fpm,
}

impl Display for RouteSource {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            RouteSource::Fpm => write!(f, "fpm"),
        }
    }
}

/// A forwarding entry as mirrored into the routing-table service. Built
/// fresh for every translation, never mutated.
#[derive(
    Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize, JsonSchema,
)]
pub struct Route {
    pub source: RouteSource,
    pub prefix: Prefix4,
    pub nexthop: Ipv4Addr,
    pub node: NodeId,
}

impl Route {
    pub fn fpm(prefix: Prefix4, nexthop: Ipv4Addr, node: NodeId) -> Self {
        Self {
            source: RouteSource::Fpm,
            prefix,
            nexthop,
            node,
        }
    }
}

impl Display for Route {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} via {} on {}",
            self.source, self.prefix, self.nexthop, self.node
        )
    }
}

/// Administrative view of one peer: its registry entries plus the number of
/// routes held in the local route table. Computed on demand, never stored.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PeerSummary {
    pub connections: BTreeSet<ConnectionInfo>,

    /// Number of routes this node holds for the peer. Zero when the peer's
    /// session lives on another node.
    pub route_count: usize,
}
