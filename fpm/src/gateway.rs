// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The route reconciliation engine. Tracks, per connected peer, the routes
//! that peer has announced, translates add/delete messages into update and
//! withdraw batches against the routing-table service, and keeps the
//! cluster-wide peer registry current for admission control and disconnect
//! cleanup.

use crate::messages::{
    Message, MessageBody, RouteProtocol, RouteUpdateMessage, RtmType, AF_INET,
};
use crate::types::{ConnectionInfo, NodeId, Peer, PeerSummary, Prefix4, Route};
use chrono::Utc;
use gw_common::lock;
use slog::{debug, error, info, trace, warn, Logger};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// The routing-table service routes are mirrored into. Calls are fire and
/// forget: this subsystem consumes no return value and owns no retry.
/// Callers rely on the implementation applying a withdraw/update pair for
/// the same prefix in call order.
pub trait RouteSink: Send + Sync {
    fn update(&self, routes: Vec<Route>);
    fn withdraw(&self, routes: Vec<Route>);
}

/// The cluster-replicated record of which peers are connected and to which
/// node. Implementations must make `compute` atomic per key so two nodes
/// acting on the same peer cannot lose updates to each other.
pub trait PeerRegistry: Send + Sync {
    fn get(&self, peer: &Peer) -> Option<BTreeSet<ConnectionInfo>>;

    fn peers(&self) -> Vec<Peer>;

    /// Atomic read-modify-write of one peer's entry. The closure receives
    /// the current connection set, or `None` when the peer is unknown, and
    /// its return value replaces the entry; returning `None` removes the
    /// key entirely. No key may be left mapping to an empty set.
    fn compute(
        &self,
        peer: &Peer,
        f: &mut dyn FnMut(
            Option<BTreeSet<ConnectionInfo>>,
        ) -> Option<BTreeSet<ConnectionInfo>>,
    );
}

/// In-process registry used by tests and the standalone daemon. Cluster
/// deployments substitute an implementation backed by their replicated
/// key-value store.
#[derive(Default)]
pub struct MemRegistry {
    entries: Mutex<BTreeMap<Peer, BTreeSet<ConnectionInfo>>>,
}

impl MemRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PeerRegistry for MemRegistry {
    fn get(&self, peer: &Peer) -> Option<BTreeSet<ConnectionInfo>> {
        lock!(self.entries).get(peer).cloned()
    }

    fn peers(&self) -> Vec<Peer> {
        lock!(self.entries).keys().copied().collect()
    }

    fn compute(
        &self,
        peer: &Peer,
        f: &mut dyn FnMut(
            Option<BTreeSet<ConnectionInfo>>,
        ) -> Option<BTreeSet<ConnectionInfo>>,
    ) {
        let mut entries = lock!(self.entries);
        let current = entries.remove(peer);
        if let Some(next) = f(current) {
            entries.insert(*peer, next);
        }
    }
}

/// The session layer's view of the engine: admission, disconnect and
/// message delivery, implemented by one coordinator value.
pub trait FpmHandler: Send + Sync {
    /// Decide whether to admit a newly accepted connection from `peer`.
    /// On admission the peer becomes visible to the rest of the cluster.
    fn peer_connected(&self, peer: Peer) -> bool;

    /// The session for `peer` ended, for any reason.
    fn peer_disconnected(&self, peer: Peer);

    /// A protocol message arrived on `peer`'s session.
    fn fpm_message(&self, peer: Peer, message: Message);
}

pub struct Gateway {
    /// The identity stamped into every route this gateway creates.
    node: NodeId,

    /// Cluster-wide peer bookkeeping.
    registry: Arc<dyn PeerRegistry>,

    /// Where update and withdraw batches go.
    sink: Arc<dyn RouteSink>,

    /// Per-peer routes announced over the live sessions this node holds.
    /// Rebuilt from scratch whenever a peer reconnects here; never shared
    /// with other nodes.
    tables: Mutex<BTreeMap<Peer, BTreeMap<Prefix4, Route>>>,

    /// Withdraw a peer's routes when its session ends.
    clear_routes: AtomicBool,

    log: Logger,
}

impl Gateway {
    pub fn new(
        node: NodeId,
        registry: Arc<dyn PeerRegistry>,
        sink: Arc<dyn RouteSink>,
        clear_routes: bool,
        log: Logger,
    ) -> Gateway {
        Gateway {
            node,
            registry,
            sink,
            tables: Mutex::new(BTreeMap::new()),
            clear_routes: AtomicBool::new(clear_routes),
            log,
        }
    }

    /// Live update of the one tunable configuration item.
    pub fn reconfigure(&self, clear_routes: bool) {
        self.clear_routes.store(clear_routes, Ordering::Relaxed);
    }

    /// Administrative view over every registered peer. Route counts are a
    /// snapshot and may trail concurrent session activity.
    pub fn summaries(&self) -> BTreeMap<Peer, PeerSummary> {
        let mut result = BTreeMap::new();
        for peer in self.registry.peers() {
            let connections = self.registry.get(&peer).unwrap_or_default();
            let route_count =
                lock!(self.tables).get(&peer).map(|t| t.len()).unwrap_or(0);
            result.insert(
                peer,
                PeerSummary {
                    connections,
                    route_count,
                },
            );
        }
        result
    }

    /// Treat every peer with a live session on this node as disconnected,
    /// purging its routes when `clear_routes` is set.
    pub fn shutdown(&self) {
        let peers: Vec<Peer> = lock!(self.tables).keys().copied().collect();
        for peer in peers {
            self.peer_disconnected(peer);
        }
    }

    fn update_route(&self, peer: Peer, m: &RouteUpdateMessage) {
        let prefix = match m.destination() {
            Some(prefix) => prefix,
            None => {
                error!(
                    self.log,
                    "[{peer}] route update without destination"
                );
                return;
            }
        };
        let gateway = match m.gateway() {
            Some(gateway) => gateway,
            None => {
                debug!(
                    self.log,
                    "[{peer}] no gateway for {prefix}, \
                     not mirroring interface route"
                );
                return;
            }
        };

        let route = Route::fpm(prefix, gateway, self.node.clone());
        let mut tables = lock!(self.tables);
        let table = match tables.get_mut(&peer) {
            Some(table) => table,
            None => {
                warn!(self.log, "[{peer}] route update from unknown peer");
                return;
            }
        };

        let prior = table.insert(prefix, route.clone());
        // Withdraw before update so the prefix never has two live routes
        // from the same peer.
        if let Some(prior) = prior {
            self.sink.withdraw(vec![prior]);
        }
        self.sink.update(vec![route]);
    }

    fn withdraw_route(&self, peer: Peer, m: &RouteUpdateMessage) {
        let prefix = match m.destination() {
            Some(prefix) => prefix,
            None => {
                error!(
                    self.log,
                    "[{peer}] route delete without destination"
                );
                return;
            }
        };

        let mut tables = lock!(self.tables);
        let table = match tables.get_mut(&peer) {
            Some(table) => table,
            None => {
                warn!(self.log, "[{peer}] route delete from unknown peer");
                return;
            }
        };

        // The stored route carries the next hop; deletions need not.
        match table.remove(&prefix) {
            Some(route) => self.sink.withdraw(vec![route]),
            None => {
                warn!(self.log, "[{peer}] delete for unknown prefix {prefix}")
            }
        }
    }
}

impl FpmHandler for Gateway {
    fn peer_connected(&self, peer: Peer) -> bool {
        let info = ConnectionInfo {
            node: self.node.clone(),
            peer,
            connected_at: Utc::now(),
        };
        let mut admitted = false;
        self.registry.compute(&peer, &mut |current| match current {
            // Some other session, here or on another node, already owns
            // this peer.
            Some(set) if !set.is_empty() => Some(set),
            _ => {
                admitted = true;
                Some(BTreeSet::from([info.clone()]))
            }
        });

        if admitted {
            lock!(self.tables).insert(peer, BTreeMap::new());
            info!(self.log, "[{peer}] admitted");
        } else {
            warn!(self.log, "[{peer}] rejected, peer already has a session");
        }
        admitted
    }

    fn peer_disconnected(&self, peer: Peer) {
        info!(self.log, "[{peer}] disconnected");
        let table = lock!(self.tables).remove(&peer);
        if self.clear_routes.load(Ordering::Relaxed) {
            if let Some(table) = table {
                if !table.is_empty() {
                    let routes: Vec<Route> = table.into_values().collect();
                    debug!(
                        self.log,
                        "[{peer}] withdrawing {} routes",
                        routes.len()
                    );
                    self.sink.withdraw(routes);
                }
            }
        }

        let node = self.node.clone();
        self.registry.compute(&peer, &mut |current| {
            let mut set = current?;
            set.retain(|info| info.node != node);
            if set.is_empty() {
                None
            } else {
                Some(set)
            }
        });
    }

    fn fpm_message(&self, peer: Peer, message: Message) {
        let m = match message.body {
            MessageBody::Keepalive => {
                trace!(self.log, "[{peer}] keepalive");
                return;
            }
            MessageBody::RouteUpdate(m) => m,
        };

        if !matches!(
            m.protocol,
            RouteProtocol::Zebra | RouteProtocol::Unspec
        ) {
            trace!(
                self.log,
                "[{peer}] ignoring route with protocol {:?}",
                m.protocol
            );
            return;
        }
        if m.family != AF_INET {
            trace!(
                self.log,
                "[{peer}] ignoring route with address family {}",
                m.family
            );
            return;
        }

        match m.typ {
            RtmType::NewRoute => self.update_route(peer, &m),
            RtmType::DelRoute => self.withdraw_route(peer, &m),
            other => {
                trace!(self.log, "[{peer}] ignoring rtm message {other:?}")
            }
        }
    }
}
