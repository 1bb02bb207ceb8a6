// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::clock::Clock;
use crate::connection::FpmConnection;
use crate::gateway::FpmHandler;
use crate::messages::{Message, FPM_VERSION_KEEPALIVE};
use crate::types::Peer;
use slog::{debug, error, info, warn, Logger};
use std::fmt::{self, Display, Formatter};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
pub enum FsmState<Cnx: FpmConnection> {
    /// The connection has been admitted but nothing has been received yet.
    /// The protocol capabilities of the peer are unknown.
    Uninitialized(Cnx),

    /// The first message fixed the peer's protocol version. When the
    /// version meets the keepalive threshold the idle watchdog stays armed
    /// for the life of the connection; otherwise it has been removed and
    /// only a TCP-level disconnect ends the session.
    Initialized { conn: Cnx, keepalives_expected: bool },

    /// Terminal. A reconnecting peer gets a fresh state machine and a
    /// fresh admission decision.
    Closed,
}

impl<Cnx: FpmConnection> Display for FsmState<Cnx> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let kind: FsmStateKind = self.into();
        write!(f, "{}", kind)
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum FsmStateKind {
    Uninitialized,
    Initialized,
    Closed,
}

impl Display for FsmStateKind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            FsmStateKind::Uninitialized => write!(f, "uninitialized"),
            FsmStateKind::Initialized => write!(f, "initialized"),
            FsmStateKind::Closed => write!(f, "closed"),
        }
    }
}

impl<Cnx: FpmConnection> From<&FsmState<Cnx>> for FsmStateKind {
    fn from(s: &FsmState<Cnx>) -> FsmStateKind {
        match s {
            FsmState::Uninitialized(_) => FsmStateKind::Uninitialized,
            FsmState::Initialized { .. } => FsmStateKind::Initialized,
            FsmState::Closed => FsmStateKind::Closed,
        }
    }
}

/// Events driving a session state machine. Produced by the connection's
/// receive loop, the clock, and the dispatcher.
#[derive(Debug)]
pub enum FsmEvent {
    /// A complete protocol message arrived.
    Message(Message),

    /// The idle watchdog ran down without traffic from the peer.
    IdleTimerExpires,

    /// The transport reported a read timeout; the peer is unresponsive.
    ReadTimeout,

    /// The peer closed the connection.
    Disconnected,

    /// The transport failed.
    Error(String),

    /// The supervisor is tearing the gateway down.
    Shutdown,
}

/// Runs the state machine for one FPM session. Owns the event channel the
/// connection and clock feed into, and forwards protocol messages and
/// lifecycle events to the reconciliation engine.
pub struct SessionRunner {
    event_rx: Receiver<FsmEvent>,
    event_tx: Sender<FsmEvent>,
    peer: Peer,
    handler: Arc<dyn FpmHandler>,
    clock: Clock,
    log: Logger,
}

impl SessionRunner {
    pub fn new(
        idle_hold_time: Duration,
        resolution: Duration,
        peer: Peer,
        handler: Arc<dyn FpmHandler>,
        event_rx: Receiver<FsmEvent>,
        event_tx: Sender<FsmEvent>,
        log: Logger,
    ) -> SessionRunner {
        SessionRunner {
            event_rx,
            event_tx: event_tx.clone(),
            peer,
            handler,
            clock: Clock::new(
                resolution,
                idle_hold_time,
                event_tx,
                log.clone(),
            ),
            log,
        }
    }

    pub fn start<Cnx: FpmConnection>(&mut self, conn: Cnx) {
        info!(self.log, "[{}] starting fpm session", self.peer);
        if let Err(e) = conn.start(self.event_tx.clone()) {
            error!(self.log, "[{}] start receive loop: {e}", self.peer);
            self.close(conn);
            return;
        }
        // Armed from the start so a silent connection cannot linger
        // half-open. Removed if the first message shows a legacy peer.
        self.clock.idle_timer.reset();
        self.clock.idle_timer.enable();

        let mut current = FsmState::Uninitialized(conn);
        loop {
            let previous: FsmStateKind = (&current).into();
            current = match current {
                FsmState::Uninitialized(conn) => self.on_uninitialized(conn),
                FsmState::Initialized {
                    conn,
                    keepalives_expected,
                } => self.on_initialized(conn, keepalives_expected),
                FsmState::Closed => break,
            };
            let next: FsmStateKind = (&current).into();
            if previous != next {
                info!(self.log, "[{}] {} -> {}", self.peer, previous, next);
            }
        }
    }

    fn on_uninitialized<Cnx: FpmConnection>(
        &mut self,
        conn: Cnx,
    ) -> FsmState<Cnx> {
        let event = match self.event_rx.recv() {
            Ok(event) => event,
            Err(_) => return self.close(conn),
        };
        match event {
            FsmEvent::Message(msg) => {
                // The capability decision is made exactly once, on the
                // first message of the connection.
                let keepalives_expected =
                    msg.version >= FPM_VERSION_KEEPALIVE;
                if keepalives_expected {
                    self.clock.idle_timer.reset();
                } else {
                    debug!(
                        self.log,
                        "[{}] version {} peer predates keepalives, \
                         removing idle watchdog",
                        self.peer,
                        msg.version
                    );
                    self.clock.idle_timer.disable();
                }
                self.handler.fpm_message(self.peer, msg);
                FsmState::Initialized {
                    conn,
                    keepalives_expected,
                }
            }
            event => self.handle_close_event(conn, event),
        }
    }

    fn on_initialized<Cnx: FpmConnection>(
        &mut self,
        conn: Cnx,
        keepalives_expected: bool,
    ) -> FsmState<Cnx> {
        let event = match self.event_rx.recv() {
            Ok(event) => event,
            Err(_) => return self.close(conn),
        };
        match event {
            FsmEvent::Message(msg) => {
                if keepalives_expected {
                    self.clock.idle_timer.reset();
                }
                self.handler.fpm_message(self.peer, msg);
                FsmState::Initialized {
                    conn,
                    keepalives_expected,
                }
            }
            event => self.handle_close_event(conn, event),
        }
    }

    fn handle_close_event<Cnx: FpmConnection>(
        &self,
        conn: Cnx,
        event: FsmEvent,
    ) -> FsmState<Cnx> {
        match event {
            FsmEvent::Message(_) => unreachable!("handled by caller"),
            FsmEvent::IdleTimerExpires => {
                warn!(
                    self.log,
                    "[{}] idle timeout, closing session", self.peer
                );
            }
            FsmEvent::ReadTimeout => {
                warn!(
                    self.log,
                    "[{}] read timeout, peer unresponsive", self.peer
                );
            }
            FsmEvent::Disconnected => {
                info!(self.log, "[{}] peer disconnected", self.peer);
            }
            FsmEvent::Error(e) => {
                error!(self.log, "[{}] transport error: {e}", self.peer);
            }
            FsmEvent::Shutdown => {
                info!(self.log, "[{}] shutting down session", self.peer);
            }
        }
        self.close(conn)
    }

    fn close<Cnx: FpmConnection>(&self, conn: Cnx) -> FsmState<Cnx> {
        conn.close();
        self.clock.idle_timer.disable();
        self.handler.peer_disconnected(self.peer);
        FsmState::Closed
    }
}
