// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::config::GatewayConfig;
use crate::connection::{FpmConnection, FpmListener};
use crate::error::Error;
use crate::gateway::{FpmHandler, Gateway};
use crate::session::{FsmEvent, SessionRunner};
use crate::types::Peer;
use crate::IO_TIMEOUT;
use gw_common::lock;
use slog::{error, info, warn, Logger};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{spawn, JoinHandle};
use std::time::Duration;

struct SessionHandle {
    peer: Peer,
    event_tx: Sender<FsmEvent>,
    join: JoinHandle<()>,
}

/// Accepts FPM connections and runs one session state machine per accepted
/// connection. Admission is decided before a session exists; rejected
/// connections are closed without registering any state.
pub struct Dispatcher {
    gateway: Arc<Gateway>,
    config: GatewayConfig,
    sessions: Mutex<Vec<SessionHandle>>,
    shutdown: AtomicBool,
    log: Logger,
}

impl Dispatcher {
    pub fn new(
        gateway: Arc<Gateway>,
        config: GatewayConfig,
        log: Logger,
    ) -> Dispatcher {
        Dispatcher {
            gateway,
            config,
            sessions: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
            log,
        }
    }

    /// Bind the listening port and accept connections until shut down. A
    /// bind failure is logged and leaves the gateway inactive; it does not
    /// panic the hosting process.
    pub fn run<Cnx, Listener>(&self)
    where
        Cnx: FpmConnection + 'static,
        Listener: FpmListener<Cnx>,
    {
        let listener = match Listener::bind(&self.config.listen) {
            Ok(listener) => listener,
            Err(e) => {
                error!(
                    self.log,
                    "fpm gateway failed to bind {}: {e}", self.config.listen
                );
                return;
            }
        };
        info!(self.log, "fpm gateway listening on {}", self.config.listen);

        loop {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            lock!(self.sessions).retain(|s| !s.join.is_finished());

            let conn = match listener.accept(self.log.clone(), IO_TIMEOUT) {
                Ok(conn) => conn,
                Err(Error::Timeout) => continue,
                Err(e) => {
                    error!(self.log, "fpm accept: {e}");
                    continue;
                }
            };

            if self.shutdown.load(Ordering::Acquire) {
                conn.close();
                break;
            }

            let peer = Peer::from(conn.peer());
            if !self.gateway.peer_connected(peer) {
                warn!(
                    self.log,
                    "[{peer}] closing duplicate fpm connection"
                );
                conn.close();
                continue;
            }

            let (event_tx, event_rx) = channel();
            let mut runner = SessionRunner::new(
                Duration::from_secs(self.config.idle_hold_time),
                Duration::from_millis(self.config.resolution),
                peer,
                self.gateway.clone(),
                event_rx,
                event_tx.clone(),
                self.log.clone(),
            );
            let join = spawn(move || runner.start(conn));
            lock!(self.sessions).push(SessionHandle {
                peer,
                event_tx,
                join,
            });
        }
        info!(self.log, "fpm gateway listener exiting");
    }

    /// Tear down every live session, blocking until all of them have
    /// closed, then purge gateway state for the peers this node held.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);

        let sessions = {
            let mut sessions = lock!(self.sessions);
            std::mem::take(&mut *sessions)
        };
        for session in &sessions {
            // A session that already exited has dropped its receiver;
            // that is fine, the join below still completes.
            let _ = session.event_tx.send(FsmEvent::Shutdown);
        }
        for session in sessions {
            if session.join.join().is_err() {
                error!(
                    self.log,
                    "[{}] session thread panicked", session.peer
                );
            }
        }

        self.gateway.shutdown();
    }
}
