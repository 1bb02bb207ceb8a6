// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::error::Error;
use crate::session::FsmEvent;
use slog::Logger;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::mpsc::Sender;
use std::time::Duration;

/// A listener that accepts FPM sessions from routing daemons. The concrete
/// implementation is TCP in production and an in-process channel network in
/// tests.
pub trait FpmListener<Cnx: FpmConnection> {
    fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self, Error>
    where
        Self: Sized;

    /// Accept one connection, waiting at most `timeout`. Returns
    /// [`Error::Timeout`] when nothing arrived, so callers can interleave
    /// shutdown checks with accepting.
    fn accept(&self, log: Logger, timeout: Duration) -> Result<Cnx, Error>;
}

/// One accepted FPM session. FPM is a one-way protocol: the daemon streams
/// messages at us and we never write, so a connection only ever produces
/// events.
pub trait FpmConnection: Send {
    /// Spawn the receive loop for this connection. Decoded messages and
    /// transport-level conditions are delivered as FSM events on
    /// `event_tx`.
    fn start(&self, event_tx: Sender<FsmEvent>) -> Result<(), Error>;

    /// The remote address the session was accepted from.
    fn peer(&self) -> SocketAddr;

    /// Tear down the transport. The receive loop exits on its next pass.
    fn close(&self);
}
