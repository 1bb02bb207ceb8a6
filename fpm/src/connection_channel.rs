// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Test-only implementations of [`FpmListener`] and [`FpmConnection`] over
//! in-process channels. This file is only included in `lib.rs` behind a
//! `#[cfg(test)]` guard. Connections carry raw byte chunks, not parsed
//! messages, so the receive path exercises the same frame decoder the TCP
//! transport uses and tests can fragment the stream deliberately.

use crate::connection::{FpmConnection, FpmListener};
use crate::error::Error;
use crate::messages::FrameDecoder;
use crate::session::FsmEvent;
use crate::IO_TIMEOUT;
use gw_common::lock;
use lazy_static::lazy_static;
use slog::Logger;
use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{
    channel as mpsc_channel, Receiver, RecvTimeoutError, Sender,
};
use std::sync::{Arc, Mutex};
use std::thread::spawn;
use std::time::Duration;

lazy_static! {
    static ref NET: Network = Network::new();
}

/// A simulated network mapping listen addresses to channels that deliver
/// new connections. Just enough fidelity to drive the session layer; not a
/// TCP stand-in.
struct Network {
    #[allow(clippy::type_complexity)]
    endpoints:
        Mutex<HashMap<SocketAddr, Sender<(SocketAddr, Receiver<Vec<u8>>)>>>,
}

impl Network {
    fn new() -> Self {
        Self {
            endpoints: Mutex::new(HashMap::new()),
        }
    }

    fn bind(&self, sa: SocketAddr) -> Listener {
        let (tx, rx) = mpsc_channel();
        lock!(self.endpoints).insert(sa, tx);
        Listener { rx }
    }

    fn connect(
        &self,
        from: SocketAddr,
        to: SocketAddr,
    ) -> Result<Sender<Vec<u8>>, Error> {
        let (tx, rx) = mpsc_channel();
        match lock!(self.endpoints).get(&to) {
            None => Err(Error::ChannelConnect),
            Some(sender) => {
                sender
                    .send((from, rx))
                    .map_err(|e| Error::ChannelSend(e.to_string()))?;
                Ok(tx)
            }
        }
    }
}

/// Open a simulated connection to the listener at `to`. The returned sender
/// is the peer's half: byte chunks pushed into it arrive at the gateway,
/// and dropping it reads as a disconnect.
pub fn connect(
    from: SocketAddr,
    to: SocketAddr,
) -> Result<Sender<Vec<u8>>, Error> {
    NET.connect(from, to)
}

struct Listener {
    rx: Receiver<(SocketAddr, Receiver<Vec<u8>>)>,
}

pub struct FpmListenerChannel {
    listener: Listener,
}

impl FpmListener<FpmConnectionChannel> for FpmListenerChannel {
    fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self, Error>
    where
        Self: Sized,
    {
        let addr = addr
            .to_socket_addrs()
            .map_err(|e| Error::InvalidAddress(e.to_string()))?
            .next()
            .ok_or(Error::InvalidAddress(
                "at least one address required".into(),
            ))?;
        Ok(Self {
            listener: NET.bind(addr),
        })
    }

    fn accept(
        &self,
        log: Logger,
        timeout: Duration,
    ) -> Result<FpmConnectionChannel, Error> {
        let (peer, rx) =
            self.listener.rx.recv_timeout(timeout).map_err(|e| match e {
                RecvTimeoutError::Timeout => Error::Timeout,
                RecvTimeoutError::Disconnected => Error::Disconnected,
            })?;
        Ok(FpmConnectionChannel {
            peer,
            rx: Mutex::new(Some(rx)),
            dropped: Arc::new(AtomicBool::new(false)),
            log,
        })
    }
}

pub struct FpmConnectionChannel {
    peer: SocketAddr,
    rx: Mutex<Option<Receiver<Vec<u8>>>>,
    dropped: Arc<AtomicBool>,
    log: Logger,
}

impl FpmConnection for FpmConnectionChannel {
    fn start(&self, event_tx: Sender<FsmEvent>) -> Result<(), Error> {
        let rx = lock!(self.rx).take().ok_or(Error::NotConnected)?;
        let dropped = self.dropped.clone();
        let peer = self.peer;
        let log = self.log.clone();
        spawn(move || {
            let mut decoder = FrameDecoder::new();
            'recv: loop {
                if dropped.load(Ordering::Relaxed) {
                    break;
                }
                match rx.recv_timeout(IO_TIMEOUT) {
                    Ok(bytes) => {
                        decoder.extend(&bytes);
                        loop {
                            match decoder.next() {
                                Ok(Some(msg)) => {
                                    slog::trace!(
                                        log,
                                        "[{peer}] recv: {msg:?}"
                                    );
                                    if event_tx
                                        .send(FsmEvent::Message(msg))
                                        .is_err()
                                    {
                                        break 'recv;
                                    }
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    let _ = event_tx.send(FsmEvent::Error(
                                        e.to_string(),
                                    ));
                                    break 'recv;
                                }
                            }
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => {
                        let _ = event_tx.send(FsmEvent::Disconnected);
                        break;
                    }
                }
            }
        });
        Ok(())
    }

    fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn close(&self) {
        self.dropped.store(true, Ordering::Relaxed);
        lock!(self.rx).take();
    }
}
