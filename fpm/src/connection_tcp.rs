// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::connection::{FpmConnection, FpmListener};
use crate::error::Error;
use crate::messages::FrameDecoder;
use crate::session::FsmEvent;
use crate::{to_canonical, IO_TIMEOUT};
use gw_common::lock;
use slog::{error, trace, Logger};
use std::io::Read;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread::{sleep, spawn};
use std::time::{Duration, Instant};

/// How much to read from the socket per pass. Partial messages accumulate
/// in the frame decoder, so this does not bound message size.
const RECV_BUFFER_SIZE: usize = 4096;

pub struct FpmListenerTcp {
    listener: TcpListener,
}

impl FpmListener<FpmConnectionTcp> for FpmListenerTcp {
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
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(Self { listener })
    }

    fn accept(
        &self,
        log: Logger,
        timeout: Duration,
    ) -> Result<FpmConnectionTcp, Error> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.listener.accept() {
                Ok((conn, mut peer)) => {
                    let ip = to_canonical(peer.ip());
                    peer.set_ip(ip);
                    return Ok(FpmConnectionTcp::with_conn(peer, conn, log));
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(Error::Timeout);
                    }
                    sleep(IO_TIMEOUT);
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }
}

pub struct FpmConnectionTcp {
    peer: SocketAddr,
    conn: Arc<Mutex<Option<TcpStream>>>,
    dropped: Arc<AtomicBool>,
    log: Logger,
}

impl FpmConnection for FpmConnectionTcp {
    fn start(&self, event_tx: Sender<FsmEvent>) -> Result<(), Error> {
        let stream = match lock!(self.conn).as_ref() {
            Some(s) => s.try_clone()?,
            None => return Err(Error::NotConnected),
        };
        stream.set_read_timeout(Some(IO_TIMEOUT))?;
        Self::recv(
            self.peer,
            event_tx,
            stream,
            self.dropped.clone(),
            self.log.clone(),
        );
        Ok(())
    }

    fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn close(&self) {
        self.dropped.store(true, Ordering::Relaxed);
        if let Some(stream) = lock!(self.conn).take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

impl Drop for FpmConnectionTcp {
    fn drop(&mut self) {
        self.dropped.store(true, Ordering::Relaxed);
    }
}

impl FpmConnectionTcp {
    fn with_conn(peer: SocketAddr, conn: TcpStream, log: Logger) -> Self {
        Self {
            peer,
            conn: Arc::new(Mutex::new(Some(conn))),
            dropped: Arc::new(AtomicBool::new(false)),
            log,
        }
    }

    fn recv(
        peer: SocketAddr,
        event_tx: Sender<FsmEvent>,
        mut stream: TcpStream,
        dropped: Arc<AtomicBool>,
        log: Logger,
    ) {
        spawn(move || {
            let mut decoder = FrameDecoder::new();
            let mut buf = [0u8; RECV_BUFFER_SIZE];
            'recv: loop {
                if dropped.load(Ordering::Relaxed) {
                    break;
                }
                let n = match stream.read(&mut buf) {
                    Ok(0) => {
                        // Orderly close from the peer side.
                        let _ = event_tx.send(FsmEvent::Disconnected);
                        break;
                    }
                    Ok(n) => n,
                    Err(e)
                        if e.kind() == std::io::ErrorKind::WouldBlock =>
                    {
                        // The read timeout set on the stream was hit. This
                        // is the normal polling condition; loop back and
                        // check the dropped flag.
                        continue;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                        let _ = event_tx.send(FsmEvent::ReadTimeout);
                        break;
                    }
                    Err(e) => {
                        let _ = event_tx.send(FsmEvent::Error(e.to_string()));
                        break;
                    }
                };
                decoder.extend(&buf[..n]);
                loop {
                    match decoder.next() {
                        Ok(Some(msg)) => {
                            trace!(log, "[{peer}] recv: {msg:?}");
                            if event_tx.send(FsmEvent::Message(msg)).is_err()
                            {
                                break 'recv;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            error!(log, "[{peer}] frame decode: {e}");
                            let _ =
                                event_tx.send(FsmEvent::Error(e.to_string()));
                            break 'recv;
                        }
                    }
                }
            }
        });
    }
}
