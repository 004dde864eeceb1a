//! Per-worker connection pool to the issuance engine (spec section 4.4).
//!
//! Generalizes the teacher's `ChunkPool` alloc/reclaim shape from byte
//! chunks to TCP connections: `checkout`/`return_conn` instead of
//! `alloc`/`reclaim`, plus FIFO waiters and broken-connection detection,
//! which a buffer pool never needed but a network pool does.

use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::sync::mpsc;
use std::sync::Mutex;
use std::time::Duration;

type Waiter = mpsc::Sender<io::Result<TcpStream>>;

struct Inner {
    idle: VecDeque<TcpStream>,
    /// Connections currently idle or checked out; always <= `max_size`.
    total: usize,
    waiters: VecDeque<(u64, Waiter)>,
    next_waiter_id: u64,
}

/// A pool of long-lived connections to a single engine endpoint.
pub struct Pool {
    addr: SocketAddr,
    max_size: usize,
    inner: Mutex<Inner>,
}

impl Pool {
    pub fn new(addr: SocketAddr, max_size: usize) -> Pool {
        Pool {
            addr,
            max_size,
            inner: Mutex::new(Inner {
                idle: VecDeque::new(),
                total: 0,
                waiters: VecDeque::new(),
                next_waiter_id: 0,
            }),
        }
    }

    /// Check out a ready connection, waiting in FIFO order if the pool is
    /// at `max_size` and nothing is idle. Waits indefinitely.
    pub fn checkout(&self) -> io::Result<TcpStream> {
        self.checkout_timeout(None)
    }

    /// As `checkout`, but give up after `timeout`, surfacing a
    /// `TimedOut` error (the adapter maps this to `BACKEND_UNAVAILABLE`)
    /// without ever having consumed inventory.
    pub fn checkout_timeout(&self, timeout: Option<Duration>) -> io::Result<TcpStream> {
        let mut inner = self.inner.lock().unwrap();

        while let Some(conn) = inner.idle.pop_front() {
            if connection_is_healthy(&conn) {
                return Ok(conn);
            }
            // Broken connection found on checkout: discard and keep
            // looking rather than handing it to the caller.
            inner.total -= 1;
        }

        if inner.total < self.max_size {
            inner.total += 1;
            drop(inner);
            return match TcpStream::connect(self.addr) {
                Ok(conn) => {
                    let _ = conn.set_nodelay(true);
                    Ok(conn)
                }
                Err(e) => {
                    self.inner.lock().unwrap().total -= 1;
                    Err(e)
                }
            };
        }

        let id = inner.next_waiter_id;
        inner.next_waiter_id += 1;
        let (tx, rx) = mpsc::channel();
        inner.waiters.push_back((id, tx));
        drop(inner);

        match timeout {
            Some(d) => match rx.recv_timeout(d) {
                Ok(result) => result,
                Err(_) => {
                    // A connection may have been handed to us in the gap
                    // between the channel timing out and our acquiring the
                    // lock below; check once more before giving up our
                    // place in line, so we never both drop a live
                    // connection on the floor and leave a dead waiter
                    // registered for `return_conn` to find later.
                    let mut inner = self.inner.lock().unwrap();
                    if let Ok(result) = rx.try_recv() {
                        return result;
                    }
                    inner.waiters.retain(|(waiter_id, _)| *waiter_id != id);
                    Err(io::Error::new(io::ErrorKind::TimedOut, "pool checkout timed out"))
                }
            },
            None => rx.recv().map_err(|_| io::Error::other("pool shut down"))?,
        }
    }

    /// Return a checked-out connection. If `healthy`, it rejoins the idle
    /// set (or is handed directly to the oldest live waiter); otherwise it
    /// is closed and the freed slot is used to satisfy a waiter with a
    /// fresh connection, if any is waiting.
    pub fn return_conn(&self, conn: TcpStream, healthy: bool) {
        if healthy {
            self.deliver(conn);
            return;
        }

        drop(conn);
        self.inner.lock().unwrap().total -= 1;

        loop {
            let mut inner = self.inner.lock().unwrap();
            let (_, waiter) = match inner.waiters.pop_front() {
                Some(w) => w,
                None => return,
            };
            inner.total += 1;
            drop(inner);

            let result = TcpStream::connect(self.addr).and_then(|c| {
                c.set_nodelay(true)?;
                Ok(c)
            });

            match result {
                Ok(fresh) => match waiter.send(Ok(fresh)) {
                    Ok(()) => return,
                    Err(mpsc::SendError(Ok(returned))) => {
                        // The waiter gave up (timed out) just before we
                        // could hand it the connection; it's still good,
                        // so redistribute it instead of dropping it and
                        // leaking the slot we just counted it under.
                        self.deliver(returned);
                        return;
                    }
                    Err(mpsc::SendError(Err(_))) => return,
                },
                Err(e) => {
                    self.inner.lock().unwrap().total -= 1;
                    let _ = waiter.send(Err(e));
                    // This waiter's slot never materialized; see if
                    // another waiter is still there to try for.
                    continue;
                }
            }
        }
    }

    /// Hand a live, healthy connection to the oldest waiter, skipping any
    /// that have already given up (their `send` fails because the receiver
    /// was dropped on timeout), and falling back to the idle set if none
    /// are left.
    fn deliver(&self, mut conn: TcpStream) {
        loop {
            let mut inner = self.inner.lock().unwrap();
            let (_, waiter) = match inner.waiters.pop_front() {
                Some(w) => w,
                None => {
                    inner.idle.push_back(conn);
                    return;
                }
            };
            drop(inner);

            match waiter.send(Ok(conn)) {
                Ok(()) => return,
                Err(mpsc::SendError(Ok(returned))) => {
                    conn = returned;
                    continue;
                }
                Err(mpsc::SendError(Err(_))) => return,
            }
        }
    }

    /// Snapshot of (idle, checked_out) for tests/diagnostics.
    pub fn counts(&self) -> (usize, usize) {
        let inner = self.inner.lock().unwrap();
        (inner.idle.len(), inner.total - inner.idle.len())
    }
}

/// Non-blocking zero-effect peek: `Ok(0)` means the peer closed the
/// connection (EOF) since it was last returned; `WouldBlock` means it is
/// still open with nothing buffered, which is the expected healthy state.
fn connection_is_healthy(conn: &TcpStream) -> bool {
    let mut buf = [0u8; 1];
    if conn.set_nonblocking(true).is_err() {
        return false;
    }
    let result = conn.peek(&mut buf);
    let _ = conn.set_nonblocking(false);

    match result {
        Ok(0) => false,
        Ok(_) => true,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => true,
        Err(_) => false,
    }
}
