//! An in-process substrate: two endpoints joined by a pair of lossless,
//! ordered packet queues, each with a byte-stream handle for the local
//! application. This is what the engine runs on in tests and demos.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use crate::stcp::{Channel, Events};
use crate::Error;

/// Bound on bytes the application may buffer ahead of the engine.
const APP_BUF: usize = 64 * 1024;

#[derive(Debug, Default)]
struct Inner {
    app_tx: VecDeque<u8>,      // application -> engine
    app_rx: VecDeque<u8>,      // engine -> application
    net_rx: VecDeque<Vec<u8>>, // packets from the peer
    close_requested: bool,
    eof: bool,
    open_done: bool,
    open_err: Option<Error>,
    finished: bool,
}

#[derive(Debug, Default)]
struct Shared {
    inner: Mutex<Inner>,
    cond: Condvar,
}

/// Copy of every segment an endpoint put on the wire, for tests that
/// assert exact traces.
#[derive(Debug, Clone, Default)]
pub struct WireTrace(Arc<Mutex<Vec<Vec<u8>>>>);

impl WireTrace {
    pub fn segments(&self) -> Vec<Vec<u8>> {
        self.0.lock().unwrap().clone()
    }
}

/// Engine half of one endpoint: implements [`Channel`] against the shared
/// endpoint state and the peer's inbound queue.
#[derive(Debug)]
pub struct LoopbackChannel {
    local: Arc<Shared>,
    peer: Arc<Shared>,
    severed: Arc<AtomicBool>,
    trace: Option<WireTrace>,
}

impl LoopbackChannel {
    /// Start recording outbound segments; returns the shared log.
    pub fn trace(&mut self) -> WireTrace {
        let trace = WireTrace::default();
        self.trace = Some(trace.clone());
        trace
    }

    /// Break the link in both directions. Subsequent sends and receives
    /// fail, which surfaces as a refused connection during the handshake.
    pub fn sever(&self) {
        self.severed.store(true, Ordering::Release);
    }
}

impl Channel for LoopbackChannel {
    fn wait(&mut self, interest: Events, deadline: Option<Instant>) -> Events {
        let mut inner = self.local.inner.lock().unwrap();

        loop {
            let mut ready = Events::empty();
            if !inner.app_tx.is_empty() {
                ready |= Events::APP_DATA;
            }
            if !inner.net_rx.is_empty() {
                ready |= Events::NETWORK_DATA;
            }
            if inner.close_requested {
                ready |= Events::APP_CLOSE;
            }
            ready &= interest;

            if !ready.is_empty() {
                if ready.contains(Events::APP_CLOSE) {
                    // One-shot: reporting the request consumes it.
                    inner.close_requested = false;
                }
                return ready;
            }

            match deadline {
                None => inner = self.local.cond.wait(inner).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Events::TIMEOUT;
                    }
                    let (guard, _) = self
                        .local
                        .cond
                        .wait_timeout(inner, deadline - now)
                        .unwrap();
                    inner = guard;
                }
            }
        }
    }

    fn net_send(&mut self, segment: &[u8]) -> io::Result<()> {
        if self.severed.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "link severed"));
        }

        if let Some(trace) = &self.trace {
            trace.0.lock().unwrap().push(segment.to_vec());
        }

        let mut peer = self.peer.inner.lock().unwrap();
        peer.net_rx.push_back(segment.to_vec());
        self.peer.cond.notify_all();

        Ok(())
    }

    fn net_recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.severed.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "link severed"));
        }

        let mut inner = self.local.inner.lock().unwrap();
        let Some(packet) = inner.net_rx.pop_front() else {
            return Ok(0);
        };

        let n = packet.len().min(buf.len());
        buf[..n].copy_from_slice(&packet[..n]);
        Ok(n)
    }

    fn app_recv(&mut self, buf: &mut [u8]) -> usize {
        let mut inner = self.local.inner.lock().unwrap();

        let n = buf.len().min(inner.app_tx.len());
        for slot in buf[..n].iter_mut() {
            *slot = inner.app_tx.pop_front().unwrap();
        }

        // A writer may be parked on a full buffer.
        self.local.cond.notify_all();
        n
    }

    fn app_send(&mut self, bytes: &[u8]) {
        let mut inner = self.local.inner.lock().unwrap();
        inner.app_rx.extend(bytes.iter());
        self.local.cond.notify_all();
    }

    fn unblock_app(&mut self, err: Option<Error>) {
        let mut inner = self.local.inner.lock().unwrap();
        inner.open_err = err;
        inner.open_done = true;
        self.local.cond.notify_all();
    }

    fn app_eof(&mut self) {
        let mut inner = self.local.inner.lock().unwrap();
        inner.eof = true;
        self.local.cond.notify_all();
    }

    fn app_close_ack(&mut self) {
        let mut inner = self.local.inner.lock().unwrap();
        inner.finished = true;
        self.local.cond.notify_all();
    }
}

/// Application half of one endpoint: a blocking byte stream plus the
/// open/close signals.
#[derive(Debug)]
pub struct AppHandle {
    shared: Arc<Shared>,
}

impl AppHandle {
    /// Block until the handshake outcome is known.
    pub fn wait_open(&self) -> Result<(), Error> {
        let mut inner = self.shared.inner.lock().unwrap();
        while !inner.open_done {
            inner = self.shared.cond.wait(inner).unwrap();
        }

        match inner.open_err.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Request a close and block until the engine has released the
    /// connection. Bytes written before the close are handed to the engine
    /// first, so a close never overtakes them. For the side initiating the
    /// close this includes the timed-wait linger.
    pub fn close(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        while !inner.app_tx.is_empty() && !inner.finished {
            inner = self.shared.cond.wait(inner).unwrap();
        }

        inner.close_requested = true;
        self.shared.cond.notify_all();

        while !inner.finished {
            inner = self.shared.cond.wait(inner).unwrap();
        }
    }
}

impl Read for AppHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inner = self.shared.inner.lock().unwrap();
        while inner.app_rx.is_empty() && !inner.eof {
            inner = self.shared.cond.wait(inner).unwrap();
        }

        let n = buf.len().min(inner.app_rx.len());
        for slot in buf[..n].iter_mut() {
            *slot = inner.app_rx.pop_front().unwrap();
        }

        // n == 0 only once the peer has closed its half.
        Ok(n)
    }
}

impl Write for AppHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self.shared.inner.lock().unwrap();
        while inner.app_tx.len() == APP_BUF {
            inner = self.shared.cond.wait(inner).unwrap();
        }

        let n = buf.len().min(APP_BUF - inner.app_tx.len());
        inner.app_tx.extend(buf[..n].iter());
        self.shared.cond.notify_all();

        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut inner = self.shared.inner.lock().unwrap();
        while !inner.app_tx.is_empty() {
            inner = self.shared.cond.wait(inner).unwrap();
        }

        Ok(())
    }
}

/// One side of a loopback link.
#[derive(Debug)]
pub struct Endpoint {
    pub chan: LoopbackChannel,
    pub app: AppHandle,
}

/// Two endpoints joined by a lossless, ordered link: everything one side's
/// engine sends arrives intact and in order at the other.
pub fn pair() -> (Endpoint, Endpoint) {
    let a = Arc::new(Shared::default());
    let b = Arc::new(Shared::default());
    let severed = Arc::new(AtomicBool::new(false));

    let chan_a = LoopbackChannel {
        local: a.clone(),
        peer: b.clone(),
        severed: severed.clone(),
        trace: None,
    };
    let chan_b = LoopbackChannel {
        local: b.clone(),
        peer: a.clone(),
        severed,
        trace: None,
    };

    (
        Endpoint {
            chan: chan_a,
            app: AppHandle { shared: a },
        },
        Endpoint {
            chan: chan_b,
            app: AppHandle { shared: b },
        },
    )
}
