use std::collections::VecDeque;
use std::time::{Duration, Instant};

use etherparse::TcpHeaderSlice;
use rand::Rng;
use tracing::{debug, trace};

use super::seq::{in_window, seq_lt};
use super::wire;
use super::{Channel, Config, PortPair, Role, MSS};
use crate::Error;

/*
                          +--------+   active open
                          | CLOSED |-----------------+
                          +--------+    snd SYN      |
                               | passive open        |
                               V                     V
                          +--------+            +---------+
                          | LISTEN |            | SYNSENT |
                          +--------+            +---------+
                    rcv SYN    |                     |  rcv SYN+ACK
                 snd SYN+ACK   V                     |  snd ACK
                          +---------+                |
                          | SYNRCVD |                |
                          +---------+                |
                 rcv ACK of SYN |                    |
                                V                    V
                              +------------------------+
                              |         ESTAB          |
                              +------------------------+
                        close  /                \  rcv FIN
                      snd FIN /                  \ snd ACK
                             V                    V
                      +----------+           +-----------+
                      | FINWAIT1 |           | CLOSEWAIT |
                      +----------+           +-----------+
             rcv FIN   |       | rcv ACK           | close
             snd ACK   |       |   of FIN          | snd FIN
                       V       V                   V
               +---------+  +----------+      +---------+
               | CLOSING |  | FINWAIT2 |      | LASTACK |
               +---------+  +----------+      +---------+
         rcv ACK of FIN |      | rcv FIN           | rcv ACK of FIN
                        V      V snd ACK           V
                     +----------+             +--------+
                     | TIMEWAIT |------------>| CLOSED |
                     +----------+  2 MSL      +--------+
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Listen,
    SynSent,
    SynRcvd,
    Estab,
    FinWait1,
    FinWait2,
    Closing,
    CloseWait,
    LastAck,
    TimeWait,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SendSpace {
    pub(crate) una: u32, // oldest unacknowledged sequence number
    pub(crate) nxt: u32, // next sequence number to assign
    pub(crate) wnd: u16, // last window the peer advertised
    pub(crate) iss: u32, // initial send sequence number
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RecvSpace {
    pub(crate) nxt: u32, // next sequence number expected from the peer
    pub(crate) wnd: u16, // our window, advertised on every outbound segment
    pub(crate) irs: u32, // initial receive sequence number
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Chunk {
    pub(crate) seq: u32,
    pub(crate) data: Vec<u8>,
}

/// Bytes accepted from the application but not yet put on the wire. Chunks
/// carry the sequence number assigned at admission; transmission consumes
/// them front to back and may split the head at the usable-window edge.
#[derive(Debug, Default)]
pub(crate) struct SendQueue {
    chunks: VecDeque<Chunk>,
    len: usize,
}

impl SendQueue {
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn enqueue(&mut self, seq: u32, data: Vec<u8>) {
        debug_assert!(!data.is_empty() && data.len() <= MSS);
        self.len += data.len();
        self.chunks.push_back(Chunk { seq, data });
    }

    /// Take the next transmittable chunk. The head ships whole once it fits
    /// the usable window. A head larger than the peer's entire window could
    /// never ship whole, so it is split at the usable edge instead of
    /// stalling the stream; otherwise we leave it queued and wait for an
    /// acknowledgment to free up space.
    pub(crate) fn emit(&mut self, usable: usize, window: usize) -> Option<Chunk> {
        let head_len = self.chunks.front()?.data.len();

        if head_len <= usable {
            let chunk = self.chunks.pop_front().unwrap();
            self.len -= chunk.data.len();
            Some(chunk)
        } else if head_len > window && usable > 0 {
            let head = self.chunks.front_mut().unwrap();
            let tail = head.data.split_off(usable);
            let data = std::mem::replace(&mut head.data, tail);
            let seq = head.seq;

            head.seq = head.seq.wrapping_add(usable as u32);
            self.len -= usable;

            Some(Chunk { seq, data })
        } else {
            None
        }
    }
}

/// Per-connection context. Created by the engine entry point, mutated only
/// by the event loop's thread, released once `done` is observed.
#[derive(Debug)]
pub(crate) struct Tcb {
    pub(crate) role: Role,
    pub(crate) state: State,
    pub(crate) ports: PortPair,
    pub(crate) msl: Duration,

    pub(crate) snd: SendSpace,
    pub(crate) rcv: RecvSpace,

    pub(crate) send_queue: SendQueue,
    pub(crate) outstanding: usize, // accepted application bytes not yet acknowledged
    pub(crate) delivered: usize,   // bytes handed upstream, in order
    pub(crate) fin_pending: bool,
    pub(crate) fin_seq: Option<u32>,
    pub(crate) close_deadline: Option<Instant>,
    pub(crate) done: bool,
}

impl Tcb {
    pub(crate) fn new(cfg: &Config) -> Self {
        let iss: u32 = if cfg.deterministic_iss {
            1
        } else {
            rand::thread_rng().gen_range(0..=255)
        };

        Tcb {
            role: cfg.role,
            state: match cfg.role {
                Role::Active => State::Closed,
                Role::Passive => State::Listen,
            },
            ports: cfg.ports,
            msl: cfg.msl,
            snd: SendSpace {
                una: iss,
                nxt: iss,
                wnd: 0,
                iss,
            },
            rcv: RecvSpace {
                nxt: 0,
                wnd: cfg.local_win,
                irs: 0,
            },
            send_queue: SendQueue::default(),
            outstanding: 0,
            delivered: 0,
            fin_pending: false,
            fin_seq: None,
            close_deadline: None,
            done: false,
        }
    }

    /// The application has bytes ready: accept up to one MSS, then transmit
    /// whatever the peer window admits.
    pub(crate) fn on_app_data<C: Channel>(&mut self, chan: &mut C) {
        let mut buf = [0u8; MSS];
        let n = chan.app_recv(&mut buf);
        if n == 0 {
            return;
        }

        if self.state != State::Estab && self.state != State::CloseWait {
            // Writes are refused outside the writable states: the bytes are
            // consumed but never queued.
            debug!("dropping {n} application bytes in state {:?}", self.state);
            return;
        }

        let seq = self.snd.nxt.wrapping_add(self.send_queue.len() as u32);
        self.send_queue.enqueue(seq, buf[..n].to_vec());
        self.outstanding += n;
        self.drain(chan);
    }

    /// The application asked for a close. Valid only in Estab and
    /// CloseWait; anywhere else the request is ignored.
    pub(crate) fn on_close_request<C: Channel>(&mut self, chan: &mut C) {
        match self.state {
            State::Estab => {
                trace!("state <- FinWait1");
                self.state = State::FinWait1;
            }
            State::CloseWait => {
                trace!("state <- LastAck");
                self.state = State::LastAck;
                self.close_deadline = Some(Instant::now() + 2 * self.msl);
            }
            state => {
                debug!("ignoring close request in state {state:?}");
                return;
            }
        }

        self.fin_pending = true;
        self.drain(chan);
    }

    /// Dispatch one decoded segment: ACK accounting first, then payload,
    /// then FIN, each gated by the current state.
    pub(crate) fn on_segment<C: Channel>(
        &mut self,
        chan: &mut C,
        tcph: TcpHeaderSlice,
        payload: &[u8],
    ) {
        if tcph.syn() {
            // A SYN after the handshake is never valid here; there is no
            // reset path, so it is dropped on the floor.
            debug!("{}", Error::UnexpectedSegment { state: self.state });
            return;
        }

        if tcph.ack() {
            self.process_ack(chan, &tcph);
            if self.done {
                return;
            }
        }

        if !payload.is_empty() {
            if let Err(err) = self.accept_payload(chan, &tcph, payload) {
                debug!("{err}");
                if matches!(err, Error::SequenceMismatch { .. }) {
                    // Duplicate ACK carrying the expected sequence number.
                    self.emit_ack(chan);
                }
                return;
            }
        }

        if tcph.fin() {
            self.process_fin(chan, &tcph, payload.len());
        }
    }

    /// The timed-wait deadline expired: release the connection.
    pub(crate) fn on_timeout(&mut self) {
        let Some(deadline) = self.close_deadline else {
            return;
        };
        if Instant::now() < deadline {
            return;
        }

        match self.state {
            State::TimeWait | State::LastAck => {
                trace!("timed wait expired in {:?}, state <- Closed", self.state);
                self.terminate();
            }
            _ => {}
        }
    }

    fn process_ack<C: Channel>(&mut self, chan: &mut C, tcph: &TcpHeaderSlice) {
        let ackno = tcph.acknowledgment_number();
        let in_flight = self.snd.nxt.wrapping_sub(self.snd.una);

        // An acceptable cumulative ACK falls inside (snd.una, snd.nxt].
        if in_window(ackno, self.snd.una.wrapping_add(1), in_flight) {
            let mut acked = ackno.wrapping_sub(self.snd.una) as usize;
            if self.fin_seq.map_or(false, |fin| seq_lt(fin, ackno)) {
                // The FIN consumed a sequence number but carried no byte.
                acked -= 1;
            }
            self.outstanding -= acked;

            self.snd.una = ackno;
            self.snd.wnd = tcph.window_size();
            self.drain(chan);
        } else if ackno == self.snd.una {
            // Duplicate ACK, nothing new.
            return;
        } else {
            debug!(
                "ignoring ack {ackno} outside window (snd.una {}, snd.nxt {})",
                self.snd.una, self.snd.nxt
            );
            return;
        }

        if !self.fin_acked() {
            return;
        }

        match self.state {
            State::FinWait1 => {
                trace!("state <- FinWait2");
                self.state = State::FinWait2;
            }
            State::Closing => {
                trace!("state <- TimeWait");
                self.state = State::TimeWait;
                self.close_deadline = Some(Instant::now() + 2 * self.msl);
            }
            State::LastAck => {
                trace!("state <- Closed");
                self.terminate();
            }
            _ => {}
        }
    }

    fn accept_payload<C: Channel>(
        &mut self,
        chan: &mut C,
        tcph: &TcpHeaderSlice,
        payload: &[u8],
    ) -> Result<(), Error> {
        match self.state {
            State::Estab | State::FinWait1 | State::FinWait2 => {}
            state => return Err(Error::UnexpectedSegment { state }),
        }

        let seq = tcph.sequence_number();
        if seq != self.rcv.nxt {
            return Err(Error::SequenceMismatch {
                expected: self.rcv.nxt,
                got: seq,
            });
        }

        chan.app_send(payload);
        self.delivered += payload.len();
        self.rcv.nxt = self.rcv.nxt.wrapping_add(payload.len() as u32);
        self.emit_ack(chan);

        Ok(())
    }

    fn process_fin<C: Channel>(&mut self, chan: &mut C, tcph: &TcpHeaderSlice, payload_len: usize) {
        match self.state {
            State::Estab | State::FinWait1 | State::FinWait2 => {}
            state => {
                debug!("{}", Error::UnexpectedSegment { state });
                return;
            }
        }

        // The FIN occupies the sequence number right after its payload.
        let fin_seq = tcph.sequence_number().wrapping_add(payload_len as u32);
        if fin_seq != self.rcv.nxt {
            debug!(
                "{}",
                Error::SequenceMismatch {
                    expected: self.rcv.nxt,
                    got: fin_seq,
                }
            );
            self.emit_ack(chan);
            return;
        }

        self.rcv.nxt = self.rcv.nxt.wrapping_add(1);
        self.emit_ack(chan);
        chan.app_eof();

        match self.state {
            State::Estab => {
                trace!("state <- CloseWait");
                self.state = State::CloseWait;
            }
            State::FinWait1 => {
                trace!("state <- Closing");
                self.state = State::Closing;
            }
            State::FinWait2 => {
                trace!("state <- TimeWait");
                self.state = State::TimeWait;
                self.close_deadline = Some(Instant::now() + 2 * self.msl);
            }
            _ => unreachable!(),
        }
    }

    /// Transmit queued chunks while the peer window admits them, then the
    /// pending FIN once the queue has drained.
    fn drain<C: Channel>(&mut self, chan: &mut C) {
        loop {
            let in_flight = self.snd.nxt.wrapping_sub(self.snd.una) as usize;
            let window = self.snd.wnd as usize;
            let usable = window.saturating_sub(in_flight);

            let Some(chunk) = self.send_queue.emit(usable, window) else {
                break;
            };
            debug_assert_eq!(chunk.seq, self.snd.nxt);

            self.emit_data(chan, &chunk.data);
            self.snd.nxt = self.snd.nxt.wrapping_add(chunk.data.len() as u32);
        }

        if self.fin_pending && self.send_queue.is_empty() {
            self.emit_fin(chan);
        }
    }

    fn fin_acked(&self) -> bool {
        self.fin_seq.is_some() && self.send_queue.is_empty() && self.snd.una == self.snd.nxt
    }

    fn terminate(&mut self) {
        self.state = State::Closed;
        self.close_deadline = None;
        self.done = true;
    }

    fn emit_data<C: Channel>(&mut self, chan: &mut C, payload: &[u8]) {
        let res = wire::send_data(
            chan,
            self.ports,
            self.snd.nxt,
            self.rcv.nxt,
            self.rcv.wnd,
            payload,
        );
        if let Err(err) = res {
            debug!("packet channel send failed: {err}");
        }
    }

    fn emit_fin<C: Channel>(&mut self, chan: &mut C) {
        let res = wire::send_fin(chan, self.ports, self.snd.nxt, self.rcv.nxt, self.rcv.wnd);
        if let Err(err) = res {
            debug!("packet channel send failed: {err}");
        }

        self.fin_seq = Some(self.snd.nxt);
        self.snd.nxt = self.snd.nxt.wrapping_add(1);
        self.fin_pending = false;
    }

    fn emit_ack<C: Channel>(&mut self, chan: &mut C) {
        let res = wire::send_ack(chan, self.ports, self.snd.nxt, self.rcv.nxt, self.rcv.wnd);
        if let Err(err) = res {
            debug!("packet channel send failed: {err}");
        }
    }

    pub(crate) fn check_invariants(&self) {
        // snd.una never passes snd.nxt.
        debug_assert!(!seq_lt(self.snd.nxt, self.snd.una));

        // Bytes in flight never exceed the peer's window; the FIN occupies
        // a sequence number but no window space.
        let in_flight = self.snd.nxt.wrapping_sub(self.snd.una);
        let fin_in_flight = u32::from(self.fin_seq.is_some() && in_flight > 0);
        let data_in_flight = in_flight - fin_in_flight;
        debug_assert!(data_in_flight <= self.snd.wnd as u32);

        // Every accepted byte is either still queued or in flight.
        debug_assert_eq!(
            self.send_queue.len() + data_in_flight as usize,
            self.outstanding
        );

        // rcv.nxt moves only over the peer's SYN, in-order bytes handed
        // upstream, and its FIN.
        let peer_fin = self.done
            || matches!(
                self.state,
                State::CloseWait | State::Closing | State::TimeWait | State::LastAck
            );
        debug_assert_eq!(
            self.rcv.nxt,
            self.rcv
                .irs
                .wrapping_add(1 + self.delivered as u32 + u32::from(peer_fin))
        );

        debug_assert!(!self.fin_pending || matches!(self.state, State::FinWait1 | State::LastAck));
        debug_assert!(!(self.fin_pending && self.fin_seq.is_some()));
        debug_assert!(!self.done || self.state == State::Closed);
    }
}
