use tracing::{debug, trace};

use super::tcb::Tcb;
use super::{wire, Channel, Config, Events, Role, State, MSS};
use crate::Error;

/// Scratch buffer for one inbound segment. Comfortably larger than a
/// header plus one MSS of payload.
const RECV_BUF: usize = 1500;

/// Drive one connection from creation to release.
///
/// Initializes the connection context, runs the three-way handshake for
/// the configured role, then runs the event loop until the connection
/// reaches its terminal state. Returns only once the context has been
/// released, or with [`Error::ConnectionRefused`] if the handshake fails;
/// in that case the outcome is also reported through
/// [`Channel::unblock_app`].
pub fn run<C: Channel>(mut chan: C, cfg: Config) -> Result<(), Error> {
    assert!(MSS <= cfg.local_win as usize);

    let mut tcb = Tcb::new(&cfg);
    trace!("{:?} context created, iss {}", tcb.role, tcb.snd.iss);

    let handshake = match cfg.role {
        Role::Active => active_open(&mut chan, &mut tcb),
        Role::Passive => passive_open(&mut chan, &mut tcb),
    };

    if let Err(err) = handshake {
        debug!("handshake failed: {err}");
        chan.unblock_app(Some(Error::ConnectionRefused));
        chan.app_close_ack();
        return Err(Error::ConnectionRefused);
    }

    trace!("state <- Estab");
    tcb.state = State::Estab;
    chan.unblock_app(None);

    event_loop(&mut chan, &mut tcb);

    chan.app_close_ack();
    Ok(())
}

/// Send SYN, block for the matching SYN+ACK, answer with ACK.
fn active_open<C: Channel>(chan: &mut C, tcb: &mut Tcb) -> Result<(), Error> {
    wire::send_syn(chan, tcb.ports, tcb.snd.iss, tcb.rcv.wnd)?;
    tcb.snd.nxt = tcb.snd.iss.wrapping_add(1);
    trace!("state <- SynSent");
    tcb.state = State::SynSent;

    let mut buf = [0u8; RECV_BUF];
    loop {
        chan.wait(Events::NETWORK_DATA, None);
        let n = chan.net_recv(&mut buf)?;

        let Ok((tcph, _)) = wire::decode(&buf[..n]) else {
            debug!("dropping malformed segment in state {:?}", tcb.state);
            continue;
        };
        if !(tcph.syn() && tcph.ack()) || tcph.acknowledgment_number() != tcb.snd.nxt {
            debug!("dropping non-handshake segment in state {:?}", tcb.state);
            continue;
        }

        tcb.snd.una = tcph.acknowledgment_number();
        tcb.snd.wnd = tcph.window_size();
        tcb.rcv.irs = tcph.sequence_number();
        tcb.rcv.nxt = tcph.sequence_number().wrapping_add(1);

        wire::send_ack(chan, tcb.ports, tcb.snd.nxt, tcb.rcv.nxt, tcb.rcv.wnd)?;
        return Ok(());
    }
}

/// Block for a SYN, answer with SYN+ACK, block for the completing ACK.
fn passive_open<C: Channel>(chan: &mut C, tcb: &mut Tcb) -> Result<(), Error> {
    let mut buf = [0u8; RECV_BUF];

    loop {
        chan.wait(Events::NETWORK_DATA, None);
        let n = chan.net_recv(&mut buf)?;

        let Ok((tcph, _)) = wire::decode(&buf[..n]) else {
            debug!("dropping malformed segment in state {:?}", tcb.state);
            continue;
        };
        if !tcph.syn() || tcph.ack() {
            debug!("dropping non-handshake segment in state {:?}", tcb.state);
            continue;
        }

        tcb.rcv.irs = tcph.sequence_number();
        tcb.rcv.nxt = tcph.sequence_number().wrapping_add(1);
        tcb.snd.wnd = tcph.window_size();
        break;
    }

    trace!("state <- SynRcvd");
    tcb.state = State::SynRcvd;
    wire::send_synack(chan, tcb.ports, tcb.snd.iss, tcb.rcv.nxt, tcb.rcv.wnd)?;
    tcb.snd.nxt = tcb.snd.iss.wrapping_add(1);

    loop {
        chan.wait(Events::NETWORK_DATA, None);
        let n = chan.net_recv(&mut buf)?;

        let Ok((tcph, _)) = wire::decode(&buf[..n]) else {
            debug!("dropping malformed segment in state {:?}", tcb.state);
            continue;
        };
        if tcph.syn() || !tcph.ack() || tcph.acknowledgment_number() != tcb.snd.nxt {
            debug!("dropping non-handshake segment in state {:?}", tcb.state);
            continue;
        }

        tcb.snd.una = tcph.acknowledgment_number();
        tcb.snd.wnd = tcph.window_size();
        return Ok(());
    }
}

/// Wait for multiplexed events and dispatch them until the terminal
/// transition sets `done`. The wait carries a deadline only while a timed
/// wait is running.
fn event_loop<C: Channel>(chan: &mut C, tcb: &mut Tcb) {
    let interest = Events::APP_DATA | Events::NETWORK_DATA | Events::APP_CLOSE;
    let mut buf = [0u8; RECV_BUF];

    while !tcb.done {
        let events = chan.wait(interest, tcb.close_deadline);

        if events.contains(Events::APP_DATA) {
            tcb.on_app_data(chan);
        }

        if events.contains(Events::NETWORK_DATA) {
            match chan.net_recv(&mut buf) {
                Ok(n) => match wire::decode(&buf[..n]) {
                    Ok((tcph, payload)) => tcb.on_segment(chan, tcph, payload),
                    Err(err) => debug!("dropping segment: {err}"),
                },
                Err(err) => debug!("packet channel recv failed: {err}"),
            }
        }

        if events.contains(Events::APP_CLOSE) {
            tcb.on_close_request(chan);
        }

        if events.contains(Events::TIMEOUT) {
            tcb.on_timeout();
        }

        tcb.check_invariants();
    }
}
