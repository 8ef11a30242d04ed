//! End-to-end sessions: two engines on real threads joined by the
//! loopback substrate, with deterministic initial sequence numbers so the
//! wire traces can be asserted byte for byte.

use std::io::{Read, Write};
use std::thread;
use std::time::{Duration, Instant};

use etherparse::TcpHeaderSlice;
use stcp::loopback::{self, AppHandle, Endpoint, WireTrace};
use stcp::{run, Config, Error, PortPair, Role, MSS};

const CLIENT_PORTS: PortPair = PortPair {
    local: 34343,
    remote: 9090,
};
const SERVER_PORTS: PortPair = PortPair {
    local: 9090,
    remote: 34343,
};

const TEST_MSL: Duration = Duration::from_millis(50);

fn config(role: Role) -> Config {
    let mut cfg = match role {
        Role::Active => Config::active(CLIENT_PORTS),
        Role::Passive => Config::passive(SERVER_PORTS),
    };
    cfg.deterministic_iss = true;
    cfg.msl = TEST_MSL;
    cfg
}

struct Seg {
    seq: u32,
    ack_no: u32,
    syn: bool,
    ack: bool,
    fin: bool,
    win: u16,
    payload: Vec<u8>,
}

fn seg(bytes: &[u8]) -> Seg {
    let tcph = TcpHeaderSlice::from_slice(bytes).unwrap();
    Seg {
        seq: tcph.sequence_number(),
        ack_no: tcph.acknowledgment_number(),
        syn: tcph.syn(),
        ack: tcph.ack(),
        fin: tcph.fin(),
        win: tcph.window_size(),
        payload: bytes[tcph.slice().len()..].to_vec(),
    }
}

struct Session {
    client: AppHandle,
    client_trace: WireTrace,
    server_trace: WireTrace,
    client_engine: thread::JoinHandle<Result<(), Error>>,
    server_engine: thread::JoinHandle<Result<(), Error>>,
    echo: thread::JoinHandle<()>,
}

/// Spin up a connected pair with an uppercasing echo server behind the
/// passive endpoint.
fn echo_session() -> Session {
    let (client, server) = loopback::pair();
    let Endpoint {
        chan: mut client_chan,
        app: client_app,
    } = client;
    let Endpoint {
        chan: mut server_chan,
        app: mut server_app,
    } = server;

    let client_trace = client_chan.trace();
    let server_trace = server_chan.trace();

    let client_engine = thread::spawn(move || run(client_chan, config(Role::Active)));
    let server_engine = thread::spawn(move || run(server_chan, config(Role::Passive)));

    let echo = thread::spawn(move || {
        server_app.wait_open().unwrap();
        let mut buf = [0u8; MSS];
        loop {
            let n = server_app.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            let upper: Vec<u8> = buf[..n].iter().map(u8::to_ascii_uppercase).collect();
            server_app.write_all(&upper).unwrap();
        }
        server_app.close();
    });

    Session {
        client: client_app,
        client_trace,
        server_trace,
        client_engine,
        server_engine,
        echo,
    }
}

fn settle() {
    thread::sleep(Duration::from_millis(100));
}

#[test]
fn tiny_echo_wire_trace() {
    let mut session = echo_session();
    session.client.wait_open().unwrap();

    session.client.write_all(b"hi").unwrap();
    let mut buf = [0u8; 2];
    session.client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"HI");

    settle();
    let c: Vec<Seg> = session.client_trace.segments().iter().map(|s| seg(s)).collect();
    let s: Vec<Seg> = session.server_trace.segments().iter().map(|s| seg(s)).collect();

    // Three-way open: SYN, SYN+ACK, ACK, with both ISS pinned to 1.
    assert!(c[0].syn && !c[0].ack);
    assert_eq!(c[0].seq, 1);
    assert_eq!(c[0].win, 3072);
    assert!(s[0].syn && s[0].ack);
    assert_eq!((s[0].seq, s[0].ack_no), (1, 2));
    assert!(c[1].ack && !c[1].syn);
    assert_eq!((c[1].seq, c[1].ack_no), (2, 2));

    // Data both ways, each answered by a cumulative ACK.
    assert_eq!(c[2].payload, b"hi");
    assert_eq!((c[2].seq, c[2].ack_no), (2, 2));
    assert!(s[1].payload.is_empty() && s[1].ack);
    assert_eq!((s[1].seq, s[1].ack_no), (2, 4));
    assert_eq!(s[2].payload, b"HI");
    assert_eq!((s[2].seq, s[2].ack_no), (2, 4));
    assert!(c[3].payload.is_empty() && c[3].ack);
    assert_eq!((c[3].seq, c[3].ack_no), (4, 4));

    assert_eq!(c.len(), 4);
    assert_eq!(s.len(), 3);

    session.client.close();
    session.echo.join().unwrap();
    session.client_engine.join().unwrap().unwrap();
    session.server_engine.join().unwrap().unwrap();
}

#[test]
fn large_transfer_segment_count_and_delivery() {
    let (client, server) = loopback::pair();
    let Endpoint {
        chan: mut client_chan,
        app: mut client_app,
    } = client;
    let Endpoint {
        chan: server_chan,
        app: mut server_app,
    } = server;

    let client_trace = client_chan.trace();

    let client_engine = thread::spawn(move || run(client_chan, config(Role::Active)));
    let server_engine = thread::spawn(move || run(server_chan, config(Role::Passive)));

    let payload: Vec<u8> = (0..10_000).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();

    let sink = thread::spawn(move || {
        server_app.wait_open().unwrap();
        let mut received = Vec::new();
        let mut buf = [0u8; 2048];
        loop {
            let n = server_app.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
        }
        server_app.close();
        received
    });

    client_app.wait_open().unwrap();
    client_app.write_all(&payload).unwrap();
    client_app.close();

    let received = sink.join().unwrap();
    assert_eq!(received, expected);

    client_engine.join().unwrap().unwrap();
    server_engine.join().unwrap().unwrap();

    // 10_000 bytes at MSS 536 is exactly ceil(10000 / 536) = 19 segments,
    // contiguous in sequence space and none larger than one MSS.
    let data: Vec<Seg> = client_trace
        .segments()
        .iter()
        .map(|s| seg(s))
        .filter(|s| !s.payload.is_empty())
        .collect();
    assert_eq!(data.len(), 19);

    let mut expect_seq = 2u32; // iss 1, SYN consumed one
    let mut total = 0;
    for segment in &data {
        assert_eq!(segment.seq, expect_seq);
        assert!(segment.payload.len() <= MSS);
        expect_seq = expect_seq.wrapping_add(segment.payload.len() as u32);
        total += segment.payload.len();
    }
    assert_eq!(total, 10_000);
}

#[test]
fn active_close_four_way_with_timed_wait() {
    let mut session = echo_session();
    session.client.wait_open().unwrap();

    session.client.write_all(b"hi").unwrap();
    let mut buf = [0u8; 2];
    session.client.read_exact(&mut buf).unwrap();

    settle();
    let before = session.client_trace.segments().len();

    let closing = Instant::now();
    session.client.close();
    assert!(closing.elapsed() >= 2 * TEST_MSL);

    session.echo.join().unwrap();
    session.client_engine.join().unwrap().unwrap();
    session.server_engine.join().unwrap().unwrap();

    let c: Vec<Seg> = session.client_trace.segments().iter().map(|s| seg(s)).collect();
    let s: Vec<Seg> = session.server_trace.segments().iter().map(|s| seg(s)).collect();

    // Initiator FIN, its ACK, responder FIN, its ACK.
    let fin = &c[before];
    assert!(fin.fin && fin.payload.is_empty());
    assert_eq!((fin.seq, fin.ack_no), (4, 4));

    let fin_ack = &s[s.len() - 2];
    assert!(fin_ack.ack && !fin_ack.fin);
    assert_eq!((fin_ack.seq, fin_ack.ack_no), (4, 5));

    let peer_fin = &s[s.len() - 1];
    assert!(peer_fin.fin);
    assert_eq!((peer_fin.seq, peer_fin.ack_no), (4, 5));

    let last_ack = &c[c.len() - 1];
    assert!(last_ack.ack && !last_ack.fin);
    assert_eq!((last_ack.seq, last_ack.ack_no), (5, 5));
}

#[test]
fn passive_close_first_allows_late_writes() {
    let (client, server) = loopback::pair();
    let Endpoint {
        chan: client_chan,
        app: mut client_app,
    } = client;
    let Endpoint {
        chan: server_chan,
        app: mut server_app,
    } = server;

    let client_engine = thread::spawn(move || run(client_chan, config(Role::Active)));
    let server_engine = thread::spawn(move || run(server_chan, config(Role::Passive)));

    let server_side = thread::spawn(move || {
        server_app.wait_open().unwrap();
        server_app.write_all(b"abc").unwrap();
        server_app.close();

        // Bytes the peer sent from CLOSE_WAIT are still delivered.
        let mut late = [0u8; 4];
        server_app.read_exact(&mut late).unwrap();
        late
    });

    client_app.wait_open().unwrap();

    let mut buf = [0u8; 3];
    client_app.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"abc");

    // Peer FIN: end of its stream.
    let mut probe = [0u8; 1];
    assert_eq!(client_app.read(&mut probe).unwrap(), 0);

    // We are in CLOSE_WAIT now; writing is still allowed.
    client_app.write_all(b"tail").unwrap();
    client_app.close();

    assert_eq!(&server_side.join().unwrap(), b"tail");
    client_engine.join().unwrap().unwrap();
    server_engine.join().unwrap().unwrap();
}

#[test]
fn simultaneous_close_terminates_both() {
    let (client, server) = loopback::pair();
    let Endpoint {
        chan: client_chan,
        app: client_app,
    } = client;
    let Endpoint {
        chan: server_chan,
        app: server_app,
    } = server;

    let client_engine = thread::spawn(move || run(client_chan, config(Role::Active)));
    let server_engine = thread::spawn(move || run(server_chan, config(Role::Passive)));

    client_app.wait_open().unwrap();
    server_app.wait_open().unwrap();

    let a = thread::spawn(move || client_app.close());
    let b = thread::spawn(move || server_app.close());

    a.join().unwrap();
    b.join().unwrap();
    client_engine.join().unwrap().unwrap();
    server_engine.join().unwrap().unwrap();
}

#[test]
fn severed_link_refuses_connection() {
    let (client, _server) = loopback::pair();
    let Endpoint { chan, app } = client;
    chan.sever();

    let engine = thread::spawn(move || run(chan, config(Role::Active)));

    assert!(matches!(app.wait_open(), Err(Error::ConnectionRefused)));
    assert!(matches!(
        engine.join().unwrap(),
        Err(Error::ConnectionRefused)
    ));
}
