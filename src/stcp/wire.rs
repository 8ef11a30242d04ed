use std::io;

use etherparse::{TcpHeader, TcpHeaderSlice};

use super::{Channel, PortPair};
use crate::Error;

/// Fixed header size: data offset 5, no options.
pub(crate) const HEADER_LEN: usize = 20;

/// Split a raw packet into its header and payload. Anything shorter than a
/// header is malformed; unknown flag bits parse fine and are simply never
/// looked at.
pub(crate) fn decode(buf: &[u8]) -> Result<(TcpHeaderSlice<'_>, &[u8]), Error> {
    let tcph = TcpHeaderSlice::from_slice(buf).map_err(|_| Error::MalformedSegment)?;
    let payload = &buf[tcph.slice().len()..];
    Ok((tcph, payload))
}

fn build(
    ports: PortPair,
    seq: u32,
    ack_no: u32,
    win: u16,
    syn: bool,
    ack: bool,
    fin: bool,
    payload: &[u8],
) -> Vec<u8> {
    let mut tcph = TcpHeader::new(ports.local, ports.remote, seq, win);

    tcph.syn = syn;
    tcph.ack = ack;
    tcph.fin = fin;
    tcph.acknowledgment_number = ack_no;
    // Checksum and urgent pointer stay zero: the substrate delivers
    // segments intact, so neither is ever inspected.

    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
    tcph.write(&mut bytes).unwrap();
    bytes.extend_from_slice(payload);

    bytes
}

pub(crate) fn send_syn<C: Channel>(
    chan: &mut C,
    ports: PortPair,
    seq: u32,
    win: u16,
) -> io::Result<()> {
    chan.net_send(&build(ports, seq, 0, win, true, false, false, &[]))
}

pub(crate) fn send_synack<C: Channel>(
    chan: &mut C,
    ports: PortPair,
    seq: u32,
    ack_no: u32,
    win: u16,
) -> io::Result<()> {
    chan.net_send(&build(ports, seq, ack_no, win, true, true, false, &[]))
}

pub(crate) fn send_ack<C: Channel>(
    chan: &mut C,
    ports: PortPair,
    seq: u32,
    ack_no: u32,
    win: u16,
) -> io::Result<()> {
    chan.net_send(&build(ports, seq, ack_no, win, false, true, false, &[]))
}

pub(crate) fn send_data<C: Channel>(
    chan: &mut C,
    ports: PortPair,
    seq: u32,
    ack_no: u32,
    win: u16,
    payload: &[u8],
) -> io::Result<()> {
    chan.net_send(&build(ports, seq, ack_no, win, false, true, false, payload))
}

pub(crate) fn send_fin<C: Channel>(
    chan: &mut C,
    ports: PortPair,
    seq: u32,
    ack_no: u32,
    win: u16,
) -> io::Result<()> {
    chan.net_send(&build(ports, seq, ack_no, win, false, true, true, &[]))
}
