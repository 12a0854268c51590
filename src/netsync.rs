// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! NetSync: the framing used over TCP in place of SLP and PADP.
//!
//! TCP already delivers bytes reliably and in order, so the only
//! wrapping needed is a six-byte header: `cmd (always 1), xid, length
//! (4 bytes)`. A session starts with a UDP wakeup on port 14237, a TCP
//! connection to port 14238, and a fixed three-step exchange whose
//! packets nobody has ever fully decoded; they are reproduced byte for
//! byte and any deviation fails the handshake rather than being
//! guessed at.

use std::net::{SocketAddr, UdpSocket};

use byteorder::{BigEndian, ByteOrder};
use log::{debug, error, trace};

use crate::error::Error;
use crate::transport::{read_exact, write_all, Transport};
use crate::util::{debug_dump, get_u16, get_u32, get_u8, put_u16, put_u32, put_u8};

/// Length of the frame header.
pub const HDR_LEN: usize = 6;
/// First two bytes of every wakeup datagram.
pub const WAKEUP_MAGIC: u16 = 0xfade;
/// UDP port the device sends its wakeup to.
pub const WAKEUP_PORT: u16 = 14237;
/// TCP port the device then connects to.
pub const DATA_PORT: u16 = 14238;

/// Hostname field limit, terminator included.
pub const MAX_HOSTNAME_LEN: usize = 256;

const CMD_DATA: u8 = 1;

pub const WAKEUP_TYPE_SYNC: u8 = 1;
pub const WAKEUP_TYPE_ACK: u8 = 2;

pub(crate) struct NetSync {
    xid: u8,
    inbuf: Vec<u8>,
}

impl NetSync {
    pub fn new() -> NetSync {
        NetSync {
            // reserved opening value; never produced again
            xid: 0xff,
            inbuf: Vec::new(),
        }
    }

    fn bump_xid(&mut self) {
        self.xid = self.xid.wrapping_add(1);
        if self.xid == 0xff || self.xid == 0x00 {
            self.xid = 1;
        }
    }

    /// Send one message: fresh xid, header, payload.
    pub fn write<T: Transport + ?Sized>(&mut self, io: &mut T, buf: &[u8]) -> Result<(), Error> {
        self.bump_xid();
        let mut hdr = Vec::with_capacity(HDR_LEN);
        put_u8(&mut hdr, CMD_DATA);
        put_u8(&mut hdr, self.xid);
        put_u32(&mut hdr, buf.len() as u32);
        trace!("netsync >>> xid {:#04x} len {}", self.xid, buf.len());
        write_all(io, &hdr)?;
        write_all(io, buf)?;
        debug_dump("NET >>>", buf);
        Ok(())
    }

    /// Read one message into the connection's buffer and return it.
    pub fn read<T: Transport + ?Sized>(&mut self, io: &mut T) -> Result<&[u8], Error> {
        let mut hdr = [0u8; HDR_LEN];
        read_exact(io, &mut hdr)?;
        let cmd = hdr[0];
        let xid = hdr[1];
        let len = BigEndian::read_u32(&hdr[2..6]) as usize;
        if cmd != CMD_DATA {
            debug!("netsync: unexpected command {:#04x}", cmd);
        }
        trace!("netsync <<< xid {:#04x} len {}", xid, len);

        self.inbuf.resize(len, 0);
        read_exact(io, &mut self.inbuf[..len])?;
        debug_dump("NET <<<", &self.inbuf[..len]);
        Ok(&self.inbuf[..len])
    }
}

/// A wakeup datagram: `magic (2), type, reserved, host id (4), netmask
/// (4)` and a NUL-terminated hostname.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wakeup {
    pub wtype: u8,
    pub reserved: u8,
    pub host_id: u32,
    pub netmask: u32,
    pub hostname: String,
}

impl Wakeup {
    /// Parse a datagram; `None` for anything that is not a wakeup.
    pub fn parse(buf: &[u8]) -> Option<Wakeup> {
        if buf.len() < 12 {
            return None;
        }
        let mut rd = buf;
        if get_u16(&mut rd) != WAKEUP_MAGIC {
            return None;
        }
        let wtype = get_u8(&mut rd);
        let reserved = get_u8(&mut rd);
        let host_id = get_u32(&mut rd);
        let netmask = get_u32(&mut rd);
        let name_end = rd.iter().position(|&b| b == 0).unwrap_or(rd.len());
        let hostname = String::from_utf8_lossy(&rd[..name_end.min(MAX_HOSTNAME_LEN - 1)]).into_owned();
        Some(Wakeup {
            wtype,
            reserved,
            host_id,
            netmask,
            hostname,
        })
    }

    pub fn emit(&self, out: &mut Vec<u8>) {
        put_u16(out, WAKEUP_MAGIC);
        put_u8(out, self.wtype);
        put_u8(out, self.reserved);
        put_u32(out, self.host_id);
        put_u32(out, self.netmask);
        let name = self.hostname.as_bytes();
        let take = name.len().min(MAX_HOSTNAME_LEN - 1);
        out.extend_from_slice(&name[..take]);
        out.push(0);
    }

    /// The acknowledgment for this wakeup: the same structure, type 2.
    pub fn ack(&self) -> Wakeup {
        Wakeup {
            wtype: WAKEUP_TYPE_ACK,
            ..self.clone()
        }
    }
}

/// Block until a wakeup datagram arrives on the socket. Datagrams that
/// are not wakeups are dropped, like any other line noise.
pub fn recv_wakeup(sock: &UdpSocket) -> Result<(Wakeup, SocketAddr), Error> {
    let mut buf = [0u8; 1024];
    loop {
        let (n, peer) = sock.recv_from(&mut buf)?;
        match Wakeup::parse(&buf[..n]) {
            Some(wakeup) => {
                debug!(
                    "netsync: wakeup from {} (host id {:#010x}, \"{}\")",
                    peer, wakeup.host_id, wakeup.hostname
                );
                return Ok((wakeup, peer));
            }
            None => debug!("netsync: ignoring stray datagram from {}", peer),
        }
    }
}

/// Acknowledge a wakeup so the device proceeds to the TCP connection.
pub fn send_wakeup_ack(sock: &UdpSocket, peer: SocketAddr, wakeup: &Wakeup) -> Result<(), Error> {
    let mut out = Vec::new();
    wakeup.ack().emit(&mut out);
    sock.send_to(&out, peer)?;
    Ok(())
}

// The session-opening exchange, captured from the wire. The numbered
// "responses" come from the device, the "statements" from the desktop.
pub(crate) const RITUAL_RESP1: [u8; 22] = [
    0x90, // command
    0x01, // argc
    0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x20, // arg id
    0x00, 0x00, 0x00, 0x08, // arg length
    // arg data
    0x00, 0x00, 0x00, 0x01, //
    0x80, 0x00, 0x00, 0x00,
];

pub(crate) const RITUAL_STMT2: [u8; 50] = [
    0x12, // command
    0x01, // argc
    0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x20, // arg id
    0x00, 0x00, 0x00, 0x24, // arg length
    // arg data
    0xff, 0xff, 0xff, 0xff, //
    0x3c, 0x00, // reversed in the response
    0x3c, 0x00, //
    0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, //
    0xc0, 0xa8, 0xa5, 0x1f, //
    0x04, 0x27, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00,
];

pub(crate) const RITUAL_RESP2: [u8; 50] = [
    0x92, // command
    0x01, // argc
    0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x20, // arg id
    0x00, 0x00, 0x00, 0x24, // arg length
    // arg data
    0xff, 0xff, 0xff, 0xff, //
    0x00, 0x3c, //
    0x00, 0x3c, //
    0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x01, //
    0xc0, 0xa8, 0x84, 0x3c, // sender's address, apparently
    0x04, 0x1c, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00,
];

pub(crate) const RITUAL_STMT3: [u8; 46] = [
    0x13, // command
    0x01, // argc
    0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x20, // arg id
    0x00, 0x00, 0x00, 0x20, // arg length
    // arg data, much like statement 2
    0xff, 0xff, 0xff, 0xff, //
    0x00, 0x3c, //
    0x00, 0x3c, //
    0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x01, //
    0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00,
];

pub(crate) const RITUAL_RESP3: [u8; 8] = [
    0x93, // command
    0x00, // argc
    0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00,
];

fn expect<T: Transport + ?Sized>(
    net: &mut NetSync,
    io: &mut T,
    want: &[u8],
    what: &str,
) -> Result<(), Error> {
    let got = net.read(io)?;
    if got != want {
        error!("netsync: unexpected {} from peer, refusing to continue", what);
        debug_dump("ritual <<<", got);
        return Err(Error::Abort);
    }
    Ok(())
}

/// Host side of the opening exchange. Only after this returns may DLP
/// traffic flow.
pub(crate) fn ritual_exch_server<T: Transport + ?Sized>(
    net: &mut NetSync,
    io: &mut T,
) -> Result<(), Error> {
    expect(net, io, &RITUAL_RESP1, "session opener")?;
    net.write(io, &RITUAL_STMT2)?;
    expect(net, io, &RITUAL_RESP2, "second response")?;
    net.write(io, &RITUAL_STMT3)?;
    expect(net, io, &RITUAL_RESP3, "closing response")?;
    debug!("netsync: ritual complete");
    Ok(())
}

/// Device side of the opening exchange, for tools that play the device.
pub(crate) fn ritual_exch_client<T: Transport + ?Sized>(
    net: &mut NetSync,
    io: &mut T,
) -> Result<(), Error> {
    net.write(io, &RITUAL_RESP1)?;
    expect(net, io, &RITUAL_STMT2, "second statement")?;
    net.write(io, &RITUAL_RESP2)?;
    expect(net, io, &RITUAL_STMT3, "third statement")?;
    net.write(io, &RITUAL_RESP3)?;
    debug!("netsync: ritual complete");
    Ok(())
}
