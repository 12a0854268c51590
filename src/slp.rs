// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Serial Link Protocol framing.
//!
//! Structure of a packet on the wire:
//!
//! ```text
//! +------+------+------+------+------+
//! | preamble           | dest | src  |
//! +------+------+------+------+------+
//! | type | size        | xid  | sum  |
//! +------+------+------+------+------+
//! | <size> bytes of user data        |
//! +------+------+------+------+------+
//! | CRC         |
//! +------+------+
//! ```
//!
//! `sum` is an 8-bit additive checksum of everything before it; the CRC
//! covers preamble, header and data. The protocol is unreliable by
//! definition: anything malformed is dropped on the floor and the layer
//! above retransmits.

use std::time::{Duration, Instant};

use byteorder::{BigEndian, ByteOrder};
use log::debug;

use crate::error::Error;
use crate::transport::{Direction, Transport};
use crate::util::{crc16, debug_dump};

/// The mandatory opener of every packet.
pub const PREAMBLE: [u8; 3] = [0xbe, 0xef, 0xed];
/// Header length including the preamble.
pub const HEADER_LEN: usize = 10;
/// Length of the trailing CRC.
pub const CRC_LEN: usize = 2;

/// Initial size of the per-connection buffers; they grow on demand and
/// are never shrunk.
pub const INIT_BUF_LEN: usize = 2 * 1024;

/// Well-known ports.
pub mod port {
    pub const DEBUGGER: u8 = 0;
    pub const CONSOLE: u8 = 1;
    pub const REMOTE_UI: u8 = 2;
    pub const DLP: u8 = 3;
}

/// Packet types, i.e. the protocol carried in the packet.
pub mod proto {
    pub const SYSTEM: u8 = 0;
    pub const PAD: u8 = 2;
    pub const LOOPBACK: u8 = 3;
}

/// The address a connection accepts packets on. Anything not matching
/// both fields is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlpAddr {
    pub protocol: u8,
    pub port: u8,
}

pub(crate) struct Slp {
    addr: Option<SlpAddr>,
    inbuf: Vec<u8>,
    outbuf: Vec<u8>,
    last_xid: u8,
    last_len: usize,
}

impl Slp {
    pub fn new() -> Slp {
        Slp {
            addr: None,
            inbuf: Vec::with_capacity(INIT_BUF_LEN),
            outbuf: Vec::with_capacity(INIT_BUF_LEN),
            last_xid: 0,
            last_len: 0,
        }
    }

    /// Record which packet stream this connection accepts.
    pub fn bind(&mut self, addr: SlpAddr) {
        self.addr = Some(addr);
    }

    /// Transaction id of the last delivered packet.
    pub fn last_xid(&self) -> u8 {
        self.last_xid
    }

    /// Payload of the last delivered packet. Like the slice returned by
    /// [`Slp::read`], it is only valid until the next read.
    pub fn last_payload(&self) -> &[u8] {
        &self.inbuf[..self.last_len]
    }

    /// Emit one packet carrying `payload`. The xid is chosen by the
    /// caller, because transaction ids belong to the layer above.
    pub fn write<T: Transport + ?Sized>(
        &mut self,
        io: &mut T,
        payload: &[u8],
        xid: u8,
    ) -> Result<(), Error> {
        let addr = self.addr.ok_or(Error::Badf)?;
        if payload.len() > usize::from(u16::MAX) {
            return Err(Error::System(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "payload too large for one packet",
            )));
        }

        self.outbuf.clear();
        self.outbuf.extend_from_slice(&PREAMBLE);
        self.outbuf.push(addr.port); // dest
        self.outbuf.push(addr.port); // src
        self.outbuf.push(addr.protocol);
        self.outbuf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        self.outbuf.push(xid);
        let sum = header_checksum(&self.outbuf);
        self.outbuf.push(sum);
        self.outbuf.extend_from_slice(payload);
        let crc = crc16(&self.outbuf, 0);
        self.outbuf.extend_from_slice(&crc.to_be_bytes());

        debug_dump("SLP >>>", &self.outbuf);
        crate::transport::write_all(io, &self.outbuf)
    }

    /// Block until a well-formed packet for the bound address arrives
    /// and return its payload and xid. The payload borrows the input
    /// buffer and is only valid until the next read.
    ///
    /// `timeout` bounds the whole wait; expiry returns
    /// [`Error::Timeout`]. SLP itself never times out — the bound is the
    /// caller's policy.
    pub fn read<T: Transport + ?Sized>(
        &mut self,
        io: &mut T,
        timeout: Option<Duration>,
    ) -> Result<(&[u8], u8), Error> {
        let addr = self.addr.ok_or(Error::Badf)?;
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            // hunt for the preamble; bytes before it are line noise
            let mut matched = 0;
            let mut dropped = 0u32;
            while matched < PREAMBLE.len() {
                let b = read_byte(io, deadline)?;
                if b == PREAMBLE[matched] {
                    matched += 1;
                } else {
                    dropped += u32::from(matched as u8) + 1;
                    matched = if b == PREAMBLE[0] { 1 } else { 0 };
                }
            }
            if dropped > 0 {
                debug!("SLP: skipped {} bytes before preamble", dropped);
            }

            let mut hdr = [0u8; HEADER_LEN - PREAMBLE.len()];
            read_full(io, deadline, &mut hdr)?;
            let dest = hdr[0];
            let ptype = hdr[2];
            let size = usize::from(BigEndian::read_u16(&hdr[3..5]));
            let xid = hdr[5];
            let sum = hdr[6];

            let mut want = header_checksum(&PREAMBLE);
            for &b in &hdr[..6] {
                want = want.wrapping_add(b);
            }
            if want != sum {
                debug!("SLP: bad header checksum ({:#04x} != {:#04x}), dropping", sum, want);
                continue;
            }

            self.inbuf.resize(size + CRC_LEN, 0);
            read_full(io, deadline, &mut self.inbuf[..size + CRC_LEN])?;

            let got_crc = BigEndian::read_u16(&self.inbuf[size..size + CRC_LEN]);
            let mut crc = crc16(&PREAMBLE, 0);
            crc = crc16(&hdr, crc);
            crc = crc16(&self.inbuf[..size], crc);
            if crc != got_crc {
                debug!("SLP: bad CRC ({:#06x} != {:#06x}), dropping", got_crc, crc);
                continue;
            }

            if ptype != addr.protocol || dest != addr.port {
                debug!("SLP: packet for {}/{} is not ours, dropping", ptype, dest);
                continue;
            }

            self.last_xid = xid;
            self.last_len = size;
            debug_dump("SLP <<<", &self.inbuf[..size]);
            return Ok((&self.inbuf[..size], xid));
        }
    }
}

fn header_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

fn wait_readable<T: Transport + ?Sized>(
    io: &mut T,
    deadline: Option<Instant>,
) -> Result<(), Error> {
    let remaining = match deadline {
        None => None,
        Some(d) => {
            let now = Instant::now();
            if now >= d {
                return Err(Error::Timeout);
            }
            Some(d - now)
        }
    };
    if io.select(Direction::Reading, remaining)? {
        Ok(())
    } else {
        Err(Error::Timeout)
    }
}

fn read_full<T: Transport + ?Sized>(
    io: &mut T,
    deadline: Option<Instant>,
    buf: &mut [u8],
) -> Result<(), Error> {
    let mut got = 0;
    while got < buf.len() {
        wait_readable(io, deadline)?;
        let n = io.read(&mut buf[got..])?;
        if n == 0 {
            return Err(Error::Eof);
        }
        got += n;
    }
    Ok(())
}

fn read_byte<T: Transport + ?Sized>(io: &mut T, deadline: Option<Instant>) -> Result<u8, Error> {
    let mut b = [0u8; 1];
    read_full(io, deadline, &mut b)?;
    Ok(b[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::ScriptedLink;

    fn pad_dlp() -> SlpAddr {
        SlpAddr {
            protocol: proto::PAD,
            port: port::DLP,
        }
    }

    /// Frame a packet by hand, independently of the writer.
    pub(crate) fn raw_packet(addr: SlpAddr, xid: u8, payload: &[u8]) -> Vec<u8> {
        let mut pkt = Vec::new();
        pkt.extend_from_slice(&PREAMBLE);
        pkt.push(addr.port);
        pkt.push(addr.port);
        pkt.push(addr.protocol);
        pkt.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        pkt.push(xid);
        let sum = pkt.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
        pkt.push(sum);
        pkt.extend_from_slice(payload);
        let crc = crc16(&pkt, 0);
        pkt.extend_from_slice(&crc.to_be_bytes());
        pkt
    }

    #[test]
    fn write_produces_the_documented_frame() {
        let mut link = ScriptedLink::empty();
        let mut slp = Slp::new();
        slp.bind(pad_dlp());
        slp.write(&mut link, b"Hello", 0x42).unwrap();

        // preamble, dst, src, type, size, xid, checksum
        assert_eq!(
            &link.tx[..10],
            &[0xbe, 0xef, 0xed, 0x03, 0x03, 0x02, 0x00, 0x05, 0x42, 0xe9]
        );
        assert_eq!(&link.tx[10..15], b"Hello");
        let crc = crc16(&link.tx[..15], 0);
        assert_eq!(&link.tx[15..], &crc.to_be_bytes());
        // one framed unit per packet
        assert_eq!(link.writes, 1);
    }

    #[test]
    fn read_round_trips_a_written_frame() {
        let mut out = ScriptedLink::empty();
        let mut slp = Slp::new();
        slp.bind(pad_dlp());
        slp.write(&mut out, b"Hello", 0x42).unwrap();

        let mut link = ScriptedLink::new(out.tx);
        let mut rx = Slp::new();
        rx.bind(pad_dlp());
        let (payload, xid) = rx.read(&mut link, None).unwrap();
        assert_eq!(payload, b"Hello");
        assert_eq!(xid, 0x42);
        assert_eq!(rx.last_xid(), 0x42);
    }

    #[test]
    fn leading_garbage_is_skipped() {
        let mut bytes = vec![0x00, 0xbe, 0x17, 0xbe, 0xef];
        bytes.extend_from_slice(&raw_packet(pad_dlp(), 7, b"ok"));
        let mut link = ScriptedLink::new(bytes);
        let mut slp = Slp::new();
        slp.bind(pad_dlp());
        let (payload, xid) = slp.read(&mut link, None).unwrap();
        assert_eq!(payload, b"ok");
        assert_eq!(xid, 7);
    }

    #[test]
    fn bad_checksum_drops_the_packet() {
        let mut bad = raw_packet(pad_dlp(), 9, b"bad");
        bad[9] = bad[9].wrapping_add(1);
        let mut bytes = bad;
        bytes.extend_from_slice(&raw_packet(pad_dlp(), 10, b"good"));
        let mut link = ScriptedLink::new(bytes);
        let mut slp = Slp::new();
        slp.bind(pad_dlp());
        let (payload, xid) = slp.read(&mut link, None).unwrap();
        assert_eq!(payload, b"good");
        assert_eq!(xid, 10);
    }

    #[test]
    fn bad_crc_drops_the_packet() {
        let mut bad = raw_packet(pad_dlp(), 9, b"bad");
        let last = bad.len() - 1;
        bad[last] ^= 0xff;
        let mut bytes = bad;
        bytes.extend_from_slice(&raw_packet(pad_dlp(), 11, b"good"));
        let mut link = ScriptedLink::new(bytes);
        let mut slp = Slp::new();
        slp.bind(pad_dlp());
        let (payload, xid) = slp.read(&mut link, None).unwrap();
        assert_eq!(payload, b"good");
        assert_eq!(xid, 11);
    }

    #[test]
    fn foreign_address_is_ignored() {
        let console = SlpAddr {
            protocol: proto::SYSTEM,
            port: port::CONSOLE,
        };
        let mut bytes = raw_packet(console, 1, b"nope");
        bytes.extend_from_slice(&raw_packet(pad_dlp(), 2, b"ours"));
        let mut link = ScriptedLink::new(bytes);
        let mut slp = Slp::new();
        slp.bind(pad_dlp());
        let (payload, xid) = slp.read(&mut link, None).unwrap();
        assert_eq!(payload, b"ours");
        assert_eq!(xid, 2);
    }

    #[test]
    fn unbound_connection_refuses_io() {
        let mut link = ScriptedLink::empty();
        let mut slp = Slp::new();
        assert!(matches!(slp.read(&mut link, None), Err(Error::Badf)));
        assert!(matches!(slp.write(&mut link, b"x", 1), Err(Error::Badf)));
    }

    #[test]
    fn truncated_stream_is_eof() {
        let packet = raw_packet(pad_dlp(), 3, b"cut short");
        let mut link = ScriptedLink::new(packet[..12].to_vec());
        let mut slp = Slp::new();
        slp.bind(pad_dlp());
        assert!(matches!(slp.read(&mut link, None), Err(Error::Eof)));
    }
}
