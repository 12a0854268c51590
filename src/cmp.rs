// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Connection Management Protocol.
//!
//! CMP runs exactly once per serial or USB connection, before any DLP
//! traffic. The device opens with a WAKEUP carrying its protocol
//! version and the fastest line rate it is willing to use; the host
//! answers with an INIT that settles the rate.

use byteorder::{BigEndian, ByteOrder};
use log::{debug, error};

use crate::error::Error;
use crate::padp::Padp;
use crate::slp::Slp;
use crate::transport::Transport;
use crate::util::{put_u16, put_u32, put_u8};

/// The protocol version this library speaks.
pub const VER_MAJOR: u8 = 1;
pub const VER_MINOR: u8 = 1;

pub const TYPE_WAKEUP: u8 = 1;
pub const TYPE_INIT: u8 = 2;
pub const TYPE_ABORT: u8 = 3;
pub const TYPE_EXTENDED: u8 = 4;

/// INIT flag: the host wants a different rate than the device offered.
pub const IFLAG_CHANGERATE: u8 = 0x80;
/// INIT flag: extend the device's receive timeout. The protocol defines
/// two such flags, both with this value; they are treated as one bit
/// and never sent.
pub const IFLAG_LONG_TIMEOUT: u8 = 0x40;
/// ABORT flag: protocol version mismatch.
pub const AFLAG_VERSION: u8 = 0x80;

pub const PACKET_LEN: usize = 10;

/// One CMP packet. Every type shares the same layout:
/// `type, flags, ver_major, ver_minor, reserved (2), rate (4)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmpPacket {
    pub ptype: u8,
    pub flags: u8,
    pub ver_major: u8,
    pub ver_minor: u8,
    pub rate: u32,
}

impl CmpPacket {
    /// Parse a packet, or `None` for something too short to be CMP.
    pub fn parse(buf: &[u8]) -> Option<CmpPacket> {
        if buf.len() < PACKET_LEN {
            return None;
        }
        Some(CmpPacket {
            ptype: buf[0],
            flags: buf[1],
            ver_major: buf[2],
            ver_minor: buf[3],
            // two reserved bytes skipped
            rate: BigEndian::read_u32(&buf[6..10]),
        })
    }

    pub fn emit(&self, out: &mut Vec<u8>) {
        put_u8(out, self.ptype);
        put_u8(out, self.flags);
        put_u8(out, self.ver_major);
        put_u8(out, self.ver_minor);
        put_u16(out, 0);
        put_u32(out, self.rate);
    }
}

fn write<T: Transport + ?Sized>(
    io: &mut T,
    slp: &mut Slp,
    padp: &mut Padp,
    packet: &CmpPacket,
) -> Result<(), Error> {
    debug!(
        "CMP: sending type {} flags {:#04x} v{}.{} rate {}",
        packet.ptype, packet.flags, packet.ver_major, packet.ver_minor, packet.rate
    );
    let mut out = Vec::with_capacity(PACKET_LEN);
    packet.emit(&mut out);
    padp.write(io, slp, &out)
}

/// Answer the device's wakeup and negotiate the line rate.
///
/// `bps` is the rate the caller wants, or 0 for "whatever the device
/// offers". Returns the agreed rate; the serial transport is
/// reprogrammed by the caller afterwards.
pub(crate) fn accept<T: Transport + ?Sized>(
    io: &mut T,
    slp: &mut Slp,
    padp: &mut Padp,
    bps: u32,
) -> Result<u32, Error> {
    let wakeup = loop {
        let msg = match padp.read(io, slp) {
            Ok(msg) => msg,
            // the device may not have been picked up yet; keep waiting
            Err(Error::Timeout) => continue,
            Err(e) => return Err(e),
        };
        match CmpPacket::parse(msg) {
            Some(p) if p.ptype == TYPE_WAKEUP => break p,
            Some(p) => debug!("CMP: ignoring packet type {} before wakeup", p.ptype),
            None => debug!("CMP: runt packet ignored"),
        }
    };
    debug!(
        "CMP: wakeup v{}.{} rate {}",
        wakeup.ver_major, wakeup.ver_minor, wakeup.rate
    );

    if wakeup.ver_major > VER_MAJOR {
        error!(
            "CMP: device speaks v{}.{}, this library speaks v{}.{}",
            wakeup.ver_major, wakeup.ver_minor, VER_MAJOR, VER_MINOR
        );
        let abort = CmpPacket {
            ptype: TYPE_ABORT,
            flags: AFLAG_VERSION,
            ver_major: VER_MAJOR,
            ver_minor: VER_MINOR,
            rate: 0,
        };
        write(io, slp, padp, &abort)?;
        return Err(Error::Abort);
    }

    let mut init = CmpPacket {
        ptype: TYPE_INIT,
        flags: 0,
        ver_major: VER_MAJOR,
        ver_minor: VER_MINOR,
        rate: wakeup.rate,
    };
    if bps != 0 && bps != wakeup.rate {
        init.rate = bps;
        init.flags |= IFLAG_CHANGERATE;
    }
    write(io, slp, padp, &init)?;

    debug!("CMP: negotiated {} bps", init.rate);
    Ok(init.rate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::padp::{FLAG_FIRST, FLAG_LAST, FRAG_ACK, FRAG_DATA};
    use crate::slp::{port, proto, SlpAddr};
    use crate::transport::testing::ScriptedLink;

    fn pad_dlp() -> SlpAddr {
        SlpAddr {
            protocol: proto::PAD,
            port: port::DLP,
        }
    }

    fn bound_slp() -> Slp {
        let mut slp = Slp::new();
        slp.bind(pad_dlp());
        slp
    }

    fn device_frame(payload: &[u8], xid: u8) -> Vec<u8> {
        let mut link = ScriptedLink::empty();
        let mut slp = bound_slp();
        slp.write(&mut link, payload, xid).unwrap();
        link.tx
    }

    fn device_cmp(packet: &CmpPacket, xid: u8) -> Vec<u8> {
        let mut frag = vec![FRAG_DATA, FLAG_FIRST | FLAG_LAST, 0, PACKET_LEN as u8];
        packet.emit(&mut frag);
        device_frame(&frag, xid)
    }

    fn device_ack(xid: u8) -> Vec<u8> {
        device_frame(&[FRAG_ACK, 0, 0, 0], xid)
    }

    /// Extract the CMP packets the host sent from the raw byte stream.
    fn host_cmp_packets(tx: Vec<u8>) -> Vec<CmpPacket> {
        let mut link = ScriptedLink::new(tx);
        let mut slp = bound_slp();
        let mut packets = Vec::new();
        loop {
            let (frag, _) = match slp.read(&mut link, None) {
                Ok(ok) => ok,
                Err(Error::Eof) => break,
                Err(e) => panic!("unexpected error {:?}", e),
            };
            if frag[0] == FRAG_DATA {
                if let Some(p) = CmpPacket::parse(&frag[4..]) {
                    packets.push(p);
                }
            }
        }
        packets
    }

    #[test]
    fn packet_codec_round_trips() {
        let p = CmpPacket {
            ptype: TYPE_WAKEUP,
            flags: 0,
            ver_major: 1,
            ver_minor: 1,
            rate: 57_600,
        };
        let mut buf = Vec::new();
        p.emit(&mut buf);
        assert_eq!(buf.len(), PACKET_LEN);
        assert_eq!(&buf[4..6], &[0, 0]);
        assert_eq!(CmpPacket::parse(&buf), Some(p));
        assert_eq!(CmpPacket::parse(&buf[..9]), None);
    }

    #[test]
    fn accept_counter_offers_the_callers_rate() {
        let wakeup = CmpPacket {
            ptype: TYPE_WAKEUP,
            flags: 0,
            ver_major: 1,
            ver_minor: 1,
            rate: 57_600,
        };
        // wakeup from the device, then an ACK for our INIT
        let mut bytes = device_cmp(&wakeup, 0xfe);
        bytes.extend_from_slice(&device_ack(1));

        let mut link = ScriptedLink::new(bytes);
        let mut slp = bound_slp();
        let mut padp = Padp::new();
        let rate = accept(&mut link, &mut slp, &mut padp, 115_200).unwrap();
        assert_eq!(rate, 115_200);

        let sent = host_cmp_packets(link.tx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].ptype, TYPE_INIT);
        assert_eq!(sent[0].flags, IFLAG_CHANGERATE);
        assert_eq!(sent[0].rate, 115_200);
        assert_eq!(sent[0].ver_major, 1);
        assert_eq!(sent[0].ver_minor, 1);
    }

    #[test]
    fn accept_echoes_the_offer_without_a_hint() {
        let wakeup = CmpPacket {
            ptype: TYPE_WAKEUP,
            flags: 0,
            ver_major: 1,
            ver_minor: 0,
            rate: 57_600,
        };
        let mut bytes = device_cmp(&wakeup, 0xfe);
        bytes.extend_from_slice(&device_ack(1));

        let mut link = ScriptedLink::new(bytes);
        let mut slp = bound_slp();
        let mut padp = Padp::new();
        let rate = accept(&mut link, &mut slp, &mut padp, 0).unwrap();
        assert_eq!(rate, 57_600);

        let sent = host_cmp_packets(link.tx);
        assert_eq!(sent[0].flags, 0);
        assert_eq!(sent[0].rate, 57_600);
    }

    #[test]
    fn newer_major_version_is_aborted() {
        let wakeup = CmpPacket {
            ptype: TYPE_WAKEUP,
            flags: 0,
            ver_major: 2,
            ver_minor: 0,
            rate: 57_600,
        };
        let mut bytes = device_cmp(&wakeup, 0xfe);
        bytes.extend_from_slice(&device_ack(1));

        let mut link = ScriptedLink::new(bytes);
        let mut slp = bound_slp();
        let mut padp = Padp::new();
        assert!(matches!(
            accept(&mut link, &mut slp, &mut padp, 0),
            Err(Error::Abort)
        ));

        let sent = host_cmp_packets(link.tx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].ptype, TYPE_ABORT);
        assert_eq!(sent[0].flags, AFLAG_VERSION);
    }

    #[test]
    fn non_wakeup_packets_are_skipped() {
        let stray = CmpPacket {
            ptype: TYPE_EXTENDED,
            flags: 0,
            ver_major: 1,
            ver_minor: 1,
            rate: 0,
        };
        let wakeup = CmpPacket {
            ptype: TYPE_WAKEUP,
            flags: 0,
            ver_major: 1,
            ver_minor: 1,
            rate: 19_200,
        };
        let mut bytes = device_cmp(&stray, 0xfc);
        bytes.extend_from_slice(&device_cmp(&wakeup, 0xfd));
        bytes.extend_from_slice(&device_ack(1));

        let mut link = ScriptedLink::new(bytes);
        let mut slp = bound_slp();
        let mut padp = Padp::new();
        let rate = accept(&mut link, &mut slp, &mut padp, 0).unwrap();
        assert_eq!(rate, 19_200);
    }
}
