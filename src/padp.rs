// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Packet Assembly/Disassembly Protocol.
//!
//! PADP puts reliability on top of SLP: messages are cut into
//! fragments, every fragment is acknowledged, and unacknowledged
//! fragments are retransmitted. A fragment header is four bytes:
//! `type, flags, size_or_offset`. On the first fragment of a message
//! the 16-bit field carries the total message length; on the rest it
//! carries the fragment's offset into the reassembled message.

use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use log::debug;

use crate::error::Error;
use crate::slp::Slp;
use crate::transport::Transport;

pub const FRAG_DATA: u8 = 1;
pub const FRAG_ACK: u8 = 2;
pub const FRAG_TICKLE: u8 = 4;
pub const FRAG_ABORT: u8 = 8;

pub const FLAG_FIRST: u8 = 0x80;
pub const FLAG_LAST: u8 = 0x40;
pub const FLAG_MEMERROR: u8 = 0x20;

/// Largest fragment payload.
pub const MAX_FRAGMENT: usize = 1024;
/// How long to wait for each fragment's ACK.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(2);
/// How many times the same fragment is sent before giving up.
pub const MAX_TRIES: u32 = 10;

const HEADER_LEN: usize = 4;

pub(crate) struct Padp {
    /// Last transmitted transaction id.
    xid: u8,
    /// Reassembly buffer; grown on demand, never shrunk.
    inbuf: Vec<u8>,
}

impl Padp {
    pub fn new() -> Padp {
        Padp {
            xid: 0xff,
            inbuf: Vec::new(),
        }
    }

    /// Pick the next transaction id. 0x00 and 0xff are reserved and
    /// skipped, so the sequence cycles through 1..=254.
    fn bump_xid(&mut self) {
        self.xid = self.xid.wrapping_add(1);
        if self.xid == 0xff || self.xid == 0x00 {
            self.xid = 1;
        }
    }

    /// Send one message, fragmenting as needed. Each fragment is
    /// retransmitted until acknowledged; running out of tries fails the
    /// whole message with [`Error::Timeout`].
    pub fn write<T: Transport + ?Sized>(
        &mut self,
        io: &mut T,
        slp: &mut Slp,
        msg: &[u8],
    ) -> Result<(), Error> {
        if msg.len() > usize::from(u16::MAX) {
            return Err(Error::System(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "message too large for PADP",
            )));
        }
        self.bump_xid();
        let xid = self.xid;

        let total = msg.len();
        let mut offset = 0;
        let mut first = true;
        loop {
            let chunk = MAX_FRAGMENT.min(total - offset);
            let mut flags = 0u8;
            if first {
                flags |= FLAG_FIRST;
            }
            if offset + chunk >= total {
                flags |= FLAG_LAST;
            }
            let size_or_offset = (if first { total } else { offset }) as u16;

            let mut frag = Vec::with_capacity(HEADER_LEN + chunk);
            frag.push(FRAG_DATA);
            frag.push(flags);
            frag.extend_from_slice(&size_or_offset.to_be_bytes());
            frag.extend_from_slice(&msg[offset..offset + chunk]);

            self.send_acknowledged(io, slp, &frag, xid)?;

            offset += chunk;
            first = false;
            if offset >= total {
                return Ok(());
            }
        }
    }

    fn send_acknowledged<T: Transport + ?Sized>(
        &mut self,
        io: &mut T,
        slp: &mut Slp,
        frag: &[u8],
        xid: u8,
    ) -> Result<(), Error> {
        for attempt in 0..MAX_TRIES {
            if attempt > 0 {
                debug!("PADP: no ACK, retransmitting (try {})", attempt + 1);
            }
            slp.write(io, frag, xid)?;
            match wait_ack(io, slp, xid) {
                Ok(()) => return Ok(()),
                Err(Error::Timeout) => continue,
                Err(e) => return Err(e),
            }
        }
        debug!("PADP: giving up after {} tries", MAX_TRIES);
        Err(Error::Timeout)
    }

    /// Receive one message, acknowledging every fragment.
    pub fn read<T: Transport + ?Sized>(
        &mut self,
        io: &mut T,
        slp: &mut Slp,
    ) -> Result<&[u8], Error> {
        // wait for the opening fragment
        let (total, xid) = loop {
            let (ftype, flags, field, len) = {
                let (frag, _) = slp.read(io, None)?;
                match parse_header(frag) {
                    Some((t, f, v)) => (t, f, v, frag.len() - HEADER_LEN),
                    None => {
                        debug!("PADP: runt fragment, dropping");
                        continue;
                    }
                }
            };
            let got_xid = slp.last_xid();

            match ftype {
                FRAG_DATA if flags & FLAG_FIRST != 0 => {
                    if flags & FLAG_MEMERROR != 0 {
                        return Err(Error::NoMem);
                    }
                    let total = usize::from(field);
                    if len > total {
                        debug!("PADP: first fragment longer than its message, dropping");
                        continue;
                    }
                    self.inbuf.resize(total, 0);
                    self.copy_in(slp, 0, len);
                    send_ack(io, slp, got_xid)?;
                    if flags & FLAG_LAST != 0 {
                        return Ok(&self.inbuf[..total]);
                    }
                    break (total, got_xid);
                }
                FRAG_DATA => {
                    debug!("PADP: stray continuation fragment, dropping");
                }
                FRAG_ACK => {
                    debug!("PADP: stale ACK, dropping");
                }
                FRAG_TICKLE => {}
                FRAG_ABORT => return Err(Error::Abort),
                other => {
                    debug!("PADP: unknown fragment type {}, dropping", other);
                }
            }
        };

        // continuation fragments
        loop {
            let (ftype, flags, field, len) = {
                let (frag, _) = slp.read(io, None)?;
                match parse_header(frag) {
                    Some((t, f, v)) => (t, f, v, frag.len() - HEADER_LEN),
                    None => {
                        debug!("PADP: runt fragment, dropping");
                        continue;
                    }
                }
            };
            let got_xid = slp.last_xid();

            match ftype {
                FRAG_DATA => {
                    if got_xid != xid {
                        send_abort(io, slp, got_xid)?;
                        return Err(Error::AckXid {
                            expected: xid,
                            got: got_xid,
                        });
                    }
                    if flags & FLAG_MEMERROR != 0 {
                        return Err(Error::NoMem);
                    }
                    let offset = usize::from(field);
                    if offset + len > total {
                        debug!("PADP: fragment past end of message, dropping");
                        continue;
                    }
                    self.copy_in(slp, offset, len);
                    send_ack(io, slp, got_xid)?;
                    if flags & FLAG_LAST != 0 {
                        return Ok(&self.inbuf[..total]);
                    }
                }
                FRAG_ACK => {
                    debug!("PADP: stale ACK, dropping");
                }
                FRAG_TICKLE => {}
                FRAG_ABORT => return Err(Error::Abort),
                other => {
                    debug!("PADP: unknown fragment type {}, dropping", other);
                }
            }
        }
    }

    /// Copy the data of the packet still sitting in the SLP input
    /// buffer into the reassembly buffer at `offset`.
    fn copy_in(&mut self, slp: &Slp, offset: usize, len: usize) {
        let data = &slp.last_payload()[HEADER_LEN..HEADER_LEN + len];
        self.inbuf[offset..offset + len].copy_from_slice(data);
    }
}

fn parse_header(frag: &[u8]) -> Option<(u8, u8, u16)> {
    if frag.len() < HEADER_LEN {
        return None;
    }
    Some((frag[0], frag[1], BigEndian::read_u16(&frag[2..4])))
}

fn wait_ack<T: Transport + ?Sized>(io: &mut T, slp: &mut Slp, xid: u8) -> Result<(), Error> {
    loop {
        let (ftype, flags) = {
            let (frag, _) = slp.read(io, Some(ACK_TIMEOUT))?;
            match parse_header(frag) {
                Some((t, f, _)) => (t, f),
                None => {
                    debug!("PADP: runt fragment while waiting for ACK");
                    continue;
                }
            }
        };
        let got_xid = slp.last_xid();

        match ftype {
            FRAG_ACK => {
                if flags & FLAG_MEMERROR != 0 {
                    return Err(Error::NoMem);
                }
                if got_xid != xid {
                    return Err(Error::AckXid {
                        expected: xid,
                        got: got_xid,
                    });
                }
                return Ok(());
            }
            FRAG_TICKLE => {}
            FRAG_ABORT => return Err(Error::Abort),
            other => {
                debug!("PADP: unexpected type {} while waiting for ACK", other);
            }
        }
    }
}

fn send_ack<T: Transport + ?Sized>(io: &mut T, slp: &mut Slp, xid: u8) -> Result<(), Error> {
    let frag = [FRAG_ACK, 0, 0, 0];
    slp.write(io, &frag, xid)
}

fn send_abort<T: Transport + ?Sized>(io: &mut T, slp: &mut Slp, xid: u8) -> Result<(), Error> {
    let frag = [FRAG_ABORT, 0, 0, 0];
    slp.write(io, &frag, xid)
}
