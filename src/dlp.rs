// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Desktop Link Protocol: the request/reply layer.
//!
//! A request is `code, argc` followed by tagged arguments; the reply
//! echoes `code | 0x80`, an argument count and a two-byte status before
//! its own arguments. Arguments come in three physical forms picked by
//! the top two bits of the id byte:
//!
//! * tiny — `id, len` (1-byte length)
//! * small — `id | 0x80, pad, len` (2-byte length)
//! * long — 16-bit id with the top bits `11`, 4-byte length
//!
//! Writers use the smallest form the payload fits in. Because the form
//! tag lives in the top two bits, an argument id only has six usable
//! bits; [`build_request`] rejects ids that stray into the tag bits so
//! every id survives the trip through any of the three forms. This
//! layer treats argument contents as opaque bytes; the typed commands
//! live in [`crate::dlp_cmd`].

use log::debug;

use crate::conn::Connection;
use crate::error::Error;
use crate::transport::Transport;
use crate::util::{get_u16, get_u32, get_u8, put_u16, put_u32};

/// Set on the response code of every reply.
pub const RESPONSE_BIT: u8 = 0x80;
/// Id of the first argument of a request.
pub const ARG_BASE: u8 = 0x20;

const ARG_FORM_MASK: u8 = 0xc0;
const ARG_FORM_TINY: u8 = 0x00;
const ARG_FORM_SMALL: u8 = 0x80;
const ARG_FORM_LONG: u8 = 0xc0;

const TINY_MAX: usize = 0xff;
const SMALL_MAX: usize = 0xffff;

/// One request argument; borrowed, since requests are assembled and
/// sent in one call.
///
/// Only the low six bits of `id` are usable; the top two carry the
/// form tag on the wire.
#[derive(Debug, Clone, Copy)]
pub struct DlpArg<'a> {
    pub id: u8,
    pub data: &'a [u8],
}

/// An argument parsed out of a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DlpRespArg {
    pub id: u8,
    pub data: Vec<u8>,
}

/// A parsed reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DlpResponse {
    pub code: u8,
    pub status: u16,
    pub args: Vec<DlpRespArg>,
}

impl DlpResponse {
    /// Fail on a non-zero device status.
    pub fn ok(self) -> Result<DlpResponse, Error> {
        if self.status != 0 {
            debug!("DLP: device status {:#06x}", self.status);
            return Err(Error::Dlp(self.status));
        }
        Ok(self)
    }

    /// The argument with the given id, if the device sent one.
    pub fn arg(&self, id: u8) -> Option<&[u8]> {
        self.args
            .iter()
            .find(|a| a.id == id)
            .map(|a| a.data.as_slice())
    }
}

/// Serialize one request.
pub fn build_request(code: u8, args: &[DlpArg]) -> Result<Vec<u8>, Error> {
    if code == 0 || code & RESPONSE_BIT != 0 {
        return Err(Error::BadId(code));
    }
    let mut out = Vec::new();
    out.push(code);
    out.push(args.len() as u8);
    for arg in args {
        // an id with form bits set would change meaning on the wire
        if arg.id & ARG_FORM_MASK != 0 {
            return Err(Error::BadArgId(arg.id));
        }
        emit_arg(&mut out, arg);
    }
    Ok(out)
}

/// Write one argument. The id must already be clear of the form bits.
fn emit_arg(out: &mut Vec<u8>, arg: &DlpArg) {
    let len = arg.data.len();
    if len <= TINY_MAX {
        out.push(arg.id);
        out.push(len as u8);
    } else if len <= SMALL_MAX {
        out.push(arg.id | ARG_FORM_SMALL);
        out.push(0);
        put_u16(out, len as u16);
    } else {
        put_u16(out, u16::from(arg.id) | 0xc000);
        put_u32(out, len as u32);
    }
    out.extend_from_slice(arg.data);
}

fn need(buf: &[u8], n: usize) -> Result<(), Error> {
    if buf.len() < n {
        return Err(Error::Eof);
    }
    Ok(())
}

/// Parse the reply to the request with the given code.
pub fn parse_response(code: u8, buf: &[u8]) -> Result<DlpResponse, Error> {
    let mut rd = buf;
    need(rd, 4)?;
    let resp = get_u8(&mut rd);
    if resp != code | RESPONSE_BIT {
        return Err(Error::BadResId {
            expected: code | RESPONSE_BIT,
            got: resp,
        });
    }
    let argc = get_u8(&mut rd);
    let status = get_u16(&mut rd);

    let mut args = Vec::with_capacity(usize::from(argc));
    for _ in 0..argc {
        need(rd, 1)?;
        let first = rd[0];
        let (id, len) = match first & ARG_FORM_MASK {
            ARG_FORM_TINY => {
                need(rd, 2)?;
                let id = get_u8(&mut rd);
                (id, usize::from(get_u8(&mut rd)))
            }
            ARG_FORM_SMALL => {
                need(rd, 4)?;
                let id = get_u8(&mut rd) & !ARG_FORM_MASK;
                let _pad = get_u8(&mut rd);
                (id, usize::from(get_u16(&mut rd)))
            }
            ARG_FORM_LONG => {
                need(rd, 6)?;
                let id = (get_u16(&mut rd) & 0x3f) as u8;
                (id, get_u32(&mut rd) as usize)
            }
            _ => return Err(Error::BadArgId(first)),
        };
        need(rd, len)?;
        args.push(DlpRespArg {
            id,
            data: rd[..len].to_vec(),
        });
        rd = &rd[len..];
    }

    Ok(DlpResponse {
        code: resp,
        status,
        args,
    })
}

/// Issue one request and wait for its reply. Exactly one reply pairs
/// with each request; nothing is read beyond it and none of its bytes
/// are discarded.
pub fn request<T: Transport>(
    conn: &mut Connection<T>,
    code: u8,
    args: &[DlpArg],
) -> Result<DlpResponse, Error> {
    let req = build_request(code, args)?;
    debug!("DLP: request {:#04x}, {} argument(s)", code, args.len());
    conn.dlp_write(&req)?;
    let resp = conn.dlp_read()?;
    let parsed = parse_response(code, resp)?;
    debug!(
        "DLP: response {:#04x}, status {:#06x}, {} argument(s)",
        parsed.code,
        parsed.status,
        parsed.args.len()
    );
    Ok(parsed)
}
