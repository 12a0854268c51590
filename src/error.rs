// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! The error taxonomy shared by every layer of the stack.
//!
//! Errors propagate upward unchanged; no layer converts an error into
//! success. Link-level malformations (bad SLP checksum, bad CRC, wrong
//! port) are not errors at all: the link layer drops those packets
//! silently and correctness is the job of the reliable layer above it.

use std::error;
use std::fmt;
use std::io::{self, ErrorKind};

// DLP status codes reported by the device in every reply.
const DLPSTAT_NOERR: u16 = 0x00;
const DLPSTAT_SYSTEM: u16 = 0x01;
const DLPSTAT_ILLEGAL_REQ: u16 = 0x02;
const DLPSTAT_NOMEM: u16 = 0x03;
const DLPSTAT_PARAM: u16 = 0x04;
const DLPSTAT_NOT_FOUND: u16 = 0x05;
const DLPSTAT_NONE_OPEN: u16 = 0x06;
const DLPSTAT_DB_OPEN: u16 = 0x07;
const DLPSTAT_TOO_MANY_OPEN: u16 = 0x08;
const DLPSTAT_EXISTS: u16 = 0x09;
const DLPSTAT_CANT_OPEN: u16 = 0x0a;
const DLPSTAT_RECORD_DELETED: u16 = 0x0b;
const DLPSTAT_RECORD_BUSY: u16 = 0x0c;
const DLPSTAT_UNSUPPORTED: u16 = 0x0d;
const DLPSTAT_READONLY: u16 = 0x0f;
const DLPSTAT_SPACE: u16 = 0x10;
const DLPSTAT_LIMIT: u16 = 0x11;
const DLPSTAT_CANCELLED: u16 = 0x12;
const DLPSTAT_BAD_WRAPPER: u16 = 0x13;
const DLPSTAT_ARG_MISSING: u16 = 0x14;
const DLPSTAT_ARG_SIZE: u16 = 0x15;

#[derive(Debug)]
pub enum Error {
    /// An underlying OS call failed; the original error (and its errno)
    /// is preserved for the caller.
    System(io::Error),
    /// Buffer allocation failed, or the device signalled it ran out of
    /// memory mid-transfer.
    NoMem,
    /// The ACK wait or a bounded read expired.
    Timeout,
    /// Operation on an uninitialised or closed connection.
    Badf,
    /// The transport returned end of file.
    Eof,
    /// The peer aborted the transaction.
    Abort,
    /// Request id outside the valid range.
    BadId(u8),
    /// The reply does not pair with the request that was sent.
    BadResId { expected: u8, got: u8 },
    /// An argument carried an invalid form tag.
    BadArgId(u8),
    /// A fragment or its ACK carried the wrong transaction id.
    AckXid { expected: u8, got: u8 },
    /// The device answered with a non-zero DLP status.
    Dlp(u16),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::System(e) => write!(f, "system error: {}", e),
            Error::NoMem => write!(f, "out of memory"),
            Error::Timeout => write!(f, "timeout"),
            Error::Badf => write!(f, "connection not usable"),
            Error::Eof => write!(f, "end of file"),
            Error::Abort => write!(f, "aborted by peer"),
            Error::BadId(id) => write!(f, "invalid request id {:#04x}", id),
            Error::BadResId { expected, got } => write!(
                f,
                "response id {:#04x} does not match request (expected {:#04x})",
                got, expected
            ),
            Error::BadArgId(id) => write!(f, "invalid argument id {:#04x}", id),
            Error::AckXid { expected, got } => write!(
                f,
                "transaction id {:#04x} does not match expected {:#04x}",
                got, expected
            ),
            Error::Dlp(code) => write!(f, "DLP: {}", dlp_status_text(*code)),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            ErrorKind::WouldBlock | ErrorKind::TimedOut => Error::Timeout,
            ErrorKind::UnexpectedEof => Error::Eof,
            _ => Error::System(e),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::System(e) => Some(e),
            _ => None,
        }
    }
}

/// Text for a DLP status code, in the device's own terms.
pub fn dlp_status_text(code: u16) -> &'static str {
    match code {
        DLPSTAT_NOERR => "OK",
        DLPSTAT_SYSTEM => "general system error",
        DLPSTAT_ILLEGAL_REQ => "unknown request",
        DLPSTAT_NOMEM => "insufficient memory",
        DLPSTAT_PARAM => "invalid parameter",
        DLPSTAT_NOT_FOUND => "database or record not found",
        DLPSTAT_NONE_OPEN => "no databases open",
        DLPSTAT_DB_OPEN => "database already open",
        DLPSTAT_TOO_MANY_OPEN => "too many open databases",
        DLPSTAT_EXISTS => "database already exists",
        DLPSTAT_CANT_OPEN => "can't open database",
        DLPSTAT_RECORD_DELETED => "record is deleted",
        DLPSTAT_RECORD_BUSY => "record is busy",
        DLPSTAT_UNSUPPORTED => "request not supported",
        DLPSTAT_READONLY => "database is read only",
        DLPSTAT_SPACE => "not enough space on device",
        DLPSTAT_LIMIT => "size limit exceeded",
        DLPSTAT_CANCELLED => "sync cancelled",
        DLPSTAT_BAD_WRAPPER => "bad argument wrapper",
        DLPSTAT_ARG_MISSING => "required argument missing",
        DLPSTAT_ARG_SIZE => "argument has the wrong size",
        _ => "unknown error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_timeouts_map_to_timeout() {
        let e = Error::from(io::Error::new(ErrorKind::WouldBlock, "later"));
        assert!(matches!(e, Error::Timeout));
        let e = Error::from(io::Error::new(ErrorKind::TimedOut, "later"));
        assert!(matches!(e, Error::Timeout));
    }

    #[test]
    fn io_errors_keep_the_cause() {
        let e = Error::from(io::Error::new(ErrorKind::PermissionDenied, "no"));
        match e {
            Error::System(inner) => assert_eq!(inner.kind(), ErrorKind::PermissionDenied),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn dlp_status_has_text() {
        assert_eq!(dlp_status_text(0), "OK");
        assert_eq!(dlp_status_text(0x05), "database or record not found");
        assert_eq!(dlp_status_text(0xffff), "unknown error");
    }
}
