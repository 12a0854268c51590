// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Byte-level helpers shared by every protocol layer.
//!
//! Everything on the wire is big-endian unsigned. The `get_*` family
//! advances a caller-held cursor; the `put_*` family appends to an output
//! buffer.

use byteorder::{BigEndian, ByteOrder};
use log::trace;

pub fn peek_u8(buf: &[u8]) -> u8 {
    buf[0]
}

pub fn peek_u16(buf: &[u8]) -> u16 {
    BigEndian::read_u16(buf)
}

pub fn peek_u32(buf: &[u8]) -> u32 {
    BigEndian::read_u32(buf)
}

pub fn get_u8(buf: &mut &[u8]) -> u8 {
    let v = buf[0];
    *buf = &buf[1..];
    v
}

pub fn get_u16(buf: &mut &[u8]) -> u16 {
    let v = BigEndian::read_u16(buf);
    *buf = &buf[2..];
    v
}

pub fn get_u32(buf: &mut &[u8]) -> u32 {
    let v = BigEndian::read_u32(buf);
    *buf = &buf[4..];
    v
}

pub fn put_u8(out: &mut Vec<u8>, v: u8) {
    out.push(v);
}

pub fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

pub fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

/// CRC-16-CCITT with polynomial 0x1021. `seed` is 0 unless the caller is
/// continuing a checksum over a previous span.
pub fn crc16(buf: &[u8], seed: u16) -> u16 {
    let mut crc = seed;
    for &b in buf {
        crc ^= u16::from(b) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Dump a buffer in hex+ASCII at trace level, 16 bytes per line.
pub fn debug_dump(prefix: &str, buf: &[u8]) {
    if !log::log_enabled!(log::Level::Trace) {
        return;
    }
    for chunk in buf.chunks(16) {
        let mut hex = String::with_capacity(3 * 16);
        let mut ascii = String::with_capacity(16);
        for &b in chunk {
            hex.push_str(&format!("{:02x} ", b));
            ascii.push(if (0x20..0x7f).contains(&b) {
                b as char
            } else {
                '.'
            });
        }
        trace!("{} {:48} {}", prefix, hex, ascii);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_round_trip() {
        let mut out = Vec::new();
        put_u8(&mut out, 0xbe);
        put_u16(&mut out, 0x1234);
        put_u32(&mut out, 0xdead_beef);
        assert_eq!(out, [0xbe, 0x12, 0x34, 0xde, 0xad, 0xbe, 0xef]);

        let mut rd = &out[..];
        assert_eq!(get_u8(&mut rd), 0xbe);
        assert_eq!(get_u16(&mut rd), 0x1234);
        assert_eq!(get_u32(&mut rd), 0xdead_beef);
        assert!(rd.is_empty());
    }

    #[test]
    fn peek_does_not_advance() {
        let buf = [0x01, 0x02, 0x03, 0x04];
        assert_eq!(peek_u8(&buf), 0x01);
        assert_eq!(peek_u16(&buf), 0x0102);
        assert_eq!(peek_u32(&buf), 0x0102_0304);
    }

    #[test]
    fn crc16_known_answers() {
        // CCITT/XModem check value
        assert_eq!(crc16(b"123456789", 0), 0x31c3);
        assert_eq!(crc16(&[], 0), 0);
        assert_eq!(crc16(&[0], 0), 0);
        assert_eq!(crc16(b"A", 0), 0x58e5);
    }

    #[test]
    fn crc16_continuation_matches_single_pass() {
        let data = b"the quick brown fox";
        let whole = crc16(data, 0);
        let split = crc16(&data[7..], crc16(&data[..7], 0));
        assert_eq!(whole, split);
    }
}
