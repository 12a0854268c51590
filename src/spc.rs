// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Serialized Procedure Call: DLP through a pipe.
//!
//! Helper programs spawned during a sync do not own the device. They
//! inherit a pipe to the process that does, and forward their DLP
//! requests through it with a small header: `op (2), status (2),
//! length (4)`. The owning process relays the request to the device
//! and pipes the reply back with the same header.

use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::OwnedFd;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use log::error;

use crate::error::Error;
use crate::serial::poll_fd;
use crate::transport::{read_exact, write_all, Direction, Transport};
use crate::util::{put_u16, put_u32};

pub const HEADER_LEN: usize = 8;

/// Operations understood by the device's owner.
pub mod op {
    pub const NOP: u16 = 0;
    pub const DBINFO: u16 = 1;
    pub const DLPC: u16 = 2;
}

/// Status codes in reply headers.
pub mod status {
    pub const OK: u16 = 0;
    pub const BADOP: u16 = 1;
    pub const NOMEM: u16 = 2;
}

/// The pipe inherited from the owning process.
pub struct Pipe {
    file: Option<File>,
}

impl Pipe {
    pub fn new(fd: OwnedFd) -> Pipe {
        Pipe {
            file: Some(File::from(fd)),
        }
    }

    fn file(&mut self) -> Result<&mut File, Error> {
        self.file.as_mut().ok_or(Error::Badf)
    }
}

impl Transport for Pipe {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        Ok(self.file()?.read(buf)?)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        Ok(self.file()?.write(buf)?)
    }

    fn drain(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        self.file.take().ok_or(Error::Badf).map(drop)
    }

    fn select(&mut self, dir: Direction, timeout: Option<Duration>) -> Result<bool, Error> {
        let file = self.file()?;
        poll_fd(file, dir, timeout)
    }
}

pub(crate) struct SpcClient {
    inbuf: Vec<u8>,
}

impl SpcClient {
    pub fn new() -> SpcClient {
        SpcClient { inbuf: Vec::new() }
    }

    /// Forward one DLP request.
    pub fn write<T: Transport + ?Sized>(&mut self, io: &mut T, buf: &[u8]) -> Result<(), Error> {
        let mut hdr = Vec::with_capacity(HEADER_LEN);
        put_u16(&mut hdr, op::DLPC);
        put_u16(&mut hdr, 0);
        put_u32(&mut hdr, buf.len() as u32);
        write_all(io, &hdr)?;
        write_all(io, buf)
    }

    /// Read back one relayed DLP reply.
    pub fn read<T: Transport + ?Sized>(&mut self, io: &mut T) -> Result<&[u8], Error> {
        let mut hdr = [0u8; HEADER_LEN];
        read_exact(io, &mut hdr)?;
        let status = BigEndian::read_u16(&hdr[2..4]);
        let len = BigEndian::read_u32(&hdr[4..8]) as usize;
        if status != status::OK {
            error!("SPC: owner refused the request, status {}", status);
            return Err(Error::Abort);
        }
        self.inbuf.resize(len, 0);
        read_exact(io, &mut self.inbuf[..len])?;
        Ok(&self.inbuf[..len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::ScriptedLink;

    fn reply(status_code: u16, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        put_u16(&mut out, op::DLPC);
        put_u16(&mut out, status_code);
        put_u32(&mut out, payload.len() as u32);
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn requests_are_wrapped_in_the_header() {
        let mut link = ScriptedLink::empty();
        let mut spc = SpcClient::new();
        spc.write(&mut link, &[0x12, 0x00]).unwrap();
        assert_eq!(
            link.tx,
            &[0x00, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02, 0x12, 0x00]
        );
    }

    #[test]
    fn replies_are_unwrapped() {
        let mut link = ScriptedLink::new(reply(status::OK, &[0x92, 0x00, 0x00, 0x00]));
        let mut spc = SpcClient::new();
        assert_eq!(spc.read(&mut link).unwrap(), &[0x92, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn owner_errors_fail_the_read() {
        let mut link = ScriptedLink::new(reply(status::BADOP, &[]));
        let mut spc = SpcClient::new();
        assert!(matches!(spc.read(&mut link), Err(Error::Abort)));
    }
}
