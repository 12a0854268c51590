// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! The transport seam between the protocol stack and the outside world.

use std::time::Duration;

use crate::error::Error;

/// Which way a [`Transport::select`] call is waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Reading,
    Writing,
}

/// An abstract byte link used by the protocol stack.
///
/// Implementors wrap a serial tty, a USB bulk pipe, a TCP stream or a
/// plain pipe. All operations block the calling thread; the stack is
/// strictly synchronous and a transport is owned by exactly one
/// connection.
pub trait Transport {
    /// Read up to `buf.len()` bytes. A return of 0 means end of file.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error>;

    /// Write up to `buf.len()` bytes, returning how many were taken.
    fn write(&mut self, buf: &[u8]) -> Result<usize, Error>;

    /// Block until everything buffered for output has left the host.
    fn drain(&mut self) -> Result<(), Error>;

    /// Release the underlying descriptor. Further operations fail with
    /// [`Error::Badf`].
    fn close(&mut self) -> Result<(), Error>;

    /// Wait until the link is ready in the given direction. `false`
    /// means the timeout expired; `None` waits forever.
    fn select(&mut self, dir: Direction, timeout: Option<Duration>) -> Result<bool, Error>;

    /// Reprogram the line rate. Only meaningful for serial links.
    fn set_speed(&mut self, _bps: u32) -> Result<(), Error> {
        Ok(())
    }
}

impl Transport for Box<dyn Transport> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        (**self).read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        (**self).write(buf)
    }

    fn drain(&mut self) -> Result<(), Error> {
        (**self).drain()
    }

    fn close(&mut self) -> Result<(), Error> {
        (**self).close()
    }

    fn select(&mut self, dir: Direction, timeout: Option<Duration>) -> Result<bool, Error> {
        (**self).select(dir, timeout)
    }

    fn set_speed(&mut self, bps: u32) -> Result<(), Error> {
        (**self).set_speed(bps)
    }
}

/// Read exactly `buf.len()` bytes, looping over short reads.
pub(crate) fn read_exact<T: Transport + ?Sized>(io: &mut T, buf: &mut [u8]) -> Result<(), Error> {
    let mut got = 0;
    while got < buf.len() {
        let n = io.read(&mut buf[got..])?;
        if n == 0 {
            return Err(Error::Eof);
        }
        got += n;
    }
    Ok(())
}

/// Write all of `buf`, looping over short writes.
pub(crate) fn write_all<T: Transport + ?Sized>(io: &mut T, buf: &[u8]) -> Result<(), Error> {
    let mut sent = 0;
    while sent < buf.len() {
        let n = io.write(&buf[sent..])?;
        if n == 0 {
            return Err(Error::Eof);
        }
        sent += n;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// What an exhausted [`ScriptedLink`] reports from `select`.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub(crate) enum WhenEmpty {
        /// Reads return end of file; the default for codec tests.
        Eof,
        /// `select` reports a timeout; used to drive retry paths.
        Timeout,
    }

    /// An in-memory transport fed from a script.
    pub(crate) struct ScriptedLink {
        rx: Vec<u8>,
        pos: usize,
        pub(crate) tx: Vec<u8>,
        /// Number of `write` calls, i.e. framed units sent.
        pub(crate) writes: usize,
        pub(crate) when_empty: WhenEmpty,
        closed: bool,
    }

    impl ScriptedLink {
        pub(crate) fn new(rx: Vec<u8>) -> ScriptedLink {
            ScriptedLink {
                rx,
                pos: 0,
                tx: Vec::new(),
                writes: 0,
                when_empty: WhenEmpty::Eof,
                closed: false,
            }
        }

        pub(crate) fn empty() -> ScriptedLink {
            ScriptedLink::new(Vec::new())
        }

        fn remaining(&self) -> usize {
            self.rx.len() - self.pos
        }
    }

    impl Transport for ScriptedLink {
        fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
            if self.closed {
                return Err(Error::Badf);
            }
            let n = buf.len().min(self.remaining());
            buf[..n].copy_from_slice(&self.rx[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }

        fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
            if self.closed {
                return Err(Error::Badf);
            }
            self.tx.extend_from_slice(buf);
            self.writes += 1;
            Ok(buf.len())
        }

        fn drain(&mut self) -> Result<(), Error> {
            Ok(())
        }

        fn close(&mut self) -> Result<(), Error> {
            self.closed = true;
            Ok(())
        }

        fn select(&mut self, dir: Direction, _timeout: Option<Duration>) -> Result<bool, Error> {
            if self.closed {
                return Err(Error::Badf);
            }
            match dir {
                Direction::Writing => Ok(true),
                Direction::Reading => {
                    if self.remaining() > 0 {
                        Ok(true)
                    } else {
                        match self.when_empty {
                            // a zero-length read reports EOF upward
                            WhenEmpty::Eof => Ok(true),
                            WhenEmpty::Timeout => Ok(false),
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn read_exact_loops_and_reports_eof() {
        let mut link = ScriptedLink::new(vec![1, 2, 3]);
        let mut buf = [0u8; 3];
        read_exact(&mut link, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3]);

        let mut short = [0u8; 2];
        assert!(matches!(
            read_exact(&mut link, &mut short),
            Err(Error::Eof)
        ));
    }
}
