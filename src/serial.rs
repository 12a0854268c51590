// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Serial tty transport.

use std::convert::TryFrom;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::AsFd;
use std::path::Path;
use std::thread;
use std::time::Duration;

use log::debug;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::termios::{self, BaudRate, SetArg};

use crate::error::Error;
use crate::transport::{Direction, Transport};

/// The handshake always starts at 9600 bps; CMP renegotiates from there.
pub const INITIAL_RATE: u32 = 9600;

pub struct Serial {
    file: Option<File>,
}

impl Serial {
    /// Open the named tty and put it into raw 8N1 mode at the initial rate.
    pub fn open<P: AsRef<Path>>(device: P) -> Result<Serial, Error> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(device.as_ref())
            .map_err(Error::System)?;

        let mut term = termios::tcgetattr(&file).map_err(sys)?;
        termios::cfmakeraw(&mut term);
        termios::cfsetispeed(&mut term, BaudRate::B9600).map_err(sys)?;
        termios::cfsetospeed(&mut term, BaudRate::B9600).map_err(sys)?;
        termios::tcsetattr(&file, SetArg::TCSANOW, &term).map_err(sys)?;

        debug!("serial: opened {} at {} bps", device.as_ref().display(), INITIAL_RATE);
        Ok(Serial { file: Some(file) })
    }

    fn file(&mut self) -> Result<&mut File, Error> {
        self.file.as_mut().ok_or(Error::Badf)
    }
}

fn sys(e: nix::Error) -> Error {
    Error::System(e.into())
}

fn baud_rate(bps: u32) -> Option<BaudRate> {
    match bps {
        1200 => Some(BaudRate::B1200),
        2400 => Some(BaudRate::B2400),
        4800 => Some(BaudRate::B4800),
        9600 => Some(BaudRate::B9600),
        19_200 => Some(BaudRate::B19200),
        38_400 => Some(BaudRate::B38400),
        57_600 => Some(BaudRate::B57600),
        115_200 => Some(BaudRate::B115200),
        230_400 => Some(BaudRate::B230400),
        _ => None,
    }
}

pub(crate) fn poll_fd<F: AsFd>(
    fd: &F,
    dir: Direction,
    timeout: Option<Duration>,
) -> Result<bool, Error> {
    let flags = match dir {
        Direction::Reading => PollFlags::POLLIN,
        Direction::Writing => PollFlags::POLLOUT,
    };
    let wait = match timeout {
        None => PollTimeout::NONE,
        Some(t) => {
            let ms = t.as_millis().min(i32::MAX as u128) as i32;
            PollTimeout::try_from(ms).unwrap_or(PollTimeout::MAX)
        }
    };
    let mut fds = [PollFd::new(fd.as_fd(), flags)];
    let n = poll(&mut fds, wait).map_err(sys)?;
    Ok(n > 0)
}

impl Transport for Serial {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        Ok(self.file()?.read(buf)?)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        Ok(self.file()?.write(buf)?)
    }

    fn drain(&mut self) -> Result<(), Error> {
        let file = self.file()?;
        termios::tcdrain(&*file).map_err(sys)
    }

    fn close(&mut self) -> Result<(), Error> {
        // dropping the handle closes the descriptor
        self.file.take().ok_or(Error::Badf).map(drop)
    }

    fn select(&mut self, dir: Direction, timeout: Option<Duration>) -> Result<bool, Error> {
        let file = self.file()?;
        poll_fd(file, dir, timeout)
    }

    fn set_speed(&mut self, bps: u32) -> Result<(), Error> {
        let rate = match baud_rate(bps) {
            Some(r) => r,
            None => {
                return Err(Error::System(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("unsupported line rate {} bps", bps),
                )))
            }
        };
        let file = self.file()?;
        let mut term = termios::tcgetattr(&*file).map_err(sys)?;
        termios::cfsetispeed(&mut term, rate).map_err(sys)?;
        termios::cfsetospeed(&mut term, rate).map_err(sys)?;
        termios::tcsetattr(&*file, SetArg::TCSANOW, &term).map_err(sys)?;
        debug!("serial: line rate now {} bps", bps);

        // The pseudo-tty cradle emulators need a moment after the rate
        // change before they start listening at the new speed.
        thread::sleep(Duration::from_secs(1));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baud_rates_cover_the_negotiable_range() {
        for &bps in &[9600u32, 19_200, 38_400, 57_600, 115_200] {
            assert!(baud_rate(bps).is_some(), "{} bps missing", bps);
        }
        assert!(baud_rate(12_345).is_none());
    }

    #[test]
    fn closed_port_reports_badf() {
        let mut port = Serial { file: None };
        let mut buf = [0u8; 1];
        assert!(matches!(port.read(&mut buf), Err(Error::Badf)));
        assert!(matches!(port.write(&buf), Err(Error::Badf)));
        assert!(matches!(port.drain(), Err(Error::Badf)));
    }
}
