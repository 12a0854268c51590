// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! TCP transport for network sync.

use std::io::{Read, Write};
use std::net::{IpAddr, Shutdown, TcpStream};
use std::time::Duration;

use crate::error::Error;
use crate::netsync;
use crate::serial::poll_fd;
use crate::transport::{Direction, Transport};

/// How long a read may sit idle before the peer is presumed gone.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(20);

/// A set of options for the TCP connection.
#[derive(Debug, Clone)]
pub struct Options {
    pub connection_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    address: String,
}

impl Options {
    pub fn new(address: IpAddr) -> Options {
        Options {
            connection_timeout: None,
            read_timeout: Some(WAIT_TIMEOUT),
            write_timeout: Some(WAIT_TIMEOUT),
            address: format!("{}:{}", address, netsync::DATA_PORT),
        }
    }
}

pub struct Tcp {
    stream: Option<TcpStream>,
}

impl Tcp {
    /// Connect out to a listening peer. Normal sync runs the other way
    /// around (the device dials in); this is for tools that play the
    /// device side.
    pub fn connect(options: Options) -> Result<Tcp, Error> {
        let stream = match options.connection_timeout {
            Some(timeout) => match options.address.parse::<std::net::SocketAddr>() {
                Ok(socket_address) => {
                    TcpStream::connect_timeout(&socket_address, timeout).map_err(Error::System)?
                }
                Err(e) => {
                    return Err(Error::System(std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        e.to_string(),
                    )))
                }
            },
            None => TcpStream::connect(&options.address).map_err(Error::System)?,
        };
        stream.set_read_timeout(options.read_timeout).map_err(Error::System)?;
        stream.set_write_timeout(options.write_timeout).map_err(Error::System)?;
        Ok(Tcp {
            stream: Some(stream),
        })
    }

    /// Wrap a stream accepted from a listening socket.
    pub fn from_stream(stream: TcpStream) -> Result<Tcp, Error> {
        stream.set_read_timeout(Some(WAIT_TIMEOUT)).map_err(Error::System)?;
        stream.set_write_timeout(Some(WAIT_TIMEOUT)).map_err(Error::System)?;
        Ok(Tcp {
            stream: Some(stream),
        })
    }

    fn stream(&mut self) -> Result<&mut TcpStream, Error> {
        self.stream.as_mut().ok_or(Error::Badf)
    }
}

impl Transport for Tcp {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        Ok(self.stream()?.read(buf)?)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        Ok(self.stream()?.write(buf)?)
    }

    fn drain(&mut self) -> Result<(), Error> {
        // the kernel owns the send buffer; nothing to wait for
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        let stream = self.stream.take().ok_or(Error::Badf)?;
        match stream.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            // the peer may already be gone
            Err(ref e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(Error::System(e)),
        }
    }

    fn select(&mut self, dir: Direction, timeout: Option<Duration>) -> Result<bool, Error> {
        let stream = self.stream()?;
        poll_fd(stream, dir, timeout)
    }
}
