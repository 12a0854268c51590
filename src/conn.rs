// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! The connection object.
//!
//! A [`Connection`] owns its transport and all per-layer state, and
//! routes DLP reads and writes through whichever framing the transport
//! calls for: SLP+PADP for cradles, NetSync for TCP, or the SPC pipe
//! for out-of-process helpers. A connection is not thread safe and
//! carries at most one request/reply exchange at a time; `&mut self`
//! enforces both.

use std::net::TcpStream;
use std::os::fd::OwnedFd;
use std::path::Path;

use log::debug;

use crate::cmp;
use crate::error::Error;
use crate::netsync::{self, NetSync};
use crate::padp::Padp;
use crate::serial::Serial;
use crate::slp::{port, proto, Slp, SlpAddr};
use crate::spc::{Pipe, SpcClient};
use crate::tcp::Tcp;
use crate::transport::Transport;
use crate::usb::Usb;

enum Link {
    /// Reliable fragments over SLP framing (serial and USB cradles).
    Padp { slp: Slp, padp: Padp },
    /// NetSync framing; the transport itself is reliable.
    Net(NetSync),
    /// DLP relayed through a pipe to the process owning the device.
    Spc(SpcClient),
}

pub struct Connection<T: Transport> {
    io: T,
    link: Link,
    speed: Option<u32>,
    open: bool,
}

impl Connection<Serial> {
    /// Open a serial cradle: raw tty, CMP handshake, line rate change.
    ///
    /// `rate` is the desired speed in bps; `None` accepts whatever the
    /// device offers.
    pub fn on_serial<P: AsRef<Path>>(device: P, rate: Option<u32>) -> Result<Connection<Serial>, Error> {
        let io = Serial::open(device)?;
        Connection::accept_cradle(io, rate.unwrap_or(0))
    }
}

impl Connection<Usb> {
    /// Open a USB cradle. The handshake is the same as serial, but the
    /// rate in the INIT packet is only ever echoed; there is no line to
    /// reprogram.
    pub fn on_usb<P: AsRef<Path>>(device: P) -> Result<Connection<Usb>, Error> {
        let io = Usb::open(device)?;
        Connection::accept_cradle(io, 0)
    }
}

impl Connection<Tcp> {
    /// Wrap a TCP stream accepted from a device that answered our
    /// wakeup ack.
    pub fn on_tcp(stream: TcpStream) -> Result<Connection<Tcp>, Error> {
        Connection::accept_net(Tcp::from_stream(stream)?)
    }
}

impl Connection<Pipe> {
    /// Use the DLP service of the process that spawned us.
    pub fn spc_client(fd: OwnedFd) -> Connection<Pipe> {
        Connection {
            io: Pipe::new(fd),
            link: Link::Spc(SpcClient::new()),
            speed: None,
            open: true,
        }
    }
}

impl<T: Transport> Connection<T> {
    /// Build the cradle-side stack over an already-open transport and
    /// run the CMP handshake on it.
    pub fn accept_cradle(mut io: T, rate: u32) -> Result<Connection<T>, Error> {
        let mut slp = Slp::new();
        slp.bind(SlpAddr {
            protocol: proto::PAD,
            port: port::DLP,
        });
        let mut padp = Padp::new();

        let speed = match cmp::accept(&mut io, &mut slp, &mut padp, rate) {
            Ok(speed) => speed,
            Err(e) => {
                let _ = io.close();
                return Err(e);
            }
        };
        if speed != 0 {
            if let Err(e) = io.set_speed(speed) {
                let _ = io.close();
                return Err(e);
            }
        }
        debug!("connection up, {} bps", speed);
        Ok(Connection {
            io,
            link: Link::Padp { slp, padp },
            speed: Some(speed),
            open: true,
        })
    }

    /// Host side of a NetSync link: run the opening ritual, then carry
    /// DLP in NetSync frames. Also used for cradles that frame over USB.
    pub fn accept_net(mut io: T) -> Result<Connection<T>, Error> {
        let mut net = NetSync::new();
        if let Err(e) = netsync::ritual_exch_server(&mut net, &mut io) {
            let _ = io.close();
            return Err(e);
        }
        Ok(Connection {
            io,
            link: Link::Net(net),
            speed: None,
            open: true,
        })
    }

    /// Device side of a NetSync link, for tools that play the device.
    pub fn connect_net(mut io: T) -> Result<Connection<T>, Error> {
        let mut net = NetSync::new();
        if let Err(e) = netsync::ritual_exch_client(&mut net, &mut io) {
            let _ = io.close();
            return Err(e);
        }
        Ok(Connection {
            io,
            link: Link::Net(net),
            speed: None,
            open: true,
        })
    }

    /// Rebind the SLP address this connection listens on. Only
    /// meaningful on cradle links.
    pub fn bind(&mut self, addr: SlpAddr) -> Result<(), Error> {
        match &mut self.link {
            Link::Padp { slp, .. } => {
                slp.bind(addr);
                Ok(())
            }
            _ => Err(Error::Badf),
        }
    }

    /// The line rate CMP settled on; `None` on transports without one.
    pub fn speed(&self) -> Option<u32> {
        self.speed
    }

    /// Send one DLP request.
    pub fn dlp_write(&mut self, buf: &[u8]) -> Result<(), Error> {
        if !self.open {
            return Err(Error::Badf);
        }
        let Connection { io, link, .. } = self;
        match link {
            Link::Padp { slp, padp } => padp.write(io, slp, buf),
            Link::Net(net) => net.write(io, buf),
            Link::Spc(spc) => spc.write(io, buf),
        }
    }

    /// Receive one DLP reply. The slice borrows the connection's input
    /// buffer and is valid until the next read.
    pub fn dlp_read(&mut self) -> Result<&[u8], Error> {
        if !self.open {
            return Err(Error::Badf);
        }
        let Connection { io, link, .. } = self;
        match link {
            Link::Padp { slp, padp } => padp.read(io, slp),
            Link::Net(net) => net.read(io),
            Link::Spc(spc) => spc.read(io),
        }
    }

    /// Flush whatever is still queued for the device and release the
    /// transport. Without the flush the device never sees the ACK for
    /// its last reply and hangs until it times out.
    pub fn close(&mut self) -> Result<(), Error> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        let _ = self.io.drain();
        self.io.close()
    }

    #[cfg(test)]
    pub(crate) fn test_net(io: T) -> Connection<T> {
        Connection {
            io,
            link: Link::Net(NetSync::new()),
            speed: None,
            open: true,
        }
    }

    #[cfg(test)]
    pub(crate) fn test_io(&mut self) -> &mut T {
        &mut self.io
    }
}

impl<T: Transport> Drop for Connection<T> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::ScriptedLink;

    #[test]
    fn closed_connection_refuses_io() {
        let mut conn = Connection::test_net(ScriptedLink::empty());
        conn.close().unwrap();
        assert!(matches!(conn.dlp_read(), Err(Error::Badf)));
        assert!(matches!(conn.dlp_write(&[1]), Err(Error::Badf)));
        // closing twice is fine
        conn.close().unwrap();
    }

    #[test]
    fn bind_is_only_for_cradle_links() {
        let mut conn = Connection::test_net(ScriptedLink::empty());
        let addr = SlpAddr {
            protocol: proto::PAD,
            port: port::DLP,
        };
        assert!(matches!(conn.bind(addr), Err(Error::Badf)));
    }

    #[test]
    fn net_link_round_trips_dlp_payloads() {
        let mut rx = Vec::new();
        // one frame: cmd 1, xid 7, the reply bytes
        rx.extend_from_slice(&[1, 7, 0, 0, 0, 4, 0x92, 0, 0, 0]);
        let mut conn = Connection::test_net(ScriptedLink::new(rx));

        conn.dlp_write(&[0x12, 0x00]).unwrap();
        assert_eq!(conn.test_io().tx, &[1, 1, 0, 0, 0, 2, 0x12, 0x00]);
        assert_eq!(conn.dlp_read().unwrap(), &[0x92, 0, 0, 0]);
    }
}
