// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! USB transport for devices in their cradle, over the Linux usbfs node.
//!
//! The cradle firmware is picky about the open sequence: the
//! configuration must be selected and both vendor setup transfers must
//! complete before the first bulk transfer. Opening the bulk pipe early
//! has been seen to panic host kernels.

use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::time::Duration;

use log::{debug, warn};
use nix::libc;

use crate::error::Error;
use crate::serial::poll_fd;
use crate::transport::{Direction, Transport};

/// Size of the intermediate read buffer. Some kernel drivers hand back
/// everything that arrived in the last bulk transfer, so reads must be
/// staged through host memory and served out in small pieces.
const IOBUF_LEN: usize = 1024;

const DESCRIPTOR_LEN: usize = 18;

// bmRequestType = IN | vendor | endpoint
const VENDOR_ENDPOINT_IN: u8 = 0xc2;
const REQ_GET_CONNECTION_INFO: u8 = 0x03;
const REQ_GET_BYTES_AVAILABLE: u8 = 0x01;
const REQ_GET_EXT_CONNECTION_INFO: u8 = 0x04;

const EXT_CONNECTION_INFO_LEN: usize = 20;
/// Creator id of the endpoint pair that carries sync data.
const DATA_CREATOR: &[u8; 4] = b"_ppp";
/// Bulk endpoint assumed when the cradle has no extended info.
const DEFAULT_ENDPOINT: u8 = 2;

const EP_DIR_IN: u8 = 0x80;

// The usbfs ioctl surface: the one place this crate talks to the
// kernel directly, and the only unsafe code in it.
#[allow(unsafe_code)]
mod ioctl {
    use nix::libc;

    #[repr(C)]
    pub(super) struct CtrlTransfer {
        pub(super) request_type: u8,
        pub(super) request: u8,
        pub(super) value: u16,
        pub(super) index: u16,
        pub(super) length: u16,
        pub(super) timeout: u32, // milliseconds, 0 waits forever
        pub(super) data: *mut libc::c_void,
    }

    #[repr(C)]
    pub(super) struct BulkTransfer {
        pub(super) ep: libc::c_uint,
        pub(super) len: libc::c_uint,
        pub(super) timeout: libc::c_uint,
        pub(super) data: *mut libc::c_void,
    }

    nix::ioctl_readwrite!(usbdevfs_control, b'U', 0, CtrlTransfer);
    nix::ioctl_readwrite!(usbdevfs_bulk, b'U', 2, BulkTransfer);
    nix::ioctl_read!(usbdevfs_setconfiguration, b'U', 5, libc::c_uint);
}

pub struct Usb {
    dev: Option<File>,
    ep_in: u8,
    ep_out: u8,
    iobuf: [u8; IOBUF_LEN],
    iostart: usize,
    iolen: usize,
}

impl Usb {
    /// Open a cradle on the given usbfs device node.
    #[allow(unsafe_code)]
    pub fn open<P: AsRef<Path>>(device: P) -> Result<Usb, Error> {
        let mut dev = OpenOptions::new()
            .read(true)
            .write(true)
            .open(device.as_ref())
            .map_err(Error::System)?;

        identify(&mut dev)?;

        let mut cfg: libc::c_uint = 1;
        usb_ioctl(unsafe { ioctl::usbdevfs_setconfiguration(dev.as_raw_fd(), &mut cfg) })?;
        debug!("usb: selected configuration {}", cfg);

        // Two vendor setup transfers, observed on the wire from the
        // reference desktop software. Their contents are unused but the
        // cradle will not open the bulk pipe without them.
        let mut scratch = [0u8; 64];
        control_in(&dev, REQ_GET_CONNECTION_INFO, 0, DESCRIPTOR_LEN as u16, &mut scratch)?;
        control_in(&dev, REQ_GET_BYTES_AVAILABLE, 5, 2, &mut scratch)?;

        let (ep_in, ep_out) = match ext_connection_info(&dev, &mut scratch) {
            Some(pair) => pair,
            None => (DEFAULT_ENDPOINT, DEFAULT_ENDPOINT),
        };
        debug!("usb: data pipe endpoints in={:#04x} out={:#04x}", ep_in, ep_out);

        Ok(Usb {
            dev: Some(dev),
            ep_in,
            ep_out,
            iobuf: [0; IOBUF_LEN],
            iostart: 0,
            iolen: 0,
        })
    }

    fn dev(&self) -> Result<&File, Error> {
        self.dev.as_ref().ok_or(Error::Badf)
    }

    #[allow(unsafe_code)]
    fn fill(&mut self) -> Result<usize, Error> {
        let fd = self.dev()?.as_raw_fd();
        let mut xfer = ioctl::BulkTransfer {
            ep: libc::c_uint::from(self.ep_in | EP_DIR_IN),
            len: IOBUF_LEN as libc::c_uint,
            timeout: 0,
            data: self.iobuf.as_mut_ptr() as *mut libc::c_void,
        };
        let n = usb_ioctl(unsafe { ioctl::usbdevfs_bulk(fd, &mut xfer) })?;
        self.iostart = 0;
        self.iolen = n as usize;
        Ok(self.iolen)
    }
}

fn usb_ioctl(res: nix::Result<libc::c_int>) -> Result<libc::c_int, Error> {
    res.map_err(|e| Error::System(e.into()))
}

/// Issue a vendor IN control transfer and ignore its payload.
#[allow(unsafe_code)]
fn control_in(dev: &File, request: u8, index: u16, length: u16, scratch: &mut [u8]) -> Result<usize, Error> {
    let mut xfer = ioctl::CtrlTransfer {
        request_type: VENDOR_ENDPOINT_IN,
        request,
        value: 0,
        index,
        length,
        timeout: 0,
        data: scratch.as_mut_ptr() as *mut libc::c_void,
    };
    let n = usb_ioctl(unsafe { ioctl::usbdevfs_control(dev.as_raw_fd(), &mut xfer) })?;
    debug!("usb: vendor request {:#04x} returned {} bytes", request, n);
    Ok(n as usize)
}

/// Read the device descriptor off the front of the usbfs node and log
/// what is in the cradle. Unknown hardware is reported, not rejected.
fn identify(dev: &mut File) -> Result<(), Error> {
    let mut desc = [0u8; DESCRIPTOR_LEN];
    dev.read_exact(&mut desc).map_err(Error::System)?;
    // descriptor fields are little-endian, unlike the rest of the stack
    let vendor = u16::from_le_bytes([desc[8], desc[9]]);
    let product = u16::from_le_bytes([desc[10], desc[11]]);
    match ids::product_name(vendor, product) {
        Some(name) => debug!("usb: found {} ({:04x}/{:04x})", name, vendor, product),
        None => warn!("usb: unrecognized device {:04x}/{:04x}, continuing anyway", vendor, product),
    }
    Ok(())
}

/// Ask for the extended connection info and pick out the endpoint pair
/// that carries sync data. Cradles that predate the request simply fail
/// the transfer; the caller falls back to the fixed endpoint.
fn ext_connection_info(dev: &File, scratch: &mut [u8]) -> Option<(u8, u8)> {
    let n = match control_in(
        dev,
        REQ_GET_EXT_CONNECTION_INFO,
        0,
        EXT_CONNECTION_INFO_LEN as u16,
        scratch,
    ) {
        Ok(n) => n,
        Err(_) => {
            debug!("usb: no extended connection info");
            return None;
        }
    };
    parse_ext_connection_info(&scratch[..n])
}

fn parse_ext_connection_info(info: &[u8]) -> Option<(u8, u8)> {
    if info.len() < EXT_CONNECTION_INFO_LEN {
        return None;
    }
    let num_ports = info[0] as usize;
    let endpoints_assigned = info[1] != 0;
    for port in 0..num_ports.min(2) {
        let entry = &info[4 + port * 8..4 + port * 8 + 8];
        if &entry[..4] != DATA_CREATOR {
            continue;
        }
        if endpoints_assigned {
            // high nibble carries the IN endpoint, low nibble the OUT
            return Some((entry[5] >> 4, entry[5] & 0x0f));
        }
        return Some((entry[4], entry[4]));
    }
    None
}

impl Transport for Usb {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        if self.dev.is_none() {
            return Err(Error::Badf);
        }
        if self.iolen == 0 && self.fill()? == 0 {
            return Ok(0);
        }
        let n = buf.len().min(self.iolen);
        buf[..n].copy_from_slice(&self.iobuf[self.iostart..self.iostart + n]);
        self.iostart += n;
        self.iolen -= n;
        Ok(n)
    }

    #[allow(unsafe_code)]
    fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        let fd = self.dev()?.as_raw_fd();
        let mut xfer = ioctl::BulkTransfer {
            ep: libc::c_uint::from(self.ep_out),
            len: buf.len() as libc::c_uint,
            timeout: 0,
            data: buf.as_ptr() as *mut libc::c_void,
        };
        let n = usb_ioctl(unsafe { ioctl::usbdevfs_bulk(fd, &mut xfer) })?;
        Ok(n as usize)
    }

    fn drain(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        self.dev.take().ok_or(Error::Badf).map(drop)
    }

    fn select(&mut self, dir: Direction, timeout: Option<Duration>) -> Result<bool, Error> {
        if dir == Direction::Reading && self.iolen > 0 {
            return Ok(true);
        }
        // The usbfs node reports ready optimistically; buffered data
        // above is the only reliable signal we have.
        let dev = self.dev()?;
        poll_fd(dev, dir, timeout)
    }
}

pub mod ids {
    //! Vendor and product ids of the cradles this stack recognizes.

    pub const HANDSPRING_VENDOR_ID: u16 = 0x082d;
    pub const PALM_VENDOR_ID: u16 = 0x0830;
    pub const SONY_VENDOR_ID: u16 = 0x054c;
    pub const ACEECA_VENDOR_ID: u16 = 0x4766;
    pub const GARMIN_VENDOR_ID: u16 = 0x091e;

    const KNOWN: &[(u16, u16, &str)] = &[
        (HANDSPRING_VENDOR_ID, 0x0100, "Handspring Visor"),
        (HANDSPRING_VENDOR_ID, 0x0200, "Handspring Treo"),
        (HANDSPRING_VENDOR_ID, 0x0300, "Handspring Treo 600"),
        (PALM_VENDOR_ID, 0x0001, "Palm m500"),
        (PALM_VENDOR_ID, 0x0002, "Palm m505"),
        (PALM_VENDOR_ID, 0x0003, "Palm m515"),
        (PALM_VENDOR_ID, 0x0020, "Palm i705"),
        (PALM_VENDOR_ID, 0x0031, "Palm Tungsten Z"),
        (PALM_VENDOR_ID, 0x0040, "Palm m125"),
        (PALM_VENDOR_ID, 0x0050, "Palm m130"),
        (PALM_VENDOR_ID, 0x0060, "Palm Tungsten T"),
        (PALM_VENDOR_ID, 0x0061, "Palm Zire 31/72"),
        (PALM_VENDOR_ID, 0x0070, "Palm Zire"),
        (SONY_VENDOR_ID, 0x0038, "Sony Clie 3.5"),
        (SONY_VENDOR_ID, 0x0066, "Sony Clie 4.0"),
        (SONY_VENDOR_ID, 0x0095, "Sony Clie S360"),
        (SONY_VENDOR_ID, 0x009a, "Sony Clie 4.1"),
        (SONY_VENDOR_ID, 0x00da, "Sony Clie NX60"),
        (SONY_VENDOR_ID, 0x00e9, "Sony Clie NZ90V"),
        (SONY_VENDOR_ID, 0x0144, "Sony Clie UX50"),
        (SONY_VENDOR_ID, 0x0169, "Sony Clie TJ25"),
        (ACEECA_VENDOR_ID, 0x0001, "Aceeca MEZ1000"),
        (GARMIN_VENDOR_ID, 0x0004, "Garmin iQue 3600"),
    ];

    /// Look up a known cradle by vendor and product id.
    pub fn product_name(vendor: u16, product: u16) -> Option<&'static str> {
        KNOWN
            .iter()
            .find(|&&(v, p, _)| v == vendor && p == product)
            .map(|&(_, _, name)| name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_devices_resolve() {
        assert_eq!(ids::product_name(0x0830, 0x0002), Some("Palm m505"));
        assert_eq!(ids::product_name(0x054c, 0x0144), Some("Sony Clie UX50"));
        assert_eq!(ids::product_name(0x1234, 0x0001), None);
    }

    #[test]
    fn ext_connection_info_picks_the_data_pipe() {
        let mut info = vec![0u8; EXT_CONNECTION_INFO_LEN];
        info[0] = 2; // two ports
        info[1] = 1; // endpoint numbers assigned
        info[4..8].copy_from_slice(b"cnys"); // some other function
        info[8] = 1;
        info[9] = 0x11;
        info[12..16].copy_from_slice(b"_ppp");
        info[16] = 2;
        info[17] = 0x34;
        assert_eq!(parse_ext_connection_info(&info), Some((3, 4)));
    }

    #[test]
    fn ext_connection_info_without_assignments_uses_port_number() {
        let mut info = vec![0u8; EXT_CONNECTION_INFO_LEN];
        info[0] = 1;
        info[1] = 0;
        info[4..8].copy_from_slice(b"_ppp");
        info[8] = 2;
        assert_eq!(parse_ext_connection_info(&info), Some((2, 2)));
    }

    #[test]
    fn short_ext_connection_info_is_rejected() {
        assert_eq!(parse_ext_connection_info(&[0u8; 4]), None);
    }
}
