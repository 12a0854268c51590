// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! This crate provides communication tools for Palm OS handheld devices.
//!
//! The stack is layered the way the protocol family is: SLP framing at
//! the bottom, PADP reliability on top of it, CMP for the one-shot rate
//! negotiation, and DLP request/reply above everything. Network sync
//! swaps the lower layers for NetSync framing over TCP. A
//! [`conn::Connection`] picks the right layers for its transport and is
//! the only handle most callers need.
//!
//! # Examples
//! ```no_run
//! # use hotsync::conn::Connection;
//! # use hotsync::dlp_cmd;
//! # use hotsync::error::Error;
//! # fn main() -> Result<(), Error> {
//! let mut conn = Connection::on_serial("/dev/ttyS0", Some(115_200))?;
//!
//! let info = dlp_cmd::read_sys_info(&mut conn)?;
//! println!("ROM version {:#010x}", info.rom_version);
//!
//! dlp_cmd::add_sync_log_entry(&mut conn, "Backup complete")?;
//! dlp_cmd::end_of_sync(&mut conn, dlp_cmd::SYNC_STATUS_OK)?;
//! conn.close()
//! # }
//! ```
pub mod cmp;
pub mod conn;
pub mod dlp;
pub mod dlp_cmd;
pub mod error;
pub mod netsync;
pub mod padp;
pub mod serial;
pub mod slp;
pub mod spc;
pub mod tcp;
pub mod transport;
pub mod usb;
pub mod util;

pub use crate::conn::Connection;
pub use crate::error::Error;
