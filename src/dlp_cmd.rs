// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Typed DLP commands.
//!
//! The raw layer in [`crate::dlp`] moves opaque request and reply
//! blobs; this module knows the layouts of the commands a sync
//! actually uses. Every function issues exactly one request and fails
//! on a non-zero device status.

use crate::conn::Connection;
use crate::dlp::{self, DlpArg, DlpResponse, ARG_BASE};
use crate::error::Error;
use crate::transport::Transport;
use crate::util::{get_u16, get_u32, get_u8, put_u16, put_u32, put_u8};

const READ_SYS_INFO: u8 = 0x12;
const GET_SYS_DATE_TIME: u8 = 0x13;
const SET_SYS_DATE_TIME: u8 = 0x14;
const OPEN_DB: u8 = 0x17;
const CLOSE_DB: u8 = 0x19;
const DELETE_DB: u8 = 0x1a;
const READ_RECORD: u8 = 0x20;
const ADD_SYNC_LOG_ENTRY: u8 = 0x2a;
const OPEN_CONDUIT: u8 = 0x2e;
const END_OF_SYNC: u8 = 0x2f;

// Database open modes, OR-able.
pub const OPEN_MODE_SECRET: u8 = 0x10;
pub const OPEN_MODE_EXCLUSIVE: u8 = 0x20;
pub const OPEN_MODE_WRITE: u8 = 0x40;
pub const OPEN_MODE_READ: u8 = 0x80;

// Termination status for end_of_sync.
pub const SYNC_STATUS_OK: u16 = 0;
pub const SYNC_STATUS_OUT_OF_MEMORY: u16 = 1;
pub const SYNC_STATUS_CANCELLED: u16 = 2;
pub const SYNC_STATUS_OTHER: u16 = 3;

/// "Read to the end of the record."
const RECORD_TO_END: u16 = 0xffff;

/// What the device reports about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SysInfo {
    pub rom_version: u32,
    pub localization: u32,
    pub product_id: Vec<u8>,
}

/// The device's idea of date and time. Eight bytes on the wire, the
/// last one padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DlpTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl DlpTime {
    fn parse(mut rd: &[u8]) -> Result<DlpTime, Error> {
        if rd.len() < 8 {
            return Err(Error::Eof);
        }
        Ok(DlpTime {
            year: get_u16(&mut rd),
            month: get_u8(&mut rd),
            day: get_u8(&mut rd),
            hour: get_u8(&mut rd),
            minute: get_u8(&mut rd),
            second: get_u8(&mut rd),
        })
    }

    fn emit(&self, out: &mut Vec<u8>) {
        put_u16(out, self.year);
        put_u8(out, self.month);
        put_u8(out, self.day);
        put_u8(out, self.hour);
        put_u8(out, self.minute);
        put_u8(out, self.second);
        put_u8(out, 0);
    }
}

/// One record, as returned by the read-record requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub id: u32,
    pub index: u16,
    pub attributes: u8,
    pub category: u8,
    pub data: Vec<u8>,
}

fn first_arg(resp: &DlpResponse) -> Result<&[u8], Error> {
    resp.arg(ARG_BASE).ok_or(Error::Eof)
}

pub fn read_sys_info<T: Transport>(conn: &mut Connection<T>) -> Result<SysInfo, Error> {
    let resp = dlp::request(conn, READ_SYS_INFO, &[])?.ok()?;
    let mut rd = first_arg(&resp)?;
    if rd.len() < 10 {
        return Err(Error::Eof);
    }
    let rom_version = get_u32(&mut rd);
    let localization = get_u32(&mut rd);
    let _pad = get_u8(&mut rd);
    let prod_len = usize::from(get_u8(&mut rd));
    if rd.len() < prod_len {
        return Err(Error::Eof);
    }
    Ok(SysInfo {
        rom_version,
        localization,
        product_id: rd[..prod_len].to_vec(),
    })
}

pub fn get_sys_date_time<T: Transport>(conn: &mut Connection<T>) -> Result<DlpTime, Error> {
    let resp = dlp::request(conn, GET_SYS_DATE_TIME, &[])?.ok()?;
    DlpTime::parse(first_arg(&resp)?)
}

pub fn set_sys_date_time<T: Transport>(
    conn: &mut Connection<T>,
    time: &DlpTime,
) -> Result<(), Error> {
    let mut data = Vec::with_capacity(8);
    time.emit(&mut data);
    dlp::request(conn, SET_SYS_DATE_TIME, &[DlpArg { id: ARG_BASE, data: &data }])?.ok()?;
    Ok(())
}

/// Tell the device a conduit is about to run; it updates its progress
/// display and arms the cancel button.
pub fn open_conduit<T: Transport>(conn: &mut Connection<T>) -> Result<(), Error> {
    dlp::request(conn, OPEN_CONDUIT, &[])?.ok()?;
    Ok(())
}

/// Open a database by name and return its handle.
pub fn open_db<T: Transport>(
    conn: &mut Connection<T>,
    card: u8,
    mode: u8,
    name: &str,
) -> Result<u8, Error> {
    let mut data = Vec::with_capacity(2 + name.len() + 1);
    put_u8(&mut data, card);
    put_u8(&mut data, mode);
    data.extend_from_slice(name.as_bytes());
    put_u8(&mut data, 0);
    let resp = dlp::request(conn, OPEN_DB, &[DlpArg { id: ARG_BASE, data: &data }])?.ok()?;
    let arg = first_arg(&resp)?;
    if arg.is_empty() {
        return Err(Error::Eof);
    }
    Ok(arg[0])
}

pub fn close_db<T: Transport>(conn: &mut Connection<T>, handle: u8) -> Result<(), Error> {
    let data = [handle];
    dlp::request(conn, CLOSE_DB, &[DlpArg { id: ARG_BASE, data: &data }])?.ok()?;
    Ok(())
}

pub fn delete_db<T: Transport>(
    conn: &mut Connection<T>,
    card: u8,
    name: &str,
) -> Result<(), Error> {
    let mut data = Vec::with_capacity(2 + name.len() + 1);
    put_u8(&mut data, card);
    put_u8(&mut data, 0);
    data.extend_from_slice(name.as_bytes());
    put_u8(&mut data, 0);
    dlp::request(conn, DELETE_DB, &[DlpArg { id: ARG_BASE, data: &data }])?.ok()?;
    Ok(())
}

fn parse_record(resp: &DlpResponse) -> Result<Record, Error> {
    let mut rd = first_arg(resp)?;
    if rd.len() < 10 {
        return Err(Error::Eof);
    }
    let id = get_u32(&mut rd);
    let index = get_u16(&mut rd);
    let size = usize::from(get_u16(&mut rd));
    let attributes = get_u8(&mut rd);
    let category = get_u8(&mut rd);
    if rd.len() < size {
        return Err(Error::Eof);
    }
    Ok(Record {
        id,
        index,
        attributes,
        category,
        data: rd[..size].to_vec(),
    })
}

/// Read a whole record by its unique id.
pub fn read_record_by_id<T: Transport>(
    conn: &mut Connection<T>,
    handle: u8,
    id: u32,
) -> Result<Record, Error> {
    let mut data = Vec::with_capacity(10);
    put_u8(&mut data, handle);
    put_u8(&mut data, 0);
    put_u32(&mut data, id);
    put_u16(&mut data, 0); // offset
    put_u16(&mut data, RECORD_TO_END);
    let resp = dlp::request(conn, READ_RECORD, &[DlpArg { id: ARG_BASE, data: &data }])?.ok()?;
    parse_record(&resp)
}

/// Read a whole record by its position in the database.
pub fn read_record_by_index<T: Transport>(
    conn: &mut Connection<T>,
    handle: u8,
    index: u16,
) -> Result<Record, Error> {
    let mut data = Vec::with_capacity(8);
    put_u8(&mut data, handle);
    put_u8(&mut data, 0);
    put_u16(&mut data, index);
    put_u16(&mut data, 0); // offset
    put_u16(&mut data, RECORD_TO_END);
    let resp = dlp::request(
        conn,
        READ_RECORD,
        &[DlpArg { id: ARG_BASE + 1, data: &data }],
    )?
    .ok()?;
    parse_record(&resp)
}

/// Append a line to the log the device shows after the sync.
pub fn add_sync_log_entry<T: Transport>(conn: &mut Connection<T>, text: &str) -> Result<(), Error> {
    let mut data = Vec::with_capacity(text.len() + 1);
    data.extend_from_slice(text.as_bytes());
    put_u8(&mut data, 0);
    dlp::request(conn, ADD_SYNC_LOG_ENTRY, &[DlpArg { id: ARG_BASE, data: &data }])?.ok()?;
    Ok(())
}

/// Terminate the sync. The device drops the connection afterwards.
pub fn end_of_sync<T: Transport>(conn: &mut Connection<T>, status: u16) -> Result<(), Error> {
    let mut data = Vec::with_capacity(2);
    put_u16(&mut data, status);
    dlp::request(conn, END_OF_SYNC, &[DlpArg { id: ARG_BASE, data: &data }])?.ok()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::ScriptedLink;

    /// NetSync-frame a canned DLP reply for the scripted link.
    fn framed_reply(code: u8, status: u16, args: &[(u8, Vec<u8>)]) -> Vec<u8> {
        let mut payload = vec![code | 0x80, args.len() as u8];
        payload.extend_from_slice(&status.to_be_bytes());
        for (id, data) in args {
            // tiny form is enough for every canned reply here
            payload.push(*id);
            payload.push(data.len() as u8);
            payload.extend_from_slice(data);
        }
        let mut out = vec![1, 0x42];
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&payload);
        out
    }

    /// The DLP payload of the single request frame in `tx`.
    fn sent_request(tx: &[u8]) -> Vec<u8> {
        assert!(tx.len() >= 6);
        tx[6..].to_vec()
    }

    #[test]
    fn read_sys_info_parses_the_reply() {
        let mut arg = vec![0x03, 0x50, 0x30, 0x00]; // ROM 3.5
        arg.extend_from_slice(&[0x00, 0x00, 0x00, 0x01]); // localization
        arg.push(0); // pad
        arg.push(4);
        arg.extend_from_slice(b"palm");
        let rx = framed_reply(READ_SYS_INFO, 0, &[(ARG_BASE, arg)]);
        let mut conn = Connection::test_net(ScriptedLink::new(rx));

        let info = read_sys_info(&mut conn).unwrap();
        assert_eq!(info.rom_version, 0x0350_3000);
        assert_eq!(info.localization, 1);
        assert_eq!(info.product_id, b"palm");

        let req = sent_request(&conn.test_io().tx);
        assert_eq!(req, vec![READ_SYS_INFO, 0]);
    }

    #[test]
    fn open_db_sends_the_name_and_returns_the_handle() {
        let rx = framed_reply(OPEN_DB, 0, &[(ARG_BASE, vec![7])]);
        let mut conn = Connection::test_net(ScriptedLink::new(rx));

        let handle = open_db(&mut conn, 0, OPEN_MODE_READ | OPEN_MODE_SECRET, "MemoDB").unwrap();
        assert_eq!(handle, 7);

        let req = sent_request(&conn.test_io().tx);
        assert_eq!(req[0], OPEN_DB);
        assert_eq!(req[1], 1);
        assert_eq!(req[2], ARG_BASE);
        assert_eq!(req[3], 9); // card, mode, "MemoDB", NUL
        assert_eq!(req[4], 0);
        assert_eq!(req[5], OPEN_MODE_READ | OPEN_MODE_SECRET);
        assert_eq!(&req[6..12], b"MemoDB");
        assert_eq!(req[12], 0);
    }

    #[test]
    fn device_errors_become_dlp_errors() {
        let rx = framed_reply(OPEN_DB, 0x0005, &[]);
        let mut conn = Connection::test_net(ScriptedLink::new(rx));
        assert!(matches!(
            open_db(&mut conn, 0, OPEN_MODE_READ, "NoSuchDB"),
            Err(Error::Dlp(0x0005))
        ));
    }

    #[test]
    fn read_record_by_index_uses_the_second_argument_id() {
        let mut arg = Vec::new();
        put_u32(&mut arg, 0x00c0_ffee);
        put_u16(&mut arg, 3);
        put_u16(&mut arg, 5);
        put_u8(&mut arg, 0x40);
        put_u8(&mut arg, 2);
        arg.extend_from_slice(b"hello");
        let rx = framed_reply(READ_RECORD, 0, &[(ARG_BASE, arg)]);
        let mut conn = Connection::test_net(ScriptedLink::new(rx));

        let record = read_record_by_index(&mut conn, 7, 3).unwrap();
        assert_eq!(record.id, 0x00c0_ffee);
        assert_eq!(record.index, 3);
        assert_eq!(record.attributes, 0x40);
        assert_eq!(record.category, 2);
        assert_eq!(record.data, b"hello");

        let req = sent_request(&conn.test_io().tx);
        assert_eq!(req[0], READ_RECORD);
        assert_eq!(req[2], ARG_BASE + 1);
        // handle, pad, index, offset, to-the-end
        assert_eq!(&req[4..12], &[7, 0, 0, 3, 0, 0, 0xff, 0xff]);
    }

    #[test]
    fn time_round_trips_through_eight_bytes() {
        let time = DlpTime {
            year: 2003,
            month: 7,
            day: 26,
            hour: 23,
            minute: 59,
            second: 1,
        };
        let mut buf = Vec::new();
        time.emit(&mut buf);
        assert_eq!(buf.len(), 8);
        assert_eq!(DlpTime::parse(&buf).unwrap(), time);
    }

    #[test]
    fn end_of_sync_carries_the_status() {
        let rx = framed_reply(END_OF_SYNC, 0, &[]);
        let mut conn = Connection::test_net(ScriptedLink::new(rx));
        end_of_sync(&mut conn, SYNC_STATUS_CANCELLED).unwrap();
        let req = sent_request(&conn.test_io().tx);
        assert_eq!(req, vec![END_OF_SYNC, 1, ARG_BASE, 2, 0x00, 0x02]);
    }
}
