//! Binary framing of the peers replication protocol.
//!
//! Every message starts with a class byte and a type byte. Stick-table
//! messages (class 10) whose type has bit 7 set carry a variable-length
//! integer announcing the payload size, so unknown message types can be
//! skipped. Integers use a dynamic-length encoding: one byte below 0xF0,
//! then 7-bit continuation groups with geometrically rising thresholds.

use std::convert::TryInto;

use crate::config::{DataType, DataValue, FreqCtr, KeyType, TableKey};
use crate::error::{Error, Peers};

/// Message classes.
pub const CLASS_CONTROL: u8 = 0;
pub const CLASS_ERROR: u8 = 1;
pub const CLASS_STICKTABLE: u8 = 10;
pub const CLASS_RESERVED: u8 = 255;

/// Control message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    ResyncReq = 0,
    ResyncFinished = 1,
    ResyncPartial = 2,
    ResyncConfirm = 3,
    Heartbeat = 4,
}

impl Control {
    pub fn from_u8(v: u8) -> Option<Control> {
        Some(match v {
            0 => Control::ResyncReq,
            1 => Control::ResyncFinished,
            2 => Control::ResyncPartial,
            3 => Control::ResyncConfirm,
            4 => Control::Heartbeat,
            _ => return None,
        })
    }
}

/// Error message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    Protocol = 0,
    SizeLimit = 1,
}

impl WireError {
    pub fn from_u8(v: u8) -> Option<WireError> {
        Some(match v {
            0 => WireError::Protocol,
            1 => WireError::SizeLimit,
            _ => return None,
        })
    }
}

/// Stick-table message types. Bit 7 marks length-prefixed payloads.
pub const MSG_STKT_UPDATE: u8 = 0x80;
pub const MSG_STKT_INCUPDATE: u8 = 0x81;
pub const MSG_STKT_DEFINE: u8 = 0x82;
pub const MSG_STKT_SWITCH: u8 = 0x83;
pub const MSG_STKT_ACK: u8 = 0x84;
pub const MSG_STKT_UPDATE_TIMED: u8 = 0x85;
pub const MSG_STKT_INCUPDATE_TIMED: u8 = 0x86;

const ENC_2BYTES_MIN: u64 = 0xF0;
const ENC_2BYTES_MIN_BITS: u32 = 4;
const ENC_STOP_BIT: u32 = 7;
const ENC_STOP_BYTE: u64 = 0x80;

/// Appends the dynamic-length encoding of `v`.
pub fn encode_varint(out: &mut Vec<u8>, mut v: u64) {
    if v < ENC_2BYTES_MIN {
        out.push(v as u8);
        return;
    }
    out.push((v | ENC_2BYTES_MIN) as u8);
    v = (v - ENC_2BYTES_MIN) >> ENC_2BYTES_MIN_BITS;
    while v >= ENC_STOP_BYTE {
        out.push((v | ENC_STOP_BYTE) as u8);
        v = (v - ENC_STOP_BYTE) >> ENC_STOP_BIT;
    }
    out.push(v as u8);
}

/// Decodes one integer, returning it with the number of bytes consumed.
/// `None` means the input is truncated.
pub fn decode_varint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut i = 0;
    let first = u64::from(*buf.first()?);
    i += 1;
    if first < ENC_2BYTES_MIN {
        return Some((first, 1));
    }
    let mut value = first;
    let mut shift = ENC_2BYTES_MIN_BITS;
    loop {
        let b = u64::from(*buf.get(i)?);
        i += 1;
        if shift >= 64 {
            // longer than any valid 64-bit encoding
            return None;
        }
        value = value.wrapping_add(b << shift);
        shift += ENC_STOP_BIT;
        if b < ENC_STOP_BYTE {
            break;
        }
    }
    Some((value, i))
}

/// A decoded frame: class, type, payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame<'a> {
    pub class: u8,
    pub msg_type: u8,
    pub payload: &'a [u8],
}

/// Tries to pop one frame off `buf`. Returns the frame and the total
/// bytes consumed, or `None` when more input is needed. Oversized
/// length-prefixed payloads error out with `SizeLimit`.
pub fn read_frame(buf: &[u8], max_payload: usize) -> crate::Result<Option<(Frame<'_>, usize)>> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let class = buf[0];
    let msg_type = buf[1];
    if class == CLASS_STICKTABLE && msg_type & 0x80 != 0 {
        let rest = &buf[2..];
        let (len, used) = match decode_varint(rest) {
            Some(v) => v,
            None => return Ok(None),
        };
        let len = len as usize;
        if len > max_payload {
            return Err(Error::new_peers(Peers::SizeLimit));
        }
        if rest.len() - used < len {
            return Ok(None);
        }
        let payload = &rest[used..used + len];
        Ok(Some((
            Frame {
                class,
                msg_type,
                payload,
            },
            2 + used + len,
        )))
    } else {
        // control/error messages are two bare bytes
        Ok(Some((
            Frame {
                class,
                msg_type,
                payload: &[],
            },
            2,
        )))
    }
}

/// Emits a bare control message.
pub fn encode_control(out: &mut Vec<u8>, ctrl: Control) {
    out.push(CLASS_CONTROL);
    out.push(ctrl as u8);
}

/// Emits a bare error message.
pub fn encode_error(out: &mut Vec<u8>, err: WireError) {
    out.push(CLASS_ERROR);
    out.push(err as u8);
}

fn push_frame(out: &mut Vec<u8>, msg_type: u8, payload: &[u8]) {
    out.push(CLASS_STICKTABLE);
    out.push(msg_type);
    encode_varint(out, payload.len() as u64);
    out.extend_from_slice(payload);
}

/// Table definition advertised before its updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDef {
    pub local_id: u64,
    pub name: Vec<u8>,
    pub key_type: KeyType,
    pub key_size: u64,
    pub data_mask: u64,
    pub expire_ms: u64,
    /// `(data type code, period ms)` for each rate-typed column.
    pub periods: Vec<(u64, u64)>,
}

pub fn encode_define(out: &mut Vec<u8>, def: &TableDef) {
    let mut p = Vec::with_capacity(def.name.len() + 32);
    encode_varint(&mut p, def.local_id);
    encode_varint(&mut p, def.name.len() as u64);
    p.extend_from_slice(&def.name);
    encode_varint(&mut p, def.key_type.code());
    encode_varint(&mut p, def.key_size);
    encode_varint(&mut p, def.data_mask);
    encode_varint(&mut p, def.expire_ms);
    for (ty, period) in &def.periods {
        encode_varint(&mut p, *ty);
        encode_varint(&mut p, *period);
    }
    push_frame(out, MSG_STKT_DEFINE, &p);
}

pub fn decode_define(payload: &[u8]) -> crate::Result<TableDef> {
    let mut c = Cursor::new(payload);
    let local_id = c.varint()?;
    let name_len = c.varint()? as usize;
    let name = c.bytes(name_len)?.to_vec();
    let key_type = KeyType::from_code(c.varint()?)
        .ok_or_else(|| Error::new_peers(Peers::Protocol))?;
    let key_size = c.varint()?;
    let data_mask = c.varint()?;
    let expire_ms = c.varint()?;
    let mut periods = Vec::new();
    while !c.is_empty() {
        let ty = c.varint()?;
        let period = c.varint()?;
        periods.push((ty, period));
    }
    Ok(TableDef {
        local_id,
        name,
        key_type,
        key_size,
        data_mask,
        expire_ms,
        periods,
    })
}

pub fn encode_switch(out: &mut Vec<u8>, local_id: u64) {
    let mut p = Vec::with_capacity(4);
    encode_varint(&mut p, local_id);
    push_frame(out, MSG_STKT_SWITCH, &p);
}

pub fn decode_switch(payload: &[u8]) -> crate::Result<u64> {
    let mut c = Cursor::new(payload);
    c.varint()
}

pub fn encode_ack(out: &mut Vec<u8>, remote_id: u64, last_get: u32) {
    let mut p = Vec::with_capacity(8);
    encode_varint(&mut p, remote_id);
    p.extend_from_slice(&last_get.to_be_bytes());
    push_frame(out, MSG_STKT_ACK, &p);
}

pub fn decode_ack(payload: &[u8]) -> crate::Result<(u64, u32)> {
    let mut c = Cursor::new(payload);
    let remote_id = c.varint()?;
    let last_get = u32::from_be_bytes(
        c.bytes(4)?
            .try_into()
            .expect("slice of verified length"),
    );
    Ok((remote_id, last_get))
}

/// How a DICT column value travels: by id alone once both caches agree,
/// or id plus full value on a cache miss.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DictWire {
    /// `id + 1` on the wire; zero is reserved for "absent".
    IdOnly(u64),
    IdValue(u64, Vec<u8>),
    Absent,
}

/// One update to encode.
#[derive(Debug, Clone)]
pub struct UpdateMsg {
    /// Present unless the id is exactly `last_pushed + 1`.
    pub update_id: Option<u32>,
    /// Remaining expiry delta; absent in downgraded (untimed) mode.
    pub expire_ms: Option<u32>,
    pub key: TableKey,
    /// One entry per registered data column, in code order. Dict columns
    /// carry their cache form.
    pub data: Vec<UpdateData>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateData {
    Int(u64),
    Freq(FreqCtr),
    Dict(DictWire),
}

impl UpdateMsg {
    pub fn msg_type(&self) -> u8 {
        match (self.update_id.is_some(), self.expire_ms.is_some()) {
            (true, true) => MSG_STKT_UPDATE_TIMED,
            (true, false) => MSG_STKT_UPDATE,
            (false, true) => MSG_STKT_INCUPDATE_TIMED,
            (false, false) => MSG_STKT_INCUPDATE,
        }
    }
}

pub fn encode_update(out: &mut Vec<u8>, msg: &UpdateMsg) {
    let mut p = Vec::with_capacity(64);
    if let Some(id) = msg.update_id {
        p.extend_from_slice(&id.to_be_bytes());
    }
    if let Some(exp) = msg.expire_ms {
        p.extend_from_slice(&exp.to_be_bytes());
    }
    match &msg.key {
        TableKey::SInt(v) => p.extend_from_slice(&v.to_be_bytes()),
        TableKey::Str(s) => {
            encode_varint(&mut p, s.len() as u64);
            p.extend_from_slice(s);
        }
        TableKey::Bin(b) => p.extend_from_slice(b),
        TableKey::Ipv4(o) => p.extend_from_slice(o),
        TableKey::Ipv6(o) => p.extend_from_slice(o),
    }
    for data in &msg.data {
        match data {
            UpdateData::Int(v) => encode_varint(&mut p, *v),
            UpdateData::Freq(f) => {
                // bit 0 of the age is cleared so decoders can extend the
                // format later
                encode_varint(&mut p, u64::from(f.curr_tick_age_ms) & !1);
                encode_varint(&mut p, u64::from(f.curr_ctr));
                encode_varint(&mut p, u64::from(f.prev_ctr));
            }
            UpdateData::Dict(DictWire::Absent) => encode_varint(&mut p, 0),
            UpdateData::Dict(DictWire::IdOnly(id)) => {
                // length 1 announces "cached id follows"
                let mut idbuf = Vec::with_capacity(2);
                encode_varint(&mut idbuf, id + 1);
                encode_varint(&mut p, idbuf.len() as u64);
                p.extend_from_slice(&idbuf);
            }
            UpdateData::Dict(DictWire::IdValue(id, value)) => {
                let mut entry = Vec::with_capacity(value.len() + 8);
                encode_varint(&mut entry, id + 1);
                encode_varint(&mut entry, value.len() as u64);
                entry.extend_from_slice(value);
                encode_varint(&mut p, entry.len() as u64);
                p.extend_from_slice(&entry);
            }
        }
    }
    push_frame(out, msg.msg_type(), &p);
}

/// Decodes an update payload against the receiving table's definition.
pub fn decode_update(
    msg_type: u8,
    payload: &[u8],
    key_type: KeyType,
    key_size: usize,
    data_types: &[DataType],
) -> crate::Result<UpdateMsg> {
    let with_id = matches!(msg_type, MSG_STKT_UPDATE | MSG_STKT_UPDATE_TIMED);
    let with_exp = matches!(msg_type, MSG_STKT_UPDATE_TIMED | MSG_STKT_INCUPDATE_TIMED);
    let mut c = Cursor::new(payload);
    let update_id = if with_id {
        Some(u32::from_be_bytes(
            c.bytes(4)?.try_into().expect("slice of verified length"),
        ))
    } else {
        None
    };
    let expire_ms = if with_exp {
        Some(u32::from_be_bytes(
            c.bytes(4)?.try_into().expect("slice of verified length"),
        ))
    } else {
        None
    };
    let key = match key_type {
        KeyType::SInt => TableKey::SInt(u32::from_be_bytes(
            c.bytes(4)?.try_into().expect("slice of verified length"),
        )),
        KeyType::Str => {
            let len = c.varint()? as usize;
            TableKey::Str(c.bytes(len)?.to_vec())
        }
        KeyType::Bin => TableKey::Bin(c.bytes(key_size)?.to_vec()),
        KeyType::Ipv4 => {
            TableKey::Ipv4(c.bytes(4)?.try_into().expect("slice of verified length"))
        }
        KeyType::Ipv6 => {
            TableKey::Ipv6(c.bytes(16)?.try_into().expect("slice of verified length"))
        }
    };
    let mut data = Vec::with_capacity(data_types.len());
    for dt in data_types {
        use crate::config::StandardType::*;
        let v = match dt.standard() {
            SInt | UInt | ULongLong => UpdateData::Int(c.varint()?),
            FreqPeriod => {
                let age = c.varint()?;
                let curr = c.varint()?;
                let prev = c.varint()?;
                UpdateData::Freq(FreqCtr {
                    curr_tick_age_ms: age as u32,
                    curr_ctr: curr as u32,
                    prev_ctr: prev as u32,
                })
            }
            Dict => {
                let len = c.varint()? as usize;
                if len == 0 {
                    UpdateData::Dict(DictWire::Absent)
                } else {
                    let entry = c.bytes(len)?;
                    let mut ec = Cursor::new(entry);
                    let id = ec.varint()?;
                    if id == 0 {
                        return Err(Error::new_peers(Peers::Protocol));
                    }
                    if ec.is_empty() {
                        UpdateData::Dict(DictWire::IdOnly(id - 1))
                    } else {
                        let vlen = ec.varint()? as usize;
                        let value = ec.bytes(vlen)?.to_vec();
                        UpdateData::Dict(DictWire::IdValue(id - 1, value))
                    }
                }
            }
        };
        data.push(v);
    }
    Ok(UpdateMsg {
        update_id,
        expire_ms,
        key,
        data,
    })
}

/// Renders a stored entry into its wire data columns. Dict columns come
/// back in `IdValue(0, ...)` placeholder form; the session substitutes
/// the cached encoding, since it owns the per-peer cache.
pub fn entry_data_to_wire(data: &[DataValue]) -> Vec<UpdateData> {
    data.iter()
        .map(|v| match v {
            DataValue::SInt(v) => UpdateData::Int(*v as u64),
            DataValue::UInt(v) => UpdateData::Int(u64::from(*v)),
            DataValue::ULongLong(v) => UpdateData::Int(*v),
            DataValue::FreqPeriod(f) => UpdateData::Freq(*f),
            DataValue::Dict(None) => UpdateData::Dict(DictWire::Absent),
            DataValue::Dict(Some(value)) => {
                // placeholder; the session substitutes the cached form
                UpdateData::Dict(DictWire::IdValue(0, value.clone()))
            }
        })
        .collect()
}

struct Cursor<'a> {
    buf: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Cursor<'a> {
        Cursor { buf }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn varint(&mut self) -> crate::Result<u64> {
        match decode_varint(self.buf) {
            Some((v, used)) => {
                self.buf = &self.buf[used..];
                Ok(v)
            }
            None => Err(Error::new_peers(Peers::Truncated)),
        }
    }

    fn bytes(&mut self, n: usize) -> crate::Result<&'a [u8]> {
        if self.buf.len() < n {
            return Err(Error::new_peers(Peers::Truncated));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(v: u64) -> (Vec<u8>, u64) {
        let mut buf = Vec::new();
        encode_varint(&mut buf, v);
        let (decoded, used) = decode_varint(&buf).unwrap();
        assert_eq!(used, buf.len());
        (buf, decoded)
    }

    #[test]
    fn varint_single_byte_below_0xf0() {
        for v in [0u64, 1, 0x42, 0xEF] {
            let (buf, decoded) = round_trip(v);
            assert_eq!(buf.len(), 1);
            assert_eq!(decoded, v);
        }
    }

    #[test]
    fn varint_thresholds() {
        // the thresholds rise geometrically: 0xF0, 0x8F0, 0x408F0, ...
        let cases = [
            (0xF0u64, 2usize),
            (0x8EF, 2),
            (0x8F0, 3),
            (0x408EF, 3),
            (0x408F0, 4),
        ];
        for (v, expect_len) in cases {
            let (buf, decoded) = round_trip(v);
            assert_eq!(buf.len(), expect_len, "value {:#x}", v);
            assert_eq!(decoded, v);
        }
        let (_, decoded) = round_trip(u64::MAX);
        assert_eq!(decoded, u64::MAX);
    }

    #[test]
    fn varint_detects_truncation() {
        let mut buf = Vec::new();
        encode_varint(&mut buf, 0x123456);
        for cut in 1..buf.len() {
            assert!(decode_varint(&buf[..cut]).is_none(), "cut at {}", cut);
        }
        assert!(decode_varint(&[]).is_none());
    }

    #[test]
    fn frames_split_and_reassemble() {
        let mut buf = Vec::new();
        encode_control(&mut buf, Control::Heartbeat);
        encode_switch(&mut buf, 3);
        encode_ack(&mut buf, 3, 77);

        let (f1, used1) = read_frame(&buf, 4096).unwrap().unwrap();
        assert_eq!(f1.class, CLASS_CONTROL);
        assert_eq!(Control::from_u8(f1.msg_type), Some(Control::Heartbeat));
        let (f2, used2) = read_frame(&buf[used1..], 4096).unwrap().unwrap();
        assert_eq!(f2.msg_type, MSG_STKT_SWITCH);
        assert_eq!(decode_switch(f2.payload).unwrap(), 3);
        let (f3, _) = read_frame(&buf[used1 + used2..], 4096).unwrap().unwrap();
        assert_eq!(f3.msg_type, MSG_STKT_ACK);
        assert_eq!(decode_ack(f3.payload).unwrap(), (3, 77));
    }

    #[test]
    fn partial_frames_wait_for_more() {
        let mut buf = Vec::new();
        encode_switch(&mut buf, 1000);
        for cut in 0..buf.len() {
            assert!(read_frame(&buf[..cut], 4096).unwrap().is_none() || cut >= buf.len());
        }
    }

    #[test]
    fn oversized_frame_is_a_size_error() {
        let mut buf = vec![CLASS_STICKTABLE, MSG_STKT_UPDATE];
        encode_varint(&mut buf, 1 << 20);
        let err = read_frame(&buf, 4096).unwrap_err();
        assert!(err.is_peers());
    }

    #[test]
    fn define_round_trip() {
        let def = TableDef {
            local_id: 1,
            name: b"sessions".to_vec(),
            key_type: KeyType::Str,
            key_size: 32,
            data_mask: 0b1000000001,
            expire_ms: 60_000,
            periods: vec![(10, 10_000)],
        };
        let mut buf = Vec::new();
        encode_define(&mut buf, &def);
        let (frame, _) = read_frame(&buf, 4096).unwrap().unwrap();
        assert_eq!(frame.msg_type, MSG_STKT_DEFINE);
        assert_eq!(decode_define(frame.payload).unwrap(), def);
    }

    #[test]
    fn update_round_trip_with_all_field_shapes() {
        use crate::config::DataType;
        let msg = UpdateMsg {
            update_id: Some(42),
            expire_ms: Some(30_000),
            key: TableKey::Str(b"client-1".to_vec()),
            data: vec![
                UpdateData::Int(7),
                UpdateData::Freq(FreqCtr {
                    curr_tick_age_ms: 1500 & !1,
                    curr_ctr: 12,
                    prev_ctr: 9,
                }),
                UpdateData::Dict(DictWire::IdValue(3, b"web1".to_vec())),
            ],
        };
        let mut buf = Vec::new();
        encode_update(&mut buf, &msg);
        let (frame, _) = read_frame(&buf, 4096).unwrap().unwrap();
        assert_eq!(frame.msg_type, MSG_STKT_UPDATE_TIMED);
        let decoded = decode_update(
            frame.msg_type,
            frame.payload,
            KeyType::Str,
            32,
            &[DataType::ServerId, DataType::HttpReqRate, DataType::ServerName],
        )
        .unwrap();
        assert_eq!(decoded.update_id, Some(42));
        assert_eq!(decoded.expire_ms, Some(30_000));
        assert_eq!(decoded.key, msg.key);
        assert_eq!(decoded.data, msg.data);
    }

    #[test]
    fn update_without_id_uses_incremental_type() {
        let msg = UpdateMsg {
            update_id: None,
            expire_ms: None,
            key: TableKey::SInt(9),
            data: vec![UpdateData::Int(1)],
        };
        assert_eq!(msg.msg_type(), MSG_STKT_INCUPDATE);
        let mut buf = Vec::new();
        encode_update(&mut buf, &msg);
        let (frame, _) = read_frame(&buf, 4096).unwrap().unwrap();
        let decoded = decode_update(
            frame.msg_type,
            frame.payload,
            KeyType::SInt,
            4,
            &[crate::config::DataType::ServerId],
        )
        .unwrap();
        assert_eq!(decoded.update_id, None);
        assert_eq!(decoded.key, TableKey::SInt(9));
    }

    #[test]
    fn dict_id_only_entry_is_one_byte_long() {
        let msg = UpdateMsg {
            update_id: None,
            expire_ms: None,
            key: TableKey::SInt(1),
            data: vec![UpdateData::Dict(DictWire::IdOnly(3))],
        };
        let mut buf = Vec::new();
        encode_update(&mut buf, &msg);
        let (frame, _) = read_frame(&buf, 4096).unwrap().unwrap();
        // payload: 4-byte key, then length byte 1, then the id byte
        assert_eq!(frame.payload.len(), 4 + 1 + 1);
        let decoded = decode_update(
            frame.msg_type,
            frame.payload,
            KeyType::SInt,
            4,
            &[crate::config::DataType::ServerName],
        )
        .unwrap();
        assert_eq!(decoded.data, vec![UpdateData::Dict(DictWire::IdOnly(3))]);
    }

    #[test]
    fn truncated_update_payload_errors() {
        let msg = UpdateMsg {
            update_id: Some(5),
            expire_ms: None,
            key: TableKey::Str(b"abcdef".to_vec()),
            data: vec![UpdateData::Int(300)],
        };
        let mut buf = Vec::new();
        encode_update(&mut buf, &msg);
        let (frame, _) = read_frame(&buf, 4096).unwrap().unwrap();
        let cut = &frame.payload[..frame.payload.len() - 1];
        let err = decode_update(
            frame.msg_type,
            cut,
            KeyType::Str,
            32,
            &[crate::config::DataType::ServerId],
        )
        .unwrap_err();
        assert!(err.is_peers());
    }
}
