//! WAL record format: a fixed 28-byte header shared by every record type,
//! plus a physical before/after byte-image body for UPDATE and COMPENSATE.
//!
//! Layout mirrors the course project's `log_t`: `{log_size: u32, lsn: i64,
//! prev_lsn: i64, trx_id: i32, type: i32}` followed by, for UPDATE/COMPENSATE,
//! `{table_id: i64, page_num: u64, offset: u16, length: u16, old_image[length],
//! new_image[length]}`, with COMPENSATE appending an 8-byte `next_undo_lsn`.

use crate::error::{EngineError, Result};
use crate::types::{Lsn, PageId, TableId, TrxId};

pub const HEADER_SIZE: usize = 28;
const UPDATE_FIXED_SIZE: usize = 20; // table_id(8) + page_num(8) + offset(2) + length(2)
const COMPENSATE_EXTRA: usize = 8; // next_undo_lsn

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRecordType {
    Begin = 0,
    Update = 1,
    Commit = 2,
    Rollback = 3,
    Compensate = 4,
}

impl LogRecordType {
    fn from_i32(v: i32) -> Result<Self> {
        match v {
            0 => Ok(Self::Begin),
            1 => Ok(Self::Update),
            2 => Ok(Self::Commit),
            3 => Ok(Self::Rollback),
            4 => Ok(Self::Compensate),
            other => Err(EngineError::log(format!("unknown log record type {other}"))),
        }
    }
}

/// A physical byte-range update: the bytes `[offset, offset+length)` of page
/// `page_num` changed from `old_image` to `new_image`.
#[derive(Debug, Clone)]
pub struct ImageDelta {
    pub table_id: TableId,
    pub page_num: PageId,
    pub offset: u16,
    pub old_image: Vec<u8>,
    pub new_image: Vec<u8>,
}

#[derive(Debug, Clone)]
pub enum LogRecordBody {
    None,
    Update(ImageDelta),
    Compensate { delta: ImageDelta, next_undo_lsn: Lsn },
}

#[derive(Debug, Clone)]
pub struct LogRecord {
    pub lsn: Lsn,
    pub prev_lsn: Lsn,
    pub trx_id: TrxId,
    pub rtype: LogRecordType,
    pub body: LogRecordBody,
}

impl LogRecord {
    /// A BEGIN record always terminates an undo/abort chain walk: `prev_lsn`
    /// is `-1`, never a real offset (offset 0 is a legitimate first record).
    pub fn begin(lsn: Lsn, trx_id: TrxId) -> Self {
        Self { lsn, prev_lsn: -1, trx_id, rtype: LogRecordType::Begin, body: LogRecordBody::None }
    }

    pub fn commit(lsn: Lsn, prev_lsn: Lsn, trx_id: TrxId) -> Self {
        Self { lsn, prev_lsn, trx_id, rtype: LogRecordType::Commit, body: LogRecordBody::None }
    }

    pub fn rollback(lsn: Lsn, prev_lsn: Lsn, trx_id: TrxId) -> Self {
        Self { lsn, prev_lsn, trx_id, rtype: LogRecordType::Rollback, body: LogRecordBody::None }
    }

    pub fn update(lsn: Lsn, prev_lsn: Lsn, trx_id: TrxId, delta: ImageDelta) -> Self {
        Self { lsn, prev_lsn, trx_id, rtype: LogRecordType::Update, body: LogRecordBody::Update(delta) }
    }

    pub fn compensate(lsn: Lsn, prev_lsn: Lsn, trx_id: TrxId, delta: ImageDelta, next_undo_lsn: Lsn) -> Self {
        Self {
            lsn,
            prev_lsn,
            trx_id,
            rtype: LogRecordType::Compensate,
            body: LogRecordBody::Compensate { delta, next_undo_lsn },
        }
    }

    pub fn log_size(&self) -> usize {
        match &self.body {
            LogRecordBody::None => HEADER_SIZE,
            LogRecordBody::Update(delta) => HEADER_SIZE + UPDATE_FIXED_SIZE + 2 * delta.old_image.len(),
            LogRecordBody::Compensate { delta, .. } => {
                HEADER_SIZE + UPDATE_FIXED_SIZE + 2 * delta.old_image.len() + COMPENSATE_EXTRA
            }
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let size = self.log_size();
        let mut buf = Vec::with_capacity(size);
        buf.extend_from_slice(&(size as u32).to_be_bytes());
        buf.extend_from_slice(&self.lsn.to_be_bytes());
        buf.extend_from_slice(&self.prev_lsn.to_be_bytes());
        buf.extend_from_slice(&self.trx_id.to_be_bytes());
        buf.extend_from_slice(&(self.rtype as i32).to_be_bytes());

        match &self.body {
            LogRecordBody::None => {}
            LogRecordBody::Update(delta) => encode_delta(&mut buf, delta),
            LogRecordBody::Compensate { delta, next_undo_lsn } => {
                encode_delta(&mut buf, delta);
                buf.extend_from_slice(&next_undo_lsn.to_be_bytes());
            }
        }
        debug_assert_eq!(buf.len(), size);
        buf
    }

    /// Decode one record starting at `bytes[0]`. Returns the record and the
    /// number of bytes it occupied.
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        if bytes.len() < HEADER_SIZE {
            return Err(EngineError::log("truncated log record header"));
        }
        let log_size = u32::from_be_bytes(bytes[0..4].try_into().unwrap()) as usize;
        if bytes.len() < log_size {
            return Err(EngineError::log("truncated log record body"));
        }
        let lsn = i64::from_be_bytes(bytes[4..12].try_into().unwrap());
        let prev_lsn = i64::from_be_bytes(bytes[12..20].try_into().unwrap());
        let trx_id = i32::from_be_bytes(bytes[20..24].try_into().unwrap());
        let rtype = LogRecordType::from_i32(i32::from_be_bytes(bytes[24..28].try_into().unwrap()))?;

        let body = match rtype {
            LogRecordType::Begin | LogRecordType::Commit | LogRecordType::Rollback => LogRecordBody::None,
            LogRecordType::Update => LogRecordBody::Update(decode_delta(&bytes[HEADER_SIZE..log_size])?),
            LogRecordType::Compensate => {
                let next_undo_lsn_off = log_size - COMPENSATE_EXTRA;
                let delta = decode_delta(&bytes[HEADER_SIZE..next_undo_lsn_off])?;
                let next_undo_lsn = i64::from_be_bytes(bytes[next_undo_lsn_off..log_size].try_into().unwrap());
                LogRecordBody::Compensate { delta, next_undo_lsn }
            }
        };

        Ok((Self { lsn, prev_lsn, trx_id, rtype, body }, log_size))
    }
}

fn encode_delta(buf: &mut Vec<u8>, delta: &ImageDelta) {
    buf.extend_from_slice(&delta.table_id.to_be_bytes());
    buf.extend_from_slice(&delta.page_num.value().to_be_bytes());
    buf.extend_from_slice(&delta.offset.to_be_bytes());
    buf.extend_from_slice(&(delta.old_image.len() as u16).to_be_bytes());
    buf.extend_from_slice(&delta.old_image);
    buf.extend_from_slice(&delta.new_image);
}

fn decode_delta(bytes: &[u8]) -> Result<ImageDelta> {
    if bytes.len() < UPDATE_FIXED_SIZE {
        return Err(EngineError::log("truncated update body"));
    }
    let table_id = i64::from_be_bytes(bytes[0..8].try_into().unwrap());
    let page_num = PageId::new(u64::from_be_bytes(bytes[8..16].try_into().unwrap()));
    let offset = u16::from_be_bytes(bytes[16..18].try_into().unwrap());
    let length = u16::from_be_bytes(bytes[18..20].try_into().unwrap()) as usize;
    let images = &bytes[UPDATE_FIXED_SIZE..];
    if images.len() != 2 * length {
        return Err(EngineError::log("update body image length mismatch"));
    }
    let old_image = images[..length].to_vec();
    let new_image = images[length..].to_vec();
    Ok(ImageDelta { table_id, page_num, offset, old_image, new_image })
}
