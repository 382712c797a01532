//! Length-prefixed binary framing for persisted records.
//!
//! Every record is written as a big-endian u32 byte length followed by the
//! bincode payload, so a reader can replay a file record by record and stop
//! cleanly at EOF.

use std::io::{ErrorKind, Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StorageResult;

pub(crate) fn write_record<W, T>(writer: &mut W, record: &T) -> StorageResult<()>
where
    W: Write,
    T: Serialize,
{
    let payload = bincode::serialize(record)?;
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(&payload)?;
    Ok(())
}

/// Reads the next record, returning `None` on a clean EOF at a record
/// boundary. EOF in the middle of a record is an error.
pub(crate) fn read_record<R, T>(reader: &mut R) -> StorageResult<Option<T>>
where
    R: Read,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(Some(bincode::deserialize(&payload)?))
}
