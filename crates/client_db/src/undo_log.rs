//! Binary record of the keys a transaction is about to write, persisted
//! before write-back so a crashed client's partial writes can be found and
//! reverted.
//!
//! Layout, all integers little endian:
//!
//! ```text
//! magic: u32 | format_version: u8 | flags: u8 | table_count: u32
//! per table:
//!     table_id: u64 | change_count: u32 | key: u64 * change_count
//!     if flags & WITH_INDEXES:
//!         index_count: u32
//!         per index:
//!             name_len: u32 | name: [u8]
//!             entry_count: u32
//!             per entry: key_len: u32 | key: [u8] | value: u64 | op: u8
//! ```
use bytes::{
    Buf,
    BufMut,
};
use common::{
    store::{
        IndexMutation,
        IndexOp,
    },
    types::{
        Key,
        TableId,
        Version,
    },
};
use value::IndexKey;

use crate::table_cache::TableCache;

pub const UNDO_LOG_MAGIC: u32 = 0x5458_554C;
pub const UNDO_LOG_FORMAT_VERSION: u8 = 1;
const FLAG_WITH_INDEXES: u8 = 0x1;

const HEADER_LEN: usize = 4 + 1 + 1 + 4;

/// Row key of chunk `chunk` of the undo log written at `version`.
pub fn chunk_key(version: Version, chunk: u16) -> Key {
    let version = u64::from(version) & 0xFFFF_FFFF_FFFF;
    Key::new(version | (u64::from(chunk) << 48))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UndoLog {
    pub with_indexes: bool,
    pub tables: Vec<TableUndo>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableUndo {
    pub table: TableId,
    pub keys: Vec<Key>,
    /// Empty unless the log was written with indexes.
    pub indexes: Vec<IndexUndo>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexUndo {
    pub name: String,
    pub entries: Vec<IndexMutation>,
}

impl UndoLog {
    pub(crate) fn encoded_len(tables: &[&TableCache], with_indexes: bool) -> usize {
        let mut len = HEADER_LEN;
        for table in tables {
            len += 8 + 4 + 8 * table.changes().len();
            if with_indexes {
                len += 4;
                for index in table.indexes().iter() {
                    len += 4 + index.name().len() + 4;
                    for entry in index.cache() {
                        len += 4 + entry.key.as_bytes().len() + 8 + 1;
                    }
                }
            }
        }
        len
    }

    pub(crate) fn encode(tables: &[&TableCache], with_indexes: bool, buf: &mut impl BufMut) {
        buf.put_u32_le(UNDO_LOG_MAGIC);
        buf.put_u8(UNDO_LOG_FORMAT_VERSION);
        buf.put_u8(if with_indexes { FLAG_WITH_INDEXES } else { 0 });
        buf.put_u32_le(tables.len() as u32);
        for table in tables {
            buf.put_u64_le(table.id().into());
            buf.put_u32_le(table.changes().len() as u32);
            for (key, _) in table.changes() {
                buf.put_u64_le(key.into());
            }
            if !with_indexes {
                continue;
            }
            buf.put_u32_le(table.indexes().iter().count() as u32);
            for index in table.indexes().iter() {
                buf.put_u32_le(index.name().len() as u32);
                buf.put_slice(index.name().as_bytes());
                buf.put_u32_le(index.cache().count() as u32);
                for entry in index.cache() {
                    let key = entry.key.as_bytes();
                    buf.put_u32_le(key.len() as u32);
                    buf.put_slice(key);
                    buf.put_u64_le(entry.value.into());
                    buf.put_u8(match entry.op {
                        IndexOp::Insert => 0,
                        IndexOp::Remove => 1,
                    });
                }
            }
        }
    }

    pub fn decode(mut buf: &[u8]) -> anyhow::Result<Self> {
        let buf = &mut buf;
        ensure_remaining(buf, HEADER_LEN)?;
        let magic = buf.get_u32_le();
        anyhow::ensure!(magic == UNDO_LOG_MAGIC, "Not an undo log (magic {magic:#x})");
        let format_version = buf.get_u8();
        anyhow::ensure!(
            format_version == UNDO_LOG_FORMAT_VERSION,
            "Unsupported undo log format version {format_version}"
        );
        let flags = buf.get_u8();
        anyhow::ensure!(
            flags & !FLAG_WITH_INDEXES == 0,
            "Unknown undo log flags {flags:#x}"
        );
        let with_indexes = flags & FLAG_WITH_INDEXES != 0;
        let table_count = buf.get_u32_le();

        let mut tables = vec![];
        for _ in 0..table_count {
            ensure_remaining(buf, 8 + 4)?;
            let table = TableId::new(buf.get_u64_le());
            let change_count = buf.get_u32_le() as usize;
            ensure_remaining(buf, 8 * change_count)?;
            let keys = (0..change_count).map(|_| Key::new(buf.get_u64_le())).collect();
            let mut indexes = vec![];
            if with_indexes {
                ensure_remaining(buf, 4)?;
                let index_count = buf.get_u32_le();
                for _ in 0..index_count {
                    let name = String::from_utf8(read_prefixed(buf)?.to_vec())?;
                    ensure_remaining(buf, 4)?;
                    let entry_count = buf.get_u32_le();
                    let mut entries = vec![];
                    for _ in 0..entry_count {
                        let key = IndexKey::from_bytes(read_prefixed(buf)?.to_vec())?;
                        ensure_remaining(buf, 8 + 1)?;
                        let value = Key::new(buf.get_u64_le());
                        let op = match buf.get_u8() {
                            0 => IndexOp::Insert,
                            1 => IndexOp::Remove,
                            op => anyhow::bail!("Invalid index op {op} in undo log"),
                        };
                        entries.push(IndexMutation { key, value, op });
                    }
                    indexes.push(IndexUndo { name, entries });
                }
            }
            tables.push(TableUndo {
                table,
                keys,
                indexes,
            });
        }
        anyhow::ensure!(
            !buf.has_remaining(),
            "{} trailing bytes after undo log",
            buf.remaining()
        );
        Ok(Self {
            with_indexes,
            tables,
        })
    }
}

fn ensure_remaining(buf: &&[u8], len: usize) -> anyhow::Result<()> {
    anyhow::ensure!(
        buf.remaining() >= len,
        "Truncated undo log: needed {len} more bytes, found {}",
        buf.remaining()
    );
    Ok(())
}

fn read_prefixed<'a>(buf: &mut &'a [u8]) -> anyhow::Result<&'a [u8]> {
    ensure_remaining(buf, 4)?;
    let len = buf.get_u32_le() as usize;
    ensure_remaining(buf, len)?;
    let slice: &'a [u8] = *buf;
    let (bytes, rest) = slice.split_at(len);
    *buf = rest;
    Ok(bytes)
}
