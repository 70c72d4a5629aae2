//! Implementation of `Ord` for `Field` using *sort keys*. We define a total
//! ordering on `Field`s by mapping them to binary strings and then comparing
//! those lexicographically. Index keys are stored as the concatenated sort
//! keys of their fields, so the remote store can order them as plain bytes.
//!
//! The encoding is self-delimiting:
//! 1) Every field is prefixed with a tag. Tags order the types.
//! 2) Integers are fixed width big-endian with the sign bit flipped.
//! 3) Floats are stored according to IEEE-754 total ordering (flip every bit
//!    of a negative number, flip only the sign bit of a positive one).
//! 4) Text and blobs are stored with `0x0` as a delimiter. Null bytes within
//!    the string are escaped to `0x0 0xFF`, which implies that `0xFF` must
//!    never be a valid tag.
use std::cmp::Ordering;

use anyhow::{
    bail,
    Context,
};
use bytes::{
    Buf,
    BufMut,
};

use crate::Field;

const NULL_TAG: u8 = 0x1;
const SMALLINT_TAG: u8 = 0x2;
const INT_TAG: u8 = 0x3;
const BIGINT_TAG: u8 = 0x4;
const FLOAT_TAG: u8 = 0x5;
const DOUBLE_TAG: u8 = 0x6;
const TEXT_TAG: u8 = 0x7;
const BLOB_TAG: u8 = 0x8;

pub const TERMINATOR_BYTE: u8 = 0x0;
const ESCAPE_BYTE: u8 = 0xFF;

pub fn write_escaped_bytes(buf: &[u8], writer: &mut impl BufMut) {
    for &byte in buf {
        writer.put_u8(byte);
        if byte == TERMINATOR_BYTE {
            writer.put_u8(ESCAPE_BYTE);
        }
    }
    writer.put_u8(TERMINATOR_BYTE);
}

fn read_escaped_bytes(reader: &mut &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut out = vec![];
    loop {
        anyhow::ensure!(reader.has_remaining(), "Unterminated byte string");
        let byte = reader.get_u8();
        if byte != TERMINATOR_BYTE {
            out.push(byte);
            continue;
        }
        if reader.first() == Some(&ESCAPE_BYTE) {
            reader.advance(1);
            out.push(TERMINATOR_BYTE);
        } else {
            return Ok(out);
        }
    }
}

fn f32_sort_bits(f: f32) -> u32 {
    let bits = f.to_bits();
    if bits & (1 << 31) != 0 {
        !bits
    } else {
        bits | (1 << 31)
    }
}

fn f32_from_sort_bits(bits: u32) -> f32 {
    if bits & (1 << 31) != 0 {
        f32::from_bits(bits & !(1 << 31))
    } else {
        f32::from_bits(!bits)
    }
}

fn f64_sort_bits(f: f64) -> u64 {
    let bits = f.to_bits();
    if bits & (1 << 63) != 0 {
        !bits
    } else {
        bits | (1 << 63)
    }
}

fn f64_from_sort_bits(bits: u64) -> f64 {
    if bits & (1 << 63) != 0 {
        f64::from_bits(bits & !(1 << 63))
    } else {
        f64::from_bits(!bits)
    }
}

impl Field {
    /// Generate the sort key for a given `Field`.
    pub fn sort_key(&self) -> Vec<u8> {
        let mut out = vec![];
        self.write_sort_key(&mut out);
        out
    }

    pub fn write_sort_key(&self, writer: &mut impl BufMut) {
        match self {
            Field::Null => writer.put_u8(NULL_TAG),
            Field::SmallInt(v) => {
                writer.put_u8(SMALLINT_TAG);
                writer.put_u16((*v as u16) ^ (1 << 15));
            },
            Field::Int(v) => {
                writer.put_u8(INT_TAG);
                writer.put_u32((*v as u32) ^ (1 << 31));
            },
            Field::BigInt(v) => {
                writer.put_u8(BIGINT_TAG);
                writer.put_u64((*v as u64) ^ (1 << 63));
            },
            Field::Float(v) => {
                writer.put_u8(FLOAT_TAG);
                writer.put_u32(f32_sort_bits(*v));
            },
            Field::Double(v) => {
                writer.put_u8(DOUBLE_TAG);
                writer.put_u64(f64_sort_bits(*v));
            },
            Field::Text(s) => {
                writer.put_u8(TEXT_TAG);
                write_escaped_bytes(s.as_bytes(), writer);
            },
            Field::Blob(b) => {
                writer.put_u8(BLOB_TAG);
                write_escaped_bytes(b, writer);
            },
        }
    }

    /// Parse one `Field` from the front of `reader`, advancing past it.
    pub fn read_sort_key(reader: &mut &[u8]) -> anyhow::Result<Self> {
        anyhow::ensure!(reader.has_remaining(), "Empty sort key");
        let tag = reader.get_u8();
        let width = match tag {
            SMALLINT_TAG => 2,
            INT_TAG | FLOAT_TAG => 4,
            BIGINT_TAG | DOUBLE_TAG => 8,
            _ => 0,
        };
        anyhow::ensure!(
            reader.remaining() >= width,
            "Truncated sort key for tag {tag:#x}"
        );
        let field = match tag {
            NULL_TAG => Field::Null,
            SMALLINT_TAG => Field::SmallInt((reader.get_u16() ^ (1 << 15)) as i16),
            INT_TAG => Field::Int((reader.get_u32() ^ (1 << 31)) as i32),
            BIGINT_TAG => Field::BigInt((reader.get_u64() ^ (1 << 63)) as i64),
            FLOAT_TAG => Field::Float(f32_from_sort_bits(reader.get_u32())),
            DOUBLE_TAG => Field::Double(f64_from_sort_bits(reader.get_u64())),
            TEXT_TAG => Field::Text(
                String::from_utf8(read_escaped_bytes(reader)?).context("Invalid text field")?,
            ),
            BLOB_TAG => Field::Blob(read_escaped_bytes(reader)?),
            ESCAPE_BYTE => bail!("Escape code used as tag"),
            _ => bail!("Unrecognized tag: {tag}"),
        };
        Ok(field)
    }
}

/// Generate the sort key for a sequence of `Field`s.
pub fn fields_to_bytes(fields: &[Field]) -> Vec<u8> {
    let mut out = vec![];
    for field in fields {
        field.write_sort_key(&mut out);
    }
    out
}

/// Parse a sequence of `Field`s from their concatenated sort keys.
pub fn bytes_to_fields(mut bytes: &[u8]) -> anyhow::Result<Vec<Field>> {
    let mut fields = vec![];
    while bytes.has_remaining() {
        fields.push(Field::read_sort_key(&mut bytes)?);
    }
    Ok(fields)
}

// Manual implementation of `Ord` that is proptested to be equivalent to
// comparing sort keys.
impl Ord for Field {
    fn cmp(&self, other: &Self) -> Ordering {
        // Avoid wildcard matches so a new variant can't be forgotten here.
        fn type_tag(f: &Field) -> u8 {
            match f {
                Field::Null => NULL_TAG,
                Field::SmallInt(..) => SMALLINT_TAG,
                Field::Int(..) => INT_TAG,
                Field::BigInt(..) => BIGINT_TAG,
                Field::Float(..) => FLOAT_TAG,
                Field::Double(..) => DOUBLE_TAG,
                Field::Text(..) => TEXT_TAG,
                Field::Blob(..) => BLOB_TAG,
            }
        }
        match (self, other) {
            (Field::Null, Field::Null) => Ordering::Equal,
            (Field::SmallInt(l), Field::SmallInt(r)) => l.cmp(r),
            (Field::Int(l), Field::Int(r)) => l.cmp(r),
            (Field::BigInt(l), Field::BigInt(r)) => l.cmp(r),
            (Field::Float(l), Field::Float(r)) => l.total_cmp(r),
            (Field::Double(l), Field::Double(r)) => l.total_cmp(r),
            (Field::Text(l), Field::Text(r)) => l.as_bytes().cmp(r.as_bytes()),
            (Field::Blob(l), Field::Blob(r)) => l.cmp(r),
            _ => type_tag(self).cmp(&type_tag(other)),
        }
    }
}

impl PartialOrd for Field {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Field {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Field {}
