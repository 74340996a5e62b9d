//! Chunk metadata — a tagged scalar sum serialized as length-prefixed TLV.
//!
//! # On-disk encoding (little-endian)
//!
//! ```text
//! meta record := pair_count:u16  pair*  tag_count:u16  string*
//! pair        := string  value
//! value       := tag:u8  payload
//!                tag 0 = null    (no payload)
//!                tag 1 = bool    (u8, 0 or 1)
//!                tag 2 = i64     (8 bytes)
//!                tag 3 = f64     (8 bytes)
//!                tag 4 = string  (length-prefixed)
//! string      := len:u16  utf8[len]
//! ```
//!
//! Pairs are sorted by key and tags lexicographically, so a record encodes
//! identically no matter how it was assembled.  There is no dynamic-map
//! representation on disk; the tagged encoding is the only one.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{MempackError, Result};

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_I64: u8 = 2;
const TAG_F64: u8 = 3;
const TAG_STR: u8 = 4;

/// A restricted JSON scalar.
#[derive(Debug, Clone, PartialEq)]
pub enum MetaValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl MetaValue {
    /// Parse a CLI-style literal: `null`, `true`/`false`, integer, float,
    /// anything else is a string.
    pub fn parse(s: &str) -> MetaValue {
        match s {
            "null" => MetaValue::Null,
            "true" => MetaValue::Bool(true),
            "false" => MetaValue::Bool(false),
            _ => {
                if let Ok(i) = s.parse::<i64>() {
                    MetaValue::Int(i)
                } else if let Ok(f) = s.parse::<f64>() {
                    MetaValue::Float(f)
                } else {
                    MetaValue::Str(s.to_owned())
                }
            }
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            MetaValue::Null => serde_json::Value::Null,
            MetaValue::Bool(b) => serde_json::Value::from(*b),
            MetaValue::Int(i) => serde_json::Value::from(*i),
            MetaValue::Float(f) => serde_json::Value::from(*f),
            MetaValue::Str(s) => serde_json::Value::from(s.as_str()),
        }
    }

    fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        match self {
            MetaValue::Null => w.write_u8(TAG_NULL)?,
            MetaValue::Bool(b) => {
                w.write_u8(TAG_BOOL)?;
                w.write_u8(u8::from(*b))?;
            }
            MetaValue::Int(i) => {
                w.write_u8(TAG_I64)?;
                w.write_i64::<LittleEndian>(*i)?;
            }
            MetaValue::Float(f) => {
                w.write_u8(TAG_F64)?;
                w.write_f64::<LittleEndian>(*f)?;
            }
            MetaValue::Str(s) => {
                w.write_u8(TAG_STR)?;
                write_string(w, s)?;
            }
        }
        Ok(())
    }

    fn read_from<R: Read>(r: &mut R) -> Result<MetaValue> {
        Ok(match r.read_u8()? {
            TAG_NULL => MetaValue::Null,
            TAG_BOOL => MetaValue::Bool(r.read_u8()? != 0),
            TAG_I64 => MetaValue::Int(r.read_i64::<LittleEndian>()?),
            TAG_F64 => MetaValue::Float(r.read_f64::<LittleEndian>()?),
            TAG_STR => MetaValue::Str(read_string(r)?),
            t => {
                return Err(MempackError::HeaderCorrupt(format!(
                    "unknown meta value tag {t}"
                )))
            }
        })
    }
}

/// One chunk's metadata: key/value scalars plus a tag set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkMeta {
    pub fields: BTreeMap<String, MetaValue>,
    pub tags: BTreeSet<String>,
}

impl ChunkMeta {
    /// Append the TLV encoding of this record to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        if self.fields.len() > u16::MAX as usize || self.tags.len() > u16::MAX as usize {
            return Err(MempackError::InvalidConfig(
                "meta record exceeds 65535 entries".into(),
            ));
        }
        out.write_u16::<LittleEndian>(self.fields.len() as u16)?;
        for (key, value) in &self.fields {
            write_string(out, key)?;
            value.write_to(out)?;
        }
        out.write_u16::<LittleEndian>(self.tags.len() as u16)?;
        for tag in &self.tags {
            write_string(out, tag)?;
        }
        Ok(())
    }

    /// Decode one self-delimiting record starting at `offset` in `blob`.
    pub fn decode(blob: &[u8], offset: u64) -> Result<ChunkMeta> {
        let mut slice = blob.get(offset as usize..).ok_or_else(|| {
            MempackError::HeaderCorrupt(format!("meta offset {offset} outside blob"))
        })?;
        let r = &mut slice;

        let mut fields = BTreeMap::new();
        let pair_count = r.read_u16::<LittleEndian>()?;
        for _ in 0..pair_count {
            let key = read_string(r)?;
            let value = MetaValue::read_from(r)?;
            fields.insert(key, value);
        }

        let mut tags = BTreeSet::new();
        let tag_count = r.read_u16::<LittleEndian>()?;
        for _ in 0..tag_count {
            tags.insert(read_string(r)?);
        }
        Ok(ChunkMeta { fields, tags })
    }

    /// True when every key/value pair in `filter` matches this record
    /// exactly.  Missing keys fail the test.
    pub fn matches(&self, filter: &BTreeMap<String, MetaValue>) -> bool {
        filter
            .iter()
            .all(|(k, v)| self.fields.get(k).is_some_and(|have| have == v))
    }

    pub fn to_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        serde_json::Value::Object(map)
    }
}

fn write_string<W: Write>(w: &mut W, s: &str) -> Result<()> {
    if s.len() > u16::MAX as usize {
        return Err(MempackError::InvalidConfig(format!(
            "string of {} B exceeds the u16 length prefix",
            s.len()
        )));
    }
    w.write_u16::<LittleEndian>(s.len() as u16)?;
    w.write_all(s.as_bytes())?;
    Ok(())
}

fn read_string<R: Read>(r: &mut R) -> Result<String> {
    let len = r.read_u16::<LittleEndian>()? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf)
        .map_err(|_| MempackError::HeaderCorrupt("non-UTF-8 string in meta".into()))
}
