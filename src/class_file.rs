//! Just enough class-file parsing to learn which class a file defines.

use anyhow::{bail, Result};
use std::path::{Path, PathBuf};

const MAGIC: u32 = 0xCAFE_BABE;

// Constant pool tags.
const CONSTANT_UTF8: u8 = 1;
const CONSTANT_INTEGER: u8 = 3;
const CONSTANT_FLOAT: u8 = 4;
const CONSTANT_LONG: u8 = 5;
const CONSTANT_DOUBLE: u8 = 6;
const CONSTANT_CLASS: u8 = 7;
const CONSTANT_STRING: u8 = 8;
const CONSTANT_FIELDREF: u8 = 9;
const CONSTANT_METHODREF: u8 = 10;
const CONSTANT_INTERFACE_METHODREF: u8 = 11;
const CONSTANT_NAME_AND_TYPE: u8 = 12;
const CONSTANT_METHOD_HANDLE: u8 = 15;
const CONSTANT_METHOD_TYPE: u8 = 16;
const CONSTANT_DYNAMIC: u8 = 17;
const CONSTANT_INVOKE_DYNAMIC: u8 = 18;
const CONSTANT_MODULE: u8 = 19;
const CONSTANT_PACKAGE: u8 = 20;

#[derive(Debug, Clone)]
enum PoolEntry {
    Utf8(String),
    Class { name_index: u16 },
    Other,
    /// Second slot of a long or double.
    Unusable,
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            bail!("truncated at offset {}", self.pos);
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}

/// Fully qualified name (`pkg.sub.Class`) of the class defined by `bytes`.
pub fn class_name(bytes: &[u8]) -> Result<String> {
    let mut r = Reader { bytes, pos: 0 };
    let magic = r.u32()?;
    if magic != MAGIC {
        bail!("bad magic 0x{:08X}", magic);
    }
    let _minor = r.u16()?;
    let _major = r.u16()?;

    let count = r.u16()? as usize;
    // Index 0 is unused.
    let mut pool = vec![PoolEntry::Unusable; count.max(1)];
    let mut i = 1;
    while i < count {
        let tag = r.u8()?;
        let mut width = 1;
        let entry = match tag {
            CONSTANT_UTF8 => {
                let len = r.u16()? as usize;
                PoolEntry::Utf8(String::from_utf8_lossy(r.take(len)?).into_owned())
            }
            CONSTANT_CLASS => PoolEntry::Class {
                name_index: r.u16()?,
            },
            CONSTANT_STRING | CONSTANT_METHOD_TYPE | CONSTANT_MODULE | CONSTANT_PACKAGE => {
                r.take(2)?;
                PoolEntry::Other
            }
            CONSTANT_METHOD_HANDLE => {
                r.take(3)?;
                PoolEntry::Other
            }
            CONSTANT_INTEGER
            | CONSTANT_FLOAT
            | CONSTANT_FIELDREF
            | CONSTANT_METHODREF
            | CONSTANT_INTERFACE_METHODREF
            | CONSTANT_NAME_AND_TYPE
            | CONSTANT_DYNAMIC
            | CONSTANT_INVOKE_DYNAMIC => {
                r.take(4)?;
                PoolEntry::Other
            }
            CONSTANT_LONG | CONSTANT_DOUBLE => {
                if i + 1 >= count {
                    bail!("wide constant at entry {} overruns the pool", i);
                }
                r.take(8)?;
                width = 2;
                PoolEntry::Other
            }
            other => bail!("unknown constant pool tag {} at entry {}", other, i),
        };
        pool[i] = entry;
        i += width;
    }

    let _access_flags = r.u16()?;
    let this_class = r.u16()? as usize;
    let name_index = match pool.get(this_class) {
        Some(PoolEntry::Class { name_index }) => *name_index as usize,
        _ => bail!("this_class #{} is not a class entry", this_class),
    };
    match pool.get(name_index) {
        Some(PoolEntry::Utf8(name)) => Ok(name.replace('/', ".")),
        _ => bail!("class name #{} is not a utf8 entry", name_index),
    }
}

/// Where the class named `fqcn` is installed under `build_dir`.
pub fn installed_path(build_dir: &Path, fqcn: &str) -> PathBuf {
    let mut path = build_dir.to_path_buf();
    let mut segments = fqcn.split('.').peekable();
    while let Some(segment) = segments.next() {
        if segments.peek().is_some() {
            path.push(segment);
        } else {
            path.push(format!("{}.class", segment));
        }
    }
    path
}

/// Build a minimal class file defining `internal_name` (`pkg/Class`).
///
/// `extra` adds a string constant so two files for the same class can differ.
#[cfg(test)]
pub(crate) fn synthesize(internal_name: &str, extra: &str) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&52u16.to_be_bytes());
    // #1 Utf8 extra, #2 Long (two slots), #4 Utf8 name, #5 Class -> #4
    out.extend_from_slice(&6u16.to_be_bytes());
    out.push(CONSTANT_UTF8);
    out.extend_from_slice(&(extra.len() as u16).to_be_bytes());
    out.extend_from_slice(extra.as_bytes());
    out.push(CONSTANT_LONG);
    out.extend_from_slice(&42u64.to_be_bytes());
    out.push(CONSTANT_UTF8);
    out.extend_from_slice(&(internal_name.len() as u16).to_be_bytes());
    out.extend_from_slice(internal_name.as_bytes());
    out.push(CONSTANT_CLASS);
    out.extend_from_slice(&4u16.to_be_bytes());
    out.extend_from_slice(&0x0021u16.to_be_bytes());
    out.extend_from_slice(&5u16.to_be_bytes());
    out
}
