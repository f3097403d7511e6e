//! GGUF container parser.
//!
//! Reads the header, metadata, and tensor table from a seekable stream and
//! validates that every tensor's data region lies inside the file. Supports
//! versions 1-3 in both byte orders; version controls the width of count
//! prefixes and the v1 string termination rule.

use std::io::{Read, Seek, SeekFrom};

use tracing::debug;

use super::kv::{ArrayValue, KvMap, Value, ValueKind};
use super::types::{pad, Tensor, TensorKind};
use super::GgufError;

const MAGIC_LE: u32 = 0x4655_4747;
const MAGIC_BE: u32 = 0x4747_5546;

/// Result of parsing a container.
#[derive(Debug)]
pub struct Decoded {
    /// Metadata key/value section.
    pub kv: KvMap,

    /// Tensor table in file order.
    pub tensors: Vec<Tensor>,

    /// Absolute file offset of the aligned tensor-data region.
    pub data_offset: u64,

    /// Total container length in bytes.
    pub length: u64,
}

#[derive(Clone, Copy, PartialEq)]
enum ByteOrder {
    Little,
    Big,
}

struct Reader<R> {
    inner: R,
    order: ByteOrder,
    version: u32,
}

impl<R: Read + Seek> Reader<R> {
    fn u8(&mut self) -> Result<u8, GgufError> {
        let mut b = [0u8; 1];
        self.inner.read_exact(&mut b)?;
        Ok(b[0])
    }

    fn u16(&mut self) -> Result<u16, GgufError> {
        let mut b = [0u8; 2];
        self.inner.read_exact(&mut b)?;
        Ok(match self.order {
            ByteOrder::Little => u16::from_le_bytes(b),
            ByteOrder::Big => u16::from_be_bytes(b),
        })
    }

    fn u32(&mut self) -> Result<u32, GgufError> {
        let mut b = [0u8; 4];
        self.inner.read_exact(&mut b)?;
        Ok(match self.order {
            ByteOrder::Little => u32::from_le_bytes(b),
            ByteOrder::Big => u32::from_be_bytes(b),
        })
    }

    fn u64(&mut self) -> Result<u64, GgufError> {
        let mut b = [0u8; 8];
        self.inner.read_exact(&mut b)?;
        Ok(match self.order {
            ByteOrder::Little => u64::from_le_bytes(b),
            ByteOrder::Big => u64::from_be_bytes(b),
        })
    }

    fn f32(&mut self) -> Result<f32, GgufError> {
        Ok(f32::from_bits(self.u32()?))
    }

    fn f64(&mut self) -> Result<f64, GgufError> {
        Ok(f64::from_bits(self.u64()?))
    }

    /// Count/length prefix: u32 in version 1, u64 in versions 2-3.
    fn count(&mut self) -> Result<u64, GgufError> {
        if self.version == 1 {
            Ok(self.u32()? as u64)
        } else {
            self.u64()
        }
    }

    /// Length-prefixed string. Version 1 strings are null-terminated and
    /// the terminator is stripped.
    fn string(&mut self) -> Result<String, GgufError> {
        let len = self.count()? as usize;
        let mut buf = vec![0u8; len];
        self.inner.read_exact(&mut buf)?;
        if self.version == 1 {
            while buf.last() == Some(&0) {
                buf.pop();
            }
        }
        Ok(String::from_utf8(buf)?)
    }

    /// Consume and discard a length-prefixed string.
    fn skip_string(&mut self) -> Result<(), GgufError> {
        let len = self.count()?;
        self.inner.seek(SeekFrom::Current(len as i64))?;
        Ok(())
    }

    fn scalar(&mut self, kind: ValueKind) -> Result<Value, GgufError> {
        Ok(match kind {
            ValueKind::U8 => Value::U8(self.u8()?),
            ValueKind::I8 => Value::I8(self.u8()? as i8),
            ValueKind::U16 => Value::U16(self.u16()?),
            ValueKind::I16 => Value::I16(self.u16()? as i16),
            ValueKind::U32 => Value::U32(self.u32()?),
            ValueKind::I32 => Value::I32(self.u32()? as i32),
            ValueKind::F32 => Value::F32(self.f32()?),
            ValueKind::Bool => Value::Bool(self.u8()? != 0),
            ValueKind::String => Value::String(self.string()?),
            ValueKind::U64 => Value::U64(self.u64()?),
            ValueKind::I64 => Value::I64(self.u64()? as i64),
            ValueKind::F64 => Value::F64(self.f64()?),
            ValueKind::Array => {
                // Nested arrays do not occur in the format.
                return Err(GgufError::UnknownValueType(ValueKind::Array as u32));
            }
        })
    }

    /// Consume a scalar without materializing it.
    fn skip_scalar(&mut self, kind: ValueKind) -> Result<(), GgufError> {
        let fixed = match kind {
            ValueKind::U8 | ValueKind::I8 | ValueKind::Bool => 1,
            ValueKind::U16 | ValueKind::I16 => 2,
            ValueKind::U32 | ValueKind::I32 | ValueKind::F32 => 4,
            ValueKind::U64 | ValueKind::I64 | ValueKind::F64 => 8,
            ValueKind::String => return self.skip_string(),
            ValueKind::Array => {
                return Err(GgufError::UnknownValueType(ValueKind::Array as u32))
            }
        };
        self.inner.seek(SeekFrom::Current(fixed))?;
        Ok(())
    }

    /// Array value. Arrays longer than `max_array_size` keep their element
    /// count but discard element storage; a negative cap disables the limit.
    fn array(&mut self, max_array_size: i64) -> Result<Value, GgufError> {
        let kind = ValueKind::from_tag(self.u32()?)?;
        let len = self.count()?;

        let keep = if max_array_size < 0 {
            len
        } else {
            len.min(max_array_size as u64)
        };

        let mut values = Vec::with_capacity(keep.min(1 << 20) as usize);
        for i in 0..len {
            if i < keep {
                values.push(self.scalar(kind)?);
            } else {
                self.skip_scalar(kind)?;
            }
        }

        // Dropped storage still reports the on-disk count.
        if keep < len {
            values.clear();
        }

        Ok(Value::Array(ArrayValue { kind, len, values }))
    }
}

/// Parse a GGUF container from a seekable stream.
///
/// `max_array_size` caps how many elements of each metadata array are
/// retained (the token table of a large model is tens of megabytes; callers
/// that only need layout information pass a small cap). Negative disables
/// the cap.
pub fn decode<R: Read + Seek>(reader: R, max_array_size: i64) -> Result<Decoded, GgufError> {
    let mut r = Reader {
        inner: reader,
        order: ByteOrder::Little,
        version: 0,
    };

    let magic = r.u32()?;
    r.order = match magic {
        MAGIC_LE => ByteOrder::Little,
        MAGIC_BE => ByteOrder::Big,
        other => return Err(GgufError::BadMagic(other)),
    };

    r.version = r.u32()?;
    if !(1..=3).contains(&r.version) {
        return Err(GgufError::UnsupportedVersion(r.version));
    }

    let tensor_count = r.count()?;
    let kv_count = r.count()?;

    let mut kv = KvMap::new();
    for _ in 0..kv_count {
        let key = r.string()?;
        let kind = ValueKind::from_tag(r.u32()?)?;
        let value = match kind {
            ValueKind::Array => r.array(max_array_size)?,
            scalar => r.scalar(scalar)?,
        };
        kv.insert(key, value);
    }

    let mut tensors = Vec::with_capacity(tensor_count.min(1 << 20) as usize);
    for _ in 0..tensor_count {
        let name = r.string()?;
        let dims = r.u32()?;
        if !(1..=4).contains(&dims) {
            return Err(GgufError::InvalidDimensions { name, dims });
        }
        let mut shape = Vec::with_capacity(dims as usize);
        for _ in 0..dims {
            shape.push(r.count()?);
        }
        let kind = TensorKind::from_tag(r.u32()?)?;
        let offset = r.u64()?;
        tensors.push(Tensor {
            name,
            kind,
            shape,
            offset,
        });
    }

    // The tensor-data region begins at the next alignment boundary.
    let alignment = kv.alignment();
    let here = r.inner.stream_position()?;
    let data_offset = here + pad(here, alignment);

    // Walk the data region: each tensor's stored offset must match the
    // running aligned cursor, and the final extent must fit in the file.
    let mut sorted: Vec<&Tensor> = tensors.iter().collect();
    sorted.sort_by_key(|t| t.offset);

    let mut cursor = 0u64;
    for t in &sorted {
        if t.offset != cursor {
            return Err(GgufError::OffsetMismatch {
                name: t.name.clone(),
                got: t.offset,
                want: cursor,
            });
        }
        let size = t.size_bytes();
        cursor += size + pad(size, alignment);
    }

    let length = r.inner.seek(SeekFrom::End(0))?;
    if let Some(last) = sorted.last() {
        let end = data_offset + last.offset + last.size_bytes();
        if end > length {
            return Err(GgufError::TruncatedData {
                name: last.name.clone(),
                size: last.size_bytes(),
                len: length,
            });
        }
    }

    debug!(
        version = r.version,
        tensors = tensors.len(),
        keys = kv.len(),
        data_offset,
        length,
        "decoded container"
    );

    Ok(Decoded {
        kv,
        tensors,
        data_offset,
        length,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn put_str(buf: &mut Vec<u8>, s: &str) {
        buf.extend_from_slice(&(s.len() as u64).to_le_bytes());
        buf.extend_from_slice(s.as_bytes());
    }

    /// Minimal hand-built v3 file: one KV pair, no tensors.
    fn v3_no_tensors() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&MAGIC_LE.to_le_bytes());
        buf.extend_from_slice(&3u32.to_le_bytes());
        buf.extend_from_slice(&0u64.to_le_bytes()); // tensors
        buf.extend_from_slice(&1u64.to_le_bytes()); // kv
        put_str(&mut buf, "general.architecture");
        buf.extend_from_slice(&(ValueKind::String as u32).to_le_bytes());
        put_str(&mut buf, "llama");
        buf
    }

    #[test]
    fn test_decode_minimal() {
        let decoded = decode(Cursor::new(v3_no_tensors()), -1).unwrap();
        assert_eq!(decoded.kv.architecture(), "llama");
        assert!(decoded.tensors.is_empty());
    }

    #[test]
    fn test_bad_magic() {
        let mut buf = v3_no_tensors();
        buf[0] = b'X';
        match decode(Cursor::new(buf), -1) {
            Err(GgufError::BadMagic(_)) => {}
            other => panic!("expected BadMagic, got {other:?}"),
        }
    }

    #[test]
    fn test_unsupported_version() {
        let mut buf = v3_no_tensors();
        buf[4..8].copy_from_slice(&9u32.to_le_bytes());
        assert!(matches!(
            decode(Cursor::new(buf), -1),
            Err(GgufError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn test_big_endian_header() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&MAGIC_LE.to_be_bytes()); // swapped magic
        buf.extend_from_slice(&3u32.to_be_bytes());
        buf.extend_from_slice(&0u64.to_be_bytes());
        buf.extend_from_slice(&1u64.to_be_bytes());
        let key = "general.architecture";
        buf.extend_from_slice(&(key.len() as u64).to_be_bytes());
        buf.extend_from_slice(key.as_bytes());
        buf.extend_from_slice(&(ValueKind::String as u32).to_be_bytes());
        buf.extend_from_slice(&(5u64).to_be_bytes());
        buf.extend_from_slice(b"gemma");

        let decoded = decode(Cursor::new(buf), -1).unwrap();
        assert_eq!(decoded.kv.architecture(), "gemma");
    }

    #[test]
    fn test_v1_counts_and_null_terminated_strings() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&MAGIC_LE.to_le_bytes());
        buf.extend_from_slice(&1u32.to_le_bytes()); // version 1
        buf.extend_from_slice(&0u32.to_le_bytes()); // tensors: u32 in v1
        buf.extend_from_slice(&1u32.to_le_bytes()); // kv: u32 in v1

        let key = "general.architecture\0";
        buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
        buf.extend_from_slice(key.as_bytes());
        buf.extend_from_slice(&(ValueKind::String as u32).to_le_bytes());
        let val = "phi2\0";
        buf.extend_from_slice(&(val.len() as u32).to_le_bytes());
        buf.extend_from_slice(val.as_bytes());

        let decoded = decode(Cursor::new(buf), -1).unwrap();
        assert_eq!(decoded.kv.architecture(), "phi2");
    }

    #[test]
    fn test_array_cap_keeps_count_drops_storage() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&MAGIC_LE.to_le_bytes());
        buf.extend_from_slice(&3u32.to_le_bytes());
        buf.extend_from_slice(&0u64.to_le_bytes());
        buf.extend_from_slice(&2u64.to_le_bytes());

        put_str(&mut buf, "general.architecture");
        buf.extend_from_slice(&(ValueKind::String as u32).to_le_bytes());
        put_str(&mut buf, "llama");

        put_str(&mut buf, "tokenizer.ggml.tokens");
        buf.extend_from_slice(&(ValueKind::Array as u32).to_le_bytes());
        buf.extend_from_slice(&(ValueKind::String as u32).to_le_bytes());
        buf.extend_from_slice(&4u64.to_le_bytes());
        for tok in ["a", "b", "c", "d"] {
            put_str(&mut buf, tok);
        }

        let decoded = decode(Cursor::new(buf.clone()), 2).unwrap();
        let arr = decoded.kv.array("tokenizer.ggml.tokens").unwrap();
        assert_eq!(arr.len, 4);
        assert!(arr.values.is_empty());

        // Uncapped keeps everything.
        let decoded = decode(Cursor::new(buf), -1).unwrap();
        let arr = decoded.kv.array("tokenizer.ggml.tokens").unwrap();
        assert_eq!(arr.values.len(), 4);
    }
}
