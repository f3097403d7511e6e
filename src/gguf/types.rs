//! Tensor descriptors and byte-size arithmetic.
//!
//! Quantized kinds pack `block_size` elements into a fixed number of bytes,
//! so a tensor's byte size is `elements * type_size / block_size`.

use super::GgufError;

/// Default alignment of the tensor-data region when the file does not
/// declare `general.alignment`.
pub const DEFAULT_ALIGNMENT: u32 = 32;

/// Bytes of padding needed to bring `offset` up to a multiple of `align`.
pub fn pad(offset: u64, align: u64) -> u64 {
    (align - offset % align) % align
}

/// Tensor data type tags. Discriminants are the on-disk ggml type ids;
/// the gaps (4, 5, 16-23, ...) are ids this codec does not accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum TensorKind {
    F32 = 0,
    F16 = 1,
    Q4_0 = 2,
    Q4_1 = 3,
    Q5_0 = 6,
    Q5_1 = 7,
    Q8_0 = 8,
    Q8_1 = 9,
    Q2K = 10,
    Q3K = 11,
    Q4K = 12,
    Q5K = 13,
    Q6K = 14,
    Q8K = 15,
    I8 = 24,
    I16 = 25,
    I32 = 26,
    I64 = 27,
    F64 = 28,
    BF16 = 30,
    MXFP4 = 39,
}

impl TensorKind {
    pub fn from_tag(tag: u32) -> Result<Self, GgufError> {
        use TensorKind::*;
        Ok(match tag {
            0 => F32,
            1 => F16,
            2 => Q4_0,
            3 => Q4_1,
            6 => Q5_0,
            7 => Q5_1,
            8 => Q8_0,
            9 => Q8_1,
            10 => Q2K,
            11 => Q3K,
            12 => Q4K,
            13 => Q5K,
            14 => Q6K,
            15 => Q8K,
            24 => I8,
            25 => I16,
            26 => I32,
            27 => I64,
            28 => F64,
            30 => BF16,
            39 => MXFP4,
            other => return Err(GgufError::UnknownTensorType(other)),
        })
    }

    /// Elements per quantization block. 1 for unquantized kinds.
    pub fn block_size(self) -> u64 {
        use TensorKind::*;
        match self {
            F32 | F16 | BF16 | F64 | I8 | I16 | I32 | I64 => 1,
            Q4_0 | Q4_1 | Q5_0 | Q5_1 | Q8_0 | Q8_1 | MXFP4 => 32,
            Q2K | Q3K | Q4K | Q5K | Q6K | Q8K => 256,
        }
    }

    /// Bytes per block. The sums mirror the on-disk block layouts
    /// (scale / min / high-bit / payload fields).
    pub fn type_size(self) -> u64 {
        use TensorKind::*;
        match self {
            F32 | I32 => 4,
            F16 | BF16 | I16 => 2,
            F64 | I64 => 8,
            I8 => 1,
            Q4_0 => 2 + 16,
            Q4_1 => 2 + 2 + 16,
            Q5_0 => 2 + 4 + 16,
            Q5_1 => 2 + 2 + 4 + 16,
            Q8_0 => 2 + 32,
            Q8_1 => 2 + 2 + 32,
            MXFP4 => 1 + 16,
            Q2K => 16 + 64 + 2 + 2,
            Q3K => 32 + 64 + 12 + 2,
            Q4K => 2 + 2 + 12 + 128,
            Q5K => 2 + 2 + 12 + 32 + 128,
            Q6K => 128 + 64 + 16 + 2,
            Q8K => 4 + 256 + 32,
        }
    }

    /// Short lowercase name as it appears in quantization strings
    /// (e.g. `q4_0`, `f16`).
    pub fn as_str(self) -> &'static str {
        use TensorKind::*;
        match self {
            F32 => "f32",
            F16 => "f16",
            Q4_0 => "q4_0",
            Q4_1 => "q4_1",
            Q5_0 => "q5_0",
            Q5_1 => "q5_1",
            Q8_0 => "q8_0",
            Q8_1 => "q8_1",
            Q2K => "q2_k",
            Q3K => "q3_k",
            Q4K => "q4_k",
            Q5K => "q5_k",
            Q6K => "q6_k",
            Q8K => "q8_k",
            I8 => "i8",
            I16 => "i16",
            I32 => "i32",
            I64 => "i64",
            F64 => "f64",
            BF16 => "bf16",
            MXFP4 => "mxfp4",
        }
    }
}

impl std::fmt::Display for TensorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata for one tensor in the container.
///
/// `offset` is relative to the start of the aligned tensor-data region.
/// Immutable after decode or construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tensor {
    /// Dotted identifier, e.g. `blk.5.attn_q.weight`.
    pub name: String,

    /// Data type tag.
    pub kind: TensorKind,

    /// 1-4 dimensions, innermost first.
    pub shape: Vec<u64>,

    /// Byte offset within the tensor-data region.
    pub offset: u64,
}

impl Tensor {
    /// Total element count across all dimensions.
    pub fn elements(&self) -> u64 {
        self.shape.iter().product()
    }

    /// Byte size of the tensor data in its stored format.
    pub fn size_bytes(&self) -> u64 {
        self.elements() * self.kind.type_size() / self.kind.block_size()
    }

    /// The repeating-block index if this tensor belongs to `blk.N.*`.
    pub fn block_index(&self) -> Option<usize> {
        let rest = self.name.strip_prefix("blk.")?;
        let (idx, _) = rest.split_once('.')?;
        idx.parse().ok()
    }

    /// Leading path segment used for layer grouping (`blk.N`, `output`,
    /// `token_embd`, `v`, `mm`, ...).
    pub fn layer_group(&self) -> &str {
        match self.block_index() {
            Some(_) => {
                // "blk.N" including the index.
                let second_dot = self.name[4..]
                    .find('.')
                    .map(|i| i + 4)
                    .unwrap_or(self.name.len());
                &self.name[..second_dot]
            }
            None => self.name.split('.').next().unwrap_or(&self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pad() {
        assert_eq!(pad(0, 32), 0);
        assert_eq!(pad(1, 32), 31);
        assert_eq!(pad(32, 32), 0);
        assert_eq!(pad(33, 32), 31);
        assert_eq!(pad(63, 32), 1);
    }

    #[test]
    fn test_type_sizes() {
        assert_eq!(TensorKind::F32.type_size(), 4);
        assert_eq!(TensorKind::Q4_0.type_size(), 18);
        assert_eq!(TensorKind::Q8_0.type_size(), 34);
        assert_eq!(TensorKind::MXFP4.type_size(), 17);
        assert_eq!(TensorKind::Q4K.type_size(), 144);
        assert_eq!(TensorKind::Q6K.type_size(), 210);
        assert_eq!(TensorKind::Q8K.type_size(), 292);
    }

    #[test]
    fn test_tensor_size_quantized() {
        // 4096x4096 at Q4_0: 16M elements / 32 per block * 18 bytes.
        let t = Tensor {
            name: "blk.0.attn_q.weight".to_string(),
            kind: TensorKind::Q4_0,
            shape: vec![4096, 4096],
            offset: 0,
        };
        assert_eq!(t.size_bytes(), 4096 * 4096 / 32 * 18);
    }

    #[test]
    fn test_unknown_tag_rejected() {
        assert!(TensorKind::from_tag(4).is_err());
        assert!(TensorKind::from_tag(5).is_err());
        assert!(TensorKind::from_tag(99).is_err());
    }

    #[test]
    fn test_block_index_and_group() {
        let t = Tensor {
            name: "blk.12.ffn_down.weight".to_string(),
            kind: TensorKind::F16,
            shape: vec![1],
            offset: 0,
        };
        assert_eq!(t.block_index(), Some(12));
        assert_eq!(t.layer_group(), "blk.12");

        let out = Tensor {
            name: "output.weight".to_string(),
            kind: TensorKind::F16,
            shape: vec![1],
            offset: 0,
        };
        assert_eq!(out.block_index(), None);
        assert_eq!(out.layer_group(), "output");

        let vis = Tensor {
            name: "v.patch_embd.weight".to_string(),
            kind: TensorKind::F16,
            shape: vec![1],
            offset: 0,
        };
        assert_eq!(vis.layer_group(), "v");
    }
}
