//! Tokenizer vocabulary built from `tokenizer.ggml.*` metadata.
//!
//! Encoding is greedy longest-match over the token table with `<0xNN>`
//! byte fallback. Decoded pieces are byte vectors: byte-fallback tokens
//! can split UTF-8 runes, and rune reassembly belongs to the streaming
//! layer, not the vocabulary.

use std::collections::HashMap;

use tracing::debug;

use super::ModelError;
use crate::gguf::KvMap;

/// Pre-tokenizer regex families this build knows how to serve. Anything
/// else fails model construction rather than silently mis-tokenizing.
const SUPPORTED_PRE: &[&str] = &[
    "default",
    "llama-bpe",
    "llama3",
    "deepseek-llm",
    "deepseek-coder",
    "falcon",
    "starcoder",
    "gpt-2",
    "qwen2",
    "stablelm2",
    "command-r",
    "chatglm-bpe",
    "tekken",
    "gpt-4o",
];

/// ggml token type tags.
const TOKEN_TYPE_CONTROL: u32 = 3;
const TOKEN_TYPE_BYTE: u32 = 6;

/// SentencePiece's visible space marker.
const SPACE_MARKER: &str = "\u{2581}";

pub type TokenId = i32;

#[derive(Debug)]
pub struct Vocabulary {
    tokens: Vec<String>,
    types: Vec<u32>,
    lookup: HashMap<String, TokenId>,
    max_token_bytes: usize,

    /// SentencePiece model (space marker) vs byte-level BPE.
    spm: bool,

    pub bos: Option<TokenId>,
    pub eos: Option<TokenId>,
    pub eot: Option<TokenId>,
    pub add_bos: bool,
}

impl Vocabulary {
    pub fn from_kv(kv: &KvMap) -> Result<Self, ModelError> {
        let tokens = kv
            .strings("tokenizer.ggml.tokens")
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ModelError::MissingKey("tokenizer.ggml.tokens".to_string()))?;

        let pre = kv.string_or("tokenizer.ggml.pre", "default");
        if !SUPPORTED_PRE.contains(&pre) {
            return Err(ModelError::UnsupportedTokenizer(pre.to_string()));
        }

        let model = kv.string_or("tokenizer.ggml.model", "gpt2");
        let spm = model == "llama";

        let types = kv
            .u64s("tokenizer.ggml.token_type")
            .map(|v| v.into_iter().map(|t| t as u32).collect())
            .unwrap_or_else(|| vec![1u32; tokens.len()]);

        let lookup: HashMap<String, TokenId> = tokens
            .iter()
            .enumerate()
            .map(|(i, t)| (t.clone(), i as TokenId))
            .collect();
        let max_token_bytes = tokens.iter().map(String::len).max().unwrap_or(1);

        let id_key = |key: &str| match kv.get(key).and_then(|v| v.as_u64()) {
            Some(id) if (id as usize) < tokens.len() => Some(id as TokenId),
            _ => None,
        };

        let vocab = Self {
            bos: id_key("tokenizer.ggml.bos_token_id"),
            eos: id_key("tokenizer.ggml.eos_token_id"),
            eot: id_key("tokenizer.ggml.eot_token_id"),
            add_bos: kv.bool_or("tokenizer.ggml.add_bos_token", spm),
            tokens,
            types,
            lookup,
            max_token_bytes,
            spm,
        };

        debug!(
            tokens = vocab.tokens.len(),
            model, pre, "constructed vocabulary"
        );
        Ok(vocab)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn is_eos(&self, id: TokenId) -> bool {
        Some(id) == self.eos || Some(id) == self.eot
    }

    fn token_type(&self, id: TokenId) -> u32 {
        self.types.get(id as usize).copied().unwrap_or(1)
    }

    /// Tokenize text. Greedy longest-match with byte fallback; the BOS
    /// token is prepended when the model asks for it and `add_bos` allows.
    pub fn encode(&self, text: &str, add_bos: bool) -> Vec<TokenId> {
        let mut out = Vec::new();
        if add_bos && self.add_bos {
            if let Some(bos) = self.bos {
                out.push(bos);
            }
        }

        let normalized = if self.spm {
            format!("{SPACE_MARKER}{}", text.replace(' ', SPACE_MARKER))
        } else {
            text.to_string()
        };

        let bytes = normalized.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            let max = (bytes.len() - i).min(self.max_token_bytes);
            let mut matched = None;
            for len in (1..=max).rev() {
                if let Ok(s) = std::str::from_utf8(&bytes[i..i + len]) {
                    if let Some(&id) = self.lookup.get(s) {
                        matched = Some((id, len));
                        break;
                    }
                }
            }
            match matched {
                Some((id, len)) => {
                    out.push(id);
                    i += len;
                }
                None => {
                    // Byte fallback; unrepresentable bytes are dropped.
                    if let Some(&id) = self.lookup.get(&format!("<0x{:02X}>", bytes[i])) {
                        out.push(id);
                    }
                    i += 1;
                }
            }
        }
        out
    }

    /// The byte piece for one token. Control tokens (BOS/EOS) decode to
    /// nothing; byte tokens decode to their single byte.
    pub fn decode(&self, id: TokenId) -> Vec<u8> {
        let Some(piece) = self.tokens.get(id as usize) else {
            return Vec::new();
        };
        match self.token_type(id) {
            TOKEN_TYPE_CONTROL => Vec::new(),
            TOKEN_TYPE_BYTE => parse_byte_token(piece)
                .map(|b| vec![b])
                .unwrap_or_else(|| piece.as_bytes().to_vec()),
            _ if self.spm => piece.replace(SPACE_MARKER, " ").into_bytes(),
            _ => piece.as_bytes().to_vec(),
        }
    }

    /// Decode a whole token run into bytes.
    pub fn decode_all(&self, ids: &[TokenId]) -> Vec<u8> {
        ids.iter().flat_map(|&id| self.decode(id)).collect()
    }
}

fn parse_byte_token(piece: &str) -> Option<u8> {
    let hex = piece.strip_prefix("<0x")?.strip_suffix('>')?;
    u8::from_str_radix(hex, 16).ok()
}
