//! Per-request inference state.
//!
//! A sequence owns a prompt's remaining inputs, the tokens in flight in
//! the current batch, and the decoded-but-unflushed output pieces. Output
//! flushing guarantees clients only ever see valid UTF-8 and never see a
//! stop string or anything after it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::sampler::{Grammar, Sampler, SamplerConfig};
use super::SchedulerError;
use crate::model::vocab::{TokenId, Vocabulary};

/// Response channel depth; a client that falls this far behind is evicted.
pub const RESPONSE_BUFFER: usize = 100;

/// Why a sequence finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DoneReason {
    /// EOS token or stop string.
    Stop,
    /// numPredict or context exhausted.
    Length,
    /// Client went away.
    ConnectionClosed,
}

/// One token's logprob report.
#[derive(Debug, Clone, Serialize)]
pub struct TokenLogprob {
    pub token: TokenId,
    pub logprob: f32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub top: Vec<(TokenId, f32)>,
}

/// One frame of the streaming completion response.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CompletionFrame {
    pub content: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logprobs: Option<Vec<TokenLogprob>>,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub done: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub done_reason: Option<DoneReason>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_eval_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_eval_duration: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eval_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eval_duration: Option<Duration>,
}

/// One input to the model: a token or an injected image embedding.
#[derive(Debug, Clone)]
pub struct Input {
    pub token: TokenId,

    /// Inline multimodal embedding instead of a token id.
    pub embed: Option<Vec<f32>>,

    /// Number of following inputs that must land in the same batch (image
    /// token runs travel whole).
    pub same_batch: usize,
}

impl Input {
    pub fn token(token: TokenId) -> Self {
        Self {
            token,
            embed: None,
            same_batch: 0,
        }
    }
}

/// Pre-processed image payload referenced by `[img-N]` markers.
#[derive(Debug, Clone)]
pub enum ImagePayload {
    /// Vision models that pre-tokenize: an expanded token run.
    Tokens(Vec<TokenId>),
    /// Models that inject projector embeddings directly.
    Embedding(Vec<f32>),
}

#[derive(Debug, Clone)]
pub struct ImageInput {
    pub id: usize,
    pub payload: ImagePayload,
}

/// Admission-time parameters.
#[derive(Debug, Clone)]
pub struct SequenceParams {
    pub num_predict: Option<usize>,
    pub num_keep: usize,
    pub stop: Vec<String>,
    pub truncate: bool,
    pub shift: bool,
    /// Top-k logprobs per emitted token; zero disables.
    pub logprobs: usize,
    pub embedding_only: bool,
    pub sampling: SamplerConfig,
    pub grammar: Option<String>,
}

impl Default for SequenceParams {
    fn default() -> Self {
        Self {
            num_predict: None,
            num_keep: 0,
            stop: Vec::new(),
            truncate: true,
            shift: true,
            logprobs: 0,
            embedding_only: false,
            sampling: SamplerConfig::default(),
            grammar: None,
        }
    }
}

#[derive(Debug, Default)]
struct Piece {
    bytes: Vec<u8>,
    logprob: Option<TokenLogprob>,
}

/// Timing counters reported in the final frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct Timings {
    pub prompt_eval_count: usize,
    pub prompt_eval_duration: Duration,
    pub eval_count: usize,
    pub eval_duration: Duration,
}

/// What `drain` decided to do with the pending pieces.
#[derive(Debug)]
pub enum Drain {
    /// Possible stop-string prefix or mid-rune boundary: emit nothing yet.
    Hold,
    /// Safe content to stream.
    Emit {
        content: String,
        logprobs: Vec<TokenLogprob>,
    },
    /// A stop string matched. `trimmed_tokens` is how many cache tokens to
    /// drop so the history ends where the client-visible output does.
    Stopped {
        content: String,
        logprobs: Vec<TokenLogprob>,
        trimmed_tokens: usize,
    },
}

pub struct Sequence {
    /// Prompt/replay inputs not yet forwarded.
    pub inputs: VecDeque<Input>,

    /// Inputs in the current batch, awaiting cache commit.
    pub pending_inputs: Vec<Input>,

    pending: Vec<Piece>,

    pub responses: mpsc::Sender<CompletionFrame>,
    pub embedding_tx: Option<oneshot::Sender<Vec<f32>>>,

    /// Set when the client goes away.
    pub quit: Arc<AtomicBool>,

    pub cache_slot: Option<usize>,
    pub sampler: Sampler,

    pub stop: Vec<String>,
    pub num_keep: usize,
    pub num_predict: Option<usize>,
    pub logprobs: usize,
    pub shift: bool,
    pub embedding_only: bool,

    /// Tokens sampled so far.
    pub predicted: usize,

    /// Client-visible text, tracked for grammar constraints.
    pub emitted: String,

    pub timings: Timings,
    pub done_reason: Option<DoneReason>,

    /// Row in the current batch's output tensor holding this sequence's
    /// logits.
    pub last_batch_index: Option<usize>,
}

impl Sequence {
    /// Tokenize and admit-check a prompt. Returns the sequence plus the
    /// receiver ends of its channels.
    pub fn new(
        prompt: &str,
        images: &[ImageInput],
        params: SequenceParams,
        vocab: &Vocabulary,
        num_ctx: usize,
    ) -> Result<
        (
            Self,
            mpsc::Receiver<CompletionFrame>,
            oneshot::Receiver<Vec<f32>>,
        ),
        SchedulerError,
    > {
        let grammar = params
            .grammar
            .as_deref()
            .map(Grammar::compile)
            .transpose()?;

        let mut inputs = build_inputs(prompt, images, vocab)?;

        if inputs.len() > num_ctx {
            if !params.truncate {
                return Err(SchedulerError::InputTooLong {
                    tokens: inputs.len(),
                    context: num_ctx,
                });
            }
            let before = inputs.len();
            inputs = truncate_prompt(inputs, num_ctx, params.num_keep);
            debug!(before, after = inputs.len(), "truncated prompt");
        }

        let (tx, rx) = mpsc::channel(RESPONSE_BUFFER);
        let (etx, erx) = oneshot::channel();

        let seq = Self {
            inputs: inputs.into(),
            pending_inputs: Vec::new(),
            pending: Vec::new(),
            responses: tx,
            embedding_tx: Some(etx),
            quit: Arc::new(AtomicBool::new(false)),
            cache_slot: None,
            sampler: Sampler::new(params.sampling.clone(), grammar),
            stop: params.stop,
            num_keep: params.num_keep,
            num_predict: params.num_predict,
            logprobs: params.logprobs,
            shift: params.shift,
            embedding_only: params.embedding_only,
            predicted: 0,
            emitted: String::new(),
            timings: Timings::default(),
            done_reason: None,
            last_batch_index: None,
        };
        Ok((seq, rx, erx))
    }

    /// All token ids in the remaining input queue, for cache prefix
    /// matching.
    pub fn input_tokens(&self) -> Vec<TokenId> {
        self.inputs.iter().map(|i| i.token).collect()
    }

    pub fn client_gone(&self) -> bool {
        self.quit.load(Ordering::Relaxed) || self.responses.is_closed()
    }

    /// Queue one decoded piece.
    pub fn push_piece(&mut self, bytes: Vec<u8>, logprob: Option<TokenLogprob>) {
        self.pending.push(Piece { bytes, logprob });
    }

    /// Decide what of the pending pieces can be released.
    ///
    /// With `finalize`, held stop prefixes flush (they turned out not to
    /// be stops) and a trailing partial rune is dropped so the client
    /// never sees invalid UTF-8.
    pub fn drain(&mut self, finalize: bool) -> Drain {
        let total: Vec<u8> = self.pending.iter().flat_map(|p| p.bytes.clone()).collect();
        let valid_len = match std::str::from_utf8(&total) {
            Ok(_) => total.len(),
            Err(e) => e.valid_up_to(),
        };
        let text = std::str::from_utf8(&total[..valid_len]).unwrap_or("");

        if let Some(cut) = find_stop(text, &self.stop) {
            let (content, logprobs, trimmed) = self.split_at_stop(cut);
            self.pending.clear();
            self.emitted.push_str(&content);
            return Drain::Stopped {
                content,
                logprobs,
                trimmed_tokens: trimmed,
            };
        }

        if !finalize && contains_stop_suffix(text, &self.stop) {
            return Drain::Hold;
        }
        if !finalize && valid_len == 0 {
            return Drain::Hold;
        }

        let content = text.to_string();
        let logprobs: Vec<TokenLogprob> =
            self.pending.iter_mut().filter_map(|p| p.logprob.take()).collect();

        // Bytes past the valid prefix carry over to the next drain.
        let tail = total[valid_len..].to_vec();
        self.pending.clear();
        if !finalize && !tail.is_empty() {
            self.pending.push(Piece {
                bytes: tail,
                logprob: None,
            });
        }

        self.emitted.push_str(&content);
        Drain::Emit { content, logprobs }
    }

    /// Cut pending pieces at a stop match. Pieces wholly past the cut are
    /// trimmed (and counted for cache truncation); the straddling piece
    /// keeps only its prefix. Logprobs track kept pieces exactly.
    fn split_at_stop(&mut self, cut: usize) -> (String, Vec<TokenLogprob>, usize) {
        let mut content = Vec::with_capacity(cut);
        let mut logprobs = Vec::new();
        let mut trimmed = 0usize;
        let mut offset = 0usize;

        for piece in &mut self.pending {
            let start = offset;
            offset += piece.bytes.len();
            if start >= cut {
                trimmed += 1;
                continue;
            }
            let keep = (cut - start).min(piece.bytes.len());
            content.extend_from_slice(&piece.bytes[..keep]);
            if let Some(lp) = piece.logprob.take() {
                logprobs.push(lp);
            }
        }

        // The cut landed inside validated text, so this cannot fail.
        let content = String::from_utf8(content).unwrap_or_default();
        (content, logprobs, trimmed)
    }

    /// The final frame for a finished sequence.
    pub fn final_frame(&self, reason: DoneReason) -> CompletionFrame {
        CompletionFrame {
            done: true,
            done_reason: Some(reason),
            prompt_eval_count: Some(self.timings.prompt_eval_count),
            prompt_eval_duration: Some(self.timings.prompt_eval_duration),
            eval_count: Some(self.timings.eval_count),
            eval_duration: Some(self.timings.eval_duration),
            ..Default::default()
        }
    }
}

/// Earliest byte index where any stop string matches.
pub fn find_stop(text: &str, stops: &[String]) -> Option<usize> {
    stops.iter().filter_map(|s| text.find(s.as_str())).min()
}

/// True when the text ends with a proper prefix of any stop string: more
/// bytes could complete the stop, so emission must hold.
pub fn contains_stop_suffix(text: &str, stops: &[String]) -> bool {
    stops.iter().any(|stop| {
        (1..stop.len()).any(|n| {
            stop.get(..n)
                .is_some_and(|prefix| text.ends_with(prefix))
        })
    })
}

/// Expand a prompt with `[img-N]` markers into model inputs.
fn build_inputs(
    prompt: &str,
    images: &[ImageInput],
    vocab: &Vocabulary,
) -> Result<Vec<Input>, SchedulerError> {
    let mut inputs = Vec::new();
    let mut rest = prompt;
    let mut first_segment = true;

    while let Some(open) = rest.find("[img-") {
        let (text, marker_on) = rest.split_at(open);
        let close = marker_on
            .find(']')
            .ok_or_else(|| SchedulerError::BadImageMarker(marker_on.to_string()))?;
        let id: usize = marker_on[5..close]
            .parse()
            .map_err(|_| SchedulerError::BadImageMarker(marker_on[..=close].to_string()))?;

        push_text(&mut inputs, text, vocab, first_segment);
        first_segment = false;

        let image = images
            .iter()
            .find(|i| i.id == id)
            .ok_or(SchedulerError::UnknownImage(id))?;
        match &image.payload {
            ImagePayload::Tokens(tokens) => {
                // The run travels whole: the first input declares how many
                // follow.
                for (i, &t) in tokens.iter().enumerate() {
                    inputs.push(Input {
                        token: t,
                        embed: None,
                        same_batch: if i == 0 { tokens.len() - 1 } else { 0 },
                    });
                }
            }
            ImagePayload::Embedding(v) => inputs.push(Input {
                token: -1,
                embed: Some(v.clone()),
                same_batch: 0,
            }),
        }
        rest = &marker_on[close + 1..];
    }
    push_text(&mut inputs, rest, vocab, first_segment);
    Ok(inputs)
}

fn push_text(inputs: &mut Vec<Input>, text: &str, vocab: &Vocabulary, add_bos: bool) {
    if text.is_empty() && !add_bos {
        return;
    }
    inputs.extend(vocab.encode(text, add_bos).into_iter().map(Input::token));
}

/// Keep the first `num_keep` inputs plus the largest tail that fits in
/// `num_ctx`, moving the cut forward so a SameBatch group is never split.
fn truncate_prompt(inputs: Vec<Input>, num_ctx: usize, num_keep: usize) -> Vec<Input> {
    if inputs.len() <= num_ctx {
        return inputs;
    }
    let keep = num_keep.min(num_ctx.saturating_sub(1));
    let mut cut = inputs.len() - (num_ctx - keep);

    // A group straddling the cut is dropped whole.
    let mut i = 0;
    while i < cut {
        let group_end = i + inputs[i].same_batch;
        if group_end >= cut {
            cut = group_end + 1;
        }
        i = group_end + 1;
    }
    let cut = cut.min(inputs.len());

    let mut out = Vec::with_capacity(keep + inputs.len() - cut);
    out.extend(inputs.iter().take(keep).cloned());
    out.extend(inputs.into_iter().skip(cut));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gguf::{ArrayValue, KvMap, Value, ValueKind};

    fn vocab() -> Vocabulary {
        let tokens = ["<s>", "</s>", "a", "b", "c", "d", " "];
        let mut kv = KvMap::new();
        kv.insert("general.architecture", Value::String("llama".into()));
        kv.insert("tokenizer.ggml.model", Value::String("gpt2".into()));
        kv.insert(
            "tokenizer.ggml.tokens",
            Value::Array(ArrayValue {
                kind: ValueKind::String,
                len: tokens.len() as u64,
                values: tokens.iter().map(|t| Value::String(t.to_string())).collect(),
            }),
        );
        Vocabulary::from_kv(&kv).unwrap()
    }

    fn seq(stops: &[&str]) -> Sequence {
        let params = SequenceParams {
            stop: stops.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        };
        let (seq, _rx, _erx) = Sequence::new("ab", &[], params, &vocab(), 64).unwrap();
        seq
    }

    #[test]
    fn test_stop_across_chunks() {
        let mut s = seq(&["world"]);
        s.push_piece(b"Hello".to_vec(), None);

        // "Hello worl" ends in a stop prefix: hold.
        s.push_piece(b" worl".to_vec(), None);
        assert!(matches!(s.drain(false), Drain::Hold));

        // "d</s>" completes the stop.
        s.push_piece(b"d</s>".to_vec(), None);
        match s.drain(false) {
            Drain::Stopped {
                content,
                trimmed_tokens,
                ..
            } => {
                assert_eq!(content, "Hello ");
                // Only the piece wholly past the match boundary trims.
                assert_eq!(trimmed_tokens, 1);
            }
            other => panic!("expected Stopped, got {other:?}"),
        }
    }

    #[test]
    fn test_utf8_boundary_held() {
        let mut s = seq(&[]);
        // "é" is 0xC3 0xA9; split it across pieces.
        s.push_piece(vec![b'o', b'k', 0xC3], None);
        match s.drain(false) {
            Drain::Emit { content, .. } => assert_eq!(content, "ok"),
            other => panic!("expected Emit, got {other:?}"),
        }
        s.push_piece(vec![0xA9], None);
        match s.drain(false) {
            Drain::Emit { content, .. } => assert_eq!(content, "é"),
            other => panic!("expected Emit, got {other:?}"),
        }
    }

    #[test]
    fn test_final_flush_drops_invalid_tail() {
        let mut s = seq(&[]);
        s.push_piece(vec![b'h', b'i', 0xC3], None);
        match s.drain(true) {
            Drain::Emit { content, .. } => assert_eq!(content, "hi"),
            other => panic!("expected Emit, got {other:?}"),
        }
        assert!(s.pending.is_empty());
    }

    #[test]
    fn test_logprobs_track_pieces_through_stop() {
        let lp = |t: TokenId| TokenLogprob {
            token: t,
            logprob: -0.5,
            top: Vec::new(),
        };
        let mut s = seq(&["XY"]);
        s.push_piece(b"aa".to_vec(), Some(lp(0)));
        s.push_piece(b"X".to_vec(), Some(lp(1)));
        s.push_piece(b"Y".to_vec(), Some(lp(2)));
        s.push_piece(b"zz".to_vec(), Some(lp(3)));
        match s.drain(false) {
            Drain::Stopped {
                content,
                logprobs,
                trimmed_tokens,
            } => {
                assert_eq!(content, "aa");
                // One logprob per piece that contributed content.
                assert_eq!(logprobs.len(), 1);
                assert_eq!(trimmed_tokens, 3);
            }
            other => panic!("expected Stopped, got {other:?}"),
        }
    }

    #[test]
    fn test_prompt_truncation_protected_prefix() {
        let inputs: Vec<Input> = (0..10_000).map(Input::token).collect();
        let out = truncate_prompt(inputs, 4096, 100);
        assert_eq!(out.len(), 4096);
        assert_eq!(out[99].token, 99);
        assert_eq!(out[100].token, 6004);
        assert_eq!(out.last().unwrap().token, 9999);
    }

    #[test]
    fn test_truncation_drops_straddling_group_whole() {
        let mut inputs: Vec<Input> = (0..100).map(Input::token).collect();
        // Group of 10 starting at index 45.
        inputs[45].same_batch = 9;
        let out = truncate_prompt(inputs, 60, 10);
        // Cut would land at 50, inside the group: the whole group goes.
        assert_eq!(out[10].token, 55);
        assert!(out.iter().all(|i| i.token < 45 || i.token >= 55));
    }

    #[test]
    fn test_input_too_long_rejected() {
        let params = SequenceParams {
            truncate: false,
            ..Default::default()
        };
        let long: String = "ab".repeat(100);
        match Sequence::new(&long, &[], params, &vocab(), 16) {
            Err(SchedulerError::InputTooLong { .. }) => {}
            other => panic!("expected InputTooLong, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn test_image_marker_expansion() {
        let images = [ImageInput {
            id: 0,
            payload: ImagePayload::Tokens(vec![10, 11, 12]),
        }];
        let inputs = build_inputs("a[img-0]b", &images, &vocab()).unwrap();
        let tokens: Vec<TokenId> = inputs.iter().map(|i| i.token).collect();
        assert_eq!(tokens, vec![2, 10, 11, 12, 3]);
        assert_eq!(inputs[1].same_batch, 2);
        assert_eq!(inputs[2].same_batch, 0);
    }

    #[test]
    fn test_unknown_image_rejected() {
        match build_inputs("[img-3]", &[], &vocab()) {
            Err(SchedulerError::UnknownImage(3)) => {}
            other => panic!("expected UnknownImage, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn test_grammar_compile_failure_at_admission() {
        let params = SequenceParams {
            grammar: Some("root \"broken\"".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            Sequence::new("a", &[], params, &vocab(), 64),
            Err(SchedulerError::Grammar(_))
        ));
    }
}
