//! The batch driver.
//!
//! One background task alternates between building the *next* batch's
//! graph and computing the *previous* batch, a pipeline of depth two. The
//! stages handshake over three latches per batch: `inputs_ready` (the
//! previous batch's outputs exist, this batch's inputs may be read),
//! `compute_started` (the sequence table may be mutated again), and
//! `outputs_ready` (logits are materialized). Pooled (embedding) models
//! compute inline; everything else computes concurrently with the next
//! batch's construction.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::sampler::Sampler;
use super::sequence::{CompletionFrame, DoneReason, Drain, Input, Sequence, TokenLogprob};
use super::signal::{signal, signalled, Signal, SignalWaiter};
use super::SchedulerError;
use crate::backend::{Backend, BatchInputs, Graph};
use crate::cache::{CacheError, ModelCache};
use crate::model::vocab::{TokenId, Vocabulary};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Concurrent sequence slots.
    pub parallel: usize,

    /// Logical batch size in tokens.
    pub batch_size: usize,

    /// Per-sequence context length.
    pub num_ctx: usize,

    /// Pooled (embedding) models compute inline instead of pipelining.
    pub pooled: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            parallel: 1,
            batch_size: 512,
            num_ctx: 2048,
            pooled: false,
        }
    }
}

struct Entry {
    cell: Arc<StdMutex<Sequence>>,
    _permit: OwnedSemaphorePermit,
}

struct Inner {
    seqs: Vec<Option<Entry>>,
    cache: ModelCache,
    next_seq: usize,
    resume_seq: Option<usize>,
}

/// A sequence participating in a batch, pinned by identity so a replaced
/// slot is never mistaken for the original.
struct BatchSeq {
    idx: usize,
    cell: Arc<StdMutex<Sequence>>,
}

/// Snapshot of one in-flight batch.
pub struct BatchState {
    pub id: u64,
    graph: Graph,
    refs: Vec<BatchSeq>,

    inputs_ready: SignalWaiter,
    compute_started: Signal,
    compute_started_waiter: SignalWaiter,
    outputs_ready: Signal,
    outputs_ready_waiter: SignalWaiter,
}

pub struct Scheduler {
    backend: Arc<dyn Backend>,
    vocab: Arc<Vocabulary>,
    config: SchedulerConfig,

    inner: Mutex<Inner>,
    nonempty: Notify,
    admission: Arc<Semaphore>,

    /// Serializes backend compute; never more than one forward in flight.
    compute_lock: Mutex<()>,
    batch_counter: AtomicU64,
}

impl Scheduler {
    pub fn new(
        backend: Arc<dyn Backend>,
        vocab: Arc<Vocabulary>,
        config: SchedulerConfig,
        cache: ModelCache,
    ) -> Arc<Self> {
        let parallel = config.parallel.max(1);
        Arc::new(Self {
            backend,
            vocab,
            inner: Mutex::new(Inner {
                seqs: (0..parallel).map(|_| None).collect(),
                cache,
                next_seq: 0,
                resume_seq: None,
            }),
            nonempty: Notify::new(),
            admission: Arc::new(Semaphore::new(parallel)),
            compute_lock: Mutex::new(()),
            batch_counter: AtomicU64::new(0),
            config,
        })
    }

    /// Spawn the driver loop.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let sched = self.clone();
        tokio::spawn(async move { sched.run().await })
    }

    async fn run(self: Arc<Self>) {
        let mut prev: Option<Arc<BatchState>> = None;
        loop {
            eprintln!("DBG run: forward_batch start");
            let batch = Arc::new(self.forward_batch(prev.as_deref()).await);
            eprintln!("DBG run: forward_batch done, refs={}", batch.refs.len());
            if self.config.pooled {
                self.compute_batch(&batch).await;
            } else {
                let sched = self.clone();
                let running = batch.clone();
                tokio::spawn(async move {
                    eprintln!("DBG compute_batch spawn start");
                    sched.compute_batch(&running).await;
                    eprintln!("DBG compute_batch spawn done");
                });
            }
            prev = Some(batch);
        }
    }

    /// Admit a new sequence: take a slot permit, claim the first empty
    /// table position, and bind a cache slot (reusing any cached prefix).
    pub async fn admit(&self, mut seq: Sequence) -> Result<(), SchedulerError> {
        let permit = self
            .admission
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SchedulerError::Shutdown)?;

        let mut inner = self.inner.lock().await;
        let idx = inner
            .seqs
            .iter()
            .position(Option::is_none)
            .ok_or(SchedulerError::NoFreeSlot)?;

        let tokens = seq.input_tokens();
        let (slot, remaining) = inner.cache.load_slot(&tokens)?;
        let reused = tokens.len() - remaining.len();
        for _ in 0..reused {
            seq.inputs.pop_front();
        }
        // The model needs at least one input to produce logits; when the
        // whole prompt was cached, replay its last token.
        if seq.inputs.is_empty() && reused > 0 {
            let last = tokens[reused - 1];
            inner.cache.truncate(slot, reused - 1)?;
            seq.inputs.push_back(Input::token(last));
        }
        seq.cache_slot = Some(slot);
        if seq.predicted == 0 {
            seq.timings.prompt_eval_count += reused.saturating_sub(1);
        }

        debug!(slot, reused, remaining = seq.inputs.len(), "admitted sequence");
        inner.seqs[idx] = Some(Entry {
            cell: Arc::new(StdMutex::new(seq)),
            _permit: permit,
        });
        // notify_one stores a permit, so an admission that lands between
        // the driver's emptiness check and its wait is never lost.
        self.nonempty.notify_one();
        Ok(())
    }

    /// Build the next batch.
    async fn forward_batch(&self, prev: Option<&BatchState>) -> BatchState {
        // The previous batch owns the sequence table until its compute has
        // started.
        if let Some(p) = prev {
            let mut started = p.compute_started_waiter.clone();
            started.wait().await;
        }
        let inputs_ready = prev
            .map(|p| p.outputs_ready_waiter.clone())
            .unwrap_or_else(signalled);

        loop {
            // Block until the table is non-empty.
            loop {
                {
                    let inner = self.inner.lock().await;
                    if inner.seqs.iter().any(Option::is_some) {
                        break;
                    }
                }
                self.nonempty.notified().await;
            }

            let mut inner = self.inner.lock().await;
            let mut bi = BatchInputs::default();
            let mut mask_rows: Vec<(usize, usize)> = Vec::new();
            let mut refs: Vec<BatchSeq> = Vec::new();
            let mut evictions: Vec<(usize, DoneReason)> = Vec::new();

            let parallel = inner.seqs.len();
            let start = inner.resume_seq.take().unwrap_or(inner.next_seq);
            inner.next_seq = (start + 1) % parallel;

            let inner_ref = &mut *inner;
            'seqs: for k in 0..parallel {
                let idx = (start + k) % parallel;
                let Some(entry) = inner_ref.seqs[idx].as_ref() else {
                    continue;
                };
                let cell = entry.cell.clone();
                let mut seq = cell.lock().unwrap();

                if seq.num_predict.is_some_and(|n| seq.predicted >= n) {
                    evictions.push((idx, DoneReason::Length));
                    continue;
                }
                if seq.client_gone() {
                    evictions.push((idx, DoneReason::ConnectionClosed));
                    continue;
                }
                let Some(slot) = seq.cache_slot else { continue };
                seq.last_batch_index = None;

                while let Some(front) = seq.inputs.front() {
                    let group = 1 + front.same_batch;
                    // An image run may exceed the configured batch size;
                    // it still travels whole.
                    let effective = self.config.batch_size.max(group);
                    if bi.len() + group > effective {
                        inner_ref.resume_seq = Some(idx);
                        break;
                    }

                    let needed = seq.pending_inputs.len() + group + 1;
                    if !inner_ref.cache.can_accept(slot, needed) {
                        if !seq.shift {
                            evictions.push((idx, DoneReason::Length));
                            continue 'seqs;
                        }
                        match inner_ref.cache.shift(slot, seq.num_keep) {
                            Ok(()) => continue,
                            Err(CacheError::Reprocess { inputs }) => {
                                // Re-feed the surviving history, then sit
                                // this batch out.
                                for t in inputs.into_iter().rev() {
                                    seq.inputs.push_front(Input::token(t));
                                }
                                seq.pending_inputs.clear();
                                continue 'seqs;
                            }
                            Err(e) => {
                                warn!(slot, "cache shift failed: {e}");
                                evictions.push((idx, DoneReason::Length));
                                continue 'seqs;
                            }
                        }
                    }

                    for _ in 0..group {
                        let input = seq.inputs.pop_front().expect("group counted");
                        let committed = inner_ref.cache.slot(slot).expect("bound slot").inputs.len();
                        let pos = committed + seq.pending_inputs.len();
                        bi.push(input.token, pos, slot, input.embed.clone());
                        mask_rows.push((slot, pos));
                        seq.pending_inputs.push(input);
                    }
                }

                // The sequence samples this batch only if its whole input
                // queue made it in.
                if seq.inputs.is_empty() && !seq.pending_inputs.is_empty() {
                    bi.outputs.push(bi.len() - 1);
                    seq.last_batch_index = Some(bi.outputs.len() - 1);
                }
                if !seq.pending_inputs.is_empty() {
                    refs.push(BatchSeq { idx, cell: cell.clone() });
                }
                if inner_ref.resume_seq.is_some() {
                    break 'seqs;
                }
            }

            for (idx, reason) in evictions {
                self.finish(&mut inner, idx, reason).await;
            }

            if bi.is_empty() {
                drop(inner);
                tokio::time::sleep(Duration::from_millis(2)).await;
                continue;
            }

            bi.mask = inner.cache.start_forward(&mask_rows, false);
            let id = self.batch_counter.fetch_add(1, Ordering::SeqCst);
            let graph = self.backend.build_graph(bi, id);

            let (compute_started, compute_started_waiter) = signal();
            let (outputs_ready, outputs_ready_waiter) = signal();
            debug!(batch = id, rows = graph.inputs.tokens.len(), "built batch");
            return BatchState {
                id,
                graph,
                refs,
                inputs_ready,
                compute_started,
                compute_started_waiter,
                outputs_ready,
                outputs_ready_waiter,
            };
        }
    }

    /// Execute one batch and feed its outputs back into the sequences.
    async fn compute_batch(&self, batch: &BatchState) {
        let mut ready = batch.inputs_ready.clone();
        ready.wait().await;

        // Move in-flight inputs into cache history for every sequence
        // still present and still the same object.
        {
            let mut inner = self.inner.lock().await;
            let inner_ref = &mut *inner;
            for bs in &batch.refs {
                let Some(entry) = inner_ref.seqs[bs.idx].as_ref() else {
                    continue;
                };
                if !Arc::ptr_eq(&entry.cell, &bs.cell) {
                    continue;
                }
                let mut seq = bs.cell.lock().unwrap();
                let Some(slot) = seq.cache_slot else { continue };
                let tokens: Vec<TokenId> =
                    seq.pending_inputs.iter().map(|i| i.token).collect();
                if let Err(e) = inner_ref.cache.commit(slot, &tokens) {
                    warn!(slot, "cache commit failed: {e}");
                }
                if seq.predicted == 0 {
                    seq.timings.prompt_eval_count += tokens.len();
                }
                seq.pending_inputs.clear();
            }
        }

        // Run the forward pass; the sequence table unblocks at `started`.
        let started = batch.compute_started.clone();
        let t0 = Instant::now();
        let (logits, pooled) = {
            let _serial = self.compute_lock.lock().await;
            let logits = self.backend.compute(&batch.graph, &|| started.set());
            let pooled = if self.config.pooled {
                self.backend.embeddings(&batch.graph)
            } else {
                Vec::new()
            };
            (logits, pooled)
        };
        batch.compute_started.set();
        let elapsed = t0.elapsed();

        // What to do once the sequence's mutex guard (not `Send`) has been
        // released. Everything needed for the post-lock async steps is
        // copied out into this enum so the guard's scope can end before
        // any `.await`.
        enum StepOutcome {
            NoRow,
            Embedding {
                tx: Option<tokio::sync::oneshot::Sender<Vec<f32>>>,
            },
            Eos,
            Hold,
            Emit {
                frame: CompletionFrame,
                tx: mpsc::Sender<CompletionFrame>,
            },
            Stopped {
                frame: Option<CompletionFrame>,
                tx: mpsc::Sender<CompletionFrame>,
                slot: usize,
                trimmed_tokens: usize,
            },
        }

        let vocab_size = self.backend.vocab_size();
        let mut inner = self.inner.lock().await;
        for bs in &batch.refs {
            let present = matches!(
                inner.seqs[bs.idx].as_ref(),
                Some(entry) if Arc::ptr_eq(&entry.cell, &bs.cell)
            );
            if !present {
                continue;
            }

            let outcome = {
                let mut seq = bs.cell.lock().unwrap();
                if let Some(row) = seq.last_batch_index {
                    if seq.predicted == 0 {
                        seq.timings.prompt_eval_duration += elapsed;
                    } else {
                        seq.timings.eval_duration += elapsed;
                    }

                    if seq.embedding_only {
                        StepOutcome::Embedding {
                            tx: seq.embedding_tx.take(),
                        }
                    } else {
                        let row_logits = &logits[row * vocab_size..(row + 1) * vocab_size];

                        let emitted = seq.emitted.clone();
                        let grammar = seq.sampler.grammar.clone();
                        let vocab = self.vocab.clone();
                        let token = seq.sampler.sample(row_logits, |id| match &grammar {
                            Some(g) => {
                                let piece = String::from_utf8_lossy(&vocab.decode(id)).into_owned();
                                g.allows(&emitted, &piece)
                            }
                            None => true,
                        });
                        seq.predicted += 1;
                        seq.timings.eval_count += 1;

                        if self.vocab.is_eos(token) {
                            StepOutcome::Eos
                        } else {
                            let logprob = (seq.logprobs > 0).then(|| TokenLogprob {
                                token,
                                logprob: Sampler::logprob_of(row_logits, token),
                                top: Sampler::top_logprobs(row_logits, seq.logprobs),
                            });
                            seq.push_piece(self.vocab.decode(token), logprob);
                            seq.inputs.push_back(Input::token(token));

                            match seq.drain(false) {
                                Drain::Hold => StepOutcome::Hold,
                                Drain::Emit { content, logprobs } => StepOutcome::Emit {
                                    frame: CompletionFrame {
                                        content,
                                        logprobs: (!logprobs.is_empty()).then_some(logprobs),
                                        ..Default::default()
                                    },
                                    tx: seq.responses.clone(),
                                },
                                Drain::Stopped {
                                    content,
                                    logprobs,
                                    trimmed_tokens,
                                } => StepOutcome::Stopped {
                                    frame: (!content.is_empty()).then(|| CompletionFrame {
                                        content,
                                        logprobs: (!logprobs.is_empty()).then_some(logprobs),
                                        ..Default::default()
                                    }),
                                    tx: seq.responses.clone(),
                                    slot: seq.cache_slot.expect("bound slot"),
                                    trimmed_tokens,
                                },
                            }
                        }
                    }
                } else {
                    StepOutcome::NoRow
                }
            };

            match outcome {
                StepOutcome::NoRow => continue,
                StepOutcome::Embedding { tx } => {
                    if let Some(tx) = tx {
                        let _ = tx.send(pooled.clone());
                    }
                    self.finish(&mut inner, bs.idx, DoneReason::Stop).await;
                }
                StepOutcome::Eos => {
                    self.finish(&mut inner, bs.idx, DoneReason::Stop).await;
                }
                StepOutcome::Hold => {}
                StepOutcome::Emit { frame, tx } => {
                    if !send_frame(&tx, frame).await {
                        self.finish(&mut inner, bs.idx, DoneReason::ConnectionClosed)
                            .await;
                    }
                }
                StepOutcome::Stopped {
                    frame,
                    tx,
                    slot,
                    trimmed_tokens,
                } => {
                    // The history ends where the client-visible output
                    // does; the trailing sampled token was never
                    // committed.
                    let len = inner.cache.slot(slot).map(|s| s.inputs.len()).unwrap_or(0);
                    let _ = inner.cache.truncate(slot, len.saturating_sub(trimmed_tokens));
                    if let Some(frame) = frame {
                        let _ = send_frame(&tx, frame).await;
                    }
                    self.finish(&mut inner, bs.idx, DoneReason::Stop).await;
                }
            }
        }

        batch.outputs_ready.set();
    }

    /// Remove a sequence: flush what remains, emit the final frame, free
    /// the cache slot. Channels close before the slot can be reused.
    async fn finish(&self, inner: &mut Inner, idx: usize, reason: DoneReason) {
        let Some(entry) = inner.seqs[idx].take() else {
            return;
        };
        let (frames, tx, slot) = {
            let mut seq = entry.cell.lock().unwrap();
            seq.done_reason = Some(reason);
            let mut frames = Vec::new();
            match seq.drain(true) {
                Drain::Emit { content, logprobs } | Drain::Stopped { content, logprobs, .. }
                    if !content.is_empty() =>
                {
                    frames.push(CompletionFrame {
                        content,
                        logprobs: (!logprobs.is_empty()).then_some(logprobs),
                        ..Default::default()
                    });
                }
                _ => {}
            }
            frames.push(seq.final_frame(reason));
            (frames, seq.responses.clone(), seq.cache_slot)
        };
        if let Some(slot) = slot {
            inner.cache.free_slot(slot);
        }
        for frame in frames {
            let _ = send_frame(&tx, frame).await;
        }
        debug!(idx, ?reason, "sequence finished");
        // The permit drops with the entry, releasing the admission slot.
    }
}

/// Best-effort bounded send; a persistently full or closed channel means
/// the client lost the race.
async fn send_frame(tx: &mpsc::Sender<CompletionFrame>, frame: CompletionFrame) -> bool {
    match tx.try_send(frame) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Closed(_)) => false,
        Err(mpsc::error::TrySendError::Full(frame)) => tx
            .send_timeout(frame, Duration::from_millis(100))
            .await
            .is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StubBackend;
    use crate::cache::{CacheConfig, CausalCache, LayerType, WrapperCache};
    use crate::gguf::{ArrayValue, KvMap, Value, ValueKind};
    use crate::sched::sampler::SamplerConfig;
    use crate::sched::sequence::SequenceParams;

    /// ids: 0=<s> 1=</s> 2..=5 letters, 6=space; eos=1.
    fn vocab() -> Arc<Vocabulary> {
        let tokens = ["<s>", "</s>", "a", "b", "c", "d", " "];
        let types = [3u32, 3, 1, 1, 1, 1, 1];
        let mut kv = KvMap::new();
        kv.insert("general.architecture", Value::String("llama".into()));
        kv.insert("tokenizer.ggml.model", Value::String("gpt2".into()));
        kv.insert("tokenizer.ggml.eos_token_id", Value::U32(1));
        kv.insert(
            "tokenizer.ggml.tokens",
            Value::Array(ArrayValue {
                kind: ValueKind::String,
                len: tokens.len() as u64,
                values: tokens.iter().map(|t| Value::String(t.to_string())).collect(),
            }),
        );
        kv.insert(
            "tokenizer.ggml.token_type",
            Value::Array(ArrayValue {
                kind: ValueKind::U32,
                len: types.len() as u64,
                values: types.iter().map(|&t| Value::U32(t)).collect(),
            }),
        );
        Arc::new(Vocabulary::from_kv(&kv).unwrap())
    }

    fn scheduler_with_cache(
        parallel: usize,
        pooled: bool,
        cache: ModelCache,
    ) -> (Arc<Scheduler>, Arc<Vocabulary>) {
        let vocab = vocab();
        let backend = Arc::new(StubBackend::new(vocab.len()));
        let sched = Scheduler::new(
            backend,
            vocab.clone(),
            SchedulerConfig {
                parallel,
                batch_size: 64,
                num_ctx: 64,
                pooled,
            },
            cache,
        );
        (sched, vocab)
    }

    fn scheduler(parallel: usize, pooled: bool) -> (Arc<Scheduler>, Arc<Vocabulary>) {
        let cache = ModelCache::Causal(CausalCache::new(CacheConfig {
            num_ctx: 64,
            parallel,
            layers: 1,
            ..Default::default()
        }));
        scheduler_with_cache(parallel, pooled, cache)
    }

    fn greedy_params() -> SequenceParams {
        SequenceParams {
            sampling: SamplerConfig {
                temperature: 0.0,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    async fn collect(
        mut rx: mpsc::Receiver<CompletionFrame>,
    ) -> (String, Option<DoneReason>, Vec<CompletionFrame>) {
        let mut text = String::new();
        let mut reason = None;
        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            text.push_str(&frame.content);
            if frame.done {
                reason = frame.done_reason;
            }
            frames.push(frame);
        }
        (text, reason, frames)
    }

    #[tokio::test]
    async fn test_generates_until_num_predict() {
        let (sched, vocab) = scheduler(1, false);
        sched.start();

        // Prompt "ab" = [2, 3]; the stub then yields 4, 5, 6, 0, 1...
        let params = SequenceParams {
            num_predict: Some(3),
            ..greedy_params()
        };
        let (seq, rx, _erx) = Sequence::new("ab", &[], params, &vocab, 64).unwrap();
        sched.admit(seq).await.unwrap();

        let (text, reason, _) = collect(rx).await;
        assert_eq!(text, "cd ");
        assert_eq!(reason, Some(DoneReason::Length));
    }

    #[tokio::test]
    async fn test_eos_stops_generation() {
        let (sched, vocab) = scheduler(1, false);
        sched.start();

        // Prompt "d" = [5] → 6 (" "), 0 (<s>, empty piece), 1 = EOS.
        let (seq, rx, _erx) =
            Sequence::new("d", &[], greedy_params(), &vocab, 64).unwrap();
        sched.admit(seq).await.unwrap();

        let (text, reason, _) = collect(rx).await;
        assert_eq!(text, " ");
        assert_eq!(reason, Some(DoneReason::Stop));
    }

    #[tokio::test]
    async fn test_stop_string_truncates_stream_and_cache() {
        let (sched, vocab) = scheduler(1, false);
        sched.start();

        // "ab" → generates "c", then "d" which matches the stop.
        let params = SequenceParams {
            stop: vec!["d".to_string()],
            ..greedy_params()
        };
        let (seq, rx, _erx) = Sequence::new("ab", &[], params, &vocab, 64).unwrap();
        sched.admit(seq).await.unwrap();

        let (text, reason, _) = collect(rx).await;
        assert_eq!(text, "c");
        assert_eq!(reason, Some(DoneReason::Stop));
    }

    #[tokio::test]
    async fn test_concurrent_sequences_all_complete_in_order() {
        let (sched, vocab) = scheduler(3, false);
        sched.start();

        let mut handles = Vec::new();
        for _ in 0..3 {
            let params = SequenceParams {
                num_predict: Some(4),
                ..greedy_params()
            };
            let (seq, rx, _erx) = Sequence::new("ab", &[], params, &vocab, 64).unwrap();
            sched.admit(seq).await.unwrap();
            handles.push(tokio::spawn(collect(rx)));
        }

        for h in handles {
            let (text, reason, frames) = h.await.unwrap();
            // Identical prompts decode identically and in order; the
            // fourth sampled token is a control token with no text.
            assert_eq!(text, "cd ");
            assert_eq!(reason, Some(DoneReason::Length));
            assert!(frames.last().unwrap().done);
            assert!(frames.last().unwrap().eval_count.unwrap() >= 4);
        }
    }

    #[tokio::test]
    async fn test_wrapped_cache_streams_identically() {
        // A sliding-window model's scheduler behaves the same from the
        // client's side; only the per-layer cache routing differs.
        let config = CacheConfig {
            num_ctx: 64,
            parallel: 1,
            layers: 2,
            ..Default::default()
        };
        let types = vec![LayerType::SlidingWindow, LayerType::Global];
        let cache = ModelCache::Wrapped(WrapperCache::new(config, 8, types));
        let (sched, vocab) = scheduler_with_cache(1, false, cache);
        sched.start();

        let params = SequenceParams {
            num_predict: Some(3),
            ..greedy_params()
        };
        let (seq, rx, _erx) = Sequence::new("ab", &[], params, &vocab, 64).unwrap();
        sched.admit(seq).await.unwrap();

        let (text, reason, _) = collect(rx).await;
        assert_eq!(text, "cd ");
        assert_eq!(reason, Some(DoneReason::Length));
    }

    #[tokio::test]
    async fn test_embedding_sequence() {
        let (sched, vocab) = scheduler(1, true);
        sched.start();

        let params = SequenceParams {
            embedding_only: true,
            ..greedy_params()
        };
        let (seq, _rx, erx) = Sequence::new("ab", &[], params, &vocab, 64).unwrap();
        sched.admit(seq).await.unwrap();

        let embedding = erx.await.unwrap();
        assert_eq!(embedding.len(), 8);
    }

    #[tokio::test]
    async fn test_logprobs_accompany_pieces() {
        let (sched, vocab) = scheduler(1, false);
        sched.start();

        let params = SequenceParams {
            num_predict: Some(2),
            logprobs: 3,
            ..greedy_params()
        };
        let (seq, rx, _erx) = Sequence::new("ab", &[], params, &vocab, 64).unwrap();
        sched.admit(seq).await.unwrap();

        let (_, _, frames) = collect(rx).await;
        let emitted: usize = frames
            .iter()
            .filter(|f| !f.content.is_empty())
            .map(|f| f.logprobs.as_ref().map_or(0, Vec::len))
            .sum();
        let pieces: usize = frames.iter().filter(|f| !f.content.is_empty()).count();
        assert_eq!(emitted, pieces);
        for f in frames.iter().filter(|f| f.logprobs.is_some()) {
            for lp in f.logprobs.as_ref().unwrap() {
                assert!(lp.logprob <= 0.0);
                assert_eq!(lp.top.len(), 3);
            }
        }
    }

    #[tokio::test]
    async fn test_admission_respects_parallel_limit() {
        let (sched, vocab) = scheduler(1, false);
        // Driver intentionally not started: the first admit takes the only
        // permit, the second must block.
        let (a, _rx_a, _ea) = Sequence::new("a", &[], greedy_params(), &vocab, 64).unwrap();
        sched.admit(a).await.unwrap();

        let (b, _rx_b, _eb) = Sequence::new("b", &[], greedy_params(), &vocab, 64).unwrap();
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), sched.admit(b)).await;
        assert!(blocked.is_err());
    }
}
