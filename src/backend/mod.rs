//! The compute seam.
//!
//! Tensor math lives outside this crate. The scheduler hands a backend the
//! gathered batch inputs, the backend builds and executes the forward
//! graph, and logits come back row-major. The bundled [`StubBackend`] is
//! deterministic and exists so the scheduler, server, and tests run
//! without an accelerator library linked.

use crate::model::vocab::TokenId;

/// Everything the model consumes for one forward pass. Parallel vectors,
/// one entry per batch row.
#[derive(Debug, Clone, Default)]
pub struct BatchInputs {
    /// Token ids (-1 for rows fed by an embedding).
    pub tokens: Vec<TokenId>,

    /// Position of each row within its sequence.
    pub positions: Vec<usize>,

    /// Cache sequence id of each row, for attention masking.
    pub sequences: Vec<usize>,

    /// Inline multimodal embeddings.
    pub embeddings: Vec<Option<Vec<f32>>>,

    /// Rows whose logits will be read, in output order.
    pub outputs: Vec<usize>,

    /// Additive attention mask from the cache, rows × cache positions.
    pub mask: Vec<half::f16>,
}

impl BatchInputs {
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn push(
        &mut self,
        token: TokenId,
        position: usize,
        sequence: usize,
        embedding: Option<Vec<f32>>,
    ) {
        self.tokens.push(token);
        self.positions.push(position);
        self.sequences.push(sequence);
        self.embeddings.push(embedding);
    }
}

/// A built forward graph, ready to execute. Construction happens on the
/// next batch's context while the previous batch computes.
#[derive(Debug)]
pub struct Graph {
    pub id: u64,
    pub inputs: BatchInputs,
}

/// The model execution interface.
///
/// `compute` blocks for the duration of the forward pass and fires
/// `started` once compute is underway; from that point the caller may
/// mutate scheduling state that graph construction depends on.
pub trait Backend: Send + Sync + 'static {
    fn vocab_size(&self) -> usize;

    fn build_graph(&self, inputs: BatchInputs, id: u64) -> Graph {
        Graph { id, inputs }
    }

    /// Execute; returns logits, `graph.inputs.outputs.len() × vocab_size`
    /// row-major.
    fn compute(&self, graph: &Graph, started: &dyn Fn()) -> Vec<f32>;

    /// Pooled output vector for embedding models.
    fn embeddings(&self, _graph: &Graph) -> Vec<f32> {
        Vec::new()
    }
}

/// Deterministic backend: the "model" always predicts token `t + 1` after
/// token `t`. Output shape and signal ordering are faithful; the math is
/// not.
pub struct StubBackend {
    vocab: usize,
}

impl StubBackend {
    pub fn new(vocab: usize) -> Self {
        Self { vocab }
    }
}

impl Backend for StubBackend {
    fn vocab_size(&self) -> usize {
        self.vocab
    }

    fn compute(&self, graph: &Graph, started: &dyn Fn()) -> Vec<f32> {
        started();
        let mut logits = vec![0.0f32; graph.inputs.outputs.len() * self.vocab];
        for (row, &input_row) in graph.inputs.outputs.iter().enumerate() {
            let last = graph.inputs.tokens[input_row].max(0) as usize;
            let next = (last + 1) % self.vocab;
            logits[row * self.vocab + next] = 10.0;
        }
        logits
    }

    fn embeddings(&self, graph: &Graph) -> Vec<f32> {
        // Mean token id, padded to a small fixed width.
        let n = graph.inputs.tokens.len().max(1) as f32;
        let mean = graph.inputs.tokens.iter().map(|&t| t.max(0) as f32).sum::<f32>() / n;
        vec![mean; 8]
    }
}
