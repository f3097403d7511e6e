//! Model-level views over a decoded GGUF container.
//!
//! - [`metadata`]: architecture parameters and the layer-group index
//! - [`schema`]: declarative tensor-name resolution
//! - [`vocab`]: the tokenizer built from `tokenizer.ggml.*` metadata

pub mod metadata;
pub mod schema;
pub mod vocab;

pub use metadata::{LayerKind, ModelMetadata};
pub use schema::TensorSpec;
pub use vocab::Vocabulary;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("unsupported architecture {0:?}")]
    UnsupportedArchitecture(String),

    #[error("model is missing required key {0:?}")]
    MissingKey(String),

    #[error("model is missing repeating block {0}")]
    MissingLayer(usize),

    #[error("unsupported tokenizer pre-processor pattern {0:?}")]
    UnsupportedTokenizer(String),

    #[error("no tensor found for {0:?}")]
    MissingTensor(String),
}
