//! The batch scheduler and sequence lifecycle.
//!
//! - [`sequence`]: per-request state, truncation, stop strings, UTF-8 safe
//!   streaming
//! - [`sampler`]: token sampling and grammar constraints
//! - [`signal`]: the per-batch handshake latches
//! - [`batch`]: the driver loop that pipelines graph construction against
//!   compute

pub mod batch;
pub mod sampler;
pub mod sequence;
pub mod signal;

pub use batch::{Scheduler, SchedulerConfig};
pub use sequence::{
    CompletionFrame, DoneReason, ImageInput, ImagePayload, Sequence, SequenceParams,
};

use thiserror::Error;

use self::sampler::GrammarError;
use crate::cache::CacheError;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("input of {tokens} tokens exceeds context of {context}")]
    InputTooLong { tokens: usize, context: usize },

    #[error("prompt references unknown image {0}")]
    UnknownImage(usize),

    #[error("malformed image marker {0:?}")]
    BadImageMarker(String),

    #[error("grammar: {0}")]
    Grammar(#[from] GrammarError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("no free sequence slot")]
    NoFreeSlot,

    #[error("scheduler is shut down")]
    Shutdown,
}
