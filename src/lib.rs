//! Generation control plane for a single loaded language model.
//!
//! The [`Engine`] turns a [`GenerationRequest`] into streamed text: it reuses
//! whatever prefix of the KV cache still matches the new prompt, evaluates
//! the rest, and samples until a stop condition fires. [`Kernel`] runs one
//! engine behind a worker thread for the network front end in `main.rs`.

pub mod backend;
pub mod commands;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod grammar;
pub mod metrics;
pub mod multimodal;
pub mod runtime;
pub mod sampling;
pub mod testing;
pub mod transport;

pub use backend::Backend;
pub use config::{ContextConfig, KernelConfig};
pub use engine::{Engine, GenerationOutput, OutputStream};
pub use error::{KernelError, Result};
pub use inference_protocol::{
    GenerationMetrics, GenerationRequest, GenerationStatus, StopReason,
};
pub use runtime::{GenerationHandle, Kernel, PollState};
