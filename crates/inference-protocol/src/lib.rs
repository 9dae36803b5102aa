//! Wire-level types shared by the inference kernel and its clients.
//!
//! Requests travel as JSON bodies behind a one-line text header
//! (`VERB [length]`), responses use the same `+OK` / `-ERR` / `DATA` framing
//! the kernel always spoke.

mod request;
mod response;
mod wire;

pub use request::{GenerationRequest, LogitBias, MirostatMode, SamplerStage, SamplingConfig};
pub use response::{GenerationMetrics, GenerationStatus, StopReason};
pub use wire::{response_data, response_err, response_err_code, response_ok, CommandHeader, OpCode};

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    #[error("empty header")]
    EmptyHeader,
    #[error("unknown opcode: {0}")]
    UnknownOpcode(String),
    #[error("invalid content length '{0}'")]
    InvalidLength(String),
    #[error("invalid sampler id {0}")]
    InvalidSampler(u8),
    #[error("invalid mirostat mode {0}")]
    InvalidMirostat(u8),
}
