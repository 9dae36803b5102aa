mod candle;
mod loader;
mod tokenizer;

pub use candle::{CandleBackend, RuntimeModel};
pub use loader::{candidate_order, load_backend, BackendVariant, LoadOutcome};

use anyhow::Result;

/// Numerical backend the generation control plane drives.
///
/// Implementations own the KV cache; positions passed in are always the
/// engine's `n_past`.
pub trait Backend: Send {
    /// Tokenizes `text`, including the BOS token when the model uses one.
    fn tokenize(&self, text: &str) -> Result<Vec<u32>>;

    /// Raw bytes of a single token. May be an incomplete UTF-8 sequence.
    fn detokenize(&self, token: u32) -> Vec<u8>;

    fn vocab_size(&self) -> usize;

    fn eos_token(&self) -> u32;

    /// Evaluates `tokens` starting at `position`; afterwards [`Backend::logits`]
    /// holds the distribution for the next position.
    fn evaluate(&mut self, tokens: &[u32], position: usize) -> Result<()>;

    fn logits(&self) -> &[f32];

    /// Evaluates `n_tokens` rows of a flat embedding buffer at `position`.
    fn evaluate_embedding(&mut self, embedding: &[f32], n_tokens: usize, position: usize)
        -> Result<()>;

    /// Drops cached positions in `start..end` (`None` = to the end).
    fn remove_kv_range(&mut self, start: usize, end: Option<usize>);

    /// Moves every cached position `>= start` by `delta`.
    fn shift_kv_range(&mut self, start: usize, delta: isize);

    fn clear_kv(&mut self);

    /// Whether removals and shifts preserve the state of the retained
    /// positions without recomputation.
    fn supports_context_shift(&self) -> bool {
        false
    }
}

impl<B: Backend + ?Sized> Backend for Box<B> {
    fn tokenize(&self, text: &str) -> Result<Vec<u32>> {
        (**self).tokenize(text)
    }

    fn detokenize(&self, token: u32) -> Vec<u8> {
        (**self).detokenize(token)
    }

    fn vocab_size(&self) -> usize {
        (**self).vocab_size()
    }

    fn eos_token(&self) -> u32 {
        (**self).eos_token()
    }

    fn evaluate(&mut self, tokens: &[u32], position: usize) -> Result<()> {
        (**self).evaluate(tokens, position)
    }

    fn logits(&self) -> &[f32] {
        (**self).logits()
    }

    fn evaluate_embedding(
        &mut self,
        embedding: &[f32],
        n_tokens: usize,
        position: usize,
    ) -> Result<()> {
        (**self).evaluate_embedding(embedding, n_tokens, position)
    }

    fn remove_kv_range(&mut self, start: usize, end: Option<usize>) {
        (**self).remove_kv_range(start, end)
    }

    fn shift_kv_range(&mut self, start: usize, delta: isize) {
        (**self).shift_kv_range(start, delta)
    }

    fn clear_kv(&mut self) {
        (**self).clear_kv()
    }

    fn supports_context_shift(&self) -> bool {
        (**self).supports_context_shift()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    Llama,
    Qwen,
    Mistral,
    Unknown,
}

impl ModelFamily {
    pub fn from_hint(hint: &str) -> Self {
        let lowered = hint.to_lowercase();
        if lowered.contains("llama") {
            ModelFamily::Llama
        } else if lowered.contains("qwen") {
            ModelFamily::Qwen
        } else if lowered.contains("mistral") || lowered.contains("mixtral") {
            ModelFamily::Mistral
        } else {
            ModelFamily::Unknown
        }
    }
}
