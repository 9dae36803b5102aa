use anyhow::{anyhow, bail, Error as E, Result};
use candle_core::{DType, Device, Tensor};
use candle_transformers::models::quantized_llama;
use candle_transformers::models::quantized_qwen2;
use tokenizers::Tokenizer;
use tracing::debug;

use super::Backend;

const REPLAY_CHUNK: usize = 512;

pub enum RuntimeModel {
    Llama(quantized_llama::ModelWeights),
    Qwen2(quantized_qwen2::ModelWeights),
}

impl RuntimeModel {
    pub fn forward(&mut self, input_tensor: &Tensor, position: usize) -> Result<Tensor> {
        match self {
            Self::Llama(model) => Ok(model.forward(input_tensor, position)?),
            Self::Qwen2(model) => Ok(model.forward(input_tensor, position)?),
        }
    }
}

/// Backend over candle's quantized GGUF models.
///
/// candle keeps the KV cache inside the model and only supports appending or
/// restarting at position 0, so edits mark the cache stale and the retained
/// tokens are replayed before the next evaluation.
pub struct CandleBackend {
    model: RuntimeModel,
    tokenizer: Tokenizer,
    device: Device,
    eos_token_id: u32,
    vocab_size: usize,
    logits: Vec<f32>,
    cache: CacheLedger,
}

/// Tokens the engine considers cached versus what candle actually holds.
///
/// candle's cache can only grow or restart at position 0. Any edit that
/// touches positions already inside it leaves entries the engine no longer
/// expects, so the cache is marked stale and rebuilt from `retained`.
#[derive(Debug, Default, Clone, PartialEq)]
struct CacheLedger {
    retained: Vec<u32>,
    /// Positions held by the model's internal KV cache.
    model_len: usize,
    stale: bool,
}

impl CacheLedger {
    fn remove(&mut self, start: usize, end: Option<usize>) {
        let len = self.retained.len();
        let end = end.unwrap_or(len).min(len);
        if start < self.model_len {
            self.stale = true;
        }
        if start < end {
            self.retained.drain(start..end);
        }
    }

    fn shift(&mut self, start: usize) {
        if start < self.model_len {
            self.stale = true;
        }
    }

    fn clear(&mut self) {
        self.retained.clear();
        self.model_len = 0;
        self.stale = false;
    }

    fn needs_replay(&self) -> bool {
        self.stale || self.model_len != self.retained.len()
    }

    /// Records a forward pass of `tokens` at the end of the retained run.
    fn appended(&mut self, tokens: &[u32]) {
        self.retained.extend_from_slice(tokens);
        self.model_len = self.retained.len();
    }

    fn replayed(&mut self) {
        self.model_len = self.retained.len();
        self.stale = false;
    }
}

impl CandleBackend {
    pub fn new(model: RuntimeModel, tokenizer: Tokenizer, eos_token_id: u32, device: Device) -> Self {
        let vocab_size = tokenizer.get_vocab_size(true);
        Self {
            model,
            tokenizer,
            device,
            eos_token_id,
            vocab_size,
            logits: Vec::new(),
            cache: CacheLedger::default(),
        }
    }

    fn forward_chunk(&mut self, tokens: &[u32], position: usize) -> Result<()> {
        let input = Tensor::new(tokens, &self.device)?.unsqueeze(0)?;
        let logits = self.model.forward(&input, position)?;
        self.logits = logits.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
        Ok(())
    }

    /// Rebuilds the model cache from position 0, which makes candle drop
    /// everything it held before.
    fn replay(&mut self) -> Result<()> {
        let retained = self.cache.retained.clone();
        debug!(tokens = retained.len(), "replaying retained context");
        for (i, chunk) in retained.chunks(REPLAY_CHUNK).enumerate() {
            self.forward_chunk(chunk, i * REPLAY_CHUNK)?;
        }
        self.cache.replayed();
        Ok(())
    }
}

impl Backend for CandleBackend {
    fn tokenize(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self.tokenizer.encode(text, true).map_err(E::msg)?;
        Ok(encoding.get_ids().to_vec())
    }

    fn detokenize(&self, token: u32) -> Vec<u8> {
        let Some(piece) = self.tokenizer.id_to_token(token) else {
            return Vec::new();
        };
        if let Some(byte) = byte_fallback(&piece) {
            return vec![byte];
        }
        if piece.contains('\u{2581}') {
            return piece.replace('\u{2581}', " ").into_bytes();
        }
        self.tokenizer
            .decode(&[token], false)
            .unwrap_or(piece)
            .into_bytes()
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn eos_token(&self) -> u32 {
        self.eos_token_id
    }

    fn evaluate(&mut self, tokens: &[u32], position: usize) -> Result<()> {
        if position != self.cache.retained.len() {
            bail!(
                "evaluation at position {} but {} positions are cached",
                position,
                self.cache.retained.len()
            );
        }
        if self.cache.needs_replay() {
            self.replay()?;
        }
        if tokens.is_empty() {
            return Ok(());
        }
        self.forward_chunk(tokens, position)?;
        self.cache.appended(tokens);
        Ok(())
    }

    fn logits(&self) -> &[f32] {
        &self.logits
    }

    fn evaluate_embedding(
        &mut self,
        _embedding: &[f32],
        _n_tokens: usize,
        position: usize,
    ) -> Result<()> {
        Err(anyhow!(
            "embedding input is not supported by quantized candle models (position {})",
            position
        ))
    }

    fn remove_kv_range(&mut self, start: usize, end: Option<usize>) {
        self.cache.remove(start, end);
    }

    fn shift_kv_range(&mut self, start: usize, _delta: isize) {
        // positions are implicit in the retained run; a shift only forces a rebuild
        self.cache.shift(start);
    }

    fn clear_kv(&mut self) {
        self.cache.clear();
    }
}

/// Decodes sentencepiece byte-fallback pieces such as `<0x0A>`.
fn byte_fallback(piece: &str) -> Option<u8> {
    let hex = piece.strip_prefix("<0x")?.strip_suffix('>')?;
    if hex.len() != 2 {
        return None;
    }
    u8::from_str_radix(hex, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::{byte_fallback, CacheLedger};

    fn ledger_after(tokens: &[u32]) -> CacheLedger {
        let mut ledger = CacheLedger::default();
        ledger.appended(tokens);
        ledger
    }

    #[test]
    fn truncating_the_tail_forces_a_rebuild() {
        let mut ledger = ledger_after(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        assert!(!ledger.needs_replay());

        // the next request shares only four tokens
        ledger.remove(4, None);
        assert_eq!(ledger.retained, vec![1, 2, 3, 4]);
        assert!(ledger.needs_replay());

        ledger.replayed();
        assert!(!ledger.needs_replay());
        assert_eq!(ledger.model_len, 4);
    }

    #[test]
    fn removing_nothing_past_the_end_keeps_the_cache() {
        let mut ledger = ledger_after(&[1, 2, 3]);
        ledger.remove(3, None);
        assert!(!ledger.needs_replay());
        ledger.appended(&[4]);
        assert_eq!(ledger.model_len, 4);
    }

    #[test]
    fn shifts_and_middle_removals_are_stale() {
        let mut ledger = ledger_after(&[1, 2, 3, 4, 5, 6]);
        ledger.remove(1, Some(3));
        ledger.shift(3);
        assert_eq!(ledger.retained, vec![1, 4, 5, 6]);
        assert!(ledger.needs_replay());

        ledger.clear();
        assert!(!ledger.needs_replay());
        assert!(ledger.retained.is_empty());
    }

    #[test]
    fn byte_fallback_pieces_decode_to_raw_bytes() {
        assert_eq!(byte_fallback("<0x0A>"), Some(b'\n'));
        assert_eq!(byte_fallback("<0xE2>"), Some(0xE2));
        assert_eq!(byte_fallback("<0x0>"), None);
        assert_eq!(byte_fallback("hello"), None);
    }
}
