//! In-memory collaborators for exercising the engine without model weights.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};

use crate::backend::Backend;
use crate::multimodal::{ImageEmbedding, ImageEncoder};

pub const EOS: u32 = 0;
pub const BOS: u32 = 1;

const PEAK_LOGIT: f32 = 20.0;
const EMBEDDING_SLOT: u32 = u32::MAX;

/// Calls the engine made against the KV cache, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvEdit {
    /// `(position, tokens)`
    Evaluate(usize, usize),
    /// `(position, rows)`
    Embedding(usize, usize),
    Remove(usize, Option<usize>),
    Shift(usize, isize),
    Clear,
}

/// Shared view of a [`ScriptedBackend`]'s KV journal, usable after the
/// backend has been moved into an engine.
#[derive(Debug, Clone, Default)]
pub struct KvJournal(Arc<Mutex<Vec<KvEdit>>>);

impl KvJournal {
    pub fn snapshot(&self) -> Vec<KvEdit> {
        self.0.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }

    fn record(&self, edit: KvEdit) {
        self.0.lock().unwrap().push(edit);
    }
}

/// Deterministic backend over a tiny vocabulary.
///
/// Id `0` is EOS (`</s>`), id `1` is BOS (`<s>`), the given pieces follow.
/// After evaluating a token the logits peak on the scripted successor of
/// that token: any token outside the script leads to the first scripted
/// piece, each scripted piece leads to the next, and the last one to EOS.
pub struct ScriptedBackend {
    vocab: Vec<Vec<u8>>,
    successors: HashMap<u32, u32>,
    opening: u32,
    logits: Vec<f32>,
    cache: Vec<u32>,
    journal: KvJournal,
    fail_evaluation: bool,
    context_shift: bool,
}

impl ScriptedBackend {
    pub fn new(pieces: &[&str]) -> Self {
        let mut vocab = vec![b"</s>".to_vec(), b"<s>".to_vec()];
        vocab.extend(pieces.iter().map(|p| p.as_bytes().to_vec()));
        Self {
            vocab,
            successors: HashMap::new(),
            opening: EOS,
            logits: Vec::new(),
            cache: Vec::new(),
            journal: KvJournal::default(),
            fail_evaluation: false,
            context_shift: true,
        }
    }

    /// Makes the model emit `script` (pieces that must be in the vocabulary)
    /// after any prompt, then EOS.
    pub fn with_script(mut self, script: &[&str]) -> Self {
        let ids: Vec<u32> = script
            .iter()
            .filter_map(|piece| self.id_of(piece))
            .collect();
        self.successors.clear();
        self.opening = ids.first().copied().unwrap_or(EOS);
        for pair in ids.windows(2) {
            self.successors.insert(pair[0], pair[1]);
        }
        if let Some(&last) = ids.last() {
            self.successors.insert(last, EOS);
        }
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail_evaluation = true;
        self
    }

    pub fn without_context_shift(mut self) -> Self {
        self.context_shift = false;
        self
    }

    pub fn id_of(&self, piece: &str) -> Option<u32> {
        self.vocab
            .iter()
            .position(|p| p == piece.as_bytes())
            .map(|i| i as u32)
    }

    pub fn journal(&self) -> KvJournal {
        self.journal.clone()
    }

    pub fn kv_edits(&self) -> Vec<KvEdit> {
        self.journal.snapshot()
    }

    /// Tokens currently held in the cache (`u32::MAX` for embedding rows).
    pub fn cached(&self) -> &[u32] {
        &self.cache
    }

    fn peak_after(&mut self, last: u32) {
        let next = self.successors.get(&last).copied().unwrap_or(self.opening);
        self.logits = vec![0.0; self.vocab.len()];
        self.logits[next as usize] = PEAK_LOGIT;
    }
}

impl Backend for ScriptedBackend {
    /// Greedy longest-piece match; bytes no piece covers are skipped.
    fn tokenize(&self, text: &str) -> Result<Vec<u32>> {
        let bytes = text.as_bytes();
        let mut out = vec![BOS];
        let mut pos = 0;
        while pos < bytes.len() {
            let best = self
                .vocab
                .iter()
                .enumerate()
                .skip(2)
                .filter(|(_, p)| !p.is_empty() && bytes[pos..].starts_with(p))
                .max_by_key(|(_, p)| p.len());
            match best {
                Some((id, piece)) => {
                    out.push(id as u32);
                    pos += piece.len();
                }
                None => pos += 1,
            }
        }
        Ok(out)
    }

    fn detokenize(&self, token: u32) -> Vec<u8> {
        self.vocab.get(token as usize).cloned().unwrap_or_default()
    }

    fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    fn eos_token(&self) -> u32 {
        EOS
    }

    fn evaluate(&mut self, tokens: &[u32], position: usize) -> Result<()> {
        if self.fail_evaluation {
            bail!("scripted evaluation failure at {}", position);
        }
        if position != self.cache.len() {
            bail!(
                "evaluation at position {} but {} positions are cached",
                position,
                self.cache.len()
            );
        }
        self.journal.record(KvEdit::Evaluate(position, tokens.len()));
        self.cache.extend_from_slice(tokens);
        if let Some(&last) = tokens.last() {
            self.peak_after(last);
        }
        Ok(())
    }

    fn logits(&self) -> &[f32] {
        &self.logits
    }

    fn evaluate_embedding(&mut self, _embedding: &[f32], n_tokens: usize, position: usize) -> Result<()> {
        if position != self.cache.len() {
            bail!("embedding at position {} but {} cached", position, self.cache.len());
        }
        self.journal.record(KvEdit::Embedding(position, n_tokens));
        self.cache.extend(std::iter::repeat(EMBEDDING_SLOT).take(n_tokens));
        self.peak_after(EMBEDDING_SLOT);
        Ok(())
    }

    fn remove_kv_range(&mut self, start: usize, end: Option<usize>) {
        self.journal.record(KvEdit::Remove(start, end));
        let len = self.cache.len();
        let end = end.unwrap_or(len).min(len);
        if start < end {
            self.cache.drain(start..end);
        }
    }

    fn shift_kv_range(&mut self, start: usize, delta: isize) {
        self.journal.record(KvEdit::Shift(start, delta));
    }

    fn clear_kv(&mut self) {
        self.journal.record(KvEdit::Clear);
        self.cache.clear();
    }

    fn supports_context_shift(&self) -> bool {
        self.context_shift
    }
}

/// Encoder producing constant embeddings of a fixed size.
pub struct FixedImageEncoder {
    tokens: usize,
    width: usize,
}

impl FixedImageEncoder {
    pub fn new(tokens: usize, width: usize) -> Self {
        Self { tokens, width }
    }
}

impl ImageEncoder for FixedImageEncoder {
    fn encode(&mut self, payload: &str) -> Result<ImageEmbedding> {
        if payload.is_empty() {
            bail!("empty image payload");
        }
        Ok(ImageEmbedding {
            tokens: self.tokens,
            data: vec![0.5; self.tokens * self.width],
        })
    }
}
