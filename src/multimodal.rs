//! Image embeddings spliced into the scalar token stream.
//!
//! Each image occupies a run of sentinel ids in the context. The sentinel id
//! flips between two values whenever the image set changes, so a cached
//! context holding the old images never fast-forwards over the new ones.

use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::backend::Backend;
use crate::error::{KernelError, Result};

pub const SENTINEL_A: u32 = u32::MAX - 1;
pub const SENTINEL_B: u32 = u32::MAX - 2;

pub fn is_sentinel(token: u32) -> bool {
    token == SENTINEL_A || token == SENTINEL_B
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageEmbedding {
    /// Number of positions the image occupies.
    pub tokens: usize,
    /// `tokens` rows of the model's embedding width, row-major.
    pub data: Vec<f32>,
}

/// Turns an opaque image payload (base64 as received) into an embedding.
pub trait ImageEncoder: Send {
    fn encode(&mut self, payload: &str) -> anyhow::Result<ImageEmbedding>;
}

pub struct MultimodalSplicer {
    encoder: Option<Box<dyn ImageEncoder>>,
    signature: Option<[u8; 32]>,
    identifier: u32,
    images: Vec<ImageEmbedding>,
}

impl MultimodalSplicer {
    pub fn new(encoder: Option<Box<dyn ImageEncoder>>) -> Self {
        Self {
            encoder,
            signature: None,
            identifier: SENTINEL_A,
            images: Vec::new(),
        }
    }

    pub fn identifier(&self) -> u32 {
        self.identifier
    }

    pub fn images(&self) -> &[ImageEmbedding] {
        &self.images
    }

    /// Forgets the processed images so the next request re-encodes them.
    pub fn invalidate(&mut self) {
        self.signature = None;
    }

    /// Encodes `payloads` if they differ from the last processed set.
    ///
    /// Images taking no positions, or at least `n_ctx` of them, are excluded.
    pub fn prepare(&mut self, payloads: &[String], n_ctx: usize) {
        let mut hasher = Sha256::new();
        for payload in payloads {
            hasher.update(payload.as_bytes());
        }
        let signature: [u8; 32] = hasher.finalize().into();
        if self.signature == Some(signature) {
            return;
        }

        self.identifier = if self.identifier == SENTINEL_A {
            SENTINEL_B
        } else {
            SENTINEL_A
        };
        self.signature = Some(signature);
        self.images.clear();

        if payloads.is_empty() {
            return;
        }
        let Some(encoder) = self.encoder.as_mut() else {
            warn!(images = payloads.len(), "no image encoder loaded, images ignored");
            return;
        };
        for (i, payload) in payloads.iter().enumerate() {
            match encoder.encode(payload) {
                Ok(embedding) if embedding.tokens > 0 && embedding.tokens < n_ctx => {
                    info!(image = i + 1, tokens = embedding.tokens, "image encoded");
                    self.images.push(embedding);
                }
                Ok(embedding) => warn!(
                    image = i + 1,
                    tokens = embedding.tokens,
                    n_ctx,
                    "image excluded: context too small or no image tokens"
                ),
                Err(e) => warn!(image = i + 1, error = %e, "image excluded: encoding failed"),
            }
        }
    }

    /// The sentinel run standing in for every prepared image.
    pub fn sentinel_run(&self) -> Vec<u32> {
        let total: usize = self.images.iter().map(|img| img.tokens).sum();
        vec![self.identifier; total]
    }

    /// Evaluates every prepared embedding at `*n_past`, in chunks of at most
    /// `batch_size` positions. `counted` is the length of the sentinel run
    /// that was consumed from the input.
    pub fn evaluate<B: Backend + ?Sized>(
        &mut self,
        backend: &mut B,
        counted: usize,
        batch_size: usize,
        n_past: &mut usize,
    ) -> Result<()> {
        let result = self.evaluate_images(backend, counted, batch_size, n_past);
        if result.is_err() {
            self.invalidate();
        }
        result
    }

    fn evaluate_images<B: Backend + ?Sized>(
        &self,
        backend: &mut B,
        counted: usize,
        batch_size: usize,
        n_past: &mut usize,
    ) -> Result<()> {
        let batch_size = batch_size.max(1);
        let mut evaluated = 0;
        for (i, image) in self.images.iter().enumerate() {
            info!(image = i + 1, tokens = image.tokens, "processing image embedding");
            let width = image.data.len() / image.tokens.max(1);
            let mut done = 0;
            while done < image.tokens {
                let n_eval = batch_size.min(image.tokens - done);
                let rows = &image.data[done * width..(done + n_eval) * width];
                backend
                    .evaluate_embedding(rows, n_eval, *n_past)
                    .map_err(|e| KernelError::ImageEval {
                        position: *n_past,
                        detail: e.to_string(),
                    })?;
                *n_past += n_eval;
                done += n_eval;
            }
            evaluated += image.tokens;
        }
        if evaluated != counted {
            return Err(KernelError::ImageTokenMismatch { counted, evaluated });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FixedImageEncoder, KvEdit, ScriptedBackend};

    fn splicer(tokens: usize) -> MultimodalSplicer {
        MultimodalSplicer::new(Some(Box::new(FixedImageEncoder::new(tokens, 2))))
    }

    #[test]
    fn identifier_toggles_only_when_images_change() {
        let mut s = splicer(3);
        let first = vec!["aGVsbG8=".to_string()];
        s.prepare(&first, 64);
        let id = s.identifier();
        assert_eq!(s.sentinel_run(), vec![id; 3]);

        s.prepare(&first, 64);
        assert_eq!(s.identifier(), id);

        s.prepare(&["d29ybGQ=".to_string()], 64);
        assert_ne!(s.identifier(), id);
        assert!(is_sentinel(s.identifier()));
    }

    #[test]
    fn invalidation_forces_reprocessing() {
        let mut s = splicer(3);
        let payloads = vec!["x".to_string()];
        s.prepare(&payloads, 64);
        let id = s.identifier();
        s.invalidate();
        s.prepare(&payloads, 64);
        assert_ne!(s.identifier(), id);
        assert_eq!(s.images().len(), 1);
    }

    #[test]
    fn oversized_images_are_excluded() {
        let mut s = splicer(64);
        s.prepare(&["x".to_string()], 64);
        assert!(s.images().is_empty());
        assert!(s.sentinel_run().is_empty());
    }

    #[test]
    fn without_encoder_images_are_ignored() {
        let mut s = MultimodalSplicer::new(None);
        s.prepare(&["x".to_string()], 64);
        assert!(s.sentinel_run().is_empty());
    }

    #[test]
    fn embeddings_are_evaluated_in_batches() {
        let mut s = splicer(5);
        s.prepare(&["x".to_string()], 64);
        let mut backend = ScriptedBackend::new(&["a"]);
        backend.evaluate(&[1, 2, 2, 2], 0).unwrap();
        backend.journal().clear();
        let mut n_past = 4;

        s.evaluate(&mut backend, 5, 2, &mut n_past).unwrap();

        assert_eq!(n_past, 9);
        assert_eq!(
            backend.kv_edits(),
            vec![
                KvEdit::Embedding(4, 2),
                KvEdit::Embedding(6, 2),
                KvEdit::Embedding(8, 1)
            ]
        );
    }

    #[test]
    fn count_mismatch_is_fatal_and_invalidates() {
        let mut s = splicer(3);
        let payloads = vec!["x".to_string()];
        s.prepare(&payloads, 64);
        let id = s.identifier();
        let mut backend = ScriptedBackend::new(&["a"]);
        let mut n_past = 0;

        let err = s.evaluate(&mut backend, 4, 8, &mut n_past).unwrap_err();
        assert!(matches!(
            err,
            KernelError::ImageTokenMismatch {
                counted: 4,
                evaluated: 3
            }
        ));
        assert!(err.invalidates_images());

        s.prepare(&payloads, 64);
        assert_ne!(s.identifier(), id);
    }
}
