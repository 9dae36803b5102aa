use tracing::{debug, warn};

use crate::backend::Backend;
use crate::context::{RecentWindow, SmartContext};
use crate::grammar::Grammar;
use crate::multimodal::{ImageEncoder, MultimodalSplicer};
use crate::sampling::MirostatState;

/// State carried from one request to the next.
///
/// `context_tokens` mirrors the backend's KV cache: between requests its
/// length is the number of evaluated positions.
pub struct Session {
    pub(crate) context_tokens: Vec<u32>,
    pub(crate) window: RecentWindow,
    pub(crate) grammar: Option<Grammar>,
    pub(crate) splicer: MultimodalSplicer,
    pub(crate) smart_context: SmartContext,
    pub(crate) mirostat: MirostatState,
    pub(crate) pieces: Vec<Vec<u8>>,
    banned: Option<Vec<u32>>,
}

impl Session {
    pub fn new(encoder: Option<Box<dyn ImageEncoder>>) -> Self {
        Self {
            context_tokens: Vec::new(),
            window: RecentWindow::default(),
            grammar: None,
            splicer: MultimodalSplicer::new(encoder),
            smart_context: SmartContext::default(),
            mirostat: MirostatState::default(),
            pieces: Vec::new(),
            banned: None,
        }
    }

    pub fn context_tokens(&self) -> &[u32] {
        &self.context_tokens
    }

    /// Rendered bytes of every vocabulary entry, built on first use.
    pub(crate) fn ensure_pieces<B: Backend + ?Sized>(&mut self, backend: &B) {
        let vocab = backend.vocab_size();
        if self.pieces.len() != vocab {
            self.pieces = (0..vocab as u32).map(|id| backend.detokenize(id)).collect();
            debug!(vocab, "vocabulary pieces cached");
        }
    }

    /// Ids whose piece contains one of `banned`, resolved once per session.
    pub(crate) fn banned_ids<B: Backend + ?Sized>(&mut self, backend: &B, banned: &[String]) -> Vec<u32> {
        if let Some(ids) = &self.banned {
            return ids.clone();
        }
        let needles: Vec<&[u8]> = banned
            .iter()
            .filter(|b| !b.is_empty())
            .map(|b| b.as_bytes())
            .collect();
        let ids: Vec<u32> = if needles.is_empty() {
            Vec::new()
        } else {
            self.ensure_pieces(backend);
            self.pieces
                .iter()
                .enumerate()
                .filter(|(_, piece)| needles.iter().any(|n| contains_bytes(piece, n)))
                .map(|(id, _)| id as u32)
                .collect()
        };
        if !ids.is_empty() {
            debug!(count = ids.len(), "banned tokens resolved");
        }
        self.banned = Some(ids.clone());
        ids
    }

    /// Drops everything that assumed the KV cache content.
    pub(crate) fn invalidate(&mut self, images: bool) {
        warn!(images, "invalidating session cache");
        self.context_tokens.clear();
        self.smart_context.clear();
        if images {
            self.splicer.invalidate();
        }
    }
}

pub(crate) fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return true;
    }
    haystack.windows(needle.len()).any(|w| w == needle)
}
