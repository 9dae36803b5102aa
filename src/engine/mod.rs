mod lifecycle;
mod session;

pub use session::Session;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use inference_protocol::{
    GenerationMetrics, GenerationRequest, GenerationStatus, LogitBias, SamplerStage, SamplingConfig,
};
use tracing::warn;

use crate::backend::Backend;
use crate::config::ContextConfig;
use crate::multimodal::ImageEncoder;

/// Output shared between the generating worker and pollers.
///
/// Each [`reset`](Self::reset) opens a new generation id; the `_for`
/// variants act only while their id is still the current one.
#[derive(Debug, Default)]
pub struct OutputStream {
    buffer: Mutex<Vec<u8>>,
    abort: AtomicBool,
    finished: AtomicBool,
    generation: AtomicU64,
}

impl OutputStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears every flag and starts a new generation id, returned.
    pub(crate) fn reset(&self) -> u64 {
        let mut buffer = self.buffer.lock().unwrap();
        buffer.clear();
        self.abort.store(false, Ordering::SeqCst);
        self.finished.store(false, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Clears text and the finished flag at the start of a run. A pending
    /// abort is kept so it applies to the run it was raised for.
    pub(crate) fn begin(&self) {
        self.buffer.lock().unwrap().clear();
        self.finished.store(false, Ordering::SeqCst);
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub(crate) fn append(&self, bytes: &[u8]) {
        self.buffer.lock().unwrap().extend_from_slice(bytes);
    }

    /// Copy of the text produced so far; incomplete UTF-8 is replaced.
    pub fn snapshot(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock().unwrap()).into_owned()
    }

    /// Text of generation `id`, or `None` once a newer one has started.
    pub(crate) fn snapshot_for(&self, id: u64) -> Option<String> {
        let buffer = self.buffer.lock().unwrap();
        (self.generation() == id).then(|| String::from_utf8_lossy(&buffer).into_owned())
    }

    pub fn request_abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    /// Raises the abort flag only if `id` is still the current generation.
    pub(crate) fn request_abort_for(&self, id: u64) -> bool {
        let _buffer = self.buffer.lock().unwrap();
        if self.generation() != id {
            return false;
        }
        self.abort.store(true, Ordering::SeqCst);
        true
    }

    pub fn abort_requested(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_finished(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutput {
    pub status: GenerationStatus,
    pub text: String,
    pub metrics: GenerationMetrics,
}

impl GenerationOutput {
    pub(crate) fn failed(metrics: GenerationMetrics) -> Self {
        Self {
            status: GenerationStatus::Failed,
            text: String::new(),
            metrics,
        }
    }
}

/// Generation control plane over one backend and one session.
pub struct Engine<B: Backend> {
    backend: B,
    config: ContextConfig,
    session: Session,
}

impl<B: Backend> Engine<B> {
    pub fn new(backend: B, config: ContextConfig) -> Self {
        Self::with_image_encoder(backend, config, None)
    }

    pub fn with_image_encoder(
        backend: B,
        config: ContextConfig,
        encoder: Option<Box<dyn ImageEncoder>>,
    ) -> Self {
        Self {
            backend,
            config,
            session: Session::new(encoder),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn token_count(&self, text: &str) -> crate::error::Result<usize> {
        Ok(self.backend.tokenize(text)?.len())
    }
}

/// A request after clamping and validation against the loaded model.
#[derive(Debug, Clone)]
pub(crate) struct PreparedRequest {
    pub n_ctx: usize,
    pub max_length: usize,
    pub sampling: SamplingConfig,
    pub order: Vec<SamplerStage>,
    pub stop_sequence: Vec<String>,
    pub logit_biases: Vec<LogitBias>,
    pub seed: u32,
}

impl PreparedRequest {
    pub fn new(request: &GenerationRequest, n_vocab: usize) -> Self {
        let n_ctx = request.max_context_length.max(2);
        let max_length = request.max_length.min(n_ctx - 1);

        let mut sampling = request.sampling;
        let window_cap = i32::try_from(n_ctx).unwrap_or(i32::MAX);
        sampling.rep_pen_range = sampling.rep_pen_range.clamp(1, window_cap);
        if sampling.top_k < 1 {
            sampling.top_k = n_vocab as i32;
        }

        let stop_sequence = request
            .stop_sequence
            .iter()
            .filter(|s| !s.is_empty())
            .cloned()
            .collect();
        let logit_biases = request
            .logit_biases
            .iter()
            .filter(|b| (b.token_id as usize) < n_vocab && b.bias != 0.0)
            .copied()
            .collect();

        Self {
            n_ctx,
            max_length,
            sampling,
            order: request.sampler_order(),
            stop_sequence,
            logit_biases,
            seed: resolve_seed(request.seed),
        }
    }
}

pub(crate) fn resolve_seed(seed: i64) -> u32 {
    if seed > 0 && seed != 0xFFFF_FFFF {
        return seed as u32;
    }
    let mut buf = [0u8; 4];
    if getrandom::getrandom(&mut buf).is_err() {
        warn!("system randomness unavailable, falling back to the clock");
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        return nanos % 1_000_000;
    }
    u32::from_le_bytes(buf) % 1_000_000
}

/// Builds the token sequence to evaluate: BOS and image sentinels, then
/// memory, then the prompt, trimmed from the front to leave room for
/// `max_length` new tokens.
pub(crate) fn assemble_input(
    mut prompt: Vec<u32>,
    memory: Vec<u32>,
    sentinels: &[u32],
    bos: Option<u32>,
    max_length: usize,
    n_ctx: usize,
) -> Vec<u32> {
    if prompt.len() + max_length > n_ctx {
        let offset = (prompt.len() + max_length - n_ctx).min(prompt.len());
        prompt.drain(..offset);
        if let (Some(bos), Some(first)) = (bos, prompt.first_mut()) {
            *first = bos;
        }
    }

    let mut memory = memory;
    if !sentinels.is_empty() {
        if sentinels.len() + max_length + 4 > n_ctx {
            warn!(
                sentinels = sentinels.len(),
                n_ctx, "too many image tokens for the context, images ignored"
            );
        } else {
            let mut block = Vec::with_capacity(1 + sentinels.len() + memory.len());
            block.extend(bos);
            block.extend_from_slice(sentinels);
            let text_start = usize::from(bos.is_some() && memory.first().copied() == bos);
            block.extend_from_slice(&memory[text_start..]);
            block.truncate(n_ctx.saturating_sub(max_length + 4));
            memory = block;
        }
    }

    if memory.is_empty() {
        return prompt;
    }

    if bos.is_some() && prompt.first().copied() == bos {
        prompt.remove(0);
    }
    if memory.len() + max_length + 4 > n_ctx {
        let offset = (memory.len() + max_length + 4 - n_ctx).min(memory.len());
        memory.drain(..offset);
        if let (Some(bos), Some(first)) = (bos, memory.first_mut()) {
            *first = bos;
        }
    }
    let total = memory.len() + prompt.len() + max_length;
    if total > n_ctx {
        let excess = total - n_ctx;
        if prompt.len() >= excess {
            prompt.drain(..excess);
        } else {
            prompt.clear();
        }
    }
    memory.extend(prompt);
    memory
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOS: u32 = 1;

    #[test]
    fn prompt_is_trimmed_from_the_front_with_bos_restored() {
        let prompt = vec![BOS, 10, 11, 12, 13, 14];
        let input = assemble_input(prompt, Vec::new(), &[], Some(BOS), 3, 7);
        assert_eq!(input, vec![BOS, 12, 13, 14]);
    }

    #[test]
    fn memory_is_prepended_and_prompt_bos_dropped() {
        let input = assemble_input(vec![BOS, 20, 21], vec![BOS, 30], &[], Some(BOS), 2, 64);
        assert_eq!(input, vec![BOS, 30, 20, 21]);
    }

    #[test]
    fn memory_squeezes_the_prompt() {
        let input = assemble_input(vec![BOS, 20, 21, 22, 23], vec![BOS, 30], &[], Some(BOS), 2, 10);
        assert_eq!(input, vec![BOS, 30, 20, 21, 22, 23]);

        let prompt = vec![BOS, 20, 21, 22, 23, 24, 25];
        let input = assemble_input(prompt, vec![BOS, 30], &[], Some(BOS), 2, 8);
        assert_eq!(input, vec![BOS, 30, 22, 23, 24, 25]);
    }

    #[test]
    fn sentinels_lead_the_memory_block() {
        let s = 900;
        let input = assemble_input(vec![BOS, 20], vec![BOS, 30], &[s, s], Some(BOS), 2, 64);
        assert_eq!(input, vec![BOS, s, s, 30, 20]);
    }

    #[test]
    fn oversized_sentinel_runs_are_ignored() {
        let s = 900;
        let input = assemble_input(vec![BOS, 20], Vec::new(), &[s; 8], Some(BOS), 2, 12);
        assert_eq!(input, vec![BOS, 20]);
    }

    #[test]
    fn request_normalization() {
        let mut request = GenerationRequest::new("hi");
        request.max_context_length = 16;
        request.max_length = 40;
        request.sampling.top_k = 0;
        request.sampling.rep_pen_range = 0;
        request.stop_sequence = vec![String::new(), "END".into()];
        request.logit_biases = vec![
            LogitBias { token_id: 3, bias: 0.0 },
            LogitBias { token_id: 4, bias: 1.5 },
            LogitBias { token_id: 99, bias: 1.5 },
        ];
        request.seed = 77;

        let prepared = PreparedRequest::new(&request, 50);
        assert_eq!(prepared.max_length, 15);
        assert_eq!(prepared.sampling.top_k, 50);
        assert_eq!(prepared.sampling.rep_pen_range, 1);
        assert_eq!(prepared.stop_sequence, vec!["END".to_string()]);
        assert_eq!(prepared.logit_biases, vec![LogitBias { token_id: 4, bias: 1.5 }]);
        assert_eq!(prepared.seed, 77);
        assert_eq!(prepared.order, SamplerStage::DEFAULT_ORDER.to_vec());
    }

    #[test]
    fn repetition_window_never_exceeds_the_context() {
        let mut request = GenerationRequest::new("hi");
        request.max_context_length = 64;
        request.sampling.rep_pen_range = i32::MAX;
        let prepared = PreparedRequest::new(&request, 50);
        assert_eq!(prepared.sampling.rep_pen_range, 64);
    }

    #[test]
    fn random_seeds_are_bounded() {
        assert!(resolve_seed(-1) < 1_000_000);
        assert!(resolve_seed(0xFFFF_FFFF) < 1_000_000);
        assert_eq!(resolve_seed(5), 5);
    }

    #[test]
    fn output_stream_snapshots_and_flags() {
        let stream = OutputStream::new();
        stream.append("héllo".as_bytes());
        stream.append(&[0xE2]);
        assert!(stream.snapshot().starts_with("héllo"));
        stream.request_abort();
        assert!(stream.abort_requested());
        let id = stream.reset();
        assert!(!stream.abort_requested());
        assert_eq!(stream.snapshot(), "");
        assert_eq!(stream.snapshot_for(id).as_deref(), Some(""));
    }

    #[test]
    fn begin_keeps_a_pending_abort() {
        let stream = OutputStream::new();
        stream.append(b"old");
        stream.mark_finished();
        stream.request_abort();
        stream.begin();
        assert!(stream.abort_requested());
        assert!(!stream.is_finished());
        assert_eq!(stream.snapshot(), "");
    }

    #[test]
    fn stale_generation_ids_are_inert() {
        let stream = OutputStream::new();
        let first = stream.reset();
        stream.append(b"first");
        let second = stream.reset();
        assert_ne!(first, second);

        assert!(!stream.request_abort_for(first));
        assert!(!stream.abort_requested());
        assert_eq!(stream.snapshot_for(first), None);

        assert!(stream.request_abort_for(second));
        assert!(stream.abort_requested());
    }
}
