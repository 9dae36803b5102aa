use std::time::Instant;

use inference_protocol::{GenerationMetrics, GenerationRequest, GenerationStatus, StopReason};
use tracing::{debug, error, info};

use super::session::contains_bytes;
use super::{assemble_input, Engine, GenerationOutput, OutputStream, PreparedRequest};
use crate::backend::Backend;
use crate::context::{fast_forward, purge_missing_tokens};
use crate::error::{KernelError, Result};
use crate::grammar;
use crate::metrics;
use crate::multimodal::is_sentinel;
use crate::sampling::{Sampler, SamplingParams};

/// Offset below the lowest logit given to tokens that must not be sampled.
const SUPPRESSION_MARGIN: f32 = 8.0;

/// Per-request progress through the feed/sample loop.
struct Progress {
    input: Vec<u32>,
    consumed: usize,
    batch: Vec<u32>,
    n_past: usize,
    remaining: usize,
    unused: usize,
    output: Vec<u8>,
    stop_reason: StopReason,
    prompt_tokens: usize,
    started: Instant,
    sampling_started: Option<Instant>,
}

impl Progress {
    fn input_exhausted(&self) -> bool {
        self.consumed >= self.input.len()
    }

    fn stop(&mut self, reason: StopReason) {
        self.unused = self.remaining;
        self.remaining = 0;
        self.stop_reason = reason;
    }
}

impl<B: Backend> Engine<B> {
    /// Runs one request to completion, streaming text into `stream`, and
    /// marks the stream finished.
    ///
    /// Any failure yields a `Failed` result with empty text and drops the
    /// cached context so the next request starts clean. An abort already
    /// raised on `stream` applies to this run.
    pub fn generate(
        &mut self,
        request: &GenerationRequest,
        stream: &OutputStream,
    ) -> GenerationOutput {
        let output = self.run_request(request, stream);
        stream.mark_finished();
        output
    }

    /// Like [`generate`](Self::generate) but leaves the finished flag to the
    /// caller, which publishes the result first.
    pub(crate) fn run_request(
        &mut self,
        request: &GenerationRequest,
        stream: &OutputStream,
    ) -> GenerationOutput {
        stream.begin();
        match self.run(request, stream) {
            Ok(output) => {
                metrics::record_generation(true);
                metrics::record_metrics(&output.metrics);
                output
            }
            Err(e) => {
                error!(error = %e, "generation failed");
                self.invalidate_after(&e);
                metrics::record_generation(false);
                GenerationOutput::failed(GenerationMetrics {
                    context_limit: request.max_context_length,
                    ..GenerationMetrics::default()
                })
            }
        }
    }

    fn invalidate_after(&mut self, err: &KernelError) {
        self.session.invalidate(err.invalidates_images());
        self.backend.clear_kv();
    }

    fn run(
        &mut self,
        request: &GenerationRequest,
        stream: &OutputStream,
    ) -> Result<GenerationOutput> {
        let started = Instant::now();
        let n_vocab = self.backend.vocab_size();
        let prepared = PreparedRequest::new(request, n_vocab);
        let n_ctx = prepared.n_ctx;

        // INIT
        grammar::refresh(
            &mut self.session.grammar,
            &request.grammar,
            request.grammar_retain_state,
        );
        self.session.splicer.prepare(&request.images, n_ctx);

        let bos = self.backend.tokenize("")?.first().copied();
        let prompt = self.backend.tokenize(&request.prompt)?;
        let memory = if request.memory.is_empty() {
            Vec::new()
        } else {
            self.backend.tokenize(&request.memory)?
        };
        let sentinels = self.session.splicer.sentinel_run();
        let mut input = assemble_input(prompt, memory, &sentinels, bos, prepared.max_length, n_ctx);
        if input.is_empty() {
            input.extend(bos);
        }
        if input.is_empty() {
            return Err(KernelError::Backend(anyhow::anyhow!("prompt produced no tokens")));
        }

        // RECONCILE
        self.session
            .window
            .reset(prepared.sampling.rep_pen_range as usize);
        let shift_enabled = self.config.context_shift && self.backend.supports_context_shift();
        if shift_enabled {
            purge_missing_tokens(
                &mut self.backend,
                &mut self.session.context_tokens,
                &input,
                prepared.max_length,
                n_ctx,
                &self.config.shift,
            )?;
        }
        let smart_policy = (self.config.smart_context && !shift_enabled).then_some(&self.config.smart);
        let n_past = fast_forward(
            &self.session.context_tokens,
            &mut input,
            &mut self.session.window,
            n_ctx,
            &mut self.session.smart_context,
            smart_policy,
        );
        self.backend.remove_kv_range(n_past, None);
        self.session.context_tokens.truncate(n_past);
        debug!(n_past, pending = input.len(), seed = prepared.seed, "context reconciled");

        let mut progress = Progress {
            prompt_tokens: input.len(),
            input,
            consumed: 0,
            batch: Vec::new(),
            n_past,
            remaining: prepared.max_length,
            unused: 0,
            output: Vec::new(),
            stop_reason: StopReason::OutOfTokens,
            started,
            sampling_started: None,
        };
        let mut sampler = Sampler::new(prepared.seed);
        let mut suppressed = self
            .session
            .banned_ids(&self.backend, &self.config.banned_tokens);
        if !request.unban_eos {
            suppressed.push(self.backend.eos_token());
        }

        while progress.remaining > 0 {
            // FEED
            if !progress.batch.is_empty() {
                self.backend.evaluate(&progress.batch, progress.n_past)?;
                progress.n_past += progress.batch.len();
                progress.batch.clear();
            }

            if progress.input_exhausted() {
                if progress.sampling_started.is_none() {
                    progress.sampling_started = Some(Instant::now());
                }
                // SAMPLE
                if stream.abort_requested() {
                    progress.unused = progress.remaining;
                    progress.remaining = 0;
                    info!(n_past = progress.n_past, "generation aborted");
                    break;
                }
                let id = self.sample_next(&prepared, &suppressed, &mut sampler)?;
                self.accept_sampled(id, &mut progress, stream)?;

                // CHECK_STOP
                if request.unban_eos && id == self.backend.eos_token() {
                    progress.stop(StopReason::EosTokenHit);
                    debug!("eos token triggered");
                } else if let Some(stop) = prepared
                    .stop_sequence
                    .iter()
                    .find(|s| contains_bytes(&progress.output, s.as_bytes()))
                {
                    debug!(stop = %stop, "stop sequence matched");
                    progress.stop(StopReason::CustomStopper);
                }
            } else {
                self.fill_batch(&mut progress)?;
            }
        }

        // the last sampled token was never evaluated
        self.session.context_tokens.truncate(progress.n_past);

        let metrics = self.finish_metrics(&prepared, &progress);
        info!(
            ctx = %format!("{}/{}", metrics.context_used, metrics.context_limit),
            process_secs = %format!("{:.2}", metrics.process_secs),
            generate_secs = %format!("{:.2}", metrics.generate_secs),
            tokens_per_sec = %format!("{:.2}", metrics.tokens_per_sec),
            generated = metrics.generated_tokens,
            "generation finished"
        );
        Ok(GenerationOutput {
            status: GenerationStatus::Success,
            text: String::from_utf8_lossy(&progress.output).into_owned(),
            metrics,
        })
    }

    /// Moves pending input into the batch, dispatching image runs directly.
    fn fill_batch(&mut self, progress: &mut Progress) -> Result<()> {
        let batch_size = self.config.batch_size.max(1);
        while !progress.input_exhausted() {
            let token = progress.input[progress.consumed];
            if is_sentinel(token) {
                if !progress.batch.is_empty() {
                    break;
                }
                let mut counted = 0;
                while !progress.input_exhausted() && is_sentinel(progress.input[progress.consumed]) {
                    let sentinel = progress.input[progress.consumed];
                    self.session.window.push(sentinel);
                    self.session.context_tokens.push(sentinel);
                    progress.consumed += 1;
                    counted += 1;
                }
                self.session.splicer.evaluate(
                    &mut self.backend,
                    counted,
                    batch_size,
                    &mut progress.n_past,
                )?;
            } else {
                progress.batch.push(token);
                self.session.window.push(token);
                self.session.context_tokens.push(token);
                progress.consumed += 1;
                if progress.batch.len() >= batch_size {
                    break;
                }
            }
        }
        Ok(())
    }

    fn sample_next(
        &mut self,
        prepared: &PreparedRequest,
        suppressed: &[u32],
        sampler: &mut Sampler,
    ) -> Result<u32> {
        let n_vocab = self.backend.vocab_size();
        let raw = self.backend.logits();
        let mut logits = raw[..n_vocab.min(raw.len())].to_vec();
        if logits.is_empty() {
            return Err(KernelError::EmptyCandidates);
        }

        if !suppressed.is_empty() {
            let lowest = logits.iter().copied().fold(0.0f32, f32::min) - SUPPRESSION_MARGIN;
            for &id in suppressed {
                if let Some(logit) = logits.get_mut(id as usize) {
                    *logit = lowest;
                }
            }
        }

        let eos = self.backend.eos_token();
        if self.session.grammar.is_some() {
            self.session.ensure_pieces(&self.backend);
        }
        let params = SamplingParams {
            config: &prepared.sampling,
            order: &prepared.order,
            logit_biases: &prepared.logit_biases,
            recent: self.session.window.as_slice(),
            n_ctx: prepared.n_ctx,
        };
        let gate = self
            .session
            .grammar
            .as_ref()
            .map(|g| g.gate(&self.session.pieces, eos));
        sampler.sample(&logits, &params, gate, &mut self.session.mirostat)
    }

    fn accept_sampled(
        &mut self,
        id: u32,
        progress: &mut Progress,
        stream: &OutputStream,
    ) -> Result<()> {
        let eos = self.backend.eos_token();
        let piece = self.backend.detokenize(id);
        if let Some(grammar) = self.session.grammar.as_mut() {
            grammar.accept_token(id, &piece, eos)?;
        }

        self.session.window.push(id);
        self.session.context_tokens.push(id);
        progress.batch.push(id);
        progress.remaining -= 1;

        if id != eos {
            progress.output.extend_from_slice(&piece);
            stream.append(&piece);
        }
        Ok(())
    }

    fn finish_metrics(&self, prepared: &PreparedRequest, progress: &Progress) -> GenerationMetrics {
        let now = Instant::now();
        let sampling_started = progress.sampling_started.unwrap_or(now);
        let process_secs = sampling_started.duration_since(progress.started).as_secs_f64();
        let generate_secs = now.duration_since(sampling_started).as_secs_f64();
        let generated = prepared.max_length - progress.unused;

        let per_token_ms = |secs: f64, n: usize| if n == 0 { 0.0 } else { secs * 1000.0 / n as f64 };
        GenerationMetrics {
            generated_tokens: generated,
            prompt_tokens: progress.prompt_tokens,
            process_secs,
            generate_secs,
            process_ms_per_token: per_token_ms(process_secs, progress.prompt_tokens),
            generate_ms_per_token: per_token_ms(generate_secs, generated),
            tokens_per_sec: if generate_secs > 0.0 {
                generated as f64 / generate_secs
            } else {
                0.0
            },
            seed: prepared.seed,
            stop_reason: progress.stop_reason,
            context_used: progress.n_past,
            context_limit: prepared.n_ctx,
        }
    }
}

#[cfg(test)]
mod tests {
    use inference_protocol::{GenerationRequest, GenerationStatus, StopReason};

    use crate::config::ContextConfig;
    use crate::engine::{Engine, OutputStream};
    use crate::testing::{FixedImageEncoder, KvEdit, ScriptedBackend, BOS};

    fn request(prompt: &str, max_length: usize) -> GenerationRequest {
        let mut req = GenerationRequest::new(prompt);
        req.max_length = max_length;
        req.max_context_length = 64;
        req.seed = 42;
        req
    }

    fn engine(backend: ScriptedBackend) -> Engine<ScriptedBackend> {
        Engine::new(backend, ContextConfig::default())
    }

    #[test]
    fn stop_string_ends_generation_before_budget() {
        let backend = ScriptedBackend::new(&["hi", "ST", "OP", " more"]).with_script(&["ST", "OP", " more"]);
        let mut engine = engine(backend);
        let mut req = request("hi", 5);
        req.stop_sequence = vec!["STOP".to_string()];
        let stream = OutputStream::new();

        let out = engine.generate(&req, &stream);

        assert_eq!(out.status, GenerationStatus::Success);
        assert_eq!(out.metrics.stop_reason, StopReason::CustomStopper);
        assert_eq!(out.metrics.generated_tokens, 2);
        assert_eq!(out.text, "STOP");
        assert_eq!(stream.snapshot(), "STOP");
        assert!(stream.is_finished());
    }

    #[test]
    fn budget_exhaustion_and_suppressed_eos() {
        let backend = ScriptedBackend::new(&["hi", "a"]).with_script(&["a"]);
        let mut engine = engine(backend);
        let out = engine.generate(&request("hi", 3), &OutputStream::new());

        // EOS is suppressed, so the model keeps going after "a"
        assert_eq!(out.metrics.stop_reason, StopReason::OutOfTokens);
        assert_eq!(out.metrics.generated_tokens, 3);
        assert!(out.text.starts_with('a'));
    }

    #[test]
    fn unbanned_eos_stops_generation() {
        let backend = ScriptedBackend::new(&["hi", "a"]).with_script(&["a"]);
        let mut engine = engine(backend);
        let mut req = request("hi", 5);
        req.unban_eos = true;

        let out = engine.generate(&req, &OutputStream::new());

        assert_eq!(out.metrics.stop_reason, StopReason::EosTokenHit);
        assert_eq!(out.metrics.generated_tokens, 2);
        assert_eq!(out.text, "a");
    }

    #[test]
    fn second_request_fast_forwards_over_the_shared_prefix() {
        let backend = ScriptedBackend::new(&["x", "y", "z", "a"]).with_script(&["a"]);
        let journal = backend.journal();
        let mut engine = engine(backend);

        engine.generate(&request("xyz", 1), &OutputStream::new());
        let first_context = engine.session().context_tokens().to_vec();
        assert_eq!(first_context.len(), 4);
        journal.clear();

        let out = engine.generate(&request("xyzy", 1), &OutputStream::new());
        assert_eq!(out.status, GenerationStatus::Success);
        assert_eq!(out.metrics.prompt_tokens, 1);
        let edits = journal.snapshot();
        assert_eq!(edits[0], KvEdit::Remove(4, None));
        assert_eq!(edits[1], KvEdit::Evaluate(4, 1));
        assert_eq!(engine.backend().cached().len(), 5);
    }

    #[test]
    fn grammar_constrains_the_output() {
        let backend = ScriptedBackend::new(&["hi", "a", "b"]).with_script(&["a"]);
        let mut engine = engine(backend);
        let mut req = request("hi", 3);
        req.grammar = "root ::= \"b\"+".to_string();

        let out = engine.generate(&req, &OutputStream::new());

        assert_eq!(out.status, GenerationStatus::Success);
        assert_eq!(out.text, "bbb");
    }

    #[test]
    fn invalid_grammar_is_ignored() {
        let backend = ScriptedBackend::new(&["hi", "a"]).with_script(&["a"]);
        let mut engine = engine(backend);
        let mut req = request("hi", 1);
        req.grammar = "root ::= (".to_string();

        let out = engine.generate(&req, &OutputStream::new());

        assert_eq!(out.status, GenerationStatus::Success);
        assert_eq!(out.text, "a");
    }

    #[test]
    fn backend_failure_reports_failed_and_clears_the_session() {
        let backend = ScriptedBackend::new(&["hi"]).failing();
        let journal = backend.journal();
        let mut engine = engine(backend);

        let out = engine.generate(&request("hi", 3), &OutputStream::new());

        assert_eq!(out.status, GenerationStatus::Failed);
        assert!(out.text.is_empty());
        assert!(engine.session().context_tokens().is_empty());
        assert_eq!(journal.snapshot().last(), Some(&KvEdit::Clear));
    }

    #[test]
    fn abort_zeroes_the_budget() {
        let backend = ScriptedBackend::new(&["hi", "a"]).with_script(&["a"]);
        let mut engine = engine(backend);
        let stream = OutputStream::new();
        stream.request_abort();

        let out = engine.generate(&request("hi", 4), &stream);

        assert_eq!(out.status, GenerationStatus::Success);
        assert_eq!(out.metrics.stop_reason, StopReason::OutOfTokens);
        assert_eq!(out.metrics.generated_tokens, 0);
        assert!(out.text.is_empty());
        assert!(stream.is_finished());
    }

    #[test]
    fn run_request_leaves_the_stream_open() {
        let backend = ScriptedBackend::new(&["hi", "a"]).with_script(&["a"]);
        let mut engine = engine(backend);
        let stream = OutputStream::new();

        let out = engine.run_request(&request("hi", 2), &stream);

        assert_eq!(out.status, GenerationStatus::Success);
        assert!(!stream.is_finished());
        assert_eq!(stream.snapshot(), out.text);
    }

    #[test]
    fn images_are_spliced_and_reevaluated_when_they_change() {
        let backend = ScriptedBackend::new(&["hi", "a"]).with_script(&["a"]);
        let journal = backend.journal();
        let mut engine = Engine::with_image_encoder(
            backend,
            ContextConfig::default(),
            Some(Box::new(FixedImageEncoder::new(3, 4))),
        );

        let mut req = request("hi", 1);
        req.images = vec!["first".to_string()];
        let out = engine.generate(&req, &OutputStream::new());
        assert_eq!(out.status, GenerationStatus::Success);
        let context = engine.session().context_tokens().to_vec();
        assert_eq!(context[0], BOS);
        assert!(context[1..4].iter().all(|&t| crate::multimodal::is_sentinel(t)));
        assert!(journal.snapshot().contains(&KvEdit::Embedding(1, 3)));

        // same images: embeddings reused
        journal.clear();
        engine.generate(&req, &OutputStream::new());
        assert!(!journal
            .snapshot()
            .iter()
            .any(|e| matches!(e, KvEdit::Embedding(..))));

        // changed image: sentinel id flips and the embedding is evaluated again
        journal.clear();
        req.images = vec!["second".to_string()];
        engine.generate(&req, &OutputStream::new());
        assert!(journal.snapshot().contains(&KvEdit::Embedding(1, 3)));
        assert_ne!(engine.session().context_tokens()[1], context[1]);
    }
}
