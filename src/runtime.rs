//! Request lifecycle around a single engine: one generation at a time on a
//! worker thread, with polling and abort from the network loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, TryLockError};
use std::thread::{self, JoinHandle};

use inference_protocol::{GenerationMetrics, GenerationRequest};
use tracing::{info, warn};

use crate::backend::Backend;
use crate::engine::{Engine, GenerationOutput, OutputStream};
use crate::error::{KernelError, Result};

/// Progress of the current (or last) generation as seen by pollers.
#[derive(Debug, Clone, PartialEq)]
pub struct PollState {
    pub text: String,
    pub finished: bool,
}

pub struct Kernel<B: Backend + 'static> {
    engine: Arc<Mutex<Engine<B>>>,
    stream: Arc<OutputStream>,
    last: Arc<Mutex<Option<GenerationOutput>>>,
    busy: Arc<AtomicBool>,
}

/// One started generation. Once a newer generation begins on the same
/// kernel, the handle no longer touches the shared stream: `abort` does
/// nothing and `poll_output` reports this generation's final text.
pub struct GenerationHandle {
    id: u64,
    stream: Arc<OutputStream>,
    result: Arc<Mutex<Option<GenerationOutput>>>,
    join: JoinHandle<()>,
}

impl<B: Backend + 'static> Kernel<B> {
    pub fn new(engine: Engine<B>) -> Self {
        let stream = OutputStream::new();
        stream.mark_finished();
        Self {
            engine: Arc::new(Mutex::new(engine)),
            stream: Arc::new(stream),
            last: Arc::new(Mutex::new(None)),
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Starts `request` on a worker thread. Fails with [`KernelError::Busy`]
    /// while another generation is running.
    pub fn start_generation(&self, request: GenerationRequest) -> Result<GenerationHandle> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(KernelError::Busy);
        }
        let id = self.stream.reset();
        let result = Arc::new(Mutex::new(None));

        let engine = Arc::clone(&self.engine);
        let stream = Arc::clone(&self.stream);
        let last = Arc::clone(&self.last);
        let slot = Arc::clone(&result);
        let busy = Arc::clone(&self.busy);
        let spawned = thread::Builder::new()
            .name("generation".to_string())
            .spawn(move || {
                let output = engine.lock().unwrap().run_request(&request, &stream);
                *slot.lock().unwrap() = Some(output.clone());
                *last.lock().unwrap() = Some(output);
                // published before pollers can observe `finished`
                stream.mark_finished();
                busy.store(false, Ordering::SeqCst);
            });

        match spawned {
            Ok(join) => Ok(GenerationHandle {
                id,
                stream: Arc::clone(&self.stream),
                result,
                join,
            }),
            Err(e) => {
                self.stream.mark_finished();
                self.busy.store(false, Ordering::SeqCst);
                Err(e.into())
            }
        }
    }

    /// Runs `request` to completion on the calling thread's behalf.
    pub fn generate(&self, request: GenerationRequest) -> Result<GenerationOutput> {
        Ok(self.start_generation(request)?.wait())
    }

    pub fn poll(&self) -> PollState {
        PollState {
            text: self.stream.snapshot(),
            finished: self.stream.is_finished(),
        }
    }

    /// Asks the running generation to stop. Returns whether one was running.
    pub fn abort(&self) -> bool {
        if !self.is_busy() {
            return false;
        }
        info!("abort requested");
        self.stream.request_abort();
        true
    }

    pub fn last_output(&self) -> Option<GenerationOutput> {
        self.last.lock().unwrap().clone()
    }

    /// Token count of `text`, BOS included. Unavailable while a generation
    /// holds the engine.
    pub fn token_count(&self, text: &str) -> Result<usize> {
        match self.engine.try_lock() {
            Ok(engine) => engine.token_count(text),
            Err(TryLockError::WouldBlock) => Err(KernelError::Busy),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().token_count(text),
        }
    }
}

impl GenerationHandle {
    pub fn poll_output(&self) -> String {
        match self.stream.snapshot_for(self.id) {
            Some(text) => text,
            None => self
                .result
                .lock()
                .unwrap()
                .as_ref()
                .map(|out| out.text.clone())
                .unwrap_or_default(),
        }
    }

    /// Stops this generation. Returns false if a newer one has started.
    pub fn abort(&self) -> bool {
        self.stream.request_abort_for(self.id)
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub fn wait(self) -> GenerationOutput {
        if self.join.join().is_err() {
            warn!("generation worker panicked");
            if self.stream.generation() == self.id {
                self.stream.mark_finished();
            }
            return GenerationOutput::failed(GenerationMetrics::default());
        }
        self.result
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| GenerationOutput::failed(GenerationMetrics::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContextConfig;
    use crate::testing::ScriptedBackend;
    use inference_protocol::{GenerationStatus, StopReason};

    fn kernel() -> Kernel<ScriptedBackend> {
        let backend = ScriptedBackend::new(&["hi", "ST", "OP"]).with_script(&["ST", "OP"]);
        Kernel::new(Engine::new(backend, ContextConfig::default()))
    }

    fn request(max_length: usize) -> GenerationRequest {
        let mut req = GenerationRequest::new("hi");
        req.max_length = max_length;
        req.max_context_length = 32;
        req.seed = 7;
        req.stop_sequence = vec!["STOP".to_string()];
        req
    }

    #[test]
    fn generation_runs_on_a_worker() {
        let kernel = kernel();
        assert!(kernel.poll().finished);

        let out = kernel.generate(request(8)).unwrap();
        assert_eq!(out.status, GenerationStatus::Success);
        assert_eq!(out.metrics.stop_reason, StopReason::CustomStopper);
        assert_eq!(kernel.poll(), PollState { text: "STOP".into(), finished: true });
        assert_eq!(kernel.last_output(), Some(out));
        assert!(!kernel.is_busy());
    }

    #[test]
    fn token_count_includes_bos() {
        let kernel = kernel();
        assert_eq!(kernel.token_count("hiST").unwrap(), 3);
    }

    #[test]
    fn abort_without_generation_is_a_no_op() {
        assert!(!kernel().abort());
    }

    fn looping_kernel() -> Kernel<ScriptedBackend> {
        let backend = ScriptedBackend::new(&["hi", "a"]).with_script(&["a"]);
        Kernel::new(Engine::new(backend, ContextConfig::default()))
    }

    fn long_request() -> GenerationRequest {
        let mut req = GenerationRequest::new("hi");
        req.max_length = 200;
        req.max_context_length = 256;
        req.seed = 7;
        req
    }

    #[test]
    fn abort_right_after_start_is_honoured() {
        let kernel = looping_kernel();
        let handle = kernel.start_generation(long_request()).unwrap();
        assert!(handle.abort());

        let out = handle.wait();
        assert_eq!(out.status, GenerationStatus::Success);
        assert!(out.metrics.generated_tokens < 200);
    }

    #[test]
    fn finished_poll_sees_the_published_result() {
        let kernel = looping_kernel();
        let mut req = long_request();
        req.max_length = 3;
        let handle = kernel.start_generation(req).unwrap();

        while !kernel.poll().finished {
            std::thread::yield_now();
        }
        let last = kernel.last_output().expect("result published before finished");
        assert_eq!(last.metrics.generated_tokens, 3);
        assert_eq!(handle.wait(), last);
    }

    #[test]
    fn stale_handle_cannot_touch_a_newer_generation() {
        let kernel = looping_kernel();
        let mut short = long_request();
        short.max_length = 2;
        let first = kernel.start_generation(short).unwrap();
        while kernel.is_busy() {
            std::thread::yield_now();
        }
        let first_text = kernel.poll().text;

        let second = kernel.start_generation(long_request()).unwrap();
        assert!(!first.abort());
        assert_eq!(first.poll_output(), first_text);

        let out = second.wait();
        assert_eq!(out.metrics.generated_tokens, 200);
        assert_eq!(first.wait().text, first_text);
    }
}
