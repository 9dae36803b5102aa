use inference_kernel::testing::{KvEdit, ScriptedBackend};
use inference_kernel::{
    ContextConfig, Engine, GenerationRequest, GenerationStatus, Kernel, KernelError, StopReason,
};

fn request(prompt: &str, max_length: usize) -> GenerationRequest {
    let mut req = GenerationRequest::new(prompt);
    req.max_length = max_length;
    req.max_context_length = 64;
    req.seed = 11;
    req
}

#[test]
fn streamed_text_matches_the_final_result() {
    let backend = ScriptedBackend::new(&["Once", " upon", " a", " time"])
        .with_script(&[" upon", " a", " time"]);
    let kernel = Kernel::new(Engine::new(backend, ContextConfig::default()));

    let mut req = request("Once", 10);
    req.unban_eos = true;
    let handle = kernel.start_generation(req).unwrap();
    let out = handle.wait();

    assert_eq!(out.status, GenerationStatus::Success);
    assert_eq!(out.text, " upon a time");
    assert_eq!(out.metrics.stop_reason, StopReason::EosTokenHit);
    assert_eq!(out.metrics.generated_tokens, 4);
    let polled = kernel.poll();
    assert!(polled.finished);
    assert_eq!(polled.text, out.text);
}

#[test]
fn continuation_reuses_the_cached_prefix() {
    let backend = ScriptedBackend::new(&["A", "B", "C"]).with_script(&["C"]);
    let journal = backend.journal();
    let kernel = Kernel::new(Engine::new(backend, ContextConfig::default()));

    let first = kernel.generate(request("AB", 1)).unwrap();
    assert_eq!(first.text, "C");
    journal.clear();

    // the client appends the reply and continues
    let second = kernel.generate(request("ABCA", 1)).unwrap();
    assert_eq!(second.status, GenerationStatus::Success);
    assert_eq!(second.metrics.prompt_tokens, 2);
    assert_eq!(
        journal.snapshot(),
        vec![KvEdit::Remove(3, None), KvEdit::Evaluate(3, 2)]
    );
}

#[test]
fn stop_sequence_spanning_tokens() {
    let backend = ScriptedBackend::new(&["Q", "ans", "wer", "\n", "Q2"])
        .with_script(&["ans", "wer", "\n", "Q2"]);
    let kernel = Kernel::new(Engine::new(backend, ContextConfig::default()));

    let mut req = request("Q", 16);
    req.stop_sequence = vec!["wer\n".to_string()];
    let out = kernel.generate(req).unwrap();

    assert_eq!(out.metrics.stop_reason, StopReason::CustomStopper);
    assert_eq!(out.text, "answer\n");
    assert_eq!(out.metrics.generated_tokens, 3);
}

#[test]
fn failures_are_reported_and_the_next_request_starts_clean() {
    let backend = ScriptedBackend::new(&["x"]).failing();
    let kernel = Kernel::new(Engine::new(backend, ContextConfig::default()));

    let out = kernel.generate(request("x", 2)).unwrap();
    assert_eq!(out.status, GenerationStatus::Failed);
    assert!(out.text.is_empty());
    assert!(kernel.poll().finished);
    assert!(!kernel.is_busy());
}

#[test]
fn only_one_generation_at_a_time() {
    let backend = ScriptedBackend::new(&["x", "y"]).with_script(&["y"]);
    let kernel = Kernel::new(Engine::new(backend, ContextConfig::default()));

    let handle = kernel.start_generation(request("x", 48)).unwrap();
    match kernel.start_generation(request("x", 1)) {
        Err(KernelError::Busy) => {}
        // the first request may already have finished
        Ok(second) => {
            second.wait();
        }
        Err(other) => panic!("unexpected error: {}", other),
    }
    handle.abort();
    let out = handle.wait();
    assert_eq!(out.status, GenerationStatus::Success);
    assert!(out.metrics.generated_tokens <= 48);
}
