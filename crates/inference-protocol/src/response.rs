use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    #[default]
    OutOfTokens,
    EosTokenHit,
    CustomStopper,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    Success,
    Failed,
}

/// Timing and accounting for one finished request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationMetrics {
    pub generated_tokens: usize,
    pub prompt_tokens: usize,
    pub process_secs: f64,
    pub generate_secs: f64,
    pub process_ms_per_token: f64,
    pub generate_ms_per_token: f64,
    pub tokens_per_sec: f64,
    pub seed: u32,
    pub stop_reason: StopReason,
    pub context_used: usize,
    pub context_limit: usize,
}
