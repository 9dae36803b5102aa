use serde::{Deserialize, Serialize};

use crate::ProtocolError;

/// One stage of the generic sampling pipeline.
///
/// Serialized as the historical integer ids so existing clients can keep
/// sending `sampler_order: [6, 0, 1, 3, 4, 2, 5]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum SamplerStage {
    TopK,
    TopA,
    TopP,
    TailFree,
    Typical,
    Temperature,
    RepetitionPenalty,
}

impl SamplerStage {
    pub const DEFAULT_ORDER: [SamplerStage; 7] = [
        SamplerStage::RepetitionPenalty,
        SamplerStage::TopK,
        SamplerStage::TopA,
        SamplerStage::TailFree,
        SamplerStage::Typical,
        SamplerStage::TopP,
        SamplerStage::Temperature,
    ];
}

impl TryFrom<u8> for SamplerStage {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::TopK),
            1 => Ok(Self::TopA),
            2 => Ok(Self::TopP),
            3 => Ok(Self::TailFree),
            4 => Ok(Self::Typical),
            5 => Ok(Self::Temperature),
            6 => Ok(Self::RepetitionPenalty),
            other => Err(ProtocolError::InvalidSampler(other)),
        }
    }
}

impl From<SamplerStage> for u8 {
    fn from(stage: SamplerStage) -> Self {
        match stage {
            SamplerStage::TopK => 0,
            SamplerStage::TopA => 1,
            SamplerStage::TopP => 2,
            SamplerStage::TailFree => 3,
            SamplerStage::Typical => 4,
            SamplerStage::Temperature => 5,
            SamplerStage::RepetitionPenalty => 6,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum MirostatMode {
    #[default]
    Disabled,
    V1,
    V2,
}

impl TryFrom<u8> for MirostatMode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Disabled),
            1 => Ok(Self::V1),
            2 => Ok(Self::V2),
            other => Err(ProtocolError::InvalidMirostat(other)),
        }
    }
}

impl From<MirostatMode> for u8 {
    fn from(mode: MirostatMode) -> Self {
        match mode {
            MirostatMode::Disabled => 0,
            MirostatMode::V1 => 1,
            MirostatMode::V2 => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LogitBias {
    pub token_id: u32,
    pub bias: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub temperature: f32,
    pub top_k: i32,
    pub top_a: f32,
    pub top_p: f32,
    pub min_p: f32,
    pub typical_p: f32,
    pub tfs: f32,
    pub rep_pen: f32,
    pub rep_pen_range: i32,
    pub presence_penalty: f32,
    pub mirostat: MirostatMode,
    pub mirostat_tau: f32,
    pub mirostat_eta: f32,
    pub dynatemp_range: f32,
    pub dynatemp_exponent: f32,
    pub smoothing_factor: f32,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_k: 100,
            top_a: 0.0,
            top_p: 0.92,
            min_p: 0.0,
            typical_p: 1.0,
            tfs: 1.0,
            rep_pen: 1.0,
            rep_pen_range: 128,
            presence_penalty: 0.0,
            mirostat: MirostatMode::Disabled,
            mirostat_tau: 5.0,
            mirostat_eta: 0.1,
            dynatemp_range: 0.0,
            dynatemp_exponent: 1.0,
            smoothing_factor: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationRequest {
    pub prompt: String,
    pub memory: String,
    pub images: Vec<String>,
    pub max_context_length: usize,
    pub max_length: usize,
    #[serde(flatten)]
    pub sampling: SamplingConfig,
    /// Empty means [`SamplerStage::DEFAULT_ORDER`].
    pub sampler_order: Vec<SamplerStage>,
    pub stop_sequence: Vec<String>,
    pub logit_biases: Vec<LogitBias>,
    pub grammar: String,
    pub grammar_retain_state: bool,
    /// Lets the end-of-sequence token be sampled (and end the request)
    /// instead of being suppressed.
    #[serde(alias = "unban_tokens")]
    pub unban_eos: bool,
    /// `<= 0` or `0xFFFFFFFF` picks a random seed.
    pub seed: i64,
}

impl Default for GenerationRequest {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            memory: String::new(),
            images: Vec::new(),
            max_context_length: 512,
            max_length: 32,
            sampling: SamplingConfig::default(),
            sampler_order: Vec::new(),
            stop_sequence: Vec::new(),
            logit_biases: Vec::new(),
            grammar: String::new(),
            grammar_retain_state: false,
            unban_eos: false,
            seed: -1,
        }
    }
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn sampler_order(&self) -> Vec<SamplerStage> {
        if self.sampler_order.is_empty() {
            SamplerStage::DEFAULT_ORDER.to_vec()
        } else {
            self.sampler_order.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sampler_order_accepts_integer_ids() {
        let req: GenerationRequest =
            serde_json::from_str(r#"{"prompt":"hi","sampler_order":[6,0,5]}"#).unwrap();
        assert_eq!(
            req.sampler_order,
            vec![
                SamplerStage::RepetitionPenalty,
                SamplerStage::TopK,
                SamplerStage::Temperature
            ]
        );
    }

    #[test]
    fn unknown_sampler_id_is_rejected() {
        let res: Result<GenerationRequest, _> =
            serde_json::from_str(r#"{"prompt":"hi","sampler_order":[9]}"#);
        assert!(res.is_err());
    }

    #[test]
    fn flattened_sampling_fields_and_defaults() {
        let req: GenerationRequest =
            serde_json::from_str(r#"{"prompt":"x","temperature":0.2,"mirostat":2}"#).unwrap();
        assert_eq!(req.sampling.temperature, 0.2);
        assert_eq!(req.sampling.mirostat, MirostatMode::V2);
        assert_eq!(req.sampling.top_k, 100);
        assert_eq!(req.sampler_order(), SamplerStage::DEFAULT_ORDER.to_vec());
    }
}
