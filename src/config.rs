use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{KernelError, Result};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub server: ServerConfig,
    pub model: ModelConfig,
    pub context: ContextConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:6380".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub path: PathBuf,
    pub tokenizer: Option<PathBuf>,
    /// Hugging Face repo used to fetch `tokenizer.json` when none is on disk.
    pub tokenizer_repo: Option<String>,
    pub family: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub batch_size: usize,
    pub smart_context: bool,
    pub context_shift: bool,
    pub banned_tokens: Vec<String>,
    pub shift: ShiftPolicy,
    pub smart: SmartContextPolicy,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            batch_size: 512,
            smart_context: false,
            context_shift: true,
            banned_tokens: Vec::new(),
            shift: ShiftPolicy::default(),
            smart: SmartContextPolicy::default(),
        }
    }
}

/// Thresholds for purging a stale middle slice out of the KV cache.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct ShiftPolicy {
    pub shortfall_base: usize,
    pub shortfall_ctx_divisor: usize,
    pub slack_base: usize,
    pub slack_ctx_divisor: usize,
    pub lcs_ctx_ratio: f32,
    pub min_tokens: usize,
}

impl Default for ShiftPolicy {
    fn default() -> Self {
        Self {
            shortfall_base: 200,
            shortfall_ctx_divisor: 30,
            slack_base: 60,
            slack_ctx_divisor: 50,
            lcs_ctx_ratio: 0.45,
            min_tokens: 6,
        }
    }
}

impl ShiftPolicy {
    /// Minimum distance between the first divergence and the end of the
    /// new input before a purge is considered.
    pub fn shortfall(&self, n_ctx: usize) -> usize {
        self.shortfall_base + ratio_of(n_ctx, self.shortfall_ctx_divisor)
    }

    pub fn slack(&self, n_ctx: usize) -> usize {
        self.slack_base + ratio_of(n_ctx, self.slack_ctx_divisor)
    }
}

fn ratio_of(n: usize, divisor: usize) -> usize {
    if divisor == 0 {
        0
    } else {
        n / divisor
    }
}

/// Thresholds for the lossy smart-context eviction.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct SmartContextPolicy {
    pub ctx_len_ratio: f32,
    pub input_len_ratio: f32,
    pub past_gap_ratio: f32,
    pub truncation_ratio: f32,
    pub similarity_base: usize,
    pub similarity_ctx_ratio: f32,
}

impl Default for SmartContextPolicy {
    fn default() -> Self {
        Self {
            ctx_len_ratio: 0.8,
            input_len_ratio: 0.6,
            past_gap_ratio: 0.5,
            truncation_ratio: 0.5,
            similarity_base: 32,
            similarity_ctx_ratio: 0.05,
        }
    }
}

impl SmartContextPolicy {
    fn ratios(&self) -> [(&'static str, f32); 5] {
        [
            ("ctx_len_ratio", self.ctx_len_ratio),
            ("input_len_ratio", self.input_len_ratio),
            ("past_gap_ratio", self.past_gap_ratio),
            ("truncation_ratio", self.truncation_ratio),
            ("similarity_ctx_ratio", self.similarity_ctx_ratio),
        ]
    }
}

impl KernelConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let cfg: KernelConfig =
            toml::from_str(raw).map_err(|e| KernelError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.context.batch_size == 0 {
            return Err(KernelError::Config("context.batch_size must be > 0".to_string()));
        }

        let mut ratios = self.context.smart.ratios().to_vec();
        ratios.push(("shift.lcs_ctx_ratio", self.context.shift.lcs_ctx_ratio));
        for (name, value) in ratios {
            if !(0.0..=1.0).contains(&value) {
                return Err(KernelError::Config(format!(
                    "{} must be in [0.0, 1.0], got {}",
                    name, value
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let cfg = KernelConfig::from_toml_str("").unwrap();
        assert_eq!(cfg.context.batch_size, 512);
        assert_eq!(cfg.context.shift, ShiftPolicy::default());
        assert_eq!(cfg.server.addr, "127.0.0.1:6380");
    }

    #[test]
    fn nested_thresholds_are_overridable() {
        let cfg = KernelConfig::from_toml_str(
            r#"
            [model]
            path = "models/tiny.gguf"

            [context]
            batch_size = 64
            smart_context = true
            banned_tokens = ["<|im_start|>"]

            [context.shift]
            shortfall_base = 0
            slack_base = 4
            "#,
        )
        .unwrap();
        assert_eq!(cfg.model.path, PathBuf::from("models/tiny.gguf"));
        assert!(cfg.context.smart_context);
        assert_eq!(cfg.context.shift.shortfall_base, 0);
        assert_eq!(cfg.context.shift.slack(100), 4 + 2);
        assert_eq!(cfg.context.banned_tokens, vec!["<|im_start|>".to_string()]);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = KernelConfig::from_toml_str("[context]\nbatch_size = 0\n").unwrap_err();
        assert!(matches!(err, KernelError::Config(_)));

        let err =
            KernelConfig::from_toml_str("[context.smart]\ntruncation_ratio = 1.5\n").unwrap_err();
        assert!(err.to_string().contains("truncation_ratio"));
    }

    #[test]
    fn zero_divisor_disables_scaling() {
        let policy = ShiftPolicy {
            shortfall_base: 10,
            shortfall_ctx_divisor: 0,
            ..ShiftPolicy::default()
        };
        assert_eq!(policy.shortfall(4096), 10);
    }
}
