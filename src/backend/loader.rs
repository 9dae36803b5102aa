use std::fs::File;
use std::path::Path;

use anyhow::{bail, Error as E, Result};
use candle_core::quantized::gguf_file;
use candle_core::Device;
use candle_transformers::models::quantized_llama;
use candle_transformers::models::quantized_qwen2;
use tracing::{info, warn};

use crate::config::ModelConfig;

use super::candle::{CandleBackend, RuntimeModel};
use super::tokenizer::{load_tokenizer, resolve_eos_token};
use super::ModelFamily;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendVariant {
    QuantizedLlama,
    QuantizedQwen2,
}

pub enum LoadOutcome {
    Loaded(RuntimeModel),
    /// The file is readable but laid out for another variant.
    RetryNext(String),
    Failed(E),
}

impl BackendVariant {
    fn architectures(&self) -> &'static [&'static str] {
        match self {
            BackendVariant::QuantizedLlama => &["llama", "mistral"],
            BackendVariant::QuantizedQwen2 => &["qwen2"],
        }
    }

    pub fn try_load(&self, path: &Path, device: &Device) -> LoadOutcome {
        let mut file = match File::open(path) {
            Ok(f) => f,
            Err(e) => return LoadOutcome::Failed(E::msg(format!("Failed to open model file: {}", e))),
        };
        let content = match gguf_file::Content::read(&mut file) {
            Ok(c) => c,
            Err(e) => return LoadOutcome::Failed(E::msg(format!("Not a readable GGUF file: {}", e))),
        };

        if let Some(arch) = content
            .metadata
            .get("general.architecture")
            .and_then(|v| v.to_string().ok())
        {
            if !self.architectures().contains(&arch.as_str()) {
                return LoadOutcome::RetryNext(format!("architecture '{}' not handled by {:?}", arch, self));
            }
        }

        let loaded = match self {
            BackendVariant::QuantizedLlama => {
                quantized_llama::ModelWeights::from_gguf(content, &mut file, device).map(RuntimeModel::Llama)
            }
            BackendVariant::QuantizedQwen2 => {
                quantized_qwen2::ModelWeights::from_gguf(content, &mut file, device).map(RuntimeModel::Qwen2)
            }
        };

        match loaded {
            Ok(model) => LoadOutcome::Loaded(model),
            Err(e) => {
                let msg = format!("{}", e);
                if msg.contains("cannot find tensor info") {
                    LoadOutcome::RetryNext(msg)
                } else {
                    LoadOutcome::Failed(E::msg(msg))
                }
            }
        }
    }
}

/// Variants to try, most likely first.
pub fn candidate_order(family: ModelFamily) -> Vec<BackendVariant> {
    match family {
        ModelFamily::Qwen => vec![BackendVariant::QuantizedQwen2, BackendVariant::QuantizedLlama],
        ModelFamily::Llama | ModelFamily::Mistral | ModelFamily::Unknown => {
            vec![BackendVariant::QuantizedLlama, BackendVariant::QuantizedQwen2]
        }
    }
}

pub fn load_backend(cfg: &ModelConfig) -> Result<CandleBackend> {
    let device = Device::Cpu;
    let family = cfg
        .family
        .as_deref()
        .map(ModelFamily::from_hint)
        .filter(|f| *f != ModelFamily::Unknown)
        .unwrap_or_else(|| {
            cfg.path
                .file_stem()
                .and_then(|s| s.to_str())
                .map(ModelFamily::from_hint)
                .unwrap_or(ModelFamily::Unknown)
        });

    info!(path = %cfg.path.display(), ?family, "loading model");

    for variant in candidate_order(family) {
        match variant.try_load(&cfg.path, &device) {
            LoadOutcome::Loaded(model) => {
                let tokenizer = load_tokenizer(
                    &cfg.path,
                    cfg.tokenizer.as_deref(),
                    cfg.tokenizer_repo.as_deref(),
                )?;
                let eos = resolve_eos_token(&tokenizer, family);
                info!(?variant, eos, "model loaded");
                return Ok(CandleBackend::new(model, tokenizer, eos, device));
            }
            LoadOutcome::RetryNext(reason) => {
                warn!(?variant, %reason, "backend variant rejected the model, trying next");
            }
            LoadOutcome::Failed(e) => return Err(e),
        }
    }

    bail!("no backend variant could load {}", cfg.path.display())
}
