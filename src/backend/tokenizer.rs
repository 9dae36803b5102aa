use std::path::{Path, PathBuf};

use anyhow::{Error as E, Result};
use tokenizers::Tokenizer;
use tracing::info;

use super::ModelFamily;

pub(super) fn resolve_tokenizer_path(model_path: &Path, tokenizer_hint: Option<&Path>) -> Option<PathBuf> {
    if let Some(hint) = tokenizer_hint {
        if hint.exists() {
            return Some(hint.to_path_buf());
        }
    }

    let parent_dir = model_path.parent().unwrap_or(Path::new("."));
    let local_tok_path = parent_dir.join("tokenizer.json");
    if local_tok_path.exists() {
        return Some(local_tok_path);
    }

    let root_tok_path = Path::new("tokenizer.json");
    if root_tok_path.exists() {
        return Some(root_tok_path.to_path_buf());
    }

    let models_tok_path = Path::new("models").join("tokenizer.json");
    if models_tok_path.exists() {
        return Some(models_tok_path);
    }

    None
}

pub(super) fn load_tokenizer(
    model_path: &Path,
    tokenizer_hint: Option<&Path>,
    tokenizer_repo: Option<&str>,
) -> Result<Tokenizer> {
    let path = match resolve_tokenizer_path(model_path, tokenizer_hint) {
        Some(path) => path,
        None => {
            let repo = tokenizer_repo.ok_or_else(|| {
                E::msg("tokenizer.json not found next to the model and no tokenizer_repo configured")
            })?;
            info!(repo, "tokenizer.json not found locally, fetching from the hub");
            let api = hf_hub::api::sync::Api::new()?;
            api.model(repo.to_string()).get("tokenizer.json")?
        }
    };
    info!(path = %path.display(), "loading tokenizer");
    Tokenizer::from_file(path).map_err(E::msg)
}

pub(super) fn resolve_eos_token(tokenizer: &Tokenizer, family: ModelFamily) -> u32 {
    let candidates: &[&str] = match family {
        ModelFamily::Llama => &["<|end_of_text|>", "</s>", "<|eot_id|>"],
        ModelFamily::Qwen => &["<|endoftext|>", "<|im_end|>", "</s>"],
        ModelFamily::Mistral => &["</s>", "<|end_of_text|>"],
        ModelFamily::Unknown => &["<|end_of_text|>", "</s>", "<|endoftext|>"],
    };

    candidates
        .iter()
        .find_map(|marker| tokenizer.token_to_id(marker))
        .unwrap_or(2)
}
