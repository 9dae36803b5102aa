use inference_protocol::GenerationRequest;

/// Decodes a `GENERATE` body. Every field but `prompt` may be omitted.
pub(crate) fn parse_generation_payload(payload: &[u8]) -> Result<GenerationRequest, String> {
    if payload.is_empty() {
        return Err("GENERATE payload is empty. Send a JSON request body.".to_string());
    }
    let request: GenerationRequest =
        serde_json::from_slice(payload).map_err(|e| format!("Invalid request JSON: {}", e))?;

    if request.max_context_length < 2 {
        return Err("max_context_length must be at least 2".to_string());
    }
    if request.max_length == 0 {
        return Err("max_length must be at least 1".to_string());
    }
    let s = &request.sampling;
    if s.temperature.is_nan() || s.top_p.is_nan() || s.rep_pen.is_nan() {
        return Err("sampling parameters must be numbers".to_string());
    }
    Ok(request)
}

pub(crate) fn parse_text_payload(payload: &[u8], verb: &str) -> Result<String, String> {
    String::from_utf8(payload.to_vec()).map_err(|_| format!("{} payload must be valid UTF-8", verb))
}

#[cfg(test)]
mod tests {
    use super::*;
    use inference_protocol::{MirostatMode, SamplerStage};

    #[test]
    fn parses_flattened_sampling_fields() {
        let body = br#"{"prompt":"hi","max_length":4,"temperature":0.2,"mirostat":2,"sampler_order":[6,5],"unban_tokens":true}"#;
        let req = parse_generation_payload(body).unwrap();
        assert_eq!(req.prompt, "hi");
        assert_eq!(req.max_length, 4);
        assert_eq!(req.sampling.temperature, 0.2);
        assert_eq!(req.sampling.mirostat, MirostatMode::V2);
        assert_eq!(
            req.sampler_order,
            vec![SamplerStage::RepetitionPenalty, SamplerStage::Temperature]
        );
        assert!(req.unban_eos);
        assert_eq!(req.max_context_length, 512);
    }

    #[test]
    fn rejects_bad_bodies() {
        assert!(parse_generation_payload(b"").is_err());
        assert!(parse_generation_payload(b"{not json").is_err());
        assert!(parse_generation_payload(br#"{"prompt":"x","max_length":0}"#).is_err());
        assert!(parse_generation_payload(br#"{"sampler_order":[9]}"#).is_err());
    }
}
