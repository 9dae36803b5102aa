//! Token selection: logit biases, grammar gating, then either a mirostat
//! controller or the configurable stage pipeline.

mod candidates;
mod mirostat;

pub use candidates::{CandidateSet, TokenData, GREEDY_TEMPERATURE};
pub use mirostat::{sample_v1, sample_v2, MirostatState};

use inference_protocol::{LogitBias, MirostatMode, SamplerStage, SamplingConfig};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::trace;

use crate::error::Result;
use crate::grammar::GrammarGate;

/// Per-step view of the request the sampler needs.
#[derive(Debug, Clone, Copy)]
pub struct SamplingParams<'a> {
    pub config: &'a SamplingConfig,
    pub order: &'a [SamplerStage],
    pub logit_biases: &'a [LogitBias],
    /// Recent-token window, oldest first.
    pub recent: &'a [u32],
    pub n_ctx: usize,
}

impl SamplingParams<'_> {
    fn penalty_window(&self) -> &[u32] {
        let range = self.config.rep_pen_range.max(1) as usize;
        let last_n = self.recent.len().min(range).min(self.n_ctx);
        &self.recent[self.recent.len() - last_n..]
    }
}

pub struct Sampler {
    rng: StdRng,
}

impl Sampler {
    pub fn new(seed: u32) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed as u64),
        }
    }

    pub fn sample(
        &mut self,
        logits: &[f32],
        params: &SamplingParams<'_>,
        grammar: Option<GrammarGate<'_>>,
        mirostat: &mut MirostatState,
    ) -> Result<u32> {
        let cfg = params.config;
        let mut candidates = CandidateSet::from_logits(logits);

        for bias in params.logit_biases {
            if let Some(logit) = candidates.logit_mut(bias.token_id as usize) {
                *logit += bias.bias;
            }
        }

        if let Some(gate) = grammar {
            gate.apply(&mut candidates);
        }

        match cfg.mirostat {
            MirostatMode::V1 | MirostatMode::V2 => {
                candidates.repetition_penalty(
                    params.penalty_window(),
                    cfg.rep_pen,
                    cfg.presence_penalty,
                );
                scale_temperature(&mut candidates, cfg.temperature, cfg.smoothing_factor);
                let mu = mirostat.mu_for(cfg.mirostat, cfg.mirostat_tau);
                let token = if cfg.mirostat == MirostatMode::V1 {
                    sample_v1(
                        &mut candidates,
                        &mut self.rng,
                        cfg.mirostat_tau,
                        cfg.mirostat_eta,
                        logits.len(),
                        mu,
                    )?
                } else {
                    sample_v2(
                        &mut candidates,
                        &mut self.rng,
                        cfg.mirostat_tau,
                        cfg.mirostat_eta,
                        mu,
                    )?
                };
                trace!(token, mu = mirostat.mu(), "mirostat sample");
                Ok(token)
            }
            MirostatMode::Disabled => {
                for stage in params.order {
                    self.apply_stage(&mut candidates, *stage, params);
                }
                candidates.sample(&mut self.rng)
            }
        }
    }

    fn apply_stage(&self, candidates: &mut CandidateSet, stage: SamplerStage, params: &SamplingParams<'_>) {
        let cfg = params.config;
        match stage {
            SamplerStage::TopK => candidates.top_k(cfg.top_k, 1),
            SamplerStage::TopA => candidates.top_a(cfg.top_a, 1),
            SamplerStage::TopP => {
                candidates.top_p(cfg.top_p, 1);
                candidates.min_p(cfg.min_p, 1);
            }
            SamplerStage::TailFree => candidates.tail_free(cfg.tfs, 1),
            SamplerStage::Typical => candidates.typical(cfg.typical_p, 1),
            SamplerStage::Temperature => apply_temperature(candidates, cfg),
            SamplerStage::RepetitionPenalty => candidates.repetition_penalty(
                params.penalty_window(),
                cfg.rep_pen,
                cfg.presence_penalty,
            ),
        }
    }
}

/// Fixed temperature; `temp <= 0` collapses to the single most likely token.
fn scale_temperature(candidates: &mut CandidateSet, temp: f32, smoothing_factor: f32) {
    if temp <= 0.0 {
        candidates.greedy();
    } else {
        candidates.temperature(temp, smoothing_factor);
    }
}

fn apply_temperature(candidates: &mut CandidateSet, cfg: &SamplingConfig) {
    if cfg.temperature <= 0.0 {
        candidates.greedy();
        return;
    }
    if cfg.dynatemp_range > 0.0 {
        let min_temp = (cfg.temperature - cfg.dynatemp_range).max(0.0);
        let max_temp = (cfg.temperature + cfg.dynatemp_range).max(0.0);
        let exponent = cfg.dynatemp_exponent.max(0.0);
        candidates.entropy_temperature(min_temp, max_temp, exponent, cfg.smoothing_factor);
    } else {
        candidates.temperature(cfg.temperature, cfg.smoothing_factor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params<'a>(config: &'a SamplingConfig, biases: &'a [LogitBias], recent: &'a [u32]) -> SamplingParams<'a> {
        SamplingParams {
            config,
            order: &SamplerStage::DEFAULT_ORDER,
            logit_biases: biases,
            recent,
            n_ctx: 512,
        }
    }

    #[test]
    fn zero_temperature_is_argmax() {
        let config = SamplingConfig {
            temperature: 0.0,
            ..SamplingConfig::default()
        };
        let logits = [0.1, 0.2, 3.0, 0.4];
        let mut sampler = Sampler::new(99);
        let mut mirostat = MirostatState::default();
        for _ in 0..5 {
            let token = sampler
                .sample(&logits, &params(&config, &[], &[]), None, &mut mirostat)
                .unwrap();
            assert_eq!(token, 2);
        }
    }

    #[test]
    fn logit_bias_is_applied_before_the_pipeline() {
        let config = SamplingConfig {
            temperature: 0.0,
            ..SamplingConfig::default()
        };
        let biases = [LogitBias {
            token_id: 0,
            bias: 10.0,
        }];
        let mut sampler = Sampler::new(1);
        let token = sampler
            .sample(
                &[0.0, 1.0, 2.0],
                &params(&config, &biases, &[]),
                None,
                &mut MirostatState::default(),
            )
            .unwrap();
        assert_eq!(token, 0);
    }

    #[test]
    fn repetition_penalty_window_respects_range() {
        let config = SamplingConfig {
            rep_pen_range: 2,
            ..SamplingConfig::default()
        };
        let recent = [7, 8, 9];
        let p = params(&config, &[], &recent);
        assert_eq!(p.penalty_window(), &[8, 9]);
    }

    #[test]
    fn same_seed_gives_same_sequence() {
        let config = SamplingConfig::default();
        let logits: Vec<f32> = (0..32).map(|i| (i % 5) as f32 * 0.3).collect();
        let run = |seed| {
            let mut sampler = Sampler::new(seed);
            let mut mirostat = MirostatState::default();
            (0..10)
                .map(|_| {
                    sampler
                        .sample(&logits, &params(&config, &[], &[]), None, &mut mirostat)
                        .unwrap()
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(run(1234), run(1234));
    }

    #[test]
    fn mirostat_at_zero_temperature_is_argmax() {
        for mode in [MirostatMode::V1, MirostatMode::V2] {
            let config = SamplingConfig {
                mirostat: mode,
                temperature: 0.0,
                ..SamplingConfig::default()
            };
            let mut sampler = Sampler::new(3);
            let mut mirostat = MirostatState::default();
            for _ in 0..4 {
                let token = sampler
                    .sample(&[5.0, 0.0, 1.0, -2.0], &params(&config, &[], &[]), None, &mut mirostat)
                    .unwrap();
                assert_eq!(token, 0, "{:?}", mode);
            }
            assert!(mirostat.mu().is_finite());
        }
    }

    #[test]
    fn mirostat_state_is_updated_through_the_sampler() {
        let config = SamplingConfig {
            mirostat: MirostatMode::V2,
            mirostat_tau: 3.0,
            ..SamplingConfig::default()
        };
        let mut sampler = Sampler::new(8);
        let mut mirostat = MirostatState::default();
        sampler
            .sample(&[5.0, 0.0, 0.0], &params(&config, &[], &[]), None, &mut mirostat)
            .unwrap();
        assert_ne!(mirostat.mu(), 6.0);
    }
}
