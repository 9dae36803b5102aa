use inference_protocol::MirostatMode;
use rand::Rng;

use super::candidates::CandidateSet;
use crate::error::{KernelError, Result};

/// Candidate window used to estimate the Zipf exponent in v1.
const MIROSTAT_M: usize = 100;

/// Target-surprise state that survives across requests.
///
/// `mu` starts at twice the target surprise and is only reset when the
/// requested mode or target changes.
#[derive(Debug, Clone, Copy)]
pub struct MirostatState {
    mode: MirostatMode,
    tau: f32,
    mu: f32,
}

impl Default for MirostatState {
    fn default() -> Self {
        Self {
            mode: MirostatMode::Disabled,
            tau: 0.0,
            mu: 0.0,
        }
    }
}

impl MirostatState {
    pub fn mu(&self) -> f32 {
        self.mu
    }

    /// Returns the running `mu` for `mode`/`tau`, resetting it on change.
    pub fn mu_for(&mut self, mode: MirostatMode, tau: f32) -> &mut f32 {
        if self.mode != mode || self.tau != tau {
            self.mode = mode;
            self.tau = tau;
            self.mu = 2.0 * tau;
        }
        &mut self.mu
    }
}

fn observe<R: Rng + ?Sized>(
    candidates: &mut CandidateSet,
    rng: &mut R,
    tau: f32,
    eta: f32,
    mu: &mut f32,
) -> Result<u32> {
    let token = candidates.sample(rng)?;
    let idx = candidates
        .position_of(token)
        .ok_or(KernelError::EmptyCandidates)?;
    let observed_surprise = -candidates.as_slice()[idx].p.log2();
    *mu -= eta * (observed_surprise - tau);
    Ok(token)
}

pub fn sample_v1<R: Rng + ?Sized>(
    candidates: &mut CandidateSet,
    rng: &mut R,
    tau: f32,
    eta: f32,
    n_vocab: usize,
    mu: &mut f32,
) -> Result<u32> {
    candidates.softmax();

    let probs: Vec<f32> = candidates.as_slice().iter().map(|t| t.p).collect();
    let window = MIROSTAT_M.saturating_sub(1).min(probs.len().saturating_sub(1));
    let mut sum_ti_bi = 0.0f32;
    let mut sum_ti_sq = 0.0f32;
    for i in 0..window {
        if probs[i + 1] <= 0.0 {
            break;
        }
        let t_i = ((i + 2) as f32 / (i + 1) as f32).ln();
        let b_i = (probs[i] / probs[i + 1]).ln();
        sum_ti_bi += t_i * b_i;
        sum_ti_sq += t_i * t_i;
    }

    if sum_ti_sq > 0.0 {
        let s_hat = sum_ti_bi / sum_ti_sq;
        let epsilon_hat = s_hat - 1.0;
        let n = n_vocab as f32;
        let k = ((epsilon_hat * 2f32.powf(*mu)) / (1.0 - n.powf(-epsilon_hat)))
            .powf(1.0 / s_hat);
        let k = if k.is_finite() {
            k.clamp(1.0, i32::MAX as f32) as i32
        } else {
            1
        };
        candidates.top_k(k, 1);
    }

    observe(candidates, rng, tau, eta, mu)
}

pub fn sample_v2<R: Rng + ?Sized>(
    candidates: &mut CandidateSet,
    rng: &mut R,
    tau: f32,
    eta: f32,
    mu: &mut f32,
) -> Result<u32> {
    candidates.softmax();

    let cut = candidates
        .as_slice()
        .iter()
        .position(|t| -t.p.log2() > *mu)
        .unwrap_or(candidates.len());
    candidates.truncate(cut.max(1));

    observe(candidates, rng, tau, eta, mu)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn mu_resets_only_when_mode_or_tau_change() {
        let mut state = MirostatState::default();
        *state.mu_for(MirostatMode::V2, 5.0) -= 1.0;
        assert_eq!(state.mu(), 9.0);
        assert_eq!(*state.mu_for(MirostatMode::V2, 5.0), 9.0);
        assert_eq!(*state.mu_for(MirostatMode::V1, 5.0), 10.0);
        assert_eq!(*state.mu_for(MirostatMode::V1, 3.0), 6.0);
    }

    #[test]
    fn v2_mu_moves_toward_target_surprise() {
        let mut rng = StdRng::seed_from_u64(3);

        // near-certain token => surprise close to 0, below tau => mu grows
        let mut mu = 10.0;
        let mut c = CandidateSet::from_logits(&[20.0, 0.0, 0.0]);
        sample_v2(&mut c, &mut rng, 5.0, 0.1, &mut mu).unwrap();
        assert!(mu > 10.0);

        // uniform over 1024 tokens => surprise 10 bits, above tau => mu shrinks
        let mut mu = 20.0;
        let mut c = CandidateSet::from_logits(&vec![0.0; 1024]);
        sample_v2(&mut c, &mut rng, 5.0, 0.1, &mut mu).unwrap();
        assert!(mu < 20.0);
    }

    #[test]
    fn v2_keeps_at_least_one_candidate() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut mu = 0.0;
        let mut c = CandidateSet::from_logits(&[1.0, 1.0, 1.0]);
        let token = sample_v2(&mut c, &mut rng, 5.0, 0.1, &mut mu).unwrap();
        assert_eq!(c.len(), 1);
        assert!(token < 3);
    }

    #[test]
    fn v1_samples_from_a_skewed_distribution() {
        let mut rng = StdRng::seed_from_u64(5);
        let logits: Vec<f32> = (0..200).map(|i| -(i as f32) * 0.5).collect();
        let mut c = CandidateSet::from_logits(&logits);
        let mut mu = 10.0;
        let token = sample_v1(&mut c, &mut rng, 5.0, 0.1, logits.len(), &mut mu).unwrap();
        assert!((token as usize) < logits.len());
        assert!(mu.is_finite());
    }
}
