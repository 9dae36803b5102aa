use std::collections::HashSet;

use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;

use crate::error::{KernelError, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenData {
    pub id: u32,
    pub logit: f32,
    pub p: f32,
}

/// Mutable candidate list fed through the sampling stages.
///
/// Suppressed entries keep their slot with a logit of `-inf`; only the
/// truncating stages shrink the list, and always after sorting.
#[derive(Debug, Clone)]
pub struct CandidateSet {
    data: Vec<TokenData>,
    sorted: bool,
}

impl CandidateSet {
    pub fn from_logits(logits: &[f32]) -> Self {
        let data = logits
            .iter()
            .enumerate()
            .map(|(id, &logit)| TokenData {
                id: id as u32,
                logit,
                p: 0.0,
            })
            .collect();
        Self { data, sorted: false }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[TokenData] {
        &self.data
    }

    pub fn logit_mut(&mut self, index: usize) -> Option<&mut f32> {
        self.sorted = false;
        self.data.get_mut(index).map(|t| &mut t.logit)
    }

    pub fn suppress(&mut self, index: usize) {
        if let Some(t) = self.data.get_mut(index) {
            t.logit = f32::NEG_INFINITY;
            self.sorted = false;
        }
    }

    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }

    pub fn position_of(&self, id: u32) -> Option<usize> {
        self.data.iter().position(|t| t.id == id)
    }

    fn sort_desc(&mut self) {
        if !self.sorted {
            self.data.sort_by(|a, b| b.logit.total_cmp(&a.logit));
            self.sorted = true;
        }
    }

    /// Sorts by descending logit and fills `p`.
    pub fn softmax(&mut self) {
        if self.data.is_empty() {
            return;
        }
        self.sort_desc();
        let max_l = self.data[0].logit;
        let mut cum_sum = 0.0f32;
        for t in self.data.iter_mut() {
            t.p = (t.logit - max_l).exp();
            cum_sum += t.p;
        }
        for t in self.data.iter_mut() {
            t.p /= cum_sum;
        }
    }

    pub fn top_k(&mut self, k: i32, min_keep: usize) {
        let size = self.data.len();
        let mut k = if k <= 0 { size } else { k as usize };
        k = k.max(min_keep).min(size);
        self.sort_desc();
        self.data.truncate(k);
    }

    /// Keeps candidates whose probability is at least `a * max_prob^2`.
    pub fn top_a(&mut self, a: f32, min_keep: usize) {
        if a <= 0.0 || self.data.len() <= 1 {
            return;
        }
        self.softmax();
        let max_prob = self.data[0].p;
        let threshold = a * max_prob * max_prob;
        let last_idx = self
            .data
            .iter()
            .enumerate()
            .find(|(i, t)| t.p < threshold && *i >= min_keep)
            .map(|(i, _)| i)
            .unwrap_or(self.data.len());
        self.data.truncate(last_idx);
    }

    pub fn top_p(&mut self, p: f32, min_keep: usize) {
        if p >= 1.0 || self.data.is_empty() {
            return;
        }
        self.softmax();
        let mut cum_sum = 0.0f32;
        let mut last_idx = self.data.len();
        for (i, t) in self.data.iter().enumerate() {
            cum_sum += t.p;
            if cum_sum >= p && i + 1 >= min_keep {
                last_idx = i + 1;
                break;
            }
        }
        self.data.truncate(last_idx);
    }

    pub fn min_p(&mut self, p: f32, min_keep: usize) {
        if p <= 0.0 || self.data.is_empty() {
            return;
        }
        self.softmax();
        let scale = self.data[0].p;
        let mut i = 1;
        while i < self.data.len() {
            if self.data[i].p < p * scale && i >= min_keep {
                break;
            }
            i += 1;
        }
        self.data.truncate(i);
    }

    pub fn tail_free(&mut self, z: f32, min_keep: usize) {
        if z >= 1.0 || self.data.len() <= 2 {
            return;
        }
        self.softmax();

        let first: Vec<f32> = self.data.windows(2).map(|w| w[0].p - w[1].p).collect();
        let mut second: Vec<f32> = first.windows(2).map(|w| (w[0] - w[1]).abs()).collect();

        let sum: f32 = second.iter().sum();
        if sum > 1e-6 {
            for v in second.iter_mut() {
                *v /= sum;
            }
        } else {
            let uniform = 1.0 / second.len() as f32;
            second.iter_mut().for_each(|v| *v = uniform);
        }

        let mut cum_sum = 0.0f32;
        let mut last_idx = self.data.len();
        for (i, v) in second.iter().enumerate() {
            cum_sum += v;
            if cum_sum > z && i >= min_keep {
                last_idx = i;
                break;
            }
        }
        self.data.truncate(last_idx);
    }

    /// Locally typical sampling: keeps the tokens whose surprise is closest
    /// to the distribution's entropy.
    pub fn typical(&mut self, p: f32, min_keep: usize) {
        if p >= 1.0 || self.data.is_empty() {
            return;
        }
        self.softmax();

        let entropy: f32 = self
            .data
            .iter()
            .filter(|t| t.p > 0.0)
            .map(|t| -t.p * t.p.ln())
            .sum();

        let mut ranked: Vec<(f32, TokenData)> = self
            .data
            .iter()
            .map(|t| ((-t.p.ln() - entropy).abs(), *t))
            .collect();
        ranked.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut cum_sum = 0.0f32;
        let mut last_idx = ranked.len();
        for (i, (_, t)) in ranked.iter().enumerate() {
            cum_sum += t.p;
            if cum_sum > p && i + 1 >= min_keep {
                last_idx = i + 1;
                break;
            }
        }

        self.data = ranked.into_iter().take(last_idx).map(|(_, t)| t).collect();
        self.sorted = false;
    }

    fn smooth(&mut self, smoothing_factor: f32) {
        if smoothing_factor <= 0.0 || self.data.len() <= 1 {
            return;
        }
        self.softmax();
        let h = self.data[0].logit;
        for t in self.data.iter_mut() {
            let shifted = t.logit - h;
            t.logit = -smoothing_factor * shifted * shifted + h;
        }
        self.softmax();
    }

    pub fn temperature(&mut self, temp: f32, smoothing_factor: f32) {
        self.smooth(smoothing_factor);
        for t in self.data.iter_mut() {
            t.logit /= temp;
        }
    }

    /// Temperature scaled by the normalized entropy of the distribution.
    pub fn entropy_temperature(
        &mut self,
        min_temp: f32,
        max_temp: f32,
        exponent: f32,
        smoothing_factor: f32,
    ) {
        if self.data.len() <= 1 {
            return;
        }
        self.smooth(smoothing_factor);

        let max_entropy = (self.data.len() as f32).ln();
        self.softmax();
        let entropy: f32 = self
            .data
            .iter()
            .filter(|t| t.p > 0.0)
            .map(|t| -t.p * t.p.ln())
            .sum();
        let normalized = if max_entropy > 0.0 {
            entropy / max_entropy
        } else {
            0.0
        };

        let dyn_temp = min_temp + (max_temp - min_temp) * normalized.powf(exponent);
        if dyn_temp <= 0.0 {
            self.greedy();
            return;
        }
        for t in self.data.iter_mut() {
            t.logit /= dyn_temp;
        }
        self.softmax();
    }

    /// Collapses to the single best candidate.
    pub fn greedy(&mut self) {
        self.temperature(GREEDY_TEMPERATURE, 0.0);
        self.top_k(1, 1);
    }

    /// Pulls logits of recently seen tokens toward zero, then subtracts a flat
    /// presence penalty from them.
    pub fn repetition_penalty(&mut self, recent: &[u32], penalty: f32, presence_penalty: f32) {
        if recent.is_empty() || (penalty == 1.0 && presence_penalty == 0.0) {
            return;
        }
        let seen: HashSet<u32> = recent.iter().copied().collect();
        for t in self.data.iter_mut().filter(|t| seen.contains(&t.id)) {
            if t.logit <= 0.0 {
                t.logit *= penalty;
            } else {
                t.logit /= penalty;
            }
            t.logit -= presence_penalty;
        }
        self.sorted = false;
    }

    /// Draws one token from the softmax of the surviving candidates.
    pub fn sample<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<u32> {
        self.softmax();
        if self.data.is_empty() || self.data[0].logit == f32::NEG_INFINITY {
            return Err(KernelError::EmptyCandidates);
        }
        let dist = WeightedIndex::new(self.data.iter().map(|t| t.p))
            .map_err(|_| KernelError::EmptyCandidates)?;
        Ok(self.data[dist.sample(rng)].id)
    }
}

pub const GREEDY_TEMPERATURE: f32 = 1.0 / 256.0;
