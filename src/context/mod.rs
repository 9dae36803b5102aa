//! Context reconciliation: decides how much of the previously evaluated
//! token history can be reused for a new request.

mod shift;

pub use shift::{plan_purge, purge_missing_tokens, PurgePlan};

use tracing::info;

use crate::config::SmartContextPolicy;

/// Fixed-length history of the most recent tokens, oldest first.
///
/// Zero-filled on reset, so token `0` counts as "seen" until enough real
/// tokens have been pushed.
#[derive(Debug, Clone, Default)]
pub struct RecentWindow {
    /// Every token is written twice, `len` apart, so the window is always
    /// the contiguous run `ring[start..start + len]`.
    ring: Vec<u32>,
    len: usize,
    start: usize,
}

impl RecentWindow {
    pub fn new(len: usize) -> Self {
        let mut window = Self::default();
        window.reset(len);
        window
    }

    pub fn reset(&mut self, len: usize) {
        self.ring.clear();
        self.ring.resize(len * 2, 0);
        self.len = len;
        self.start = 0;
    }

    pub fn push(&mut self, token: u32) {
        if self.len == 0 {
            return;
        }
        self.ring[self.start] = token;
        self.ring[self.start + self.len] = token;
        self.start = (self.start + 1) % self.len;
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.ring[self.start..self.start + self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Longest contiguous run shared by `a` and `b` (first one found in `a`).
pub fn longest_common_substring(a: &[u32], b: &[u32]) -> Vec<u32> {
    if a.is_empty() || b.is_empty() {
        return Vec::new();
    }
    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];
    let mut best_len = 0;
    let mut best_end = 0;
    for i in 1..=a.len() {
        for j in 1..=b.len() {
            if a[i - 1] == b[j - 1] {
                curr[j] = prev[j - 1] + 1;
                if curr[j] > best_len {
                    best_len = curr[j];
                    best_end = i;
                }
            } else {
                curr[j] = 0;
            }
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    a[best_end - best_len..best_end].to_vec()
}

pub fn find_index_of(haystack: &[u32], needle: &[u32]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Reuses the common prefix of `current` and `input`.
///
/// Reused tokens are pushed into `window` and removed from the front of
/// `input`, which is left holding only what must still be evaluated. At least
/// one input token is always left to evaluate. Returns the new `n_past`.
pub fn fast_forward(
    current: &[u32],
    input: &mut Vec<u32>,
    window: &mut RecentWindow,
    n_ctx: usize,
    smart: &mut SmartContext,
    smart_policy: Option<&SmartContextPolicy>,
) -> usize {
    let mut n_past = count_reusable(current, input, 0, window);
    input.drain(..n_past);

    let Some(policy) = smart_policy else {
        smart.clear();
        return n_past;
    };

    n_past = smart.try_reuse(current, input, n_past, window, n_ctx, policy);
    smart.maybe_trigger(current.len(), input, n_past, n_ctx, policy);
    n_past
}

/// Counts matching tokens between `current[start..]` and `input`, leaving at
/// least one token of `input` unmatched.
fn count_reusable(current: &[u32], input: &[u32], start: usize, window: &mut RecentWindow) -> usize {
    let mut matched = 0;
    for (i, (&old, &new)) in current[start.min(current.len())..].iter().zip(input).enumerate() {
        if old != new {
            break;
        }
        matched += 1;
        window.push(old);
        if i + 2 >= input.len() {
            break;
        }
    }
    start + matched
}

/// Buffered tail of a previously truncated prompt.
///
/// When the context is nearly full, the first half of the new input is
/// dropped and the remainder remembered. Later prompts that still contain
/// that remainder are cut at the same place, so the cached prefix keeps
/// matching instead of shifting on every request.
#[derive(Debug, Clone, Default)]
pub struct SmartContext {
    buffer: Vec<u32>,
}

impl SmartContext {
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    fn try_reuse(
        &mut self,
        current: &[u32],
        input: &mut Vec<u32>,
        n_past: usize,
        window: &mut RecentWindow,
        n_ctx: usize,
        policy: &SmartContextPolicy,
    ) -> usize {
        let input_threshold = (n_ctx as f32 * policy.input_len_ratio) as usize;
        if self.buffer.is_empty() || input.len() < input_threshold {
            self.clear();
            return n_past;
        }

        let similarity_threshold =
            policy.similarity_base + (n_ctx as f32 * policy.similarity_ctx_ratio) as usize;
        let shared = longest_common_substring(&self.buffer, input);
        if shared.len() <= similarity_threshold || !self.buffer.starts_with(&shared) {
            self.clear();
            return n_past;
        }
        let Some(found) = find_index_of(input, &shared) else {
            self.clear();
            return n_past;
        };

        input.drain(..found);
        info!(allowance = found, "reusing smart context");
        let resumed = count_reusable(current, input, n_past, window);
        input.drain(..resumed - n_past);
        resumed
    }

    fn maybe_trigger(
        &mut self,
        current_len: usize,
        input: &mut Vec<u32>,
        n_past: usize,
        n_ctx: usize,
        policy: &SmartContextPolicy,
    ) {
        let ctx_threshold = (n_ctx as f32 * policy.ctx_len_ratio) as usize;
        let input_threshold = (n_ctx as f32 * policy.input_len_ratio) as usize;
        let gap_threshold = (n_ctx as f32 * policy.past_gap_ratio) as usize;
        if !self.buffer.is_empty()
            || current_len < ctx_threshold
            || input.len() < input_threshold
            || current_len.saturating_sub(n_past) <= gap_threshold
        {
            return;
        }

        let shift = (input.len() as f32 * policy.truncation_ratio) as usize;
        self.buffer = input[shift..].to_vec();
        *input = self.buffer.clone();
        info!(allowance = shift, "new smart context triggered");
    }
}
