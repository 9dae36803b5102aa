use tracing::{debug, info};

use super::{find_index_of, longest_common_substring};
use crate::backend::Backend;
use crate::config::ShiftPolicy;
use crate::error::{KernelError, Result};

/// A middle span of the cached context to drop: `trimstart..trimstart + diff`.
/// The `kept` tokens after it must then line up with the new input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PurgePlan {
    pub trimstart: usize,
    pub diff: usize,
    pub kept: usize,
}

/// Decides whether the cached `current` context can be patched into `new` by
/// erasing one span right after their common prefix.
///
/// Returns `None` when no purge is needed or the shared tail is not long or
/// trustworthy enough.
pub fn plan_purge(
    current: &[u32],
    new: &[u32],
    genamt: usize,
    n_ctx: usize,
    policy: &ShiftPolicy,
) -> Option<PurgePlan> {
    let shortfall = policy.shortfall(n_ctx);
    let slack = policy.slack(n_ctx);
    let new_len = new.len();

    let mut trimstart = 0;
    for (i, (old, tok)) in current.iter().zip(new).enumerate() {
        if old != tok {
            break;
        }
        trimstart += 1;
        if i + 2 >= new_len {
            return None;
        }
    }

    if new_len < policy.min_tokens
        || current.len() < policy.min_tokens
        || new_len - trimstart < shortfall
    {
        return None;
    }

    let remaining = new_len - trimstart;
    let capped = remaining
        .saturating_sub(genamt + slack)
        .min((n_ctx as f32 * policy.lcs_ctx_ratio) as usize);
    let lcs_threshold = capped.max(shortfall.saturating_sub(slack));

    let new_tail = &new[trimstart..];
    let shared = longest_common_substring(&current[trimstart..], new_tail);
    debug!(
        trimstart,
        shared = shared.len(),
        threshold = lcs_threshold,
        "context shift candidate"
    );
    if shared.len() <= lcs_threshold || !new_tail.starts_with(&shared) {
        return None;
    }

    let found = find_index_of(current, &shared)?;
    if found <= trimstart {
        return None;
    }
    Some(PurgePlan {
        trimstart,
        diff: found - trimstart,
        kept: shared.len(),
    })
}

/// Checks that erasing the planned span leaves `current` agreeing with `new`
/// over the common prefix and the kept run.
fn check_purge(current: &[u32], new: &[u32], plan: &PurgePlan) -> Result<()> {
    let expected = plan.trimstart + plan.kept;
    let head = &current[..plan.trimstart.min(current.len())];
    let tail = current.get(plan.trimstart + plan.diff..).unwrap_or(&[]);
    let actual = head
        .iter()
        .chain(tail)
        .zip(new)
        .take(expected)
        .take_while(|(old, tok)| old == tok)
        .count();
    if actual != expected {
        return Err(KernelError::ContextShiftMismatch { expected, actual });
    }
    Ok(())
}

/// Erases the span chosen by [`plan_purge`] from both `current` and the
/// backend's KV cache, shifting the retained positions back so they need no
/// recomputation.
pub fn purge_missing_tokens<B: Backend + ?Sized>(
    backend: &mut B,
    current: &mut Vec<u32>,
    new: &[u32],
    genamt: usize,
    n_ctx: usize,
    policy: &ShiftPolicy,
) -> Result<Option<PurgePlan>> {
    let Some(plan) = plan_purge(current, new, genamt, n_ctx, policy) else {
        return Ok(None);
    };
    check_purge(current, new, &plan)?;
    let PurgePlan { trimstart, diff, .. } = plan;

    backend.remove_kv_range(trimstart, Some(trimstart + diff));
    backend.shift_kv_range(trimstart + diff, -(diff as isize));
    current.drain(trimstart..trimstart + diff);

    info!(erased = diff, position = trimstart + 1, "context shifting");
    Ok(Some(plan))
}
