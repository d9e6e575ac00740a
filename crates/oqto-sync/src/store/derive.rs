//! Context-window accounting.

use oqto_sync_protocol::TokenUsage;

use super::state::{ContextTokens, ContextUsage, ModelLimits};

/// Upper bound on the output budget reserved out of the context window.
pub const MAX_OUTPUT_RESERVE: u64 = 32_000;

/// Percentage at which a session counts as close to its limit.
pub const NEAR_LIMIT_PERCENT: u32 = 80;

/// Compute usage for one assistant message.
///
/// `used = input + cache.read + output`, measured against the window minus
/// `min(output_limit, 32000)`, rounded to a whole percent. Counts come off
/// the wire unchecked, so the sum saturates.
pub fn context_usage(tokens: &TokenUsage, limits: ModelLimits, now: i64) -> ContextUsage {
    let used = tokens
        .input
        .saturating_add(tokens.cache.read)
        .saturating_add(tokens.output);
    let usable = limits
        .context
        .saturating_sub(limits.output.min(MAX_OUTPUT_RESERVE));

    let percentage = if usable == 0 {
        if used == 0 { 0 } else { 100 }
    } else {
        (used as f64 / usable as f64 * 100.0).round() as u32
    };

    ContextUsage {
        used,
        limit: usable,
        percentage,
        is_near_limit: percentage >= NEAR_LIMIT_PERCENT,
        tokens: ContextTokens {
            input: tokens.input,
            output: tokens.output,
            cached: tokens.cache.read,
        },
        last_updated: now,
    }
}
