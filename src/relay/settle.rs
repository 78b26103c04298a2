use tracing::{error, info};

use super::types::Usage;
use crate::database::{channel, consume_log, user};
use crate::service::quota;

/// Everything settlement needs, captured before dispatch.
#[derive(Debug, Clone)]
pub struct SettleContext {
    pub user_id: i64,
    pub token_id: i64,
    pub channel_id: i64,
    pub token_name: String,
    /// The caller-visible model name; pricing always follows this one, not
    /// the mapped name sent upstream.
    pub model_name: String,
    pub model_ratio: f64,
    pub group_ratio: f64,
    pub completion_ratio: f64,
    pub pre_consumed_quota: i64,
}

/// The settled quota for a finished call.
///
/// Zero total tokens means the upstream never produced anything, so nothing
/// is billed (the preconsumed amount still has to flow back). A real call
/// whose cost rounds to zero is billed one unit instead of none.
pub fn compute_settled_quota(usage: Usage, ratio: f64, completion_ratio: f64) -> i64 {
    let raw = (usage.prompt_tokens as f64 + usage.completion_tokens as f64 * completion_ratio) * ratio;
    let mut settled = raw.ceil() as i64;
    if ratio != 0.0 && settled <= 0 {
        settled = 1;
    }
    if usage.prompt_tokens + usage.completion_tokens == 0 {
        settled = 0;
    }
    settled
}

/// One-shot settlement handle. `complete` settles with the observed usage;
/// dropping it unfinished (handler bailed out, client vanished, upstream
/// errored) settles with empty usage, which reduces to a refund of the
/// preconsumed amount.
pub struct Settlement {
    context: Option<SettleContext>,
}

impl Settlement {
    pub fn new(context: SettleContext) -> Self {
        Settlement {
            context: Some(context),
        }
    }

    pub fn complete(mut self, usage: Usage) {
        if let Some(context) = self.context.take() {
            spawn_settle(context, usage);
        }
    }
}

impl Drop for Settlement {
    fn drop(&mut self) {
        if let Some(context) = self.context.take() {
            spawn_settle(context, Usage::default());
        }
    }
}

/// Settlement runs detached: the response has usually already been closed,
/// and a panic or database failure here must stay out of the request path.
fn spawn_settle(context: SettleContext, usage: Usage) {
    tokio::spawn(async move {
        let result = tokio::task::spawn_blocking(move || settle(context, usage)).await;
        if let Err(e) = result {
            error!("settlement task panicked: {}", e);
        }
    });
}

fn settle(context: SettleContext, usage: Usage) {
    let ratio = context.model_ratio * context.group_ratio;
    let settled = compute_settled_quota(usage, ratio, context.completion_ratio);
    let delta = settled - context.pre_consumed_quota;

    if let Err(e) = quota::post_consume_token_quota(context.token_id, context.user_id, delta) {
        error!("error consuming token remain quota: {}", e);
    }
    let user_id = context.user_id;
    tokio::spawn(async move {
        if let Err(e) = quota::cache_update_user_quota(user_id).await {
            error!("error updating user quota cache: {}", e);
        }
    });

    if settled != 0 {
        let content = format!(
            "model ratio {:.2}, group ratio {:.2}",
            context.model_ratio, context.group_ratio
        );
        if let Err(e) = consume_log::record_consume_log(
            context.user_id,
            context.channel_id,
            context.token_id,
            &context.model_name,
            &context.token_name,
            usage.prompt_tokens,
            usage.completion_tokens,
            settled,
            &content,
        ) {
            error!("error recording consume log: {}", e);
        }
        if let Err(e) = user::update_user_used_quota_and_request_count(context.user_id, settled) {
            error!("error updating user used quota: {}", e);
        }
        channel::update_channel_used_quota(context.channel_id, settled);
        info!(
            "settled {} quota for user {} on channel {} ({} prompt + {} completion tokens)",
            settled, context.user_id, context.channel_id, usage.prompt_tokens, usage.completion_tokens
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settled_quota_rounds_up() {
        let usage = Usage::new(10, 10);
        // (10 + 10 * 2) * 0.5 = 15
        assert_eq!(compute_settled_quota(usage, 0.5, 2.0), 15);
        // (10 + 10 * 1.5) * 0.3 = 7.5 -> 8
        assert_eq!(compute_settled_quota(usage, 0.3, 1.5), 8);
    }

    #[test]
    fn test_real_call_never_bills_zero() {
        let usage = Usage::new(1, 0);
        // 1 * 0.0001 rounds up through the minimum charge.
        assert_eq!(compute_settled_quota(usage, 0.0001, 1.0), 1);
    }

    #[test]
    fn test_zero_ratio_bills_zero() {
        let usage = Usage::new(100, 100);
        assert_eq!(compute_settled_quota(usage, 0.0, 1.0), 0);
    }

    #[test]
    fn test_error_before_tokens_bills_zero() {
        assert_eq!(compute_settled_quota(Usage::default(), 0.5, 2.0), 0);
    }

    #[test]
    fn test_refund_delta_for_failed_call() {
        // A drop-settle uses empty usage: settled = 0, so the delta applied
        // is exactly -pre_consumed.
        let settled = compute_settled_quota(Usage::default(), 0.5, 2.0);
        let pre_consumed = 250;
        assert_eq!(settled - pre_consumed, -250);
    }
}
