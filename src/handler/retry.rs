// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use rand::Rng;
use tracing::info;

use crate::api::error::RpcError;

/// Retry discipline for forwarded bulk chunks: uniformly delayed, capped
/// attempt count.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub limit: u32,
    pub delay_min_s: u64,
    pub delay_max_s: u64,
}

/// Only admission-control rejections are retryable by default; a caller may
/// widen the set (e.g. to retry on peer connection errors).
pub fn default_retryable(err: &RpcError) -> bool {
    matches!(err, RpcError::Overloaded(_))
}

/// Calls `f`, retrying per `policy` while `is_retryable` approves the
/// error. The final error is returned once attempts are exhausted.
pub async fn call_with_retry<T, F, Fut>(
    policy: RetryPolicy,
    is_retryable: impl Fn(&RpcError) -> bool,
    mut f: F,
) -> Result<T, RpcError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RpcError>>,
{
    let mut retry_count: u32 = 0;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                retry_count += 1;
                if retry_count > policy.limit || !is_retryable(&e) {
                    return Err(e);
                }
                let delay = rand::rng()
                    .random_range(policy.delay_min_s as f64..=policy.delay_max_s as f64);
                info!("retrying after {delay:.1}s: {e}");
                tokio::time::sleep(Duration::from_secs_f64(delay)).await;
            },
        }
    }
}
