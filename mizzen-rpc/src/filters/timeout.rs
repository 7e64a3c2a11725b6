//! Provider-side deadline overrun logging

use crate::filter::Filter;
use crate::invocation::{RpcInvocation, RpcResult};
use crate::invoker::Invoker;
use async_trait::async_trait;
use mizzen_core::constants::{DEFAULT_TIMEOUT_MS, TIMEOUT_KEY};
use mizzen_core::Result;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

/// The consumer has long given up when a provider overruns its deadline;
/// this filter makes such calls visible on the provider side.
pub struct TimeoutFilter;

#[async_trait]
impl Filter for TimeoutFilter {
    fn name(&self) -> &'static str {
        "timeout"
    }

    async fn invoke(
        &self,
        next: &Arc<dyn Invoker>,
        invocation: RpcInvocation,
    ) -> Result<RpcResult> {
        let method = invocation.method().to_string();
        let limit = next.url().method_param_u64(&method, TIMEOUT_KEY, DEFAULT_TIMEOUT_MS);
        let started = Instant::now();
        let outcome = next.invoke(invocation).await;
        let elapsed = started.elapsed();
        if elapsed.as_millis() as u64 > limit {
            warn!(
                "{}.{} took {}ms, past its {}ms timeout",
                next.url().service_key(),
                method,
                elapsed.as_millis(),
                limit
            );
        }
        outcome
    }
}
