//! Invocation statistics collection

use crate::filter::Filter;
use crate::invocation::{RpcInvocation, RpcResult};
use crate::invoker::Invoker;
use crate::status::RpcStatus;
use async_trait::async_trait;
use mizzen_core::Result;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Feeds the per-(url, method) counters and emits a debug line per call
pub struct MonitorFilter;

#[async_trait]
impl Filter for MonitorFilter {
    fn name(&self) -> &'static str {
        "monitor"
    }

    async fn invoke(
        &self,
        next: &Arc<dyn Invoker>,
        invocation: RpcInvocation,
    ) -> Result<RpcResult> {
        let method = invocation.method().to_string();
        let status = RpcStatus::begin_count(next.url(), &method);
        let started = Instant::now();
        let outcome = next.invoke(invocation).await;
        let elapsed = started.elapsed();
        status.end_count(elapsed, outcome.is_ok());
        debug!(
            "{}.{} finished in {}ms (total {}, failed {})",
            next.url().service_key(),
            method,
            elapsed.as_millis(),
            status.total(),
            status.failed()
        );
        outcome
    }
}
