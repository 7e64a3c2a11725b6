//! Provider-side concurrent execution limit

use crate::filter::Filter;
use crate::invocation::{RpcInvocation, RpcResult};
use crate::invoker::Invoker;
use crate::status::RpcStatus;
use async_trait::async_trait;
use mizzen_core::constants::EXECUTES_KEY;
use mizzen_core::{Error, Result};
use std::sync::Arc;
use std::time::Instant;

/// Rejects immediately when the provider already runs `executes` concurrent
/// calls of the method; there is no waiting on this side.
pub struct ExecuteLimitFilter;

#[async_trait]
impl Filter for ExecuteLimitFilter {
    fn name(&self) -> &'static str {
        "executelimit"
    }

    async fn invoke(
        &self,
        next: &Arc<dyn Invoker>,
        invocation: RpcInvocation,
    ) -> Result<RpcResult> {
        let url = next.url();
        let method = invocation.method().to_string();
        let max = url.method_param_u32(&method, EXECUTES_KEY, 0);

        if max > 0 && RpcStatus::of(url, &method).active() >= max {
            return Err(Error::LimitExceeded(format!(
                "{}.{} already executing {} calls (limit {})",
                url.service_key(),
                method,
                max,
                max
            )));
        }

        let status = RpcStatus::begin_count(url, &method);
        let started = Instant::now();
        let outcome = next.invoke(invocation).await;
        status.end_count(started.elapsed(), outcome.is_ok());
        outcome
    }
}
