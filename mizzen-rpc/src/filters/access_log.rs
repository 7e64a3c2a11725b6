//! Provider-side access logging

use crate::filter::Filter;
use crate::invocation::{RpcInvocation, RpcResult};
use crate::invoker::Invoker;
use async_trait::async_trait;
use mizzen_core::constants::APPLICATION_KEY;
use mizzen_core::Result;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Logs one line per call under the `mizzen::accesslog` target, enabled by
/// the `accesslog` URL parameter
pub struct AccessLogFilter;

#[async_trait]
impl Filter for AccessLogFilter {
    fn name(&self) -> &'static str {
        "accesslog"
    }

    async fn invoke(
        &self,
        next: &Arc<dyn Invoker>,
        invocation: RpcInvocation,
    ) -> Result<RpcResult> {
        let caller = invocation
            .attachment(APPLICATION_KEY)
            .unwrap_or("unknown")
            .to_string();
        let method = invocation.method().to_string();
        let service = next.url().service_key().to_string();
        let started = Instant::now();
        let outcome = next.invoke(invocation).await;
        info!(
            target: "mizzen::accesslog",
            "{} -> {}.{} [{}ms] {}",
            caller,
            service,
            method,
            started.elapsed().as_millis(),
            match &outcome {
                Ok(result) if result.has_exception() => "biz-exception",
                Ok(_) => "ok",
                Err(_) => "error",
            }
        );
        outcome
    }
}
