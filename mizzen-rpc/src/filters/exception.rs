//! Provider-side error normalization

use crate::filter::Filter;
use crate::invocation::{RpcInvocation, RpcResult};
use crate::invoker::Invoker;
use async_trait::async_trait;
use mizzen_core::{Error, ErrorKind, Result};
use std::sync::Arc;
use tracing::warn;

/// Attaches invocation context (interface, method) to framework errors
/// leaving the provider, and downgrades internal errors to the `Unknown`
/// kind so implementation detail does not leak to peers. Service-raised
/// exceptions pass through untouched.
pub struct ExceptionFilter;

#[async_trait]
impl Filter for ExceptionFilter {
    fn name(&self) -> &'static str {
        "exception"
    }

    async fn invoke(
        &self,
        next: &Arc<dyn Invoker>,
        invocation: RpcInvocation,
    ) -> Result<RpcResult> {
        let context = format!("{}.{}", next.url().service_key(), invocation.method());
        match next.invoke(invocation).await {
            Ok(result) => Ok(result),
            Err(e) if e.is_biz() => Ok(RpcResult::exception(e)),
            Err(e) => {
                warn!("invocation of {} failed: {}", context, e);
                match e.kind() {
                    ErrorKind::Internal => {
                        Err(Error::Unknown(format!("{} failed: {}", context, e)))
                    }
                    _ => Err(e),
                }
            }
        }
    }
}
