//! Provider-side rate limiting

use crate::filter::Filter;
use crate::invocation::{RpcInvocation, RpcResult};
use crate::invoker::Invoker;
use async_trait::async_trait;
use dashmap::DashMap;
use mizzen_core::constants::{TPS_LIMIT_INTERVAL_KEY, TPS_LIMIT_RATE_KEY};
use mizzen_core::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

const DEFAULT_INTERVAL_MS: u64 = 60_000;

struct StatItem {
    rate: u64,
    interval: Duration,
    state: Mutex<(Instant, u64)>,
}

impl StatItem {
    fn new(rate: u64, interval: Duration) -> Self {
        Self { rate, interval, state: Mutex::new((Instant::now(), rate)) }
    }

    fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        let (last_reset, tokens) = *state;
        if last_reset.elapsed() >= self.interval {
            *state = (Instant::now(), self.rate);
        }
        if state.1 == 0 {
            return false;
        }
        state.1 -= 1;
        true
    }
}

/// Token-bucket limiter keyed by service, refilled once per interval
pub struct TpsLimitFilter {
    items: DashMap<String, Arc<StatItem>>,
}

impl TpsLimitFilter {
    pub fn new() -> Self {
        Self { items: DashMap::new() }
    }
}

impl Default for TpsLimitFilter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Filter for TpsLimitFilter {
    fn name(&self) -> &'static str {
        "tpslimit"
    }

    async fn invoke(
        &self,
        next: &Arc<dyn Invoker>,
        invocation: RpcInvocation,
    ) -> Result<RpcResult> {
        let url = next.url();
        let rate = url.param_u64(TPS_LIMIT_RATE_KEY, 0);
        if rate > 0 {
            let interval =
                url.param_duration_ms(TPS_LIMIT_INTERVAL_KEY, DEFAULT_INTERVAL_MS);
            let item = self
                .items
                .entry(url.service_key().to_string())
                .or_insert_with(|| Arc::new(StatItem::new(rate, interval)))
                .clone();
            if !item.try_acquire() {
                return Err(Error::LimitExceeded(format!(
                    "{} exceeded {} calls per {:?}",
                    url.service_key(),
                    rate,
                    interval
                )));
            }
        }
        next.invoke(invocation).await
    }
}
