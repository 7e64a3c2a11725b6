//! Built-in filters

mod access_log;
mod active_limit;
mod context;
mod exception;
mod execute_limit;
mod monitor;
mod timeout;
mod token;
mod tps_limit;

pub use access_log::AccessLogFilter;
pub use active_limit::ActiveLimitFilter;
pub use context::{ConsumerContextFilter, ContextFilter};
pub use exception::ExceptionFilter;
pub use execute_limit::ExecuteLimitFilter;
pub use monitor::MonitorFilter;
pub use timeout::TimeoutFilter;
pub use token::TokenFilter;
pub use tps_limit::TpsLimitFilter;

use crate::filter::FilterRegistry;
use mizzen_core::constants::{
    ACCESS_LOG_KEY, EXECUTES_KEY, SIDE_CONSUMER, SIDE_PROVIDER, TOKEN_KEY, TPS_LIMIT_RATE_KEY,
};
use mizzen_core::Activate;
use std::sync::Arc;

/// Register the built-in filters with their activation metadata
pub fn register_builtin(registry: &FilterRegistry) {
    registry.register_activate(
        "consumercontext",
        Activate { group: Some(SIDE_CONSUMER), order: -10_000, ..Default::default() },
        || Arc::new(ConsumerContextFilter),
    );
    registry.register_activate(
        "activelimit",
        Activate { group: Some(SIDE_CONSUMER), order: -9_000, ..Default::default() },
        || Arc::new(ActiveLimitFilter),
    );
    registry.register_activate(
        "context",
        Activate { group: Some(SIDE_PROVIDER), order: -10_000, ..Default::default() },
        || Arc::new(ContextFilter),
    );
    registry.register_activate(
        "exception",
        Activate { group: Some(SIDE_PROVIDER), order: -9_500, ..Default::default() },
        || Arc::new(ExceptionFilter),
    );
    registry.register_activate(
        "token",
        Activate {
            group: Some(SIDE_PROVIDER),
            value_key: Some(TOKEN_KEY),
            order: -9_000,
        },
        || Arc::new(TokenFilter),
    );
    registry.register_activate(
        "executelimit",
        Activate {
            group: Some(SIDE_PROVIDER),
            value_key: Some(EXECUTES_KEY),
            order: -8_000,
        },
        || Arc::new(ExecuteLimitFilter),
    );
    registry.register_activate(
        "tpslimit",
        Activate {
            group: Some(SIDE_PROVIDER),
            value_key: Some(TPS_LIMIT_RATE_KEY),
            order: -7_000,
        },
        || Arc::new(TpsLimitFilter::new()),
    );
    registry.register_activate(
        "accesslog",
        Activate {
            group: Some(SIDE_PROVIDER),
            value_key: Some(ACCESS_LOG_KEY),
            order: -6_000,
        },
        || Arc::new(AccessLogFilter),
    );
    registry.register_activate(
        "timeout",
        Activate { group: Some(SIDE_PROVIDER), order: -5_000, ..Default::default() },
        || Arc::new(TimeoutFilter),
    );
    registry.register("monitor", || Arc::new(MonitorFilter));
}

/// A fresh registry holding every built-in filter
pub fn builtin_registry() -> Arc<FilterRegistry> {
    let registry = Arc::new(FilterRegistry::new("Filter"));
    register_builtin(&registry);
    registry
}
