//! Process shutdown hook
//!
//! Tears down the context exactly once no matter how many paths race into
//! it: an explicit call, the signal task, or drop-time cleanup.

use crate::context::MizzenContext;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

pub struct ShutdownHook {
    context: Arc<MizzenContext>,
    destroyed: AtomicBool,
}

impl ShutdownHook {
    pub fn new(context: Arc<MizzenContext>) -> Arc<Self> {
        Arc::new(Self { context, destroyed: AtomicBool::new(false) })
    }

    /// Listen for ctrl-c and run the teardown when it arrives
    pub fn install(self: &Arc<Self>) {
        let hook = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                hook.destroy_all().await;
            }
        });
    }

    pub fn has_run(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Destroy all registries, then all protocols; only the first caller
    /// does any work
    pub async fn destroy_all(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("running shutdown hook");
        self.context.destroy().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn runs_exactly_once_under_contention() {
        let context = MizzenContext::new();
        let hook = ShutdownHook::new(context.clone());

        let winners = Arc::new(AtomicU32::new(0));
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let hook = hook.clone();
            let winners = winners.clone();
            tasks.push(tokio::spawn(async move {
                let ran_before = hook.has_run();
                hook.destroy_all().await;
                if !ran_before && hook.has_run() {
                    winners.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert!(hook.has_run());
        assert!(context.is_destroyed());
    }

    #[tokio::test]
    async fn second_call_is_a_no_op() {
        let hook = ShutdownHook::new(MizzenContext::new());
        hook.destroy_all().await;
        assert!(hook.has_run());
        hook.destroy_all().await;
        assert!(hook.has_run());
    }
}
