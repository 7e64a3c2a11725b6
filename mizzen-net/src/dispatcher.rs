//! Dispatch strategies: which channel events leave the I/O task
//!
//! The read task delivers events inline; a [`DispatchingHandler`] forwards a
//! configurable subset of them to the worker pool so user code never blocks
//! the connection. When the pool rejects a two-way request the caller gets a
//! `SERVER_THREADPOOL_EXHAUSTED` response instead of silence.

use crate::codec::{status, Frame};
use crate::pool::WorkerPool;
use crate::transport::{Channel, ChannelHandler};
use async_trait::async_trait;
use mizzen_core::constants::DISPATCHER_KEY;
use mizzen_core::{Error, Result, Url};
use std::sync::Arc;
use tracing::warn;

/// Which events hop from the I/O task to the worker pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Everything runs on the pool
    All,
    /// Everything runs inline on the I/O task
    Direct,
    /// Only received messages run on the pool
    Message,
    /// Only received requests run on the pool; responses complete inline
    Execution,
    /// Connect/disconnect and messages run on the pool
    Connection,
}

impl Dispatch {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "all" => Ok(Dispatch::All),
            "direct" => Ok(Dispatch::Direct),
            "message" => Ok(Dispatch::Message),
            "execution" => Ok(Dispatch::Execution),
            "connection" => Ok(Dispatch::Connection),
            other => Err(Error::Extension(format!(
                "no extension named '{}' for Dispatcher",
                other
            ))),
        }
    }

    pub fn from_url(url: &Url) -> Result<Self> {
        Self::from_name(url.param_or(DISPATCHER_KEY, "all"))
    }

    fn lifecycle_on_pool(&self) -> bool {
        matches!(self, Dispatch::All | Dispatch::Connection)
    }

    fn message_on_pool(&self, frame: &Frame) -> bool {
        match self {
            Dispatch::All | Dispatch::Message | Dispatch::Connection => true,
            Dispatch::Execution => frame.request,
            Dispatch::Direct => false,
        }
    }
}

/// Handler wrapper applying a [`Dispatch`] strategy over a [`WorkerPool`]
pub struct DispatchingHandler {
    inner: Arc<dyn ChannelHandler>,
    dispatch: Dispatch,
    pool: Arc<WorkerPool>,
}

impl DispatchingHandler {
    pub fn new(inner: Arc<dyn ChannelHandler>, dispatch: Dispatch, pool: Arc<WorkerPool>) -> Self {
        Self { inner, dispatch, pool }
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }
}

#[async_trait]
impl ChannelHandler for DispatchingHandler {
    async fn connected(&self, channel: Channel) {
        if self.dispatch.lifecycle_on_pool() {
            let inner = self.inner.clone();
            if let Err(e) = self.pool.execute(async move { inner.connected(channel).await }) {
                warn!("connect event dropped: {}", e);
            }
        } else {
            self.inner.connected(channel).await;
        }
    }

    async fn disconnected(&self, channel: Channel) {
        if self.dispatch.lifecycle_on_pool() {
            let inner = self.inner.clone();
            if let Err(e) = self.pool.execute(async move { inner.disconnected(channel).await }) {
                warn!("disconnect event dropped: {}", e);
            }
        } else {
            self.inner.disconnected(channel).await;
        }
    }

    async fn sent(&self, channel: Channel, frame: &Frame) {
        self.inner.sent(channel, frame).await;
    }

    async fn received(&self, channel: Channel, frame: Frame) {
        // heartbeats are latency-sensitive and never leave the I/O task
        if frame.event || !self.dispatch.message_on_pool(&frame) {
            self.inner.received(channel, frame).await;
            return;
        }
        let inner = self.inner.clone();
        let reply_exhausted = frame.request && frame.two_way;
        let id = frame.id;
        let format = frame.format;
        let task_channel = channel.clone();
        let outcome = self.pool.execute(async move { inner.received(task_channel, frame).await });
        if let Err(e) = outcome {
            warn!("request {} rejected by worker pool: {}", id, e);
            if reply_exhausted {
                let body = format.serialize(&e.to_string()).unwrap_or_default();
                let reply = Frame::response(
                    id,
                    format,
                    status::SERVER_THREADPOOL_EXHAUSTED,
                    body.into(),
                );
                channel.send(reply).ok();
            }
        }
    }

    async fn caught(&self, channel: Channel, error: Error) {
        self.inner.caught(channel, error).await;
    }
}
