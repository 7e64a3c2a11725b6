//! TCP transport: servers, clients, and the channel event model
//!
//! A [`Channel`] is one live connection. Handlers observe the five channel
//! events (connected, disconnected, sent, received, caught); `received` runs
//! on the connection's read task unless a dispatcher moves it to the worker
//! pool, so handlers must never block there.

use crate::codec::{ExchangeCodec, Frame};
use async_trait::async_trait;
use dashmap::DashMap;
use mizzen_core::constants::{DEFAULT_PAYLOAD, PAYLOAD_KEY};
use mizzen_core::{ChannelBuffer, Error, Result, Url};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

const READ_CHUNK: usize = 8 * 1024;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 3_000;

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

fn now_ms() -> u64 {
    EPOCH.elapsed().as_millis() as u64
}

/// Handler for channel events
#[async_trait]
pub trait ChannelHandler: Send + Sync {
    async fn connected(&self, _channel: Channel) {}
    async fn disconnected(&self, _channel: Channel) {}
    async fn sent(&self, _channel: Channel, _frame: &Frame) {}
    async fn received(&self, channel: Channel, frame: Frame);
    async fn caught(&self, _channel: Channel, _error: Error) {}
}

struct ChannelInner {
    id: u64,
    url: Url,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    writer: mpsc::UnboundedSender<Frame>,
    closed: AtomicBool,
    close_notify: Notify,
    last_read_ms: AtomicU64,
    last_write_ms: AtomicU64,
}

/// One live connection; cheap to clone
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    /// Queue a frame for writing; fails once the channel is closed
    pub fn send(&self, frame: Frame) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Network(format!(
                "channel to {} is closed",
                self.inner.peer_addr
            )));
        }
        self.inner
            .writer
            .send(frame)
            .map_err(|_| Error::Network(format!("channel to {} is closed", self.inner.peer_addr)))
    }

    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            trace!("channel {} to {} closed", self.inner.id, self.inner.peer_addr);
        }
        self.inner.close_notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Milliseconds since the last inbound frame
    pub fn read_idle_ms(&self) -> u64 {
        now_ms().saturating_sub(self.inner.last_read_ms.load(Ordering::Relaxed))
    }

    /// Milliseconds since the last outbound frame
    pub fn write_idle_ms(&self) -> u64 {
        now_ms().saturating_sub(self.inner.last_write_ms.load(Ordering::Relaxed))
    }

    fn mark_read(&self) {
        self.inner.last_read_ms.store(now_ms(), Ordering::Relaxed);
    }

    fn mark_write(&self) {
        self.inner.last_write_ms.store(now_ms(), Ordering::Relaxed);
    }
}

static CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Spawn read/write tasks for an established stream and hand back the channel
fn start_channel(
    stream: TcpStream,
    url: Url,
    handler: Arc<dyn ChannelHandler>,
    on_close: Option<Arc<dyn Fn(&Channel) + Send + Sync>>,
) -> Result<Channel> {
    stream.set_nodelay(true).ok();
    let local_addr = stream.local_addr()?;
    let peer_addr = stream.peer_addr()?;
    let (mut read_half, mut write_half) = stream.into_split();
    let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Frame>();

    let now = now_ms();
    let channel = Channel {
        inner: Arc::new(ChannelInner {
            id: CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            url: url.clone(),
            local_addr,
            peer_addr,
            writer: writer_tx,
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
            last_read_ms: AtomicU64::new(now),
            last_write_ms: AtomicU64::new(now),
        }),
    };
    let payload_limit = url.param_usize(PAYLOAD_KEY, DEFAULT_PAYLOAD);

    // write task: frames queued on the channel are encoded and flushed here
    {
        let channel = channel.clone();
        let handler = handler.clone();
        tokio::spawn(async move {
            let codec = ExchangeCodec::new(usize::MAX);
            loop {
                let frame = tokio::select! {
                    maybe = writer_rx.recv() => match maybe {
                        Some(frame) => frame,
                        None => break,
                    },
                    _ = channel.inner.close_notify.notified() => break,
                };
                let mut buf = ChannelBuffer::dynamic(frame.body.len() + 32);
                if let Err(e) = codec.encode(&frame, &mut buf) {
                    handler.caught(channel.clone(), e).await;
                    continue;
                }
                if let Err(e) = write_half.write_all(buf.readable()).await {
                    handler.caught(channel.clone(), e.into()).await;
                    channel.close();
                    break;
                }
                channel.mark_write();
                handler.sent(channel.clone(), &frame).await;
            }
        });
    }

    // read task: bytes accumulate in a channel buffer and frames decode out
    {
        let channel = channel.clone();
        tokio::spawn(async move {
            handler.connected(channel.clone()).await;
            let mut codec = ExchangeCodec::new(payload_limit);
            let mut buf = ChannelBuffer::dynamic(READ_CHUNK);
            let mut chunk = [0u8; READ_CHUNK];
            'outer: loop {
                if channel.is_closed() {
                    break;
                }
                let read = tokio::select! {
                    r = read_half.read(&mut chunk) => r,
                    _ = channel.inner.close_notify.notified() => break,
                };
                let n = match read {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        if !channel.is_closed() {
                            handler.caught(channel.clone(), e.into()).await;
                        }
                        break;
                    }
                };
                if buf.write_slice(&chunk[..n]).is_err() {
                    break;
                }
                loop {
                    match codec.decode(&mut buf) {
                        Ok(Some(frame)) => {
                            channel.mark_read();
                            handler.received(channel.clone(), frame).await;
                        }
                        Ok(None) => break,
                        Err(e) => {
                            handler.caught(channel.clone(), e).await;
                            break 'outer;
                        }
                    }
                }
                buf.discard_read_bytes();
            }
            channel.close();
            if let Some(on_close) = on_close {
                on_close(&channel);
            }
            handler.disconnected(channel.clone()).await;
        });
    }

    Ok(channel)
}

/// Listening endpoint
pub struct Server {
    url: Url,
    local_addr: SocketAddr,
    channels: Arc<DashMap<SocketAddr, Channel>>,
    closed: Arc<AtomicBool>,
}

impl Server {
    /// Bind and serve every accepted connection with `handler`. The socket
    /// address comes from `bind.ip`/`bind.port` when set (publishing address
    /// and bind address may differ behind NAT), else from host and port.
    pub async fn bind(url: Url, handler: Arc<dyn ChannelHandler>) -> Result<Server> {
        let bind_host = url.param_or("bind.ip", url.host()).to_string();
        let bind_port = url
            .param("bind.port")
            .and_then(|p| p.parse().ok())
            .unwrap_or_else(|| url.port());
        let listener = TcpListener::bind((bind_host.as_str(), bind_port)).await?;
        let local_addr = listener.local_addr()?;
        info!("server bound on {}", local_addr);

        let channels: Arc<DashMap<SocketAddr, Channel>> = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));

        {
            let channels = channels.clone();
            let closed = closed.clone();
            let url = url.clone();
            tokio::spawn(async move {
                loop {
                    let (stream, peer) = match listener.accept().await {
                        Ok(pair) => pair,
                        Err(e) => {
                            if closed.load(Ordering::SeqCst) {
                                break;
                            }
                            warn!("accept failed: {}", e);
                            continue;
                        }
                    };
                    if closed.load(Ordering::SeqCst) {
                        break;
                    }
                    debug!("accepted connection from {}", peer);
                    let on_close = {
                        let channels = channels.clone();
                        Arc::new(move |ch: &Channel| {
                            channels.remove(&ch.peer_addr());
                        }) as Arc<dyn Fn(&Channel) + Send + Sync>
                    };
                    match start_channel(stream, url.clone(), handler.clone(), Some(on_close)) {
                        Ok(channel) => {
                            channels.insert(peer, channel);
                        }
                        Err(e) => warn!("failed to start channel for {}: {}", peer, e),
                    }
                }
            });
        }

        Ok(Server { url, local_addr, channels, closed })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn channels(&self) -> Vec<Channel> {
        self.channels.iter().map(|e| e.value().clone()).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("server on {} closing", self.local_addr);
        for entry in self.channels.iter() {
            entry.value().close();
        }
        self.channels.clear();
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.close();
    }
}

/// Connecting endpoint with reconnect support
pub struct Client {
    url: Url,
    handler: Arc<dyn ChannelHandler>,
    channel: RwLock<Option<Channel>>,
    closed: AtomicBool,
}

impl Client {
    pub async fn connect(url: Url, handler: Arc<dyn ChannelHandler>) -> Result<Client> {
        let client = Client {
            url,
            handler,
            channel: RwLock::new(None),
            closed: AtomicBool::new(false),
        };
        let channel = client.open().await?;
        *client.channel.write() = Some(channel);
        Ok(client)
    }

    async fn open(&self) -> Result<Channel> {
        let connect_timeout =
            self.url.param_duration_ms("connect.timeout", DEFAULT_CONNECT_TIMEOUT_MS);
        let address = self.url.address();
        let stream = timeout(connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| Error::Timeout(format!("connect to {} timed out", address)))??;
        debug!("connected to {}", address);
        start_channel(stream, self.url.clone(), self.handler.clone(), None)
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn channel(&self) -> Option<Channel> {
        self.channel.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.channel().map(|c| !c.is_closed()).unwrap_or(false)
    }

    pub fn send(&self, frame: Frame) -> Result<()> {
        match self.channel() {
            Some(channel) if !channel.is_closed() => channel.send(frame),
            _ => Err(Error::Network(format!("not connected to {}", self.url.address()))),
        }
    }

    /// Tear down the current connection and establish a fresh one
    pub async fn reconnect(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Destroyed(format!("client for {}", self.url.address())));
        }
        if let Some(old) = self.channel.write().take() {
            old.close();
        }
        let fresh = self.open().await?;
        *self.channel.write() = Some(fresh);
        info!("reconnected to {}", self.url.address());
        Ok(())
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(channel) = self.channel.write().take() {
            channel.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}
