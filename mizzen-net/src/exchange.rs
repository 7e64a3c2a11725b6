//! Request/response exchange above the transport
//!
//! Each two-way request takes a fresh 64-bit id from a per-endpoint counter
//! and parks a one-shot future in the pending table; the matching response
//! completes it by id equality, so wraparound correlates correctly while the
//! open window stays small. Idle connections exchange heartbeat frames: a
//! client probes after `heartbeat` quiet milliseconds and reconnects after
//! three times that without any inbound traffic, and a server closes
//! channels that stay silent for the same three-fold window.

use crate::codec::{status, Frame, SerializationFormat};
use crate::dispatcher::{Dispatch, DispatchingHandler};
use crate::pool::WorkerPool;
use crate::transport::{Channel, ChannelHandler, Client, Server};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use mizzen_core::constants::{DEFAULT_HEARTBEAT_MS, HEARTBEAT_KEY, SERIALIZATION_KEY};
use mizzen_core::{Error, Result, Url};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

/// Completed response as seen by the exchange layer
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u8,
    pub format: SerializationFormat,
    pub body: Bytes,
}

/// Inbound request handed to an [`ExchangeHandler`]
#[derive(Debug, Clone)]
pub struct ExchangeRequest {
    pub id: u64,
    pub two_way: bool,
    pub format: SerializationFormat,
    pub body: Bytes,
    /// The body blew the payload limit and was discarded on the wire
    pub truncated: bool,
}

/// Reply produced by an [`ExchangeHandler`]
#[derive(Debug, Clone)]
pub struct ExchangeReply {
    pub status: u8,
    pub body: Bytes,
}

impl ExchangeReply {
    pub fn ok(body: Bytes) -> Self {
        Self { status: status::OK, body }
    }

    pub fn error(status: u8, format: SerializationFormat, message: &str) -> Self {
        let body = format.serialize(&message.to_string()).unwrap_or_default();
        Self { status, body: body.into() }
    }
}

/// Server-side request processor installed over an exchange server
#[async_trait]
pub trait ExchangeHandler: Send + Sync {
    async fn reply(&self, channel: Channel, request: ExchangeRequest) -> ExchangeReply;
}

type PendingTable = Arc<DashMap<u64, oneshot::Sender<Result<RawResponse>>>>;

/// One-shot handle for an in-flight two-way request
pub struct ResponseFuture {
    id: u64,
    rx: oneshot::Receiver<Result<RawResponse>>,
    pending: PendingTable,
}

impl ResponseFuture {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the correlated response; expiry removes the pending entry so
    /// a late response is dropped
    pub async fn wait(self, timeout: Duration) -> Result<RawResponse> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Network("connection dropped pending request".into())),
            Err(_) => {
                self.pending.remove(&self.id);
                Err(Error::Timeout(format!(
                    "request {} got no response within {:?}",
                    self.id, timeout
                )))
            }
        }
    }

    /// Abandon the request; a late response is dropped
    pub fn cancel(self) {
        if let Some((_, sender)) = self.pending.remove(&self.id) {
            sender
                .send(Err(Error::Internal(format!("request {} cancelled", self.id))))
                .ok();
        }
    }
}

struct ClientState {
    pending: PendingTable,
    format: SerializationFormat,
}

struct ExchangeClientHandler {
    state: Arc<ClientState>,
}

#[async_trait]
impl ChannelHandler for ExchangeClientHandler {
    async fn received(&self, channel: Channel, frame: Frame) {
        if frame.event {
            if frame.request {
                channel
                    .send(Frame::heartbeat_reply(frame.id, frame.format))
                    .ok();
            }
            // heartbeat replies only refresh the read timestamp
            return;
        }
        if frame.request {
            trace!("ignoring unexpected request {} on client channel", frame.id);
            return;
        }
        match self.state.pending.remove(&frame.id) {
            Some((_, sender)) => {
                let outcome = if frame.truncated {
                    Err(Error::Serialization(format!(
                        "response {} exceeded the payload limit",
                        frame.id
                    )))
                } else {
                    Ok(RawResponse { status: frame.status, format: frame.format, body: frame.body })
                };
                sender.send(outcome).ok();
            }
            None => trace!("dropping late response {}", frame.id),
        }
    }

    async fn disconnected(&self, channel: Channel) {
        let ids: Vec<u64> = self.state.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, sender)) = self.state.pending.remove(&id) {
                sender
                    .send(Err(Error::Network(format!(
                        "connection to {} lost with request {} in flight",
                        channel.peer_addr(),
                        id
                    ))))
                    .ok();
            }
        }
    }

    async fn caught(&self, channel: Channel, error: Error) {
        debug!("client channel to {} error: {}", channel.peer_addr(), error);
    }
}

/// Connecting side of the exchange: correlation table, timeouts, heartbeat
pub struct ExchangeClient {
    url: Url,
    client: Client,
    state: Arc<ClientState>,
    next_id: AtomicU64,
    heartbeat: Duration,
    closed: AtomicBool,
}

impl ExchangeClient {
    pub async fn connect(url: Url) -> Result<Arc<ExchangeClient>> {
        let format = SerializationFormat::from_name(
            url.param_or(SERIALIZATION_KEY, SerializationFormat::default().name()),
        )?;
        let state = Arc::new(ClientState { pending: Arc::new(DashMap::new()), format });
        let handler = Arc::new(ExchangeClientHandler { state: state.clone() });
        let client = Client::connect(url.clone(), handler).await?;
        let heartbeat = url.param_duration_ms(HEARTBEAT_KEY, DEFAULT_HEARTBEAT_MS);

        let exchange = Arc::new(ExchangeClient {
            url,
            client,
            state,
            next_id: AtomicU64::new(1),
            heartbeat,
            closed: AtomicBool::new(false),
        });
        Self::start_heartbeat(Arc::downgrade(&exchange));
        Ok(exchange)
    }

    fn start_heartbeat(this: Weak<ExchangeClient>) {
        tokio::spawn(async move {
            loop {
                let Some(client) = this.upgrade() else { break };
                let heartbeat = client.heartbeat;
                let tick = (heartbeat / 4).max(Duration::from_millis(50));
                drop(client);
                tokio::time::sleep(tick).await;

                let Some(client) = this.upgrade() else { break };
                if client.closed.load(Ordering::SeqCst) {
                    break;
                }
                let Some(channel) = client.client.channel() else { continue };
                let read_idle = Duration::from_millis(channel.read_idle_ms());
                let write_idle = Duration::from_millis(channel.write_idle_ms());
                if channel.is_closed() || read_idle >= heartbeat * 3 {
                    warn!(
                        "no traffic from {} for {:?}, reconnecting",
                        client.url.address(),
                        read_idle
                    );
                    if let Err(e) = client.client.reconnect().await {
                        warn!("reconnect to {} failed: {}", client.url.address(), e);
                    }
                } else if read_idle >= heartbeat || write_idle >= heartbeat {
                    let id = client.fresh_id();
                    trace!("sending heartbeat {} to {}", id, client.url.address());
                    channel.send(Frame::heartbeat(id, client.state.format)).ok();
                }
            }
        });
    }

    fn fresh_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn format(&self) -> SerializationFormat {
        self.state.format
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    pub fn pending_count(&self) -> usize {
        self.state.pending.len()
    }

    /// Send a two-way request and receive a future for the response
    pub fn request(&self, body: Bytes) -> Result<ResponseFuture> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Destroyed(format!("exchange client for {}", self.url.address())));
        }
        let id = self.fresh_id();
        let (tx, rx) = oneshot::channel();
        self.state.pending.insert(id, tx);
        let frame = Frame::request(id, self.state.format, true, body);
        if let Err(e) = self.client.send(frame) {
            self.state.pending.remove(&id);
            return Err(e);
        }
        Ok(ResponseFuture { id, rx, pending: self.state.pending.clone() })
    }

    /// Fire-and-forget: no id reserved, no future registered
    pub fn oneway(&self, body: Bytes) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Destroyed(format!("exchange client for {}", self.url.address())));
        }
        self.client.send(Frame::request(0, self.state.format, false, body))
    }

    pub async fn reconnect(&self) -> Result<()> {
        self.client.reconnect().await
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let ids: Vec<u64> = self.state.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, sender)) = self.state.pending.remove(&id) {
                sender
                    .send(Err(Error::Destroyed(format!(
                        "exchange client for {} closed",
                        self.url.address()
                    ))))
                    .ok();
            }
        }
        self.client.close();
    }
}

struct ExchangeServerHandler {
    handler: Arc<dyn ExchangeHandler>,
}

#[async_trait]
impl ChannelHandler for ExchangeServerHandler {
    async fn received(&self, channel: Channel, frame: Frame) {
        if frame.event {
            if frame.request {
                trace!("heartbeat {} from {}", frame.id, channel.peer_addr());
                channel
                    .send(Frame::heartbeat_reply(frame.id, frame.format))
                    .ok();
            }
            return;
        }
        if !frame.request {
            trace!("ignoring stray response {} on server channel", frame.id);
            return;
        }
        if frame.truncated {
            warn!(
                "request {} from {} exceeded the payload limit",
                frame.id,
                channel.peer_addr()
            );
            if frame.two_way {
                let reply = ExchangeReply::error(
                    status::BAD_REQUEST,
                    frame.format,
                    "request body exceeded the payload limit",
                );
                channel
                    .send(Frame::response(frame.id, frame.format, reply.status, reply.body))
                    .ok();
            }
            return;
        }

        let request = ExchangeRequest {
            id: frame.id,
            two_way: frame.two_way,
            format: frame.format,
            body: frame.body,
            truncated: false,
        };
        let two_way = frame.two_way;
        let id = frame.id;
        let format = frame.format;
        let reply = self.handler.reply(channel.clone(), request).await;
        if two_way {
            channel.send(Frame::response(id, format, reply.status, reply.body)).ok();
        }
    }

    async fn caught(&self, channel: Channel, error: Error) {
        debug!("server channel from {} error: {}", channel.peer_addr(), error);
    }
}

/// Listening side of the exchange
pub struct ExchangeServer {
    server: Server,
    heartbeat: Duration,
    closed: Arc<AtomicBool>,
}

impl ExchangeServer {
    pub async fn bind(url: Url, handler: Arc<dyn ExchangeHandler>) -> Result<Arc<ExchangeServer>> {
        let pool = Arc::new(WorkerPool::from_url(&url)?);
        let dispatch = Dispatch::from_url(&url)?;
        let inner = Arc::new(ExchangeServerHandler { handler });
        let dispatching = Arc::new(DispatchingHandler::new(inner, dispatch, pool));
        let server = Server::bind(url.clone(), dispatching).await?;
        let heartbeat = url.param_duration_ms(HEARTBEAT_KEY, DEFAULT_HEARTBEAT_MS);
        let closed = Arc::new(AtomicBool::new(false));

        let exchange = Arc::new(ExchangeServer { server, heartbeat, closed });
        exchange.clone().start_idle_sweep();
        Ok(exchange)
    }

    /// Close channels that stayed silent for three heartbeat periods
    fn start_idle_sweep(self: Arc<Self>) {
        let this = Arc::downgrade(&self);
        drop(self);
        tokio::spawn(async move {
            loop {
                let Some(server) = this.upgrade() else { break };
                if server.closed.load(Ordering::SeqCst) {
                    break;
                }
                let heartbeat = server.heartbeat;
                let limit = heartbeat * 3;
                for channel in server.server.channels() {
                    let idle = Duration::from_millis(channel.read_idle_ms());
                    if idle >= limit {
                        info!(
                            "closing idle channel from {} after {:?}",
                            channel.peer_addr(),
                            idle
                        );
                        channel.close();
                    }
                }
                let tick = (heartbeat / 4).max(Duration::from_millis(50));
                drop(server);
                tokio::time::sleep(tick).await;
            }
        });
    }

    pub fn url(&self) -> &Url {
        self.server.url()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn channels(&self) -> Vec<Channel> {
        self.server.channels()
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.server.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoUpper;

    #[async_trait]
    impl ExchangeHandler for EchoUpper {
        async fn reply(&self, _channel: Channel, request: ExchangeRequest) -> ExchangeReply {
            let text: String = match request.format.deserialize(&request.body) {
                Ok(t) => t,
                Err(_) => return ExchangeReply::error(status::BAD_REQUEST, request.format, "bad body"),
            };
            let body = request.format.serialize(&text.to_uppercase()).unwrap();
            ExchangeReply::ok(body.into())
        }
    }

    async fn bind_echo(params: &[(&str, &str)]) -> (Arc<ExchangeServer>, Url) {
        let mut url = Url::new("mizzen", "127.0.0.1", 0, "echo");
        for (k, v) in params {
            url = url.with_param(*k, *v);
        }
        let server = ExchangeServer::bind(url.clone(), Arc::new(EchoUpper)).await.unwrap();
        let client_url = url.with_port(server.local_addr().port());
        (server, client_url)
    }

    async fn call(client: &ExchangeClient, text: &str) -> Result<String> {
        let body = client.format().serialize(&text.to_string())?;
        let response = client
            .request(body.into())?
            .wait(Duration::from_secs(1))
            .await?;
        assert_eq!(response.status, status::OK);
        response.format.deserialize(&response.body)
    }

    #[tokio::test]
    async fn request_response_correlation() {
        let (_server, url) = bind_echo(&[]).await;
        let client = ExchangeClient::connect(url).await.unwrap();

        // several requests in flight at once, all correlate by id
        let futures: Vec<_> = (0..8)
            .map(|i| {
                let body = client.format().serialize(&format!("msg{}", i)).unwrap();
                (i, client.request(body.into()).unwrap())
            })
            .collect();
        for (i, future) in futures {
            let response = future.wait(Duration::from_secs(1)).await.unwrap();
            let text: String = response.format.deserialize(&response.body).unwrap();
            assert_eq!(text, format!("MSG{}", i));
        }
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn timeout_removes_pending_entry() {
        struct Sluggish;
        #[async_trait]
        impl ExchangeHandler for Sluggish {
            async fn reply(&self, _c: Channel, request: ExchangeRequest) -> ExchangeReply {
                tokio::time::sleep(Duration::from_millis(500)).await;
                ExchangeReply::ok(request.body)
            }
        }
        let url = Url::new("mizzen", "127.0.0.1", 0, "slow");
        let server = ExchangeServer::bind(url.clone(), Arc::new(Sluggish)).await.unwrap();
        let client = ExchangeClient::connect(url.with_port(server.local_addr().port()))
            .await
            .unwrap();

        let body = client.format().serialize(&"x".to_string()).unwrap();
        let future = client.request(body.into()).unwrap();
        let err = future.wait(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn cancel_drops_late_response() {
        let (_server, url) = bind_echo(&[]).await;
        let client = ExchangeClient::connect(url).await.unwrap();
        let body = client.format().serialize(&"x".to_string()).unwrap();
        let future = client.request(body.into()).unwrap();
        future.cancel();
        assert_eq!(client.pending_count(), 0);
        // the late response finds no pending entry and is discarded
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn disconnect_fails_pending_futures() {
        struct BlackHole;
        #[async_trait]
        impl ExchangeHandler for BlackHole {
            async fn reply(&self, _c: Channel, _r: ExchangeRequest) -> ExchangeReply {
                tokio::time::sleep(Duration::from_secs(30)).await;
                ExchangeReply::ok(Bytes::new())
            }
        }
        let url = Url::new("mizzen", "127.0.0.1", 0, "hole");
        let server = ExchangeServer::bind(url.clone(), Arc::new(BlackHole)).await.unwrap();
        let client = ExchangeClient::connect(url.with_port(server.local_addr().port()))
            .await
            .unwrap();

        let body = client.format().serialize(&"x".to_string()).unwrap();
        let future = client.request(body.into()).unwrap();
        server.close();

        let err = future.wait(Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, Error::Network(_)), "got {:?}", err);
    }

    #[tokio::test]
    async fn heartbeat_keeps_quiet_connection_alive() {
        // 120ms heartbeat: with no requests flowing, probes must prevent the
        // server idle sweep (3x) from closing the channel
        let (server, url) = bind_echo(&[("heartbeat", "120")]).await;
        let client = ExchangeClient::connect(url).await.unwrap();
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(server.channels().len(), 1);
        assert!(client.is_connected());
        let out = call(&client, "still here").await.unwrap();
        assert_eq!(out, "STILL HERE");
    }

    #[tokio::test]
    async fn oversized_request_gets_bad_request_but_connection_survives() {
        let (_server, url) = bind_echo(&[("payload", "64")]).await;
        let client = ExchangeClient::connect(url).await.unwrap();

        let big = client.format().serialize(&"y".repeat(500)).unwrap();
        let response = client
            .request(big.into())
            .unwrap()
            .wait(Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(response.status, status::BAD_REQUEST);

        // connection is still usable
        let out = call(&client, "ok").await.unwrap();
        assert_eq!(out, "OK");
    }
}
