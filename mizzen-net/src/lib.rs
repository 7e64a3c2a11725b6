//! # Mizzen Net
//!
//! Transport and exchange layers of the Mizzen RPC framework: TCP servers
//! and clients with the channel event model, the framed wire codec,
//! dispatch strategies, worker pools, and request/response correlation with
//! heartbeat maintenance.

pub mod codec;
pub mod dispatcher;
pub mod exchange;
pub mod pool;
pub mod transport;

pub use codec::{status, ExchangeCodec, Frame, SerializationFormat};
pub use dispatcher::{Dispatch, DispatchingHandler};
pub use exchange::{
    ExchangeClient, ExchangeHandler, ExchangeReply, ExchangeRequest, ExchangeServer, RawResponse,
    ResponseFuture,
};
pub use pool::{ThreadPoolKind, WorkerPool};
pub use transport::{Channel, ChannelHandler, Client, Server};
