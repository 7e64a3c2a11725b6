//! # Mizzen Config
//!
//! The orchestration layer: service descriptors become exports, reference
//! descriptors become typed proxies, the process context owns the wired
//! extension plane, and the shutdown hook tears it all down exactly once.

pub mod context;
pub mod descriptor;
pub mod env;
pub mod reference;
pub mod service;
pub mod shutdown;

pub use context::MizzenContext;
pub use descriptor::{
    MethodDescriptor, ProtocolDescriptor, ReferenceDescriptor, Scope, ServiceDescriptor,
};
pub use reference::ReferenceConfig;
pub use service::ServiceConfig;
pub use shutdown::ShutdownHook;
