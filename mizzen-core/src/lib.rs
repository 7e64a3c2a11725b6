//! # Mizzen Core
//!
//! Shared foundation for the Mizzen RPC framework: the universal [`url::Url`]
//! descriptor, the [`buffer::ChannelBuffer`] underlying wire framing, the
//! extension plane, and the common error model.

pub mod buffer;
pub mod constants;
pub mod error;
pub mod extension;
pub mod url;

pub use buffer::{BufferError, ChannelBuffer};
pub use error::{Error, ErrorKind, Result};
pub use extension::{Activate, AdaptiveExtension, ExtensionRegistry};
pub use url::Url;
