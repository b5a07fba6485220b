//! Channel/event message bus over a hosted pub/sub service.
//!
//! A channel is identified by a channel name and an event name. Messages
//! sent on a channel are broadcast through the remote service and come
//! back to every local subscriber through a replaying stream, so late
//! subscribers still see what was published before they hooked in.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use futures_util::StreamExt;
//! use litebus::{LoopbackTransport, MessageBus};
//!
//! # async fn run() -> litebus::Result<()> {
//! let bus = MessageBus::new(Arc::new(LoopbackTransport::new()));
//! let mut messages = bus.hook::<String>("ui", "notice").await?;
//!
//! bus.send("ui", "notice", "hello").await?;
//! if let Some(message) = messages.next().await {
//!     println!("{}", message?);
//! }
//! # Ok(())
//! # }
//! ```

pub mod binding;
pub mod bus;
pub mod config;
pub mod connection;
pub mod error;
pub mod registry;
pub mod replay;
pub mod subscription;
pub mod transport;

pub use bus::MessageBus;
pub use config::{BusSettings, Settings, TransportSettings};
pub use error::{BusError, Result, TransportError};
pub use subscription::MessageStream;
pub use transport::{
    ConnectionStatus, LoopbackTransport, RemoteChannel, RemoteTransport, WsTransport,
};

pub use litebus_protocol::{ChannelCreated, ChannelKey, MessageEnvelope};
