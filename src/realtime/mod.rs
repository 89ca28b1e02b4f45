//! Realtime Module
//!
//! The persistent, auto-reconnecting event channel and its topic registry.

mod backoff;
mod channel;
mod connector;
mod envelope;
mod registry;
mod state;

pub use backoff::ReconnectPolicy;
pub use channel::ChannelManager;
pub use connector::{Connection, Connector, FrameSink, FrameStream, WsConnector};
pub use envelope::{Envelope, CONNECTION_TOPIC, HELLO_TOPIC};
pub use registry::{DispatchReport, Handler, HandlerId, SubscriptionRegistry};
pub use state::ConnectionState;
