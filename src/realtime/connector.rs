use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::future;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::config::Config;
use crate::error::{Result, SyncError};

pub type FrameSink = Pin<Box<dyn Sink<String, Error = SyncError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// An open bidirectional channel of text frames.
pub struct Connection {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl Connection {
    pub fn new(sink: FrameSink, stream: FrameStream) -> Self {
        Self { sink, stream }
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Connection>;
}

// == WebSocket Connector ==
#[derive(Debug, Clone)]
pub struct WsConnector {
    endpoint: String,
    timeout: Duration,
}

impl WsConnector {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.ws_endpoint.clone(), config.request_timeout())
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Connection> {
        debug!(endpoint = %self.endpoint, "Opening realtime channel");
        let (socket, _) = tokio::time::timeout(
            self.timeout,
            tokio_tungstenite::connect_async(self.endpoint.as_str()),
        )
        .await
        .map_err(|_| SyncError::Timeout(self.timeout))?
        .map_err(|e| SyncError::Channel(format!("network error connecting: {}", e)))?;

        let (write, read) = socket.split();
        let sink = write
            .sink_map_err(|e| SyncError::Channel(e.to_string()))
            .with(|text: String| future::ready(Ok::<_, SyncError>(Message::Text(text))));
        let stream = read.filter_map(|frame| {
            future::ready(match frame {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(_) => None,
                Err(e) => Some(Err(SyncError::Channel(e.to_string()))),
            })
        });
        Ok(Connection::new(Box::pin(sink), Box::pin(stream)))
    }
}
