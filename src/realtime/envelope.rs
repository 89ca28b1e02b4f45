use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::Result;

/// Topic announcing connection-level notices from the server.
pub const CONNECTION_TOPIC: &str = "connection";

/// Hello frame sent after every successful connect.
pub const HELLO_TOPIC: &str = "hello";

/// Wire frame `{"type": ..., "payload": ...}`; `type` is the topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub topic: String,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
        }
    }

    pub fn hello(client_id: &str) -> Self {
        Self::new(HELLO_TOPIC, json!({ "client_id": client_id }))
    }

    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
