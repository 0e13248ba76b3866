//! Client for the room registry REST service.
//!
//! Used only to look a room up before joining; the session never depends on it.

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::RegistryError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RoomSettings {
    pub allow_screen_share: bool,
    pub allow_chat: bool,
    pub allow_recording: bool,
    pub mute_on_join: bool,
    pub video_off_on_join: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    pub name: String,
    pub max_participants: u32,
    #[serde(default)]
    pub participants: u32,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default)]
    pub settings: RoomSettings,
    pub host_id: String,
}

impl RoomInfo {
    pub fn has_room_for(&self, newcomers: u32) -> bool {
        self.participants.saturating_add(newcomers) <= self.max_participants
    }
}

#[derive(Deserialize)]
struct RoomEnvelope {
    room: RoomInfo,
}

#[derive(Clone)]
pub struct RegistryClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl RegistryClient {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, RegistryError> {
        let client = Client::builder().build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
            token,
        })
    }

    /// `GET {base}/rooms/room/{id}`
    pub async fn fetch_room(&self, room_id: &str) -> Result<RoomInfo, RegistryError> {
        let url = format!("{}/rooms/room/{}", self.base_url, room_id);
        let mut req = self.client.get(&url);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let message = resp
                .json::<Value>()
                .await
                .ok()
                .as_ref()
                .and_then(error_message)
                .unwrap_or_else(|| default_message(status));
            return Err(RegistryError::Api {
                status: status.as_u16(),
                message,
            });
        }
        let envelope: RoomEnvelope = resp.json().await?;
        debug!(room = %room_id, name = %envelope.room.name, "Room fetched");
        Ok(envelope.room)
    }
}

fn error_message(body: &Value) -> Option<String> {
    body.get("message")
        .or_else(|| body.get("error"))
        .and_then(Value::as_str)
        .map(str::to_owned)
}

fn default_message(status: StatusCode) -> String {
    match status {
        StatusCode::NOT_FOUND => "Room not found".to_owned(),
        _ => status.to_string(),
    }
}
