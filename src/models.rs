use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ClientError, ClientResult};

/// `{message}` or `{error}` body returned by most mutating endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageReply {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl MessageReply {
    /// A 2xx body with an `error` field is an application error.
    pub fn into_result(self) -> ClientResult<String> {
        match (self.error, self.message) {
            (Some(error), _) => Err(ClientError::Application(error)),
            (None, Some(message)) => Ok(message),
            (None, None) => Ok(String::new()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct JobProgress {
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub status: Option<String>,
}

impl JobProgress {
    pub fn percent(&self) -> u8 {
        self.progress.round().clamp(0.0, 100.0) as u8
    }

    pub fn status_text(&self) -> Option<&str> {
        self.status.as_deref().filter(|s| !s.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Source {
    pub name: String,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default)]
    pub is_owner: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatsResponse {
    #[serde(default)]
    pub count: Option<u64>,
    #[serde(default)]
    pub sources: Option<Vec<Source>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChatSummary {
    #[serde(deserialize_with = "id_as_string")]
    pub id: String,
    pub title: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatDetail {
    #[serde(deserialize_with = "id_as_string")]
    pub id: String,
    #[serde(default)]
    pub messages: Vec<StoredMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoredMessage {
    pub role: String,
    pub content: String,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default, deserialize_with = "opt_id_as_string")]
    pub id: Option<String>,
    #[serde(default)]
    pub stats: Option<AnswerStats>,
    #[serde(default)]
    pub reference_details: Vec<ReferenceDetail>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AnswerStats {
    #[serde(default)]
    pub time: f64,
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ReferenceDetail {
    pub source: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AskRequest {
    pub query: String,
    pub sources: Vec<String>,
    pub chat_id: Option<String>,
}

/// Server-side settings. Unknown fields are kept so a save round-trips them.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ServerConfig {
    pub model: ModelSettings,
    #[serde(default)]
    pub logging: ServerLogging,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ModelSettings {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub temperature: f64,
    #[serde(default)]
    pub max_tokens: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ServerLogging {
    pub level: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for ServerLogging {
    fn default() -> Self {
        ServerLogging { level: "INFO".to_string(), extra: Map::new() }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AvailableModels {
    #[serde(default)]
    pub models: Vec<String>,
}

/// Problem report attached to a bot answer.
#[derive(Debug, Clone, Default)]
pub struct ProblemReport {
    pub content: String,
    pub message_id: Option<String>,
    pub image: Option<std::path::PathBuf>,
}

// Chat and message ids come back as numbers from some server versions.
fn id_as_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("unexpected id: {}", other))),
    }
}

fn opt_id_as_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!("unexpected id: {}", other))),
    }
}
