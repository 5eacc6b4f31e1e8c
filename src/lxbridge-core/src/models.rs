use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// The only action a query run ever asks a source script for.
pub const MUSIC_URL_ACTION: &str = "musicUrl";

/// One stream-URL lookup, as given on the command line.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    /// Script-specific source identifier (e.g. `kw`, `wy`).
    pub source: String,
    pub song_id: String,
    /// Bitrate/format tier token; the vocabulary belongs to the script.
    pub quality: String,
    /// Extra `musicInfo` fields. Empty when the raw JSON was missing or malformed.
    pub extra_info: Map<String, Value>,
}

impl Query {
    pub fn new(
        source: impl Into<String>,
        song_id: impl Into<String>,
        quality: impl Into<String>,
        raw_info: &str,
    ) -> Self {
        Self {
            source: source.into(),
            song_id: song_id.into(),
            quality: quality.into(),
            extra_info: parse_extra_info(raw_info),
        }
    }

    /// Build the `request` event payload handed to the script.
    pub fn payload(&self) -> RequestPayload {
        let mut music_info = Map::new();
        music_info.insert("songmid".into(), Value::String(self.song_id.clone()));
        music_info.insert("hash".into(), Value::String(self.song_id.clone()));
        for (key, value) in &self.extra_info {
            music_info.insert(key.clone(), value.clone());
        }

        RequestPayload {
            action: MUSIC_URL_ACTION.to_string(),
            source: self.source.clone(),
            info: MusicRequestInfo {
                music_info,
                quality: self.quality.clone(),
            },
        }
    }
}

/// Parse the info argument; anything that is not a JSON object counts as empty.
fn parse_extra_info(raw: &str) -> Map<String, Value> {
    if raw.trim().is_empty() {
        return Map::new();
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => map,
        Ok(other) => {
            tracing::debug!(kind = json_kind(&other), "info JSON is not an object, ignoring");
            Map::new()
        }
        Err(err) => {
            tracing::debug!(error = %err, "malformed info JSON, using empty map");
            Map::new()
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Payload of the `request` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestPayload {
    pub action: String,
    pub source: String,
    pub info: MusicRequestInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MusicRequestInfo {
    #[serde(rename = "musicInfo")]
    pub music_info: Map<String, Value>,
    #[serde(rename = "type")]
    pub quality: String,
}

/// Terminal outcome of one run; exactly one is printed.
#[derive(Debug, Clone, PartialEq)]
pub enum InvocationResult {
    Success(Value),
    Failure(String),
    InvalidInput,
}

impl InvocationResult {
    pub const SUCCESS_CODE: u8 = 0;
    pub const FAILURE_CODE: u8 = 2;

    pub fn failure(message: impl Into<String>) -> Self {
        Self::Failure(message.into())
    }

    pub fn code(&self) -> u8 {
        match self {
            Self::Success(_) => Self::SUCCESS_CODE,
            Self::Failure(_) | Self::InvalidInput => Self::FAILURE_CODE,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Success(data) => json!({ "code": Self::SUCCESS_CODE, "data": data }),
            Self::Failure(msg) => json!({ "code": Self::FAILURE_CODE, "msg": msg }),
            Self::InvalidInput => json!({ "code": Self::FAILURE_CODE, "msg": "invalid args" }),
        }
    }

    /// Single-line rendering for stdout.
    pub fn to_line(&self) -> String {
        self.to_json().to_string()
    }
}
