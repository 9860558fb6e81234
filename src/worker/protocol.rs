use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Id of the start handshake. The worker also uses it to ask for a reload.
pub const START_ID: &str = "1";
pub const RELOAD_RESULT: &str = "reload";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub id: String,
    #[serde(flatten)]
    pub body: RequestBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestBody {
    Start {
        init_args: Value,
    },
    Run {
        code: String,
        #[serde(default)]
        validated_args: Value,
        #[serde(default)]
        user: Value,
    },
    OnMount {
        code: String,
    },
    ProcStats,
}

/// Anything the worker writes on stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkerMessage {
    Response(WorkerResponse),
    Event(WorkerEvent),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub id: String,
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

/// Unsolicited messages, not tied to a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    Error { error: Value },
}

impl WorkerResponse {
    pub fn ok(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            result,
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, error: Value) -> Self {
        Self {
            id: id.into(),
            result: Value::Null,
            error: Some(error),
        }
    }

    pub fn is_reload(&self) -> bool {
        self.id == START_ID && self.result.as_str() == Some(RELOAD_RESULT)
    }
}

impl WorkerEvent {
    pub fn error_code(&self) -> Option<&str> {
        match self {
            WorkerEvent::Error { error } => error.get("code").and_then(Value::as_str),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProcStats {
    pub pid: u32,
    pub cpu: f32,
    pub mem: u64,
    pub uptime: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn requests_are_flat_objects() {
        let request = WorkerRequest {
            id: "7".to_string(),
            body: RequestBody::Run {
                code: "echo 1".to_string(),
                validated_args: json!({ "a": 1 }),
                user: Value::Null,
            },
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["id"], "7");
        assert_eq!(value["type"], "run");
        assert_eq!(value["validated_args"]["a"], 1);

        let parsed: WorkerRequest =
            serde_json::from_str(r#"{"id":"3","type":"proc_stats"}"#).unwrap();
        assert_eq!(parsed.body, RequestBody::ProcStats);
    }

    #[test]
    fn messages_distinguish_responses_from_events() {
        let msg: WorkerMessage = serde_json::from_str(r#"{"id":"1","result":"reload"}"#).unwrap();
        let WorkerMessage::Response(response) = msg else {
            panic!("expected a response");
        };
        assert!(response.is_reload());

        let msg: WorkerMessage =
            serde_json::from_str(r#"{"type":"error","error":{"code":"3D000"}}"#).unwrap();
        let WorkerMessage::Event(event) = msg else {
            panic!("expected an event");
        };
        assert_eq!(event.error_code(), Some("3D000"));
    }
}
