use serde_json::Value;

/// Shape of a reply to a liveness probe.
///
/// A listener is only considered to be a Unity bridge when its reply is `Pong` or
/// `Affirmative`; an open port that answers with anything else is someone else's service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LivenessReply {
    /// `{"status":"success","result":{"message":"pong"}}`
    Pong,
    /// Any JSON or plain text containing `pong` or `success`, case-insensitive
    Affirmative,
    /// Anything else, kept for diagnostics
    Unrecognized(String),
}

const LIVENESS_TOKENS: [&str; 2] = ["pong", "success"];

impl LivenessReply {
    /// Classifies a raw reply body
    pub fn classify(body: &[u8]) -> Self {
        if let Ok(value) = serde_json::from_slice::<Value>(body) {
            let is_pong = value.get("status").and_then(Value::as_str) == Some("success")
                && value
                    .get("result")
                    .and_then(|result| result.get("message"))
                    .and_then(Value::as_str)
                    == Some("pong");
            if is_pong {
                return LivenessReply::Pong;
            }
        }

        let text = String::from_utf8_lossy(body).to_lowercase();
        if LIVENESS_TOKENS.iter().any(|token| text.contains(token)) {
            LivenessReply::Affirmative
        } else {
            LivenessReply::Unrecognized(crate::unity_messages::preview(body))
        }
    }

    /// Whether the reply confirms a compatible server
    pub fn is_alive(&self) -> bool {
        !matches!(self, LivenessReply::Unrecognized(_))
    }

    /// Result returned to callers of the `ping` command. Unrecognized replies still count
    /// as pong because the transport answered; the warning tells the caller why.
    pub fn to_ping_result(&self) -> Value {
        match self {
            LivenessReply::Pong | LivenessReply::Affirmative => {
                serde_json::json!({ "message": "pong" })
            }
            LivenessReply::Unrecognized(_) => serde_json::json!({
                "message": "pong",
                "warning": "Unexpected response format"
            }),
        }
    }
}
