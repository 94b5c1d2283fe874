//! Protocol Messages
//!
//! Wire format for both transports. Every message is a JSON object tagged by
//! its `command` field; field names are camelCase.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Known inbound command names.
pub const COMMANDS: [&str; 6] = ["STATUS", "ENABLE", "AUTH", "CHECK", "BIO_ENABLE", "BIO_AUTH"];

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from either device to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    /// Look up biometric status for a credential.
    Status(StatusRequest),
    /// Start an enrolment session linked to a user.
    Enable(InitRequest),
    /// Start a verification session.
    Auth(InitRequest),
    /// Secondary device confirms pairing with a session.
    Check(CheckRequest),
    /// Secondary device enrols a biometric id for the session's user.
    BioEnable(BiometricRequest),
    /// Secondary device verifies with a biometric id.
    BioAuth(BiometricRequest),
}

/// STATUS request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRequest {
    /// External credential.
    #[serde(default)]
    pub user_data: String,
}

/// ENABLE / AUTH request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitRequest {
    /// External credential (ENABLE only).
    #[serde(default)]
    pub user_data: String,
    /// Attach to an existing session (single-shot transport only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
}

/// CHECK request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckRequest {
    /// Session to activate.
    #[serde(default)]
    pub session_id: String,
}

/// BIO_ENABLE / BIO_AUTH request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BiometricRequest {
    /// Session the secondary device paired with.
    #[serde(default)]
    pub session_id: String,
    /// Biometric identifier (hyphenated UUID).
    #[serde(default)]
    pub bio_id: String,
}

/// Why an inbound payload could not be turned into a [`Command`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Not JSON, or a known command with wrongly typed fields.
    Malformed,
    /// Missing or unrecognized `command` value.
    Unknown(String),
}

impl Command {
    /// Parse an inbound payload.
    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        let value: Value = serde_json::from_str(raw).map_err(|_| ParseError::Malformed)?;
        let name = match value.get("command") {
            Some(Value::String(name)) => name.clone(),
            Some(other) => other.to_string(),
            None => "undefined".to_string(),
        };
        if !COMMANDS.contains(&name.as_str()) {
            return Err(ParseError::Unknown(name));
        }
        serde_json::from_value(value).map_err(|_| ParseError::Malformed)
    }

    /// Wire name of this command.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Status(_) => "STATUS",
            Command::Enable(_) => "ENABLE",
            Command::Auth(_) => "AUTH",
            Command::Check(_) => "CHECK",
            Command::BioEnable(_) => "BIO_ENABLE",
            Command::BioAuth(_) => "BIO_AUTH",
        }
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from the server to either device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reply {
    /// Current biometric status.
    Status(StatusReply),
    /// Session token for an enrolment.
    Enable(InitReply),
    /// Session token for a verification.
    Auth(InitReply),
    /// Pairing confirmed.
    Check(CheckReply),
    /// Enrolment result, sent to both devices.
    BioEnable(ActivationReply),
    /// Verification result for the secondary device.
    BioAuth(VerificationReply),
    /// User token pushed to the primary device.
    Token(TokenPush),
    /// Error; always terminal.
    Error(ErrorReply),
}

/// STATUS reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReply {
    /// Always true.
    pub check: bool,
    /// Whether biometrics are active for the user.
    pub is_active: bool,
}

/// ENABLE / AUTH reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitReply {
    /// Encrypted `sessionId|callbackUrl|command`.
    pub token: String,
    /// Project identifier.
    pub id: String,
    /// Session's connection id, for a later attach (single-shot only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
}

/// CHECK reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckReply {
    /// Always true.
    pub ready: bool,
}

/// BIO_ENABLE reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivationReply {
    /// Activation status after enrolment.
    pub is_active: bool,
}

/// BIO_AUTH reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReply {
    /// Whether a token was found.
    pub result: bool,
}

/// TOKEN push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPush {
    /// User token, `null` when the biometric id is unknown.
    pub token: Option<String>,
}

/// ERROR reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    /// Always true.
    pub error: bool,
    /// Human-readable message.
    pub message: String,
}

impl Reply {
    /// Build an error reply.
    pub fn error(message: impl Into<String>) -> Self {
        Reply::Error(ErrorReply {
            error: true,
            message: message.into(),
        })
    }

    /// Is this an error reply.
    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_status() {
        let cmd = Command::parse(r#"{"command":"STATUS","userData":"tok1"}"#).unwrap();
        assert_eq!(
            cmd,
            Command::Status(StatusRequest {
                user_data: "tok1".into()
            })
        );
        assert_eq!(cmd.name(), "STATUS");
    }

    #[test]
    fn test_parse_biometric_fields() {
        let raw = r#"{"command":"BIO_ENABLE","sessionId":"s1","bioId":"b1"}"#;
        let cmd = Command::parse(raw).unwrap();
        let Command::BioEnable(req) = cmd else {
            panic!("Wrong command type");
        };
        assert_eq!(req.session_id, "s1");
        assert_eq!(req.bio_id, "b1");
    }

    #[test]
    fn test_parse_enable_with_connection_id() {
        let cmd = Command::parse(r#"{"command":"ENABLE","connectionId":"c-1"}"#).unwrap();
        let Command::Enable(req) = cmd else {
            panic!("Wrong command type");
        };
        assert_eq!(req.connection_id.as_deref(), Some("c-1"));
        assert!(req.user_data.is_empty());
    }

    #[test]
    fn test_parse_malformed() {
        assert_eq!(Command::parse("{not json"), Err(ParseError::Malformed));
        assert_eq!(
            Command::parse(r#"{"command":"CHECK","sessionId":42}"#),
            Err(ParseError::Malformed)
        );
    }

    #[test]
    fn test_parse_unknown() {
        assert_eq!(
            Command::parse(r#"{"command":"REBOOT"}"#),
            Err(ParseError::Unknown("REBOOT".into()))
        );
        assert_eq!(
            Command::parse(r#"{"userData":"x"}"#),
            Err(ParseError::Unknown("undefined".into()))
        );
        // Outbound-only kinds are not accepted inbound
        assert_eq!(
            Command::parse(r#"{"command":"TOKEN","token":"t"}"#),
            Err(ParseError::Unknown("TOKEN".into()))
        );
    }

    #[test]
    fn test_reply_wire_shapes() {
        let status = Reply::Status(StatusReply {
            check: true,
            is_active: true,
        });
        assert_eq!(
            serde_json::to_value(&status).unwrap(),
            json!({"command": "STATUS", "check": true, "isActive": true})
        );

        let init = Reply::Auth(InitReply {
            token: "abc".into(),
            id: "p1".into(),
            connection_id: None,
        });
        assert_eq!(
            serde_json::to_value(&init).unwrap(),
            json!({"command": "AUTH", "token": "abc", "id": "p1"})
        );

        let push = Reply::Token(TokenPush { token: None });
        assert_eq!(
            serde_json::to_value(&push).unwrap(),
            json!({"command": "TOKEN", "token": null})
        );

        let err = Reply::error("Client not found");
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            json!({"command": "ERROR", "error": true, "message": "Client not found"})
        );
        assert!(err.is_error());
    }

    #[test]
    fn test_bio_enable_reply_name() {
        let reply = Reply::BioEnable(ActivationReply { is_active: false });
        let json = reply.to_json().unwrap();
        assert!(json.contains(r#""command":"BIO_ENABLE""#));
        assert_eq!(Reply::from_json(&json).unwrap(), reply);
    }
}
