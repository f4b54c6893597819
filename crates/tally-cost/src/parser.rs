//! Record parser for Claude Code session logs.
//!
//! Each line of a session log is one JSON record. Only `assistant` records
//! carry usage; everything else (`user`, `system`, `summary`, ...) yields
//! just the session id and working directory it names, which the engine uses
//! to place the session in a project. Assistant records are checked against an explicit
//! shape so that a missing or malformed field becomes a typed [`ParseError`]
//! instead of a silently zeroed count.

use crate::models::TokenCounts;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// Why a line could not be turned into a turn candidate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// The line is not a JSON object
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    /// A required field is absent
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// A field is present but has the wrong shape
    #[error("invalid field {field}: {message}")]
    InvalidField {
        field: &'static str,
        message: String,
    },
}

/// A parsed assistant response, not yet priced or keyed.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnCandidate {
    /// `message.id`, then `requestId`, then `uuid`; `None` if the record has none
    pub identity_key: Option<String>,
    pub session_id: String,
    /// `cwd` of the record, if present
    pub project_path: Option<String>,
    pub model: String,
    pub timestamp: DateTime<Utc>,
    pub tokens: TokenCounts,
}

/// What one log line contributes.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLine {
    Turn(TurnCandidate),
    /// A record that is not a billable turn
    Other {
        session_id: Option<String>,
        cwd: Option<String>,
    },
}

impl ParsedLine {
    fn other(session_id: Option<String>, cwd: Option<String>) -> Self {
        ParsedLine::Other {
            session_id: session_id.filter(|s| !s.is_empty()),
            cwd: cwd.filter(|c| !c.is_empty()),
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            ParsedLine::Turn(turn) => Some(&turn.session_id),
            ParsedLine::Other { session_id, .. } => session_id.as_deref(),
        }
    }

    /// Working directory named by the record.
    pub fn cwd(&self) -> Option<&str> {
        match self {
            ParsedLine::Turn(turn) => turn.project_path.as_deref(),
            ParsedLine::Other { cwd, .. } => cwd.as_deref(),
        }
    }

    pub fn into_turn(self) -> Option<TurnCandidate> {
        match self {
            ParsedLine::Turn(turn) => Some(turn),
            ParsedLine::Other { .. } => None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssistantRecord {
    uuid: Option<String>,
    request_id: Option<String>,
    session_id: Option<String>,
    timestamp: Option<String>,
    cwd: Option<String>,
    message: Option<AssistantMessage>,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    id: Option<String>,
    model: Option<String>,
    usage: Option<Usage>,
}

// Counts stay as raw values so negative and fractional numbers can be
// reported precisely.
#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: Option<Value>,
    output_tokens: Option<Value>,
    cache_creation_input_tokens: Option<Value>,
    cache_read_input_tokens: Option<Value>,
}

/// Parser for single log lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordParser;

impl RecordParser {
    pub fn new() -> Self {
        Self
    }

    /// Parse one complete line.
    ///
    /// Non-assistant records, blank lines, and assistant records with
    /// all-zero usage come back as [`ParsedLine::Other`].
    pub fn parse_line(&self, line: &str) -> Result<ParsedLine, ParseError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(ParsedLine::other(None, None));
        }

        let value: Value =
            serde_json::from_str(line).map_err(|e| ParseError::InvalidJson(e.to_string()))?;
        let Some(object) = value.as_object() else {
            return Err(ParseError::InvalidJson("record is not an object".into()));
        };

        match object.get("type").and_then(Value::as_str) {
            Some("assistant") => {}
            Some(_) => {
                let field = |name: &str| {
                    object.get(name).and_then(Value::as_str).map(str::to_string)
                };
                return Ok(ParsedLine::other(field("sessionId"), field("cwd")));
            }
            None => return Err(ParseError::MissingField("type")),
        }

        let record: AssistantRecord =
            serde_json::from_value(value).map_err(|e| ParseError::InvalidField {
                field: "record",
                message: e.to_string(),
            })?;

        let message = record.message.ok_or(ParseError::MissingField("message"))?;
        let model = message
            .model
            .filter(|m| !m.is_empty())
            .ok_or(ParseError::MissingField("message.model"))?;
        let usage = message
            .usage
            .ok_or(ParseError::MissingField("message.usage"))?;

        let tokens = TokenCounts {
            input_tokens: required_count("message.usage.input_tokens", usage.input_tokens)?,
            output_tokens: required_count("message.usage.output_tokens", usage.output_tokens)?,
            cache_write_tokens: optional_count(
                "message.usage.cache_creation_input_tokens",
                usage.cache_creation_input_tokens,
            )?,
            cache_read_tokens: optional_count(
                "message.usage.cache_read_input_tokens",
                usage.cache_read_input_tokens,
            )?,
        };
        if tokens.is_zero() {
            return Ok(ParsedLine::other(record.session_id, record.cwd));
        }

        let session_id = record
            .session_id
            .filter(|s| !s.is_empty())
            .ok_or(ParseError::MissingField("sessionId"))?;
        let raw_timestamp = record
            .timestamp
            .ok_or(ParseError::MissingField("timestamp"))?;
        let timestamp = DateTime::parse_from_rfc3339(&raw_timestamp)
            .map_err(|e| ParseError::InvalidField {
                field: "timestamp",
                message: format!("{raw_timestamp:?}: {e}"),
            })?
            .with_timezone(&Utc);

        let identity_key = [message.id, record.request_id, record.uuid]
            .into_iter()
            .flatten()
            .find(|k| !k.is_empty());

        Ok(ParsedLine::Turn(TurnCandidate {
            identity_key,
            session_id,
            project_path: record.cwd.filter(|c| !c.is_empty()),
            model,
            timestamp,
            tokens,
        }))
    }
}

fn required_count(field: &'static str, value: Option<Value>) -> Result<i64, ParseError> {
    match value {
        Some(v) => to_count(field, &v),
        None => Err(ParseError::MissingField(field)),
    }
}

fn optional_count(field: &'static str, value: Option<Value>) -> Result<i64, ParseError> {
    match value {
        Some(Value::Null) | None => Ok(0),
        Some(v) => to_count(field, &v),
    }
}

fn to_count(field: &'static str, value: &Value) -> Result<i64, ParseError> {
    match value.as_i64() {
        Some(n) if n >= 0 => Ok(n),
        Some(n) => Err(ParseError::InvalidField {
            field,
            message: format!("negative count {n}"),
        }),
        None => Err(ParseError::InvalidField {
            field,
            message: format!("expected a non-negative integer, got {value}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn assistant(usage: &str) -> String {
        format!(
            r#"{{"type":"assistant","uuid":"u-1","requestId":"req_1","sessionId":"sess-123","timestamp":"2026-03-01T10:15:30.250Z","cwd":"/home/dev/webapp","message":{{"id":"msg_01","model":"claude-sonnet-4-5-20250929","role":"assistant","content":[],"usage":{usage}}}}}"#
        )
    }

    #[test]
    fn test_parse_assistant_line() {
        let parser = RecordParser::new();
        let line = assistant(
            r#"{"input_tokens":100,"output_tokens":50,"cache_creation_input_tokens":200,"cache_read_input_tokens":300}"#,
        );

        let turn = parser.parse_line(&line).unwrap().into_turn().unwrap();

        assert_eq!(turn.identity_key.as_deref(), Some("msg_01"));
        assert_eq!(turn.session_id, "sess-123");
        assert_eq!(turn.project_path.as_deref(), Some("/home/dev/webapp"));
        assert_eq!(turn.model, "claude-sonnet-4-5-20250929");
        assert_eq!(turn.tokens, TokenCounts::new(100, 50, 200, 300));
        assert_eq!(
            turn.timestamp,
            Utc.with_ymd_and_hms(2026, 3, 1, 10, 15, 30).unwrap()
                + chrono::Duration::milliseconds(250)
        );
    }

    #[test]
    fn test_cache_fields_default_to_zero() {
        let parser = RecordParser::new();
        let line = assistant(r#"{"input_tokens":7,"output_tokens":3}"#);

        let turn = parser.parse_line(&line).unwrap().into_turn().unwrap();
        assert_eq!(turn.tokens, TokenCounts::new(7, 3, 0, 0));
    }

    #[test]
    fn test_skip_non_assistant_records() {
        let parser = RecordParser::new();

        let line = r#"{"type":"user","sessionId":"s","message":{"role":"user","content":"hello"}}"#;
        assert!(parser.parse_line(line).unwrap().into_turn().is_none());

        let line = r#"{"type":"summary","summary":"Refactor","leafUuid":"abc"}"#;
        assert!(parser.parse_line(line).unwrap().into_turn().is_none());

        assert!(parser.parse_line("   ").unwrap().into_turn().is_none());
    }

    #[test]
    fn test_user_record_names_session_and_cwd() {
        let parser = RecordParser::new();
        let line = r#"{"type":"user","sessionId":"sess-9","cwd":"/home/dev/api","message":{"role":"user","content":"hi"}}"#;

        let parsed = parser.parse_line(line).unwrap();
        assert_eq!(parsed.session_id(), Some("sess-9"));
        assert_eq!(parsed.cwd(), Some("/home/dev/api"));
        assert!(parsed.into_turn().is_none());

        let parsed = parser.parse_line(r#"{"type":"summary","summary":"x"}"#).unwrap();
        assert_eq!(parsed.session_id(), None);
        assert_eq!(parsed.cwd(), None);
    }

    #[test]
    fn test_zero_usage_is_not_a_turn() {
        let parser = RecordParser::new();
        let line = assistant(
            r#"{"input_tokens":0,"output_tokens":0,"cache_creation_input_tokens":0,"cache_read_input_tokens":0}"#,
        );
        let parsed = parser.parse_line(&line).unwrap();
        assert_eq!(parsed.cwd(), Some("/home/dev/webapp"));
        assert!(parsed.into_turn().is_none());
    }

    #[test]
    fn test_malformed_json() {
        let parser = RecordParser::new();
        let err = parser.parse_line(r#"{"type":"assistant","mess"#).unwrap_err();
        assert!(matches!(err, ParseError::InvalidJson(_)));

        let err = parser.parse_line("[1,2,3]").unwrap_err();
        assert!(matches!(err, ParseError::InvalidJson(_)));
    }

    #[test]
    fn test_missing_token_counts() {
        let parser = RecordParser::new();
        let line = assistant(r#"{"input_tokens":10}"#);
        assert_eq!(
            parser.parse_line(&line).unwrap_err(),
            ParseError::MissingField("message.usage.output_tokens")
        );

        let line = r#"{"type":"assistant","sessionId":"s","timestamp":"2026-03-01T00:00:00Z","message":{"model":"claude-opus-4-6"}}"#;
        assert_eq!(
            parser.parse_line(line).unwrap_err(),
            ParseError::MissingField("message.usage")
        );
    }

    #[test]
    fn test_negative_and_fractional_counts_rejected() {
        let parser = RecordParser::new();

        let line = assistant(r#"{"input_tokens":-5,"output_tokens":10}"#);
        assert!(matches!(
            parser.parse_line(&line).unwrap_err(),
            ParseError::InvalidField {
                field: "message.usage.input_tokens",
                ..
            }
        ));

        let line = assistant(r#"{"input_tokens":5,"output_tokens":1.5}"#);
        assert!(matches!(
            parser.parse_line(&line).unwrap_err(),
            ParseError::InvalidField {
                field: "message.usage.output_tokens",
                ..
            }
        ));
    }

    #[test]
    fn test_bad_timestamp() {
        let parser = RecordParser::new();
        let line = r#"{"type":"assistant","sessionId":"s","timestamp":"yesterday","message":{"model":"m","usage":{"input_tokens":1,"output_tokens":1}}}"#;
        assert!(matches!(
            parser.parse_line(line).unwrap_err(),
            ParseError::InvalidField {
                field: "timestamp",
                ..
            }
        ));
    }

    #[test]
    fn test_identity_key_fallbacks() {
        let parser = RecordParser::new();

        let line = r#"{"type":"assistant","requestId":"req_9","uuid":"u-9","sessionId":"s","timestamp":"2026-03-01T00:00:00Z","message":{"model":"m","usage":{"input_tokens":1,"output_tokens":1}}}"#;
        let turn = parser.parse_line(line).unwrap().into_turn().unwrap();
        assert_eq!(turn.identity_key.as_deref(), Some("req_9"));

        let line = r#"{"type":"assistant","uuid":"u-9","sessionId":"s","timestamp":"2026-03-01T00:00:00Z","message":{"model":"m","usage":{"input_tokens":1,"output_tokens":1}}}"#;
        let turn = parser.parse_line(line).unwrap().into_turn().unwrap();
        assert_eq!(turn.identity_key.as_deref(), Some("u-9"));

        let line = r#"{"type":"assistant","sessionId":"s","timestamp":"2026-03-01T00:00:00Z","message":{"model":"m","usage":{"input_tokens":1,"output_tokens":1}}}"#;
        let turn = parser.parse_line(line).unwrap().into_turn().unwrap();
        assert!(turn.identity_key.is_none());
        assert!(turn.project_path.is_none());
    }
}
