#![forbid(unsafe_code)]

use chatlette_domain::Envelope;
use serde_json::Value;
use thiserror::Error;

/// Default maximum encoded envelope size.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024; // 64 KiB

#[derive(Debug, Error)]
pub enum CodecError {
	#[error("message exceeds maximum size: len={len} max={max}")]
	MessageTooLarge {
		len: usize,
		max: usize,
	},

	#[error("expected a JSON object, got {0}")]
	NotAnObject(&'static str),

	#[error("json error: {0}")]
	Json(#[from] serde_json::Error),
}

/// Encode an envelope as a JSON text message.
pub fn encode_envelope(env: &Envelope, max_message_size: usize) -> Result<String, CodecError> {
	let text = serde_json::to_string(env)?;
	if text.len() > max_message_size {
		return Err(CodecError::MessageTooLarge {
			len: text.len(),
			max: max_message_size,
		});
	}
	Ok(text)
}

/// Encode using `DEFAULT_MAX_MESSAGE_SIZE`.
pub fn encode_envelope_default(env: &Envelope) -> Result<String, CodecError> {
	encode_envelope(env, DEFAULT_MAX_MESSAGE_SIZE)
}

/// Decode a JSON text message into an envelope.
pub fn decode_envelope(src: &str, max_message_size: usize) -> Result<Envelope, CodecError> {
	decode_envelope_bytes(src.as_bytes(), max_message_size)
}

/// Decode a JSON message carried in a binary frame.
pub fn decode_envelope_bytes(src: &[u8], max_message_size: usize) -> Result<Envelope, CodecError> {
	if src.len() > max_message_size {
		return Err(CodecError::MessageTooLarge {
			len: src.len(),
			max: max_message_size,
		});
	}

	let value: Value = serde_json::from_slice(src)?;
	if !value.is_object() {
		return Err(CodecError::NotAnObject(json_kind(&value)));
	}

	Ok(serde_json::from_value(value)?)
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

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn decodes_client_action() {
		let env = decode_envelope(r#"{"action":"new_user","content":{"chatname":"Alice"}}"#, DEFAULT_MAX_MESSAGE_SIZE)
			.expect("decode");
		assert_eq!(env.action, "new_user");
		assert_eq!(env.content_str("chatname"), Some("Alice"));
		assert!(env.chatname.is_none());
	}

	#[test]
	fn rejects_non_object_json() {
		let err = decode_envelope("[1,2,3]", DEFAULT_MAX_MESSAGE_SIZE).unwrap_err();
		match err {
			CodecError::NotAnObject(kind) => assert_eq!(kind, "array"),
			other => panic!("unexpected error: {other:?}"),
		}
	}

	#[test]
	fn rejects_invalid_json() {
		assert!(matches!(
			decode_envelope("{not json", DEFAULT_MAX_MESSAGE_SIZE),
			Err(CodecError::Json(_))
		));
	}

	#[test]
	fn encode_rejects_too_large() {
		let env = Envelope::new("send_message", json!({"text": "a".repeat(10_000)}));
		let err = encode_envelope(&env, 32).unwrap_err();
		match err {
			CodecError::MessageTooLarge { len, max } => assert!(len > max),
			other => panic!("unexpected error: {other:?}"),
		}
	}

	#[test]
	fn decode_rejects_too_large_before_parsing() {
		let big = format!(r#"{{"action":"x","content":"{}"}}"#, "b".repeat(100));
		assert!(matches!(
			decode_envelope(&big, 16),
			Err(CodecError::MessageTooLarge { .. })
		));
	}
}
