#![forbid(unsafe_code)]

pub mod codec;

pub use chatlette_domain::Envelope;
pub use codec::{
	CodecError, DEFAULT_MAX_MESSAGE_SIZE, decode_envelope, decode_envelope_bytes, encode_envelope, encode_envelope_default,
};

/// Action tags understood by the relay.
pub mod actions {
	/// Establishes the connection's display name.
	pub const NEW_USER: &str = "new_user";
	/// Chat content; requires an established display name by default.
	pub const SEND_MESSAGE: &str = "send_message";
}

/// Codes carried in `{action: "error"}` notices.
pub mod error_codes {
	pub const UNSUPPORTED_ACTION: &str = "unsupported_action";
	pub const IDENTITY_NOT_ESTABLISHED: &str = "identity_not_established";
	pub const ACTION_NOT_PERMITTED: &str = "action_not_permitted";
	pub const INVALID_FRAME: &str = "invalid_frame";
}
