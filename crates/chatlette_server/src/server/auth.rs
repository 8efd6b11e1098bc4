#![forbid(unsafe_code)]

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, anyhow};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chatlette_domain::Identity;
use chatlette_util::secret::SecretString;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthClaims {
	pub sub: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	pub exp: u64,
}

/// Resolves the identity of a connection from the bearer token presented at accept time.
#[derive(Debug, Clone, Default)]
pub struct IdentityProvider {
	hmac_secret: Option<SecretString>,
}

impl IdentityProvider {
	pub fn new(hmac_secret: Option<SecretString>) -> Self {
		Self { hmac_secret }
	}

	/// Missing, malformed or expired tokens all yield `Identity::Anonymous`.
	pub fn identify(&self, token: Option<&str>) -> Identity {
		let Some(token) = token.map(str::trim).filter(|t| !t.is_empty()) else {
			return Identity::Anonymous;
		};
		let Some(secret) = self.hmac_secret.as_ref() else {
			debug!("token presented but no auth secret configured; treating as anonymous");
			return Identity::Anonymous;
		};

		match verify_hmac_token(token, secret.expose()) {
			Ok(claims) => Identity::Authenticated {
				username: claims.sub,
				display_name: claims.name.filter(|n| !n.trim().is_empty()),
				expires_at: Some(claims.exp),
			},
			Err(e) => {
				debug!(error = %e, "auth token rejected");
				Identity::Anonymous
			}
		}
	}
}

pub fn unix_secs_now() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Expiry claim for a token valid `ttl_secs` from now. `None` if it would overflow.
pub fn expiry_after(ttl_secs: u64) -> Option<u64> {
	unix_secs_now().checked_add(ttl_secs)
}

pub fn verify_hmac_token(token: &str, secret: &str) -> anyhow::Result<AuthClaims> {
	let parts = token.split('.').collect::<Vec<_>>();
	if parts.len() != 3 || parts[0] != "v1" {
		return Err(anyhow!("invalid token format"));
	}

	let payload_b64 = parts[1];
	let sig_b64 = parts[2];

	let payload = URL_SAFE_NO_PAD.decode(payload_b64).context("decode token payload")?;
	let expected_sig = sign(payload_b64.as_bytes(), secret.as_bytes())?;
	let provided_sig = URL_SAFE_NO_PAD.decode(sig_b64).context("decode token signature")?;

	if !constant_time_eq(&expected_sig, &provided_sig) {
		return Err(anyhow!("invalid token signature"));
	}

	let claims: AuthClaims = serde_json::from_slice(&payload).context("parse token claims")?;
	if claims.sub.trim().is_empty() {
		return Err(anyhow!("token subject is empty"));
	}
	if claims.exp <= unix_secs_now() {
		return Err(anyhow!("token expired"));
	}

	Ok(claims)
}

/// Mint a `v1.<payload>.<sig>` token.
pub fn issue_hmac_token(claims: &AuthClaims, secret: &str) -> anyhow::Result<String> {
	let payload = serde_json::to_vec(claims).context("encode token claims")?;
	let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
	let sig = sign(payload_b64.as_bytes(), secret.as_bytes())?;
	Ok(format!("v1.{payload_b64}.{}", URL_SAFE_NO_PAD.encode(sig)))
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> anyhow::Result<Vec<u8>> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).map_err(|e| anyhow!("hmac key: {e}"))?;
	mac.update(payload_b64);
	Ok(mac.finalize().into_bytes().to_vec())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}

#[cfg(test)]
mod tests {
	use super::*;

	const SECRET: &str = "test-secret";

	fn claims(sub: &str, name: Option<&str>, exp: u64) -> AuthClaims {
		AuthClaims {
			sub: sub.to_string(),
			name: name.map(str::to_string),
			exp,
		}
	}

	#[test]
	fn valid_token_yields_authenticated_identity() {
		let exp = unix_secs_now() + 3600;
		let token = issue_hmac_token(&claims("alice", Some("Alice"), exp), SECRET).unwrap();

		let provider = IdentityProvider::new(Some(SecretString::new(SECRET)));
		let identity = provider.identify(Some(&token));

		assert_eq!(
			identity,
			Identity::Authenticated {
				username: "alice".to_string(),
				display_name: Some("Alice".to_string()),
				expires_at: Some(exp),
			}
		);
	}

	#[test]
	fn wrong_secret_or_tampering_is_anonymous() {
		let token = issue_hmac_token(&claims("alice", None, unix_secs_now() + 60), SECRET).unwrap();

		let other = IdentityProvider::new(Some(SecretString::new("other")));
		assert_eq!(other.identify(Some(&token)), Identity::Anonymous);

		let mut parts: Vec<&str> = token.split('.').collect();
		let forged = URL_SAFE_NO_PAD.encode(br#"{"sub":"mallory","exp":99999999999}"#);
		parts[1] = &forged;
		let tampered = parts.join(".");
		let provider = IdentityProvider::new(Some(SecretString::new(SECRET)));
		assert_eq!(provider.identify(Some(&tampered)), Identity::Anonymous);
	}

	#[test]
	fn expired_token_is_rejected() {
		let token = issue_hmac_token(&claims("alice", None, 1), SECRET).unwrap();
		let err = verify_hmac_token(&token, SECRET).unwrap_err();
		assert!(err.to_string().contains("expired"));
	}

	#[test]
	fn missing_token_or_secret_is_anonymous() {
		let provider = IdentityProvider::new(Some(SecretString::new(SECRET)));
		assert_eq!(provider.identify(None), Identity::Anonymous);
		assert_eq!(provider.identify(Some("   ")), Identity::Anonymous);

		let token = issue_hmac_token(&claims("alice", None, unix_secs_now() + 60), SECRET).unwrap();
		assert_eq!(IdentityProvider::default().identify(Some(&token)), Identity::Anonymous);
	}

	#[test]
	fn token_expiry_rejects_overflowing_ttl() {
		let exp = expiry_after(60).unwrap();
		assert!(exp >= unix_secs_now() + 60);
		assert_eq!(expiry_after(u64::MAX), None);
	}

	#[test]
	fn malformed_tokens_are_rejected() {
		assert!(verify_hmac_token("v2.a.b", SECRET).is_err());
		assert!(verify_hmac_token("v1.only-two", SECRET).is_err());
		assert!(verify_hmac_token("v1.!!!.???", SECRET).is_err());
	}
}
