//! Shared bearer token gate.
//!
//! One token per process: either the env override or 4 random bytes
//! rendered as 8 hex chars at startup. Comparison goes through SHA-256
//! digests with a constant-time equality check, so neither token length
//! nor prefix leaks through timing.

use sha2::Digest;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::infra::resolver::TargetCli;

const COOKIE_NAME: &str = "agent_remote_token";
const COOKIE_MAX_AGE_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone)]
pub struct AuthGate {
    token: String,
}

impl AuthGate {
    /// Token from `CLAUDE_REMOTE_TOKEN` (for the default target CLI), or a
    /// freshly generated one.
    pub fn from_env(cli: &TargetCli) -> Self {
        let token = std::env::var(cli.token_env())
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(generate_token);
        Self { token }
    }

    #[cfg(test)]
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn verify(&self, presented: &str) -> bool {
        let expected = Sha256::digest(self.token.as_bytes());
        let actual = Sha256::digest(presented.as_bytes());
        expected.ct_eq(&actual).into()
    }

    /// The 24-hour cookie set after a successful query-token presentation,
    /// so nested sub-resource requests authenticate without re-sending the
    /// token in each URL.
    pub fn cookie_value(&self) -> String {
        format!(
            "{COOKIE_NAME}={}; Max-Age={COOKIE_MAX_AGE_SECS}; Path=/; HttpOnly; SameSite=Lax",
            self.token
        )
    }

    pub fn verify_cookie_header(&self, cookies: &str) -> bool {
        cookies
            .split(';')
            .filter_map(|pair| {
                let (name, value) = pair.trim().split_once('=')?;
                (name == COOKIE_NAME).then_some(value)
            })
            .any(|value| self.verify(value))
    }
}

fn generate_token() -> String {
    let bytes: [u8; 4] = rand::random();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
