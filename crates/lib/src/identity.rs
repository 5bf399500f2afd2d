//! Host launch context and identity resolution.
//!
//! The host platform embeds a launch context (a JSON payload with the current
//! user) into the app at startup. Identity is resolved from it exactly once per
//! session; absence is fatal since it cannot change within a running instance.

use serde::Deserialize;
use thiserror::Error;

/// Stable user handle from the host platform.
pub type Identity = i64;

/// The user block of the host launch context. Only `id` is load-bearing;
/// `username` is kept for logging and display.
#[derive(Debug, Clone, Deserialize)]
pub struct LaunchUser {
    pub id: Identity,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
}

impl LaunchUser {
    /// Display name for logs: username when present, otherwise the id.
    pub fn display_name(&self) -> String {
        self.username
            .clone()
            .unwrap_or_else(|| self.id.to_string())
    }
}

/// Embedded launch context as handed over by the host shell.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LaunchContext {
    #[serde(default)]
    pub user: Option<LaunchUser>,
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("host launch context missing (app not launched inside the host shell)")]
    HostContextMissing,
    #[error("host launch context carries no user identity")]
    NoUser,
    #[error("host launch context is not valid JSON: {0}")]
    Invalid(String),
}

/// Capability that yields the caller's identity. Injected into the session
/// orchestrator so core logic never reads ambient globals.
pub trait IdentitySource: Send + Sync {
    fn resolve(&self) -> Result<LaunchUser, IdentityError>;
}

/// Production source: parses the JSON launch payload handed over by the host
/// shell (e.g. the `CABLINE_LAUNCH_CONTEXT` environment variable).
pub struct LaunchContextSource {
    raw: Option<String>,
}

impl LaunchContextSource {
    pub fn new(raw: Option<String>) -> Self {
        Self { raw }
    }

    /// Read the payload from `CABLINE_LAUNCH_CONTEXT`.
    pub fn from_env() -> Self {
        Self::new(std::env::var("CABLINE_LAUNCH_CONTEXT").ok())
    }
}

impl IdentitySource for LaunchContextSource {
    fn resolve(&self) -> Result<LaunchUser, IdentityError> {
        let raw = self
            .raw
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(IdentityError::HostContextMissing)?;
        let ctx: LaunchContext =
            serde_json::from_str(raw).map_err(|e| IdentityError::Invalid(e.to_string()))?;
        ctx.user.ok_or(IdentityError::NoUser)
    }
}
