//! Configuration and bootstrap parameters.
//!
//! The server side is started by an external launcher with three
//! parameters: a mode name, a server/target type name, and the path to
//! a cookie file whose contents seed the target as a shared secret.
//! Resolving those names against concrete implementations is the
//! launcher's business; this crate only carries them.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::writer::WriterConfig;

/// Default cap on concurrently running invocation tasks.
pub const DEFAULT_MAX_CONCURRENT_CALLS: usize = 64;

/// Startup parameters handed to the server side by the launcher.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Name of the mode supplying pre/post hooks.
    pub mode_name: String,
    /// Name of the server type under test.
    pub server_name: String,
    /// Path to the cookie file.
    pub cookie_file: PathBuf,
}

impl ServerOptions {
    /// Bundle the three launcher-provided parameters.
    pub fn new(
        mode_name: impl Into<String>,
        server_name: impl Into<String>,
        cookie_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            mode_name: mode_name.into(),
            server_name: server_name.into(),
            cookie_file: cookie_file.into(),
        }
    }

    /// Read the shared secret from the cookie file.
    pub fn load_cookie(&self) -> Result<Cookie> {
        Cookie::load(&self.cookie_file)
    }
}

/// Shared secret read once from the cookie file and passed to the
/// target's constructor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie(String);

impl Cookie {
    /// Read the cookie from a file, trimming a trailing newline.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be read.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(Self(raw.trim_end_matches('\n').to_string()))
    }

    /// Borrow the secret.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Cookie {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Server-side tuning knobs.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum concurrently running invocation tasks. Calls beyond the
    /// cap wait for a slot in pipe order.
    pub max_concurrent_calls: usize,
    /// Writer task configuration.
    pub writer: WriterConfig,
}

impl ServerConfig {
    /// Set the invocation concurrency cap.
    pub fn with_max_concurrent_calls(mut self, limit: usize) -> Self {
        self.max_concurrent_calls = limit;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: DEFAULT_MAX_CONCURRENT_CALLS,
            writer: WriterConfig::default(),
        }
    }
}

/// Client-side tuning knobs.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Deadline for each call's reply; `None` waits forever, matching
    /// the wire protocol's lack of any timeout of its own.
    pub call_timeout: Option<Duration>,
    /// Writer task configuration.
    pub writer: WriterConfig,
}

impl ClientConfig {
    /// Set a per-call reply deadline.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }
}
