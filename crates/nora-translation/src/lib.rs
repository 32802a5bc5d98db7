//! Supervision and client protocol for a local Zotero translation-server.
//!
//! The helper is an external Node.js service. This crate starts it on demand
//! as its own process group, waits until it actually answers, talks to it
//! over HTTP and makes sure it is torn down again.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use thiserror::Error;

pub mod client;
pub mod config_file;
pub mod inspect;
pub mod preflight;
pub mod probe;
pub mod response;
pub mod spawn;
pub mod supervisor;
pub mod terminate;
pub mod wait;

#[cfg(test)]
mod fakes;

pub use client::{TranslationClient, TranslationRequest};
pub use probe::{LocalProber, PortProber};
pub use response::{Creator, TranslationResult, normalize_payload};
pub use supervisor::{ReadinessState, ReadyGuard, ServerHandle, Supervisor};
pub use terminate::{Signal, SignalTarget, Signaller, Terminator};

/// Boxed future used at the trait seams so they stay object safe.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Port the translation-server listens on unless configured otherwise.
pub const DEFAULT_PORT: u16 = 1969;

/// Liveness endpoint; any HTTP status counts as "alive".
pub const PING_PATH: &str = "/connector/ping";

#[derive(Error, Debug)]
pub enum TranslatorError {
    #[error(
        "translation server did not become ready on port {port} within {:.1}s\n--- stdout ---\n{stdout}\n--- stderr ---\n{stderr}",
        patience.as_secs_f64()
    )]
    StartupTimeout {
        port: u16,
        patience: Duration,
        stdout: String,
        stderr: String,
    },
    #[error("translation request failed: {0}")]
    TranslationRequestFailed(String),
    #[error("translation rejected: {0}")]
    TranslationRejected(String),
    #[error("malformed translation response: {0}")]
    MalformedResponse(String),
    #[error("failed to spawn translation server `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("preflight check failed: {0}")]
    Preflight(String),
    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, TranslatorError>;

/// Runtime configuration for the supervisor and client.
#[derive(Debug, Clone)]
pub struct TranslatorConfig {
    pub host: String,
    pub port: u16,
    /// Installation root of the translation-server (its `package.json` lives here).
    pub server_dir: PathBuf,
    /// Program and arguments used to start the helper. Empty means
    /// `npm start --prefix <server_dir>`.
    pub command: Vec<String>,
    pub startup_patience: Duration,
    pub poll_interval: Duration,
    pub kill_patience: Duration,
    /// How long the group gets after the terminate signal before it is killed.
    pub termination_grace: Duration,
    pub probe_timeout: Duration,
    pub request_timeout: Duration,
    pub check_node: bool,
    pub node_min_major: u32,
    pub node_max_major: u32,
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            server_dir: default_server_dir(),
            command: vec![],
            startup_patience: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
            kill_patience: Duration::from_secs(5),
            termination_grace: Duration::from_secs(2),
            probe_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_secs(20),
            check_node: false,
            node_min_major: 18,
            node_max_major: 20,
        }
    }
}

impl TranslatorConfig {
    /// `http://<host>:<port>`, without a trailing slash.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// The full helper command line, falling back to `npm start --prefix <server_dir>`.
    pub fn helper_command(&self) -> Vec<String> {
        if !self.command.is_empty() {
            return self.command.clone();
        }
        vec![
            "npm".to_string(),
            "start".to_string(),
            "--prefix".to_string(),
            self.server_dir.display().to_string(),
        ]
    }
}

/// `<data_dir>/nora/translation-server`, or a relative `translation_server`
/// directory when the platform has no data directory.
pub fn default_server_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("nora").join("translation-server"))
        .unwrap_or_else(|| PathBuf::from("translation_server"))
}
