use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Result, TranslatorConfig, TranslatorError};

/// On-disk TOML configuration structure.
/// All fields are optional so partial configs work (merge with defaults).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigFile {
    pub server: Option<ServerConfig>,
    pub timing: Option<TimingConfig>,
    pub preflight: Option<PreflightConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub dir: Option<String>,
    pub command: Option<Vec<String>>,
}

/// Durations are in milliseconds, except `request_timeout_secs`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimingConfig {
    pub startup_patience_ms: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub kill_patience_ms: Option<u64>,
    pub termination_grace_ms: Option<u64>,
    pub probe_timeout_ms: Option<u64>,
    pub request_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreflightConfig {
    pub check_node: Option<bool>,
    pub node_min_major: Option<u32>,
    pub node_max_major: Option<u32>,
}

/// Platform config directory path: `<config_dir>/nora/config.toml`.
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("nora").join("config.toml"))
}

/// Load config by cascading CWD `.nora.toml` over platform config.
/// CWD values override platform values.
pub fn load_config() -> ConfigFile {
    let platform = config_path().and_then(|p| load_from_path(&p));
    let cwd = load_from_path(Path::new(".nora.toml"));

    match (platform, cwd) {
        (None, None) => ConfigFile::default(),
        (Some(p), None) => p,
        (None, Some(c)) => c,
        (Some(p), Some(c)) => merge(p, c),
    }
}

/// Load a config from a specific path. Returns `None` if the file doesn't
/// exist or can't be parsed.
pub fn load_from_path(path: &Path) -> Option<ConfigFile> {
    let content = std::fs::read_to_string(path).ok()?;
    match toml::from_str(&content) {
        Ok(config) => Some(config),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring unparsable config file");
            None
        }
    }
}

fn pick<T: Clone, S>(base: &Option<S>, overlay: &Option<S>, field: impl Fn(&S) -> &Option<T>) -> Option<T> {
    overlay
        .as_ref()
        .and_then(|s| field(s).clone())
        .or_else(|| base.as_ref().and_then(|s| field(s).clone()))
}

/// Merge two configs: `overlay` values take precedence over `base`.
pub fn merge(base: ConfigFile, overlay: ConfigFile) -> ConfigFile {
    ConfigFile {
        server: Some(ServerConfig {
            host: pick(&base.server, &overlay.server, |s| &s.host),
            port: pick(&base.server, &overlay.server, |s| &s.port),
            dir: pick(&base.server, &overlay.server, |s| &s.dir),
            command: pick(&base.server, &overlay.server, |s| &s.command),
        }),
        timing: Some(TimingConfig {
            startup_patience_ms: pick(&base.timing, &overlay.timing, |t| &t.startup_patience_ms),
            poll_interval_ms: pick(&base.timing, &overlay.timing, |t| &t.poll_interval_ms),
            kill_patience_ms: pick(&base.timing, &overlay.timing, |t| &t.kill_patience_ms),
            termination_grace_ms: pick(&base.timing, &overlay.timing, |t| &t.termination_grace_ms),
            probe_timeout_ms: pick(&base.timing, &overlay.timing, |t| &t.probe_timeout_ms),
            request_timeout_secs: pick(&base.timing, &overlay.timing, |t| &t.request_timeout_secs),
        }),
        preflight: Some(PreflightConfig {
            check_node: pick(&base.preflight, &overlay.preflight, |p| &p.check_node),
            node_min_major: pick(&base.preflight, &overlay.preflight, |p| &p.node_min_major),
            node_max_major: pick(&base.preflight, &overlay.preflight, |p| &p.node_max_major),
        }),
    }
}

impl ConfigFile {
    /// A file that pins every setting of `config`.
    pub fn from_config(config: &TranslatorConfig) -> Self {
        let ms = |d: Duration| Some(d.as_millis() as u64);
        ConfigFile {
            server: Some(ServerConfig {
                host: Some(config.host.clone()),
                port: Some(config.port),
                dir: Some(config.server_dir.display().to_string()),
                command: Some(config.command.clone()),
            }),
            timing: Some(TimingConfig {
                startup_patience_ms: ms(config.startup_patience),
                poll_interval_ms: ms(config.poll_interval),
                kill_patience_ms: ms(config.kill_patience),
                termination_grace_ms: ms(config.termination_grace),
                probe_timeout_ms: ms(config.probe_timeout),
                request_timeout_secs: Some(config.request_timeout.as_secs()),
            }),
            preflight: Some(PreflightConfig {
                check_node: Some(config.check_node),
                node_min_major: Some(config.node_min_major),
                node_max_major: Some(config.node_max_major),
            }),
        }
    }

    /// Overlay the file's values onto `config`.
    pub fn apply(&self, mut config: TranslatorConfig) -> Result<TranslatorConfig> {
        if let Some(server) = &self.server {
            if let Some(host) = &server.host {
                config.host = host.clone();
            }
            if let Some(port) = server.port {
                if port == 0 {
                    return Err(TranslatorError::Config("server.port must be non-zero".into()));
                }
                config.port = port;
            }
            if let Some(dir) = &server.dir {
                config.server_dir = PathBuf::from(dir);
            }
            if let Some(command) = &server.command {
                config.command = command.clone();
            }
        }
        if let Some(timing) = &self.timing {
            let ms = Duration::from_millis;
            if let Some(v) = timing.startup_patience_ms {
                config.startup_patience = ms(v);
            }
            if let Some(v) = timing.poll_interval_ms {
                if v == 0 {
                    return Err(TranslatorError::Config(
                        "timing.poll_interval_ms must be non-zero".into(),
                    ));
                }
                config.poll_interval = ms(v);
            }
            if let Some(v) = timing.kill_patience_ms {
                config.kill_patience = ms(v);
            }
            if let Some(v) = timing.termination_grace_ms {
                config.termination_grace = ms(v);
            }
            if let Some(v) = timing.probe_timeout_ms {
                config.probe_timeout = ms(v);
            }
            if let Some(v) = timing.request_timeout_secs {
                config.request_timeout = Duration::from_secs(v);
            }
        }
        if let Some(preflight) = &self.preflight {
            if let Some(v) = preflight.check_node {
                config.check_node = v;
            }
            if let Some(v) = preflight.node_min_major {
                config.node_min_major = v;
            }
            if let Some(v) = preflight.node_max_major {
                config.node_max_major = v;
            }
        }
        Ok(config)
    }
}

/// Save the config to the platform config directory, returning the path.
pub fn save_config(config: &ConfigFile) -> Result<PathBuf> {
    let path = config_path()
        .ok_or_else(|| TranslatorError::Config("could not determine config directory".into()))?;
    save_to_path(config, &path)?;
    Ok(path)
}

pub fn save_to_path(config: &ConfigFile, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            TranslatorError::Config(format!("failed to create {}: {}", parent.display(), e))
        })?;
    }
    let content = to_toml(config)?;
    std::fs::write(path, content)
        .map_err(|e| TranslatorError::Config(format!("failed to write {}: {}", path.display(), e)))
}

/// Render the config as TOML text.
pub fn to_toml(config: &ConfigFile) -> Result<String> {
    toml::to_string_pretty(config)
        .map_err(|e| TranslatorError::Config(format!("failed to serialize config: {}", e)))
}
