//! Daemon configuration: TOML file + CLI overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use uplink_core::{UplinkError, UplinkResult, WS_FRAME_SIZE};

/// Top-level config file structure. Every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub server: ServerSection,
    pub paths: PathsSection,
    pub workers: WorkersSection,
    pub shell: ShellSection,
    pub forward: ForwardSection,
    pub signaling: SignalingSection,
}

/// `[server]` section: where and how to reach the cloud endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub connect_timeout: u64,
    pub reconnect_timeout: u64,
    pub frame_size: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "wss://uplink.example.com".into(),
            connect_timeout: 30,
            reconnect_timeout: 70,
            frame_size: WS_FRAME_SIZE,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsSection {
    pub params_dir: String,
    pub key: String,
    pub log_root: String,
    pub external_log_root: String,
    pub swaglog_dir: String,
    pub stats_dir: String,
    pub snapshot_dir: Option<String>,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            params_dir: "~/.uplink/params".into(),
            key: "~/.uplink/id_ed25519".into(),
            log_root: "/data/media/0/realdata".into(),
            external_log_root: "/mnt/external_realdata".into(),
            swaglog_dir: "/data/log".into(),
            stats_dir: "/data/stats".into(),
            snapshot_dir: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkersSection {
    pub rpc: usize,
    pub upload: usize,
    pub retry_delay: u64,
    pub max_retry_count: u32,
}

impl Default for WorkersSection {
    fn default() -> Self {
        Self {
            rpc: 4,
            upload: 4,
            retry_delay: 10,
            max_retry_count: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShellSection {
    pub command: String,
    pub args: Vec<String>,
    pub term: String,
    pub idle_timeout: u64,
}

impl Default for ShellSection {
    fn default() -> Self {
        Self {
            command: "/bin/bash".into(),
            args: vec!["-l".into()],
            term: "xterm-256color".into(),
            idle_timeout: 600,
        }
    }
}

/// `[forward]` section: log and stat forwarding.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ForwardSection {
    pub compress: bool,
    pub max_message_bytes: usize,
    pub interval: u64,
    pub response_wait: u64,
}

impl Default for ForwardSection {
    fn default() -> Self {
        Self {
            compress: false,
            max_message_bytes: 32 * 1024,
            interval: 10,
            response_wait: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SignalingSection {
    /// Media pipeline process bridged over stdin/stdout JSON lines.
    pub pipeline_command: Option<Vec<String>>,
    pub restart_delay: u64,
    pub sdp_timeout: u64,
}

impl Default for SignalingSection {
    fn default() -> Self {
        Self {
            pipeline_command: None,
            restart_delay: 5,
            sdp_timeout: 10,
        }
    }
}

/// Overrides collected from the command line and environment.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub host: Option<String>,
    pub params_dir: Option<String>,
    pub rpc_workers: Option<usize>,
}

/// Resolved configuration (paths expanded, overrides applied).
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub connect_timeout: Duration,
    pub reconnect_timeout: Duration,
    pub frame_size: usize,

    pub params_dir: PathBuf,
    pub key_path: PathBuf,
    pub log_root: PathBuf,
    pub external_log_root: PathBuf,
    pub swaglog_dir: PathBuf,
    pub stats_dir: PathBuf,
    pub snapshot_dir: Option<PathBuf>,

    pub rpc_workers: usize,
    pub upload_workers: usize,
    pub retry_delay: Duration,
    pub max_retry_count: u32,

    pub shell_command: String,
    pub shell_args: Vec<String>,
    pub shell_term: String,
    pub shell_idle_timeout: Duration,

    pub forward_compress: bool,
    pub forward_max_bytes: usize,
    pub forward_interval: Duration,
    pub forward_response_wait: Duration,

    pub pipeline_command: Option<Vec<String>>,
    pub pipeline_restart_delay: Duration,
    pub sdp_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self::resolve(ConfigFile::default(), &CliOverrides::default())
    }
}

impl Config {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: &CliOverrides) -> UplinkResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde_str(&path.to_string_lossy());
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| UplinkError::Other(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        Ok(Self::resolve(file_config, cli))
    }

    fn resolve(file: ConfigFile, cli: &CliOverrides) -> Self {
        let host = cli.host.clone().unwrap_or(file.server.host);
        let params_dir = cli
            .params_dir
            .clone()
            .unwrap_or(file.paths.params_dir);
        let rpc_workers = cli.rpc_workers.unwrap_or(file.workers.rpc).max(1);

        Self {
            host,
            connect_timeout: Duration::from_secs(file.server.connect_timeout),
            reconnect_timeout: Duration::from_secs(file.server.reconnect_timeout),
            frame_size: file.server.frame_size.max(1),

            params_dir: expand_tilde_str(&params_dir),
            key_path: expand_tilde_str(&file.paths.key),
            log_root: expand_tilde_str(&file.paths.log_root),
            external_log_root: expand_tilde_str(&file.paths.external_log_root),
            swaglog_dir: expand_tilde_str(&file.paths.swaglog_dir),
            stats_dir: expand_tilde_str(&file.paths.stats_dir),
            snapshot_dir: file.paths.snapshot_dir.as_deref().map(expand_tilde_str),

            rpc_workers,
            upload_workers: file.workers.upload.max(1),
            retry_delay: Duration::from_secs(file.workers.retry_delay),
            max_retry_count: file.workers.max_retry_count,

            shell_command: file.shell.command,
            shell_args: file.shell.args,
            shell_term: file.shell.term,
            shell_idle_timeout: Duration::from_secs(file.shell.idle_timeout),

            forward_compress: file.forward.compress,
            forward_max_bytes: file.forward.max_message_bytes,
            forward_interval: Duration::from_secs(file.forward.interval),
            forward_response_wait: Duration::from_secs(file.forward.response_wait),

            pipeline_command: file.signaling.pipeline_command.filter(|c| !c.is_empty()),
            pipeline_restart_delay: Duration::from_secs(file.signaling.restart_delay),
            sdp_timeout: Duration::from_secs(file.signaling.sdp_timeout),
        }
    }
}

/// Expand a leading `~/` to the user's home directory.
fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_constants() {
        let cfg = Config::default();
        assert_eq!(cfg.connect_timeout, Duration::from_secs(30));
        assert_eq!(cfg.reconnect_timeout, Duration::from_secs(70));
        assert_eq!(cfg.frame_size, 4096);
        assert_eq!(cfg.rpc_workers, 4);
        assert_eq!(cfg.upload_workers, 4);
        assert_eq!(cfg.retry_delay, Duration::from_secs(10));
        assert_eq!(cfg.max_retry_count, 30);
        assert_eq!(cfg.shell_idle_timeout, Duration::from_secs(600));
        assert_eq!(cfg.shell_args, vec!["-l".to_string()]);
        assert_eq!(cfg.forward_max_bytes, 32 * 1024);
        assert!(cfg.pipeline_command.is_none());
    }

    #[test]
    fn file_values_and_cli_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[server]
host = "wss://file.example"

[workers]
rpc = 2
upload = 1

[shell]
command = "/bin/sh"
args = []

[signaling]
pipeline_command = ["/usr/bin/pipeline", "--stdio"]
"#
        )
        .unwrap();

        let cli = CliOverrides {
            host: Some("wss://cli.example".into()),
            params_dir: Some("/tmp/params".into()),
            rpc_workers: None,
        };
        let cfg = Config::load(Some(file.path()), &cli).unwrap();
        assert_eq!(cfg.host, "wss://cli.example");
        assert_eq!(cfg.params_dir, PathBuf::from("/tmp/params"));
        assert_eq!(cfg.rpc_workers, 2);
        assert_eq!(cfg.upload_workers, 1);
        assert_eq!(cfg.shell_command, "/bin/sh");
        assert!(cfg.shell_args.is_empty());
        assert_eq!(
            cfg.pipeline_command,
            Some(vec!["/usr/bin/pipeline".to_string(), "--stdio".to_string()])
        );
    }

    #[test]
    fn partial_section_keeps_remaining_defaults() {
        let file: ConfigFile = toml::from_str(
            "[server]\nhost = \"ws://h\"\n[forward]\ncompress = true\n",
        )
        .unwrap();
        let cfg = Config::resolve(file, &CliOverrides::default());
        assert_eq!(cfg.host, "ws://h");
        assert_eq!(cfg.connect_timeout, Duration::from_secs(30));
        assert!(cfg.forward_compress);
        assert_eq!(cfg.forward_response_wait, Duration::from_secs(100));
        assert_eq!(cfg.shell_term, "xterm-256color");
    }

    #[test]
    fn missing_file_uses_defaults() {
        let cfg = Config::load(
            Some(Path::new("/nonexistent/uplink/config.toml")),
            &CliOverrides::default(),
        )
        .unwrap();
        assert_eq!(cfg.host, ServerSection::default().host);
    }

    #[test]
    fn invalid_toml_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server\nhost = 3").unwrap();
        assert!(Config::load(Some(file.path()), &CliOverrides::default()).is_err());
    }

    #[test]
    fn tilde_expansion() {
        let expanded = expand_tilde_str("~/x/y");
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expanded, home.join("x/y"));
        }
        assert_eq!(expand_tilde_str("/abs"), PathBuf::from("/abs"));
    }
}
