use std::{env, fs, path::PathBuf, time::Duration};

use serde::Deserialize;
use tracing::debug;

use crate::error::ConfigError;

/// Environment variable naming the JSON config file.
pub const CONFIG_FILE_PATH_ENV: &str = "GANTRY_CONFIG_FILE_PATH";
/// Fallback config path, relative to the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "conf/gantry.json";

/// Which listener(s) the server runs.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
pub enum ServerMode {
    #[default]
    #[serde(rename = "tcp")]
    Tcp,
    #[serde(rename = "websocket")]
    Websocket,
    #[serde(rename = "kcp")]
    Kcp,
    /// Empty mode string: TCP and WebSocket side by side.
    #[serde(rename = "")]
    TcpAndWebsocket,
}

/// Worker assignment strategy.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
pub enum WorkerMode {
    /// `worker_id = conn_id % pool_size`: sticky but shared.
    #[default]
    #[serde(rename = "Hash", alias = "")]
    Hash,
    /// One exclusive worker per connection; pool size becomes `max_conn`.
    #[serde(rename = "Bind")]
    Bind,
}

/// Server configuration record, threaded explicitly through
/// [`Server::new`](crate::Server::new).
///
/// Field names follow the original JSON schema (PascalCase). Every field
/// is optional in the file; missing fields take the defaults below.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct ServerConfig {
    /// Server name; connections inherit it.
    pub name: String,
    /// Listener bind address.
    pub host: String,
    pub tcp_port: u16,
    pub ws_port: u16,
    pub kcp_port: u16,
    pub mode: ServerMode,
    /// Accept-gating threshold.
    pub max_conn: usize,
    /// `unpack` rejects payload lengths above this; 0 disables the check.
    pub max_packet_size: u32,
    pub worker_pool_size: u32,
    pub worker_mode: WorkerMode,
    /// Per-worker queue capacity.
    pub max_worker_task_len: usize,
    /// Per-connection send-queue capacity.
    pub max_msg_chan_len: usize,
    /// Socket read buffer size.
    #[serde(rename = "IOReadBuffSize")]
    pub io_read_buff_size: usize,
    /// Liveness window in seconds.
    pub heartbeat_max: u64,
    /// TLS is enabled when both files are set.
    pub cert_file: String,
    pub private_key_file: String,
    pub router_slices_mode: bool,
    pub request_pool_mode: bool,

    pub kcp_ack_no_delay: bool,
    pub kcp_stream_mode: bool,
    pub kcp_no_delay: i32,
    pub kcp_interval: i32,
    pub kcp_resend: i32,
    pub kcp_nc: i32,
    pub kcp_send_window: u16,
    pub kcp_recv_window: u16,
    pub kcp_mtu: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "gantry-server".into(),
            host: "0.0.0.0".into(),
            tcp_port: 8999,
            ws_port: 9000,
            kcp_port: 9001,
            mode: ServerMode::Tcp,
            max_conn: 12000,
            max_packet_size: 4096,
            worker_pool_size: 10,
            worker_mode: WorkerMode::Hash,
            max_worker_task_len: 1024,
            max_msg_chan_len: 1024,
            io_read_buff_size: 1024,
            heartbeat_max: 10,
            cert_file: String::new(),
            private_key_file: String::new(),
            router_slices_mode: false,
            request_pool_mode: false,
            kcp_ack_no_delay: false,
            kcp_stream_mode: true,
            // Turbo-mode tuning: ikcp_nodelay(kcp, 1, 10, 2, 1).
            kcp_no_delay: 1,
            kcp_interval: 10,
            kcp_resend: 2,
            kcp_nc: 1,
            kcp_send_window: 32,
            kcp_recv_window: 32,
            kcp_mtu: 1400,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from the file named by `GANTRY_CONFIG_FILE_PATH`,
    /// falling back to `<cwd>/conf/gantry.json`. A missing file is not an
    /// error: defaults are used.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_file(&config_file_path())
    }

    pub fn from_file(path: &PathBuf) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!(?path, "no config file, using defaults");
            return Ok(Self::default());
        }
        let data = fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub fn heartbeat_max_duration(&self) -> Duration {
        Duration::from_secs(self.heartbeat_max)
    }

    pub fn tls_enabled(&self) -> bool {
        !self.cert_file.is_empty() && !self.private_key_file.is_empty()
    }
}

fn config_file_path() -> PathBuf {
    match env::var(CONFIG_FILE_PATH_ENV) {
        Ok(path) if !path.is_empty() => PathBuf::from(path),
        _ => env::current_dir().unwrap_or_else(|_| PathBuf::from(".")).join(DEFAULT_CONFIG_FILE),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.tcp_port, 8999);
        assert_eq!(cfg.mode, ServerMode::Tcp);
        assert_eq!(cfg.max_conn, 12000);
        assert_eq!(cfg.worker_pool_size, 10);
        assert_eq!(cfg.worker_mode, WorkerMode::Hash);
        assert_eq!(cfg.heartbeat_max_duration(), Duration::from_secs(10));
        assert!(!cfg.tls_enabled());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = ServerConfig::from_file(&PathBuf::from("/nonexistent/gantry.json")).unwrap();
        assert_eq!(cfg.tcp_port, 8999);
    }

    #[test]
    fn partial_file_overrides_some_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"Name": "echo", "TcpPort": 7000, "Mode": "", "WorkerMode": "Bind", "MaxConn": 3}}"#
        )
        .unwrap();

        let cfg = ServerConfig::from_file(&file.path().to_path_buf()).unwrap();
        assert_eq!(cfg.name, "echo");
        assert_eq!(cfg.tcp_port, 7000);
        assert_eq!(cfg.mode, ServerMode::TcpAndWebsocket);
        assert_eq!(cfg.worker_mode, WorkerMode::Bind);
        assert_eq!(cfg.max_conn, 3);
        // Untouched fields keep their defaults.
        assert_eq!(cfg.ws_port, 9000);
        assert_eq!(cfg.max_packet_size, 4096);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(
            ServerConfig::from_file(&file.path().to_path_buf()),
            Err(ConfigError::Parse(_))
        ));
    }
}
