use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub tracking: TrackingConfig,
    #[serde(default)]
    pub topology: TopologyConfig,
    #[serde(default)]
    pub auto_traceroute: AutoTracerouteConfig,
    #[serde(default)]
    pub auto_telemetry: AutoTelemetryConfig,
    #[serde(default)]
    pub federation: FederationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Directory served at `/` for the bundled web pages.
    #[serde(default = "default_web_dir")]
    pub web_dir: String,
    #[serde(default = "default_site_name")]
    pub site_name: String,
    /// Channel index used when a send-text request does not name one.
    #[serde(default)]
    pub default_channel: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_packets_per_node")]
    pub max_packets_per_node: usize,
    /// Port tags whose packets land in per-node history. An empty list
    /// tracks everything.
    #[serde(default = "default_track_packet_types")]
    pub track_packet_types: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_link_timeout_minutes")]
    pub link_timeout_minutes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoTracerouteConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_traceroute_interval")]
    pub interval_minutes: u64,
    #[serde(default = "default_traceroute_age_hours")]
    pub traceroute_age_hours: i64,
    #[serde(default = "default_traceroute_active_threshold")]
    pub active_threshold_minutes: i64,
    #[serde(default = "default_hop_limit")]
    pub hop_limit: u32,
    #[serde(default = "default_traceroute_max_per_cycle")]
    pub max_per_cycle: usize,
    #[serde(default = "default_traceroute_delay_seconds")]
    pub delay_seconds: u64,
    #[serde(default = "default_true")]
    pub exclude_mqtt_nodes: bool,
    #[serde(default = "default_attempt_timeout_seconds")]
    pub timeout_seconds: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoTelemetryConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_telemetry_interval")]
    pub interval_minutes: u64,
    #[serde(default = "default_request_age_hours")]
    pub request_age_hours: i64,
    #[serde(default = "default_telemetry_active_threshold")]
    pub active_threshold_minutes: i64,
    #[serde(default = "default_telemetry_max_per_cycle")]
    pub max_per_cycle: usize,
    #[serde(default = "default_telemetry_delay_seconds")]
    pub delay_seconds: u64,
    #[serde(default = "default_true")]
    pub exclude_mqtt_nodes: bool,
    #[serde(default = "default_true")]
    pub skip_nodes_with_recent_traceroute: bool,
    #[serde(default = "default_attempt_timeout_seconds")]
    pub timeout_seconds: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_collector_id")]
    pub collector_id: String,
    #[serde(default)]
    pub api_url: String,
    #[serde(default = "default_export_interval")]
    pub export_interval_minutes: u64,
    #[serde(default = "default_export_lookback")]
    pub export_hours_lookback: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive for the subscriber, e.g. `info` or
    /// `meshwatch_server=debug`; `RUST_LOG` wins when set.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_web_dir() -> String {
    "web".to_string()
}

fn default_site_name() -> String {
    "Meshwatch".to_string()
}

fn default_database_path() -> String {
    "./nodes.db".to_string()
}

fn default_max_packets_per_node() -> usize {
    1000
}

fn default_track_packet_types() -> Vec<String> {
    [
        "TEXT_MESSAGE_APP",
        "POSITION_APP",
        "NODEINFO_APP",
        "TELEMETRY_APP",
        "ROUTING_APP",
        "TRACEROUTE_APP",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_link_timeout_minutes() -> i64 {
    60
}

fn default_traceroute_interval() -> u64 {
    30
}

fn default_traceroute_age_hours() -> i64 {
    4
}

fn default_traceroute_active_threshold() -> i64 {
    60
}

fn default_hop_limit() -> u32 {
    7
}

fn default_traceroute_max_per_cycle() -> usize {
    5
}

fn default_traceroute_delay_seconds() -> u64 {
    10
}

fn default_telemetry_interval() -> u64 {
    15
}

fn default_request_age_hours() -> i64 {
    2
}

fn default_telemetry_active_threshold() -> i64 {
    120
}

fn default_telemetry_max_per_cycle() -> usize {
    10
}

fn default_telemetry_delay_seconds() -> u64 {
    5
}

fn default_attempt_timeout_seconds() -> i64 {
    120
}

fn default_collector_id() -> String {
    "meshwatch-collector".to_string()
}

fn default_export_interval() -> u64 {
    60
}

fn default_export_lookback() -> i64 {
    2
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            web_dir: default_web_dir(),
            site_name: default_site_name(),
            default_channel: 0,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_packets_per_node: default_max_packets_per_node(),
            track_packet_types: default_track_packet_types(),
        }
    }
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            link_timeout_minutes: default_link_timeout_minutes(),
        }
    }
}

impl Default for AutoTracerouteConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_minutes: default_traceroute_interval(),
            traceroute_age_hours: default_traceroute_age_hours(),
            active_threshold_minutes: default_traceroute_active_threshold(),
            hop_limit: default_hop_limit(),
            max_per_cycle: default_traceroute_max_per_cycle(),
            delay_seconds: default_traceroute_delay_seconds(),
            exclude_mqtt_nodes: true,
            timeout_seconds: default_attempt_timeout_seconds(),
        }
    }
}

impl Default for AutoTelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_minutes: default_telemetry_interval(),
            request_age_hours: default_request_age_hours(),
            active_threshold_minutes: default_telemetry_active_threshold(),
            max_per_cycle: default_telemetry_max_per_cycle(),
            delay_seconds: default_telemetry_delay_seconds(),
            exclude_mqtt_nodes: true,
            skip_nodes_with_recent_traceroute: true,
            timeout_seconds: default_attempt_timeout_seconds(),
        }
    }
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            collector_id: default_collector_id(),
            api_url: String::new(),
            export_interval_minutes: default_export_interval(),
            export_hours_lookback: default_export_lookback(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Default basename probed in the working directory when no file is named
/// on the command line.
const CONFIG_BASENAME: &str = "meshwatch";

/// Environment variables override file values: `MESHWATCH__SECTION__KEY`.
const ENV_PREFIX: &str = "MESHWATCH";

impl Config {
    /// Layered load for a standalone daemon: serde defaults underneath, a
    /// TOML file on top, environment variables last.
    ///
    /// A file named via `--config` must exist; the implicit
    /// `meshwatch.toml` in the working directory is optional so the daemon
    /// also runs bare.
    pub fn load(file_override: Option<&str>) -> Result<Self, config::ConfigError> {
        let file = match file_override {
            Some(path) => config::File::with_name(path).required(true),
            None => config::File::with_name(CONFIG_BASENAME).required(false),
        };

        config::Config::builder()
            .add_source(file)
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()
    }

    pub fn load_or_default(file_override: Option<&str>) -> Self {
        match Self::load(file_override) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: Failed to load config: {}. Using defaults.", e);
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_scheduler_contract() {
        let config = Config::default();
        assert_eq!(config.tracking.max_packets_per_node, 1000);
        assert_eq!(config.topology.link_timeout_minutes, 60);

        assert_eq!(config.auto_traceroute.interval_minutes, 30);
        assert_eq!(config.auto_traceroute.traceroute_age_hours, 4);
        assert_eq!(config.auto_traceroute.active_threshold_minutes, 60);
        assert_eq!(config.auto_traceroute.hop_limit, 7);
        assert_eq!(config.auto_traceroute.max_per_cycle, 5);
        assert_eq!(config.auto_traceroute.delay_seconds, 10);

        assert_eq!(config.auto_telemetry.interval_minutes, 15);
        assert_eq!(config.auto_telemetry.request_age_hours, 2);
        assert_eq!(config.auto_telemetry.active_threshold_minutes, 120);
        assert_eq!(config.auto_telemetry.max_per_cycle, 10);
        assert_eq!(config.auto_telemetry.delay_seconds, 5);
        assert!(config.auto_telemetry.skip_nodes_with_recent_traceroute);

        assert_eq!(config.federation.export_hours_lookback, 2);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let parsed: Config = serde_json::from_str(
            r#"{"auto_traceroute": {"enabled": true, "max_per_cycle": 3}}"#,
        )
        .unwrap();
        assert!(parsed.auto_traceroute.enabled);
        assert_eq!(parsed.auto_traceroute.max_per_cycle, 3);
        assert_eq!(parsed.auto_traceroute.hop_limit, 7);
        assert_eq!(parsed.tracking.max_packets_per_node, 1000);
    }

    #[test]
    fn test_explicit_config_file_must_exist() {
        assert!(Config::load(Some("/nonexistent/meshwatch.toml")).is_err());
        // load_or_default still comes up with a usable config.
        let fallback = Config::load_or_default(Some("/nonexistent/meshwatch.toml"));
        assert_eq!(fallback.server.port, 8080);
    }

    #[test]
    fn test_load_from_explicit_file() {
        let file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        std::fs::write(
            file.path(),
            "[server]\nport = 9090\n\n[auto_telemetry]\nenabled = true\n",
        )
        .unwrap();

        let config = Config::load(file.path().to_str()).unwrap();
        assert_eq!(config.server.port, 9090);
        assert!(config.auto_telemetry.enabled);
        // Sections the file does not mention keep their defaults.
        assert_eq!(config.database.path, "./nodes.db");
        assert_eq!(config.server.host, "0.0.0.0");
    }
}
