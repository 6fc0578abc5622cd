use job_registry::Launcher;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// =============================================================================
// File config (figment-deserialized from defaults / profile / toml / env vars)
// =============================================================================
//
//   vna_gateway.toml:   [server]
//                       port = 8000
//
//   env var:            VNA_SERVER__PORT=8000   (double underscore = nesting)
//
//   (single underscore stays within field names: VNA_JOBS__MAX_JOBS)

/// Default config file, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "vna_gateway.toml";

/// Named configuration presets.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    /// host=127.0.0.1, simulated telemetry
    Local,
    /// host=0.0.0.0, telemetry read from the instrument
    Lab,
}

/// Where telemetry samples come from.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    #[default]
    Simulated,
    Instrument,
}

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub profile: Option<Profile>,
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub jobs: JobsFileConfig,
    #[serde(default)]
    pub telemetry: TelemetryFileConfig,
}

/// Listener settings (lives under `[server]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Measurement job settings (lives under `[jobs]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobsFileConfig {
    /// Executable started by `RUN`
    #[serde(default = "default_program")]
    pub program: String,
    /// Arguments inserted before the ones given to `RUN`
    #[serde(default = "default_program_args")]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// 0 = unlimited
    #[serde(default)]
    pub max_jobs: usize,
    #[serde(default = "default_reap_interval_ms")]
    pub reap_interval_ms: u64,
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
}

impl Default for JobsFileConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: default_program_args(),
            working_dir: None,
            max_jobs: 0,
            reap_interval_ms: default_reap_interval_ms(),
            stop_grace_secs: default_stop_grace_secs(),
        }
    }
}

/// Telemetry settings (lives under `[telemetry]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TelemetryFileConfig {
    #[serde(default)]
    pub source: SourceKind,
    /// Command printing one RSL reading (dBm) on its last stdout line
    #[serde(default = "default_rsl_command")]
    pub command: Vec<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Outbound messages buffered per WebSocket client
    #[serde(default = "default_client_queue")]
    pub client_queue: usize,
}

impl Default for TelemetryFileConfig {
    fn default() -> Self {
        Self {
            source: SourceKind::default(),
            command: default_rsl_command(),
            timeout_ms: default_timeout_ms(),
            interval_ms: default_interval_ms(),
            client_queue: default_client_queue(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8000
}
fn default_program() -> String {
    "python3".to_string()
}
fn default_program_args() -> Vec<String> {
    vec!["scripts/znle_pyvisa.py".to_string()]
}
fn default_reap_interval_ms() -> u64 {
    1000
}
fn default_stop_grace_secs() -> u64 {
    5
}
fn default_rsl_command() -> Vec<String> {
    vec![
        "python3".to_string(),
        "scripts/znle_pyvisa.py".to_string(),
        "--rsl".to_string(),
    ]
}
fn default_timeout_ms() -> u64 {
    5000
}
fn default_interval_ms() -> u64 {
    500
}
fn default_client_queue() -> usize {
    32
}

/// Build a figment that layers: defaults → profile defaults → toml file → VNA_* env vars.
///
/// The CLI profile takes priority over the file profile. Env vars use
/// double-underscore for nesting into sections:
///   `VNA_SERVER__PORT=9000`  →  `server.port = 9000`
///   `VNA_TELEMETRY__SOURCE=instrument`  →  `telemetry.source = "instrument"`
pub fn load_config(config_path: &Path, cli_profile: Option<&Profile>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    // Pass 1: peek at profile from the file/env (CLI overrides file)
    let base = Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_path))
        .merge(Env::prefixed("VNA_").split("__"));

    let profile: Option<Profile> = cli_profile
        .cloned()
        .or_else(|| base.extract_inner("profile").ok());

    // Pass 2: profile defaults sit between struct defaults and the file
    let profile_layer = profile_to_file_config(profile.as_ref());

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Serialized::defaults(profile_layer))
        .merge(Toml::file(config_path))
        .merge(Env::prefixed("VNA_").split("__"))
}

fn profile_to_file_config(profile: Option<&Profile>) -> FileConfig {
    match profile {
        Some(Profile::Local) => FileConfig {
            profile: Some(Profile::Local),
            server: ServerFileConfig {
                host: "127.0.0.1".to_string(),
                ..Default::default()
            },
            telemetry: TelemetryFileConfig {
                source: SourceKind::Simulated,
                ..Default::default()
            },
            ..Default::default()
        },
        Some(Profile::Lab) => FileConfig {
            profile: Some(Profile::Lab),
            server: ServerFileConfig {
                host: "0.0.0.0".to_string(),
                ..Default::default()
            },
            telemetry: TelemetryFileConfig {
                source: SourceKind::Instrument,
                ..Default::default()
            },
            ..Default::default()
        },
        None => FileConfig::default(),
    }
}

// =============================================================================
// Runtime config (derived from FileConfig)
// =============================================================================

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub jobs: JobsConfig,
    pub telemetry: TelemetryConfig,
}

#[derive(Clone, Debug)]
pub struct JobsConfig {
    pub launcher: Launcher,
    pub max_jobs: Option<usize>,
    pub reap_interval: Duration,
    pub stop_grace: Duration,
}

#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    pub source: SourceKind,
    pub command: Vec<String>,
    /// Maximum time one instrument read may take
    pub timeout: Duration,
    /// Broadcast period
    pub interval: Duration,
    pub client_queue: usize,
}

impl GatewayConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        let launcher = Launcher {
            program: fc.jobs.program.clone(),
            base_args: fc.jobs.args.clone(),
            working_dir: fc.jobs.working_dir.clone(),
            env: Vec::new(),
        };

        Self {
            host: fc.server.host.clone(),
            port: fc.server.port,
            jobs: JobsConfig {
                launcher,
                max_jobs: (fc.jobs.max_jobs > 0).then_some(fc.jobs.max_jobs),
                reap_interval: Duration::from_millis(fc.jobs.reap_interval_ms.max(1)),
                stop_grace: Duration::from_secs(fc.jobs.stop_grace_secs),
            },
            telemetry: TelemetryConfig {
                source: fc.telemetry.source,
                command: fc.telemetry.command.clone(),
                timeout: Duration::from_millis(fc.telemetry.timeout_ms),
                interval: Duration::from_millis(fc.telemetry.interval_ms.max(1)),
                client_queue: fc.telemetry.client_queue.max(1),
            },
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::from_file(&FileConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── profile_to_file_config ──────────────────────────────────────────

    #[test]
    fn test_local_profile() {
        let fc = profile_to_file_config(Some(&Profile::Local));
        assert_eq!(fc.profile, Some(Profile::Local));
        assert_eq!(fc.server.host, "127.0.0.1");
        assert_eq!(fc.telemetry.source, SourceKind::Simulated);
    }

    #[test]
    fn test_lab_profile() {
        let fc = profile_to_file_config(Some(&Profile::Lab));
        assert_eq!(fc.profile, Some(Profile::Lab));
        assert_eq!(fc.server.host, "0.0.0.0");
        assert_eq!(fc.telemetry.source, SourceKind::Instrument);
    }

    // ── defaults ────────────────────────────────────────────────────────

    #[test]
    fn test_file_config_defaults() {
        let fc = FileConfig::default();
        assert!(fc.profile.is_none());
        assert_eq!(fc.server.host, "0.0.0.0");
        assert_eq!(fc.server.port, 8000);
        assert_eq!(fc.jobs.program, "python3");
        assert_eq!(fc.jobs.args, vec!["scripts/znle_pyvisa.py"]);
        assert_eq!(fc.jobs.max_jobs, 0);
        assert_eq!(fc.jobs.reap_interval_ms, 1000);
        assert_eq!(fc.telemetry.interval_ms, 500);
        assert_eq!(fc.telemetry.source, SourceKind::Simulated);
    }

    // ── GatewayConfig::from_file ────────────────────────────────────────

    #[test]
    fn test_gateway_config_from_defaults() {
        let gc = GatewayConfig::default();
        assert_eq!(gc.bind_addr(), "0.0.0.0:8000");
        assert!(gc.jobs.max_jobs.is_none());
        assert_eq!(gc.jobs.reap_interval, Duration::from_secs(1));
        assert_eq!(gc.jobs.stop_grace, Duration::from_secs(5));
        assert_eq!(gc.telemetry.interval, Duration::from_millis(500));
        assert_eq!(
            gc.jobs.launcher.command_line(&["--points".into(), "5".into()]),
            vec!["python3", "scripts/znle_pyvisa.py", "--points", "5"]
        );
    }

    #[test]
    fn test_gateway_config_job_limit() {
        let mut fc = FileConfig::default();
        fc.jobs.max_jobs = 4;
        let gc = GatewayConfig::from_file(&fc);
        assert_eq!(gc.jobs.max_jobs, Some(4));
    }

    // ── load_config ─────────────────────────────────────────────────────

    #[test]
    fn test_load_config_missing_file_uses_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let fc: FileConfig = load_config(&tmp.path().join(DEFAULT_CONFIG_FILE), None)
            .extract()
            .unwrap();
        assert_eq!(fc.server.port, 8000);
        assert!(fc.profile.is_none());
    }

    #[test]
    fn test_load_config_with_profile() {
        let tmp = tempfile::tempdir().unwrap();
        let fc: FileConfig = load_config(&tmp.path().join("none.toml"), Some(&Profile::Local))
            .extract()
            .unwrap();
        assert_eq!(fc.server.host, "127.0.0.1");
    }

    #[test]
    fn test_load_config_file_profile() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("gateway.toml");
        std::fs::write(&path, "profile = \"lab\"\n").unwrap();
        let fc: FileConfig = load_config(&path, None).extract().unwrap();
        assert_eq!(fc.telemetry.source, SourceKind::Instrument);
    }

    #[test]
    fn test_load_config_toml_overrides_profile() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("gateway.toml");
        std::fs::write(&path, "[telemetry]\nsource = \"simulated\"\n").unwrap();
        let fc: FileConfig = load_config(&path, Some(&Profile::Lab)).extract().unwrap();
        assert_eq!(fc.telemetry.source, SourceKind::Simulated);
        assert_eq!(fc.server.host, "0.0.0.0");
    }

    #[test]
    fn test_load_config_toml_sets_values() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("gateway.toml");
        std::fs::write(
            &path,
            "[server]\nport = 9100\n\n[jobs]\nprogram = \"/usr/bin/env\"\nargs = []\nmax_jobs = 2\n",
        )
        .unwrap();
        let fc: FileConfig = load_config(&path, None).extract().unwrap();
        assert_eq!(fc.server.port, 9100);
        assert_eq!(fc.jobs.program, "/usr/bin/env");
        assert!(fc.jobs.args.is_empty());
        assert_eq!(fc.jobs.max_jobs, 2);
    }
}
