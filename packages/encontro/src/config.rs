use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// =============================================================================
// Unified config (figment-deserialized from defaults / encontro.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   encontro.toml:   [relay]
//                    idle_timeout_secs = 60
//
//   env var:         ENCONTRO_RELAY__IDLE_TIMEOUT_SECS=60   (double underscore = nesting)
//
//   CLI:             --host / --port override [server]

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "encontro.toml";

/// Named configuration presets.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    /// host=127.0.0.1, any room id is accepted and created on first join
    Local,
    /// host=0.0.0.0, only rooms known to the room store are joinable
    Server,
}

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub profile: Option<Profile>,
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub relay: RelayFileConfig,
    #[serde(default)]
    pub rooms: RoomsFileConfig,
}

/// Listener settings (lives under `[server]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Allowed CORS origins. Empty means permissive.
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: Vec::new(),
        }
    }
}

/// Relay tuning knobs (lives under `[relay]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelayFileConfig {
    #[serde(default = "default_send_queue_capacity")]
    pub send_queue_capacity: usize,
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    /// 0 disables the idle timeout
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// Broadcast `peer-joined` / `peer-left` to the rest of the room
    #[serde(default = "default_announce_membership")]
    pub announce_membership: bool,
    /// Envelope types handed to the message recorder
    #[serde(default)]
    pub persist_types: Vec<String>,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl Default for RelayFileConfig {
    fn default() -> Self {
        Self {
            send_queue_capacity: default_send_queue_capacity(),
            send_timeout_ms: default_send_timeout_ms(),
            idle_timeout_secs: default_idle_timeout_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            announce_membership: default_announce_membership(),
            persist_types: Vec::new(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

/// In-memory room store settings (lives under `[rooms]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoomsFileConfig {
    #[serde(default = "default_seed_rooms")]
    pub seed: Vec<String>,
    #[serde(default)]
    pub auto_create: bool,
}

impl Default for RoomsFileConfig {
    fn default() -> Self {
        Self {
            seed: default_seed_rooms(),
            auto_create: false,
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8443
}
fn default_send_queue_capacity() -> usize {
    64
}
fn default_send_timeout_ms() -> u64 {
    5000
}
fn default_idle_timeout_secs() -> u64 {
    300
}
fn default_shutdown_grace_secs() -> u64 {
    5
}
fn default_announce_membership() -> bool {
    true
}
fn default_max_frame_bytes() -> usize {
    64 * 1024
}
fn default_seed_rooms() -> Vec<String> {
    vec!["lobby".to_string()]
}

/// Build a figment that layers: defaults → profile defaults → config file → ENCONTRO_* env vars.
///
/// The CLI profile takes priority over the config file profile.
pub fn load_config(config_path: &Path, cli_profile: Option<&Profile>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    // Pass 1: peek at profile from the file/env (CLI overrides file)
    let base = Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_path))
        .merge(Env::prefixed("ENCONTRO_").split("__"));

    let profile: Option<Profile> = cli_profile
        .cloned()
        .or_else(|| base.extract_inner("profile").ok());

    // Pass 2: rebuild with profile defaults between struct defaults and the file
    let profile_layer = profile_to_file_config(profile.as_ref());

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Serialized::defaults(profile_layer))
        .merge(Toml::file(config_path))
        .merge(Env::prefixed("ENCONTRO_").split("__"))
}

/// Convert a profile into a `FileConfig` with the profile's default values filled in.
fn profile_to_file_config(profile: Option<&Profile>) -> FileConfig {
    match profile {
        Some(Profile::Local) => FileConfig {
            profile: Some(Profile::Local),
            server: ServerFileConfig {
                host: "127.0.0.1".to_string(),
                ..Default::default()
            },
            rooms: RoomsFileConfig {
                auto_create: true,
                ..Default::default()
            },
            relay: Default::default(),
        },
        Some(Profile::Server) => FileConfig {
            profile: Some(Profile::Server),
            server: ServerFileConfig {
                host: "0.0.0.0".to_string(),
                ..Default::default()
            },
            rooms: RoomsFileConfig {
                auto_create: false,
                ..Default::default()
            },
            relay: Default::default(),
        },
        None => FileConfig::default(),
    }
}

// =============================================================================
// Runtime config (derived from FileConfig, used throughout the server)
// =============================================================================

/// Relay configuration (runtime view).
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Outbound frames buffered per connection before new ones are dropped
    pub send_queue_capacity: usize,
    /// Longest a single socket write may take before the peer is dropped
    pub send_timeout: Duration,
    /// Close connections that send nothing for this long (None = disabled)
    pub idle_timeout: Option<Duration>,
    /// How long shutdown waits for sessions to finish cleanup
    pub shutdown_grace: Duration,
    pub announce_membership: bool,
    pub persist_types: Vec<String>,
    pub max_frame_bytes: usize,
}

impl RelayConfig {
    pub fn from_file(fc: &RelayFileConfig) -> Self {
        Self {
            send_queue_capacity: fc.send_queue_capacity.max(1),
            send_timeout: Duration::from_millis(fc.send_timeout_ms.max(1)),
            idle_timeout: if fc.idle_timeout_secs == 0 {
                None
            } else {
                Some(Duration::from_secs(fc.idle_timeout_secs))
            },
            shutdown_grace: Duration::from_secs(fc.shutdown_grace_secs),
            announce_membership: fc.announce_membership,
            persist_types: fc.persist_types.clone(),
            max_frame_bytes: fc.max_frame_bytes,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::from_file(&RelayFileConfig::default())
    }
}

/// Listener configuration (runtime view).
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
}

impl ServerConfig {
    pub fn from_file(fc: &ServerFileConfig) -> Self {
        Self {
            host: fc.host.clone(),
            port: fc.port,
            cors_origins: fc.cors_origins.clone(),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
