//! Agent configuration: YAML document under `/etc/bladed` with
//! `BLADE_*` environment overrides.

use std::path::{Path, PathBuf};
use std::{env, fs};

use anyhow::{bail, Context, Result};
use log::info;
use serde::{Deserialize, Serialize};

use crate::fan_controller::{FanCurveConfig, Step};
use crate::led::Color;

const DEFAULT_CONFIG_PATH: &str = "/etc/bladed/config.yaml";

/// Transport for the control-plane listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenMode {
    Tcp,
    Unix,
}

impl std::str::FromStr for ListenMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tcp" => Ok(ListenMode::Tcp),
            "unix" => Ok(ListenMode::Unix),
            other => bail!(
                "invalid listen mode '{other}'; valid modes are: [tcp, unix]"
            ),
        }
    }
}

/// Listener configuration for the gRPC control plane and the metrics
/// endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenConfig {
    /// Metrics/health HTTP listen address.
    #[serde(default = "defaults::metrics_addr")]
    pub metrics: String,

    /// gRPC listen address (host:port for tcp, socket path for unix).
    #[serde(default = "defaults::grpc_addr")]
    pub grpc: String,

    /// Listener transport.
    #[serde(default = "defaults::listen_mode")]
    pub mode: ListenMode,

    /// Enforce mTLS on the gRPC listener (tcp only; unix sockets are
    /// unauthenticated by construction).
    #[serde(default = "defaults::authenticated")]
    pub authenticated: bool,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            metrics: defaults::metrics_addr(),
            grpc: defaults::grpc_addr(),
            mode: defaults::listen_mode(),
            authenticated: defaults::authenticated(),
        }
    }
}

/// Reference-backend tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HalConfig {
    /// Temperature the simulated backend starts with.
    #[serde(default = "defaults::initial_temperature")]
    pub initial_temperature: f64,
}

impl Default for HalConfig {
    fn default() -> Self {
        Self {
            initial_temperature: defaults::initial_temperature(),
        }
    }
}

/// Full agent configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub listen: ListenConfig,

    /// Whether stealth mode (LEDs suppressed) is the configured default.
    #[serde(default)]
    pub stealth_mode: bool,

    /// Edge LED color while idle.
    #[serde(default = "defaults::idle_led_color")]
    pub idle_led_color: Color,

    /// Edge LED color while identify is active.
    #[serde(default = "defaults::identify_led_color")]
    pub identify_led_color: Color,

    /// Top LED color while the blade is in critical state.
    #[serde(default = "defaults::critical_led_color")]
    pub critical_led_color: Color,

    /// Critical temperature of the blade, surfaced through the status
    /// endpoint.
    #[serde(default = "defaults::critical_temperature_threshold")]
    pub critical_temperature_threshold: u32,

    #[serde(default = "defaults::fan_curve")]
    pub fan_curve: FanCurveConfig,

    #[serde(default)]
    pub hal: HalConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            listen: ListenConfig::default(),
            stealth_mode: false,
            idle_led_color: defaults::idle_led_color(),
            identify_led_color: defaults::identify_led_color(),
            critical_led_color: defaults::critical_led_color(),
            critical_temperature_threshold: defaults::critical_temperature_threshold(),
            fan_curve: defaults::fan_curve(),
            hal: HalConfig::default(),
        }
    }
}

mod defaults {
    use super::*;

    pub fn metrics_addr() -> String {
        "0.0.0.0:9666".to_string()
    }

    pub fn grpc_addr() -> String {
        "0.0.0.0:8081".to_string()
    }

    pub fn listen_mode() -> ListenMode {
        ListenMode::Tcp
    }

    pub fn authenticated() -> bool {
        true
    }

    pub fn initial_temperature() -> f64 {
        40.0
    }

    pub fn idle_led_color() -> Color {
        Color::new(0, 64, 0)
    }

    pub fn identify_led_color() -> Color {
        Color::new(0, 0, 255)
    }

    pub fn critical_led_color() -> Color {
        Color::new(255, 0, 0)
    }

    pub fn critical_temperature_threshold() -> u32 {
        80
    }

    pub fn fan_curve() -> FanCurveConfig {
        FanCurveConfig {
            steps: vec![
                Step {
                    temperature: 45.0,
                    percent: 20,
                },
                Step {
                    temperature: 60.0,
                    percent: 50,
                },
                Step {
                    temperature: 70.0,
                    percent: 100,
                },
            ],
        }
    }
}

impl AgentConfig {
    /// Loads the configuration.
    ///
    /// An explicitly given path must exist; without one the default
    /// `/etc/bladed/config.yaml` is used if present, otherwise built-in
    /// defaults apply. `BLADE_*` environment variables override scalar
    /// keys in either case (`.` in the YAML path maps to `_`).
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut config = match path {
            Some(p) => {
                info!("Loading config from: {}", p.display());
                Self::load_from_path(&p)?
            }
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_PATH);
                if default_path.exists() {
                    info!("Loading config from: {}", default_path.display());
                    Self::load_from_path(default_path)?
                } else {
                    info!("No config file found, using built-in defaults");
                    Self::default()
                }
            }
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn load_from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse YAML in: {}", path.display()))
    }

    /// Applies `BLADE_*` environment overrides for the scalar keys.
    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(v) = env::var("BLADE_LISTEN_METRICS") {
            self.listen.metrics = v;
        }
        if let Ok(v) = env::var("BLADE_LISTEN_GRPC") {
            self.listen.grpc = v;
        }
        if let Ok(v) = env::var("BLADE_LISTEN_MODE") {
            self.listen.mode = v
                .parse()
                .context("invalid BLADE_LISTEN_MODE environment override")?;
        }
        if let Ok(v) = env::var("BLADE_LISTEN_AUTHENTICATED") {
            self.listen.authenticated = v
                .parse()
                .context("invalid BLADE_LISTEN_AUTHENTICATED environment override")?;
        }
        if let Ok(v) = env::var("BLADE_STEALTH_MODE") {
            self.stealth_mode = v
                .parse()
                .context("invalid BLADE_STEALTH_MODE environment override")?;
        }
        if let Ok(v) = env::var("BLADE_CRITICAL_TEMPERATURE_THRESHOLD") {
            self.critical_temperature_threshold = v
                .parse()
                .context("invalid BLADE_CRITICAL_TEMPERATURE_THRESHOLD environment override")?;
        }
        Ok(())
    }

    /// Startup validation; violations abort the agent with remediation
    /// advice. The fan curve is validated by the fan controller on
    /// construction.
    pub fn validate(&self) -> Result<()> {
        if self.listen.grpc.is_empty() {
            bail!(
                "no gRPC listen address configured; set listen.grpc in the config \
                 or the BLADE_LISTEN_GRPC environment variable"
            );
        }
        if self.listen.metrics.is_empty() {
            bail!(
                "no metrics listen address configured; set listen.metrics in the \
                 config or the BLADE_LISTEN_METRICS environment variable"
            );
        }
        Ok(())
    }
}
