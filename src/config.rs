//! Configuration using Figment
//!
//! Settings are loaded from:
//! 1. `config/korad_daq.toml` (or an explicit path)
//! 2. Environment variables prefixed with `KORAD_DAQ_`, sections separated by `__`
//!
//! Every field has a default, so a missing file yields a usable configuration
//! pointing at the instrument's factory address.
//!
//! # Example
//! ```no_run
//! use korad_daq::config::Settings;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // KORAD_DAQ_DISCHARGE__CELL_ID=17 overrides [discharge] cell_id
//! let settings = Settings::load()?;
//! settings.validate()?;
//! println!("device at {}", settings.device_addr()?);
//! # Ok(())
//! # }
//! ```

use crate::discharge::{DischargeConfig, DisablePolicy};
use crate::error::{AppResult, DaqError};
use crate::instrument::BatteryProfile;
use crate::protocol::QueryPolicy;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/korad_daq.toml";

/// Port the KEL103 listens on.
pub const DEFAULT_PORT: u16 = 18190;

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    /// Logging settings
    pub application: ApplicationConfig,
    /// Addresses and query timing
    pub network: NetworkConfig,
    /// Discharge test parameters
    pub discharge: DischargeSettings,
    /// Export settings
    pub storage: StorageConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// Network endpoints and query timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Host address to bind
    pub local_address: String,
    /// Host port to bind; the instrument replies to this port
    pub local_port: u16,
    /// Instrument address
    pub device_address: String,
    /// Instrument port
    pub device_port: u16,
    /// Receive timeout of one query attempt in milliseconds
    pub attempt_timeout_ms: u64,
    /// Upper bound for one query including resends, in milliseconds
    pub query_ceiling_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            local_address: "0.0.0.0".to_string(),
            local_port: DEFAULT_PORT,
            device_address: "192.168.1.198".to_string(),
            device_port: DEFAULT_PORT,
            attempt_timeout_ms: 1000,
            query_ceiling_ms: 3000,
        }
    }
}

/// Discharge test parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DischargeSettings {
    /// Identifier of the cell under test
    pub cell_id: String,
    /// Pause between two sampling cycles in milliseconds
    pub sampling_period_ms: u64,
    /// Four-wire voltage measurement
    pub remote_sense: bool,
    /// Discharge current in amperes
    pub set_current: f64,
    /// Stop voltage in volts
    pub voltage_cutoff: f64,
    /// Instrument-side capacity limit in ampere-hours
    pub capacity_cutoff: f64,
    /// Instrument-side time limit in minutes
    pub time_cutoff: f64,
    /// Current range limit in amperes
    pub max_current: f64,
    /// Battery profile slot; slot 2 must be programmed before 0 and 1
    pub profile_slot: u8,
    /// Substring the identity must contain
    pub expected_model: String,
    /// Output disable attempts after a fault
    pub disable_attempts: u32,
    /// Pause between disable attempts in milliseconds
    pub disable_pause_ms: u64,
}

impl Default for DischargeSettings {
    fn default() -> Self {
        Self {
            cell_id: "1".to_string(),
            sampling_period_ms: 1000,
            remote_sense: false,
            set_current: 1.0,
            voltage_cutoff: 2.5,
            capacity_cutoff: 99.0,
            time_cutoff: 99.0,
            max_current: 30.0,
            profile_slot: 2,
            expected_model: "KEL103".to_string(),
            disable_attempts: 3,
            disable_pause_ms: 1000,
        }
    }
}

/// Export configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Output directory for exported sessions
    pub output_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("data"),
        }
    }
}

const VALID_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const VALID_FORMATS: [&str; 3] = ["pretty", "compact", "json"];
const MAX_PROFILE_SLOT: u8 = 9;

fn invalid(message: impl Into<String>) -> DaqError {
    DaqError::Configuration(message.into())
}

fn socket_addr(field: &str, address: &str, port: u16) -> AppResult<SocketAddr> {
    let ip: IpAddr = address
        .trim()
        .parse()
        .map_err(|e| invalid(format!("Invalid {field} '{address}': {e}")))?;
    Ok(SocketAddr::new(ip, port))
}

impl Settings {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path and the environment.
    ///
    /// A missing file is not an error; defaults apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("KORAD_DAQ_").split("__"))
            .extract()?;
        Ok(settings)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let app = &self.application;
        if !VALID_LEVELS.contains(&app.log_level.to_lowercase().as_str()) {
            return Err(invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                app.log_level,
                VALID_LEVELS.join(", ")
            )));
        }
        if !VALID_FORMATS.contains(&app.log_format.to_lowercase().as_str()) {
            return Err(invalid(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                app.log_format,
                VALID_FORMATS.join(", ")
            )));
        }

        self.local_addr()?;
        self.device_addr()?;
        let net = &self.network;
        if net.attempt_timeout_ms == 0 {
            return Err(invalid("attempt_timeout_ms must be greater than 0"));
        }
        if net.query_ceiling_ms < net.attempt_timeout_ms {
            return Err(invalid(format!(
                "query_ceiling_ms ({}) must not be shorter than attempt_timeout_ms ({})",
                net.query_ceiling_ms, net.attempt_timeout_ms
            )));
        }

        let d = &self.discharge;
        if d.cell_id.trim().is_empty() {
            return Err(invalid("cell_id must not be empty"));
        }
        if d.sampling_period_ms == 0 {
            return Err(invalid("sampling_period_ms must be greater than 0"));
        }
        for (name, value) in [
            ("set_current", d.set_current),
            ("voltage_cutoff", d.voltage_cutoff),
            ("capacity_cutoff", d.capacity_cutoff),
            ("time_cutoff", d.time_cutoff),
            ("max_current", d.max_current),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(invalid(format!(
                    "{name} must be a positive number, got {value}"
                )));
            }
        }
        if d.set_current > d.max_current {
            return Err(invalid(format!(
                "set_current ({} A) exceeds max_current ({} A)",
                d.set_current, d.max_current
            )));
        }
        if d.profile_slot > MAX_PROFILE_SLOT {
            return Err(invalid(format!(
                "profile_slot {} out of range 0-{MAX_PROFILE_SLOT}",
                d.profile_slot
            )));
        }
        if d.expected_model.trim().is_empty() {
            return Err(invalid("expected_model must not be empty"));
        }
        if d.disable_attempts == 0 {
            return Err(invalid("disable_attempts must be at least 1"));
        }

        Ok(())
    }

    /// Local endpoint to bind.
    pub fn local_addr(&self) -> AppResult<SocketAddr> {
        socket_addr(
            "local_address",
            &self.network.local_address,
            self.network.local_port,
        )
    }

    /// Instrument endpoint.
    pub fn device_addr(&self) -> AppResult<SocketAddr> {
        socket_addr(
            "device_address",
            &self.network.device_address,
            self.network.device_port,
        )
    }

    /// Retry policy for instrument queries.
    pub fn query_policy(&self) -> QueryPolicy {
        QueryPolicy::from_millis(
            self.network.attempt_timeout_ms,
            self.network.query_ceiling_ms,
        )
    }

    /// Parameters for [`crate::discharge::DischargeTest`].
    pub fn discharge_config(&self) -> DischargeConfig {
        let d = &self.discharge;
        DischargeConfig {
            cell_id: d.cell_id.clone(),
            sampling_period: Duration::from_millis(d.sampling_period_ms),
            remote_sense: d.remote_sense,
            profile: BatteryProfile {
                slot: d.profile_slot,
                max_current: d.max_current,
                set_current: d.set_current,
                voltage_cutoff: d.voltage_cutoff,
                capacity_cutoff: d.capacity_cutoff,
                time_cutoff: d.time_cutoff,
            },
            expected_model: d.expected_model.clone(),
            disable: DisablePolicy {
                attempts: d.disable_attempts,
                pause: Duration::from_millis(d.disable_pause_ms),
            },
        }
    }
}
