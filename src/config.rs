//! TLU configuration using Figment
//!
//! Configuration is layered from:
//! 1. built-in defaults ([`TluConfig::default`])
//! 2. a TOML file (`config/tlu.toml` unless told otherwise)
//! 3. environment variables prefixed with `TLU_DAQ_`, nested keys split on
//!    `__` (e.g. `TLU_DAQ_RUN__MAX_TRIGGER_COUNT=1000`)
//!
//! A loaded [`TluConfig`] is checked by [`TluConfig::validate`] and turned
//! into register values by [`TluConfig::compile`]. Nothing is written to the
//! hardware until compilation has succeeded for every value.
//!
//! # Example
//! ```no_run
//! use tlu_daq::config::TluConfig;
//!
//! # fn main() -> tlu_daq::Result<()> {
//! let config = TluConfig::load_from("config/tlu.example.toml")?;
//! let compiled = config.compile()?;
//! println!("mask {:#010x}:{:#010x}", compiled.trigger_mask.high, compiled.trigger_mask.low);
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TluError};
use crate::i2c::devices::threshold_to_code;
use crate::i2c::I2cConfig;
use crate::logging::OutputFormat;
use crate::trigger::{self, TriggerMask};

/// Default configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/tlu.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "TLU_DAQ_";

/// Number of DUT interfaces on the board.
pub const DUT_COUNT: usize = 4;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TluConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Bus and I2C settings
    #[serde(default)]
    pub hardware: HardwareConfig,
    /// Trigger logic
    #[serde(default)]
    pub trigger: TriggerConfig,
    /// DUT interfaces
    #[serde(default)]
    pub dut: DutConfig,
    /// Run control
    #[serde(default)]
    pub run: RunConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Name shown in logs
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: OutputFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: OutputFormat::default(),
        }
    }
}

/// Hardware access configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HardwareConfig {
    /// I2C master settings
    #[serde(default)]
    pub i2c: I2cConfig,
    /// Skip the I2C peripherals (thresholds, DUT line drivers) when applying
    /// a configuration
    #[serde(default)]
    pub skip_i2c: bool,
}

/// Trigger logic configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Boolean rule over CH1..CH6
    #[serde(default = "default_rule")]
    pub rule: String,
    /// Discriminator threshold per input, volts
    #[serde(default = "default_thresholds")]
    pub thresholds: [f64; 6],
    /// Pulse stretch per input, clock cycles (0-31)
    #[serde(default)]
    pub stretch: [u32; 6],
    /// Pulse delay per input, clock cycles (0-31)
    #[serde(default)]
    pub delay: [u32; 6],
    /// Internal trigger generator frequency in Hz (0 = off)
    #[serde(default)]
    pub internal_frequency_hz: f64,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            rule: default_rule(),
            thresholds: default_thresholds(),
            stretch: [0; 6],
            delay: [0; 6],
            internal_frequency_hz: 0.0,
        }
    }
}

/// DUT interface configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DutConfig {
    /// Enabled DUT interfaces, bit `i` is DUT `i + 1`
    #[serde(default)]
    pub mask: u8,
    /// Interface mode code per DUT (0-3)
    #[serde(default)]
    pub interface_mode: [u8; DUT_COUNT],
    /// Mode modifier bits, one per DUT
    #[serde(default)]
    pub mode_modifier: u8,
    /// DUTs whose busy line is ignored
    #[serde(default)]
    pub ignore_busy: u8,
}

/// Run control configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// FIFO poll period when the FIFO is empty
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Status task period
    #[serde(default = "default_status_interval", with = "humantime_serde")]
    pub status_interval: Duration,
    /// Stop after this many post-veto triggers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_trigger_count: Option<u64>,
    /// Stop after this much run time
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            status_interval: default_status_interval(),
            max_trigger_count: None,
            timeout: None,
        }
    }
}

// Default value functions
fn default_name() -> String {
    "tlu-daq".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_rule() -> String {
    "CH1".to_string()
}

fn default_thresholds() -> [f64; 6] {
    [-0.2; 6]
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(10)
}

fn default_status_interval() -> Duration {
    Duration::from_secs(1)
}

/// Stop conditions evaluated by the status task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopConditions {
    /// Post-veto triggers since run start
    pub max_trigger_count: Option<u64>,
    /// Run time
    pub timeout: Option<Duration>,
}

/// Register values derived from a validated [`TluConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledConfig {
    /// Rule text the mask was built from
    pub rule: String,
    /// Trigger pattern registers
    pub trigger_mask: TriggerMask,
    /// DAC code per input
    pub threshold_codes: [u16; 6],
    /// Packed pulse stretch
    pub pulse_stretch: u32,
    /// Packed pulse delay
    pub pulse_delay: u32,
    /// Internal trigger interval in 160 MHz cycles
    pub internal_trigger_interval: u32,
    /// DUT enable mask
    pub dut_mask: u32,
    /// Packed DUT interface modes, 2 bits per DUT
    pub dut_interface_mode: u32,
    /// DUT mode modifier
    pub dut_mode_modifier: u32,
    /// Ignore-busy mask
    pub ignore_dut_busy: u32,
    /// Whether I2C peripherals are programmed
    pub program_i2c: bool,
    /// FIFO poll period
    pub poll_interval: Duration,
    /// Status period
    pub status_interval: Duration,
    /// Run stop conditions
    pub stop: StopConditions,
}

impl TluConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path and the environment.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::figment(path).extract()?)
    }

    /// Provider stack used by [`load_from`](Self::load_from), for callers
    /// that merge further layers.
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::from(Serialized::defaults(TluConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate value ranges that do not need compiling.
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(TluError::config(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let dut_limit = (1u8 << DUT_COUNT) - 1;
        for (field, value) in [
            ("dut.mask", self.dut.mask),
            ("dut.mode_modifier", self.dut.mode_modifier),
            ("dut.ignore_busy", self.dut.ignore_busy),
        ] {
            if value > dut_limit {
                return Err(TluError::config(format!(
                    "Invalid {} {:#x}. Only {} DUT interfaces exist",
                    field, value, DUT_COUNT
                )));
            }
        }
        if let Some((dut, mode)) = self
            .dut
            .interface_mode
            .iter()
            .enumerate()
            .find(|(_, mode)| **mode > 3)
        {
            return Err(TluError::config(format!(
                "Invalid interface mode {} for DUT {}. Must be 0-3",
                mode,
                dut + 1
            )));
        }

        if self.run.poll_interval.is_zero() || self.run.status_interval.is_zero() {
            return Err(TluError::config("poll_interval and status_interval must be non-zero"));
        }
        if self.run.max_trigger_count == Some(0) {
            return Err(TluError::config("max_trigger_count must be at least 1"));
        }

        if self.hardware.i2c.retry_limit == 0 {
            return Err(TluError::config("i2c.retry_limit must be at least 1"));
        }
        Ok(())
    }

    /// Validate and compute every register value.
    pub fn compile(&self) -> Result<CompiledConfig> {
        self.validate()?;
        let trigger_mask = trigger::compile(&self.trigger.rule)?;

        let mut threshold_codes = [0u16; 6];
        for (code, volts) in threshold_codes.iter_mut().zip(self.trigger.thresholds) {
            *code = threshold_to_code(volts)?;
        }

        let pulse_stretch = trigger::pack_pulse_vector(self.trigger.stretch)
            .map_err(|e| TluError::config(format!("trigger.stretch: {e}")))?;
        let pulse_delay = trigger::pack_pulse_vector(self.trigger.delay)
            .map_err(|e| TluError::config(format!("trigger.delay: {e}")))?;
        let internal_trigger_interval =
            trigger::internal_trigger_interval(self.trigger.internal_frequency_hz)?;

        let dut_interface_mode = self
            .dut
            .interface_mode
            .iter()
            .enumerate()
            .fold(0u32, |acc, (i, mode)| acc | (u32::from(*mode) << (2 * i)));

        Ok(CompiledConfig {
            rule: self.trigger.rule.clone(),
            trigger_mask,
            threshold_codes,
            pulse_stretch,
            pulse_delay,
            internal_trigger_interval,
            dut_mask: u32::from(self.dut.mask),
            dut_interface_mode,
            dut_mode_modifier: u32::from(self.dut.mode_modifier),
            ignore_dut_busy: u32::from(self.dut.ignore_busy),
            program_i2c: !self.hardware.skip_i2c,
            poll_interval: self.run.poll_interval,
            status_interval: self.run.status_interval,
            stop: StopConditions {
                max_trigger_count: self.run.max_trigger_count,
                timeout: self.run.timeout,
            },
        })
    }
}
