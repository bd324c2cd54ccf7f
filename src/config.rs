//! Configuration for the ergometer bridge.
//!
//! Configuration is loaded in this priority order:
//! 1. Environment variables (highest priority)
//! 2. Config file (config.toml)
//! 3. Built-in defaults (lowest priority)
//!
//! Every numeric constant the protocol engine relies on lives here: value
//! ranges and plausibility thresholds, command pacing intervals, the gear
//! ratio table and the physics constants for SIM mode. The engine itself
//! never hard-codes any of them.
//!
//! # Environment Variables
//!
//! - `ERGO_SERIAL_PORT` - Serial port path (skips USB adapter discovery)
//! - `ERGO_BAUD_RATE` - Serial baud rate
//! - `ERGO_MODE` - Start-up session mode (`ERG` or `SIM`)
//! - `ERGO_HOST_MAX_GEAR` - Host-imposed gear ceiling

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::daum::{SessionMode, ShiftTarget};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub intervals: IntervalConfig,
    #[serde(default)]
    pub ranges: RangeConfig,
    #[serde(default)]
    pub gears: GearConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Fixed port path. When unset, the first USB serial adapter is used.
    #[serde(default)]
    pub port: Option<String>,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    #[serde(default = "default_data_bits")]
    pub data_bits: u8,

    /// "none", "even" or "odd"
    #[serde(default = "default_parity")]
    pub parity: String,

    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,

    /// Silence on the line that closes a response window. The cockpit sends
    /// no framing delimiter; the pause between responses is the boundary.
    #[serde(default = "default_window_gap")]
    pub window_gap_ms: u64,
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_parity() -> String {
    "none".to_string()
}

fn default_stop_bits() -> u8 {
    1
}

fn default_window_gap() -> u64 {
    80
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntervalConfig {
    /// Queue pacing, the cockpit's minimum inter-command spacing.
    #[serde(default = "default_queue_tick")]
    pub queue_tick_ms: u64,

    /// How often a run data request is queued.
    #[serde(default = "default_run_data")]
    pub run_data_ms: u64,

    /// Retry cadence for the address handshake.
    #[serde(default = "default_address_retry")]
    pub address_retry_ms: u64,

    /// Retry cadence when no port can be opened.
    #[serde(default = "default_open_retry")]
    pub open_retry_ms: u64,

    /// Pause between closing and reopening the port on a restart.
    #[serde(default = "default_reopen_delay")]
    pub reopen_delay_ms: u64,

    /// Delay between address resolution and the start-up commands. The
    /// cockpit emits a bogus gear value right after the handshake.
    #[serde(default = "default_startup_delay")]
    pub startup_delay_ms: u64,
}

fn default_queue_tick() -> u64 {
    50
}

fn default_run_data() -> u64 {
    500
}

fn default_address_retry() -> u64 {
    1000
}

fn default_open_retry() -> u64 {
    10_000
}

fn default_reopen_delay() -> u64 {
    1000
}

fn default_startup_delay() -> u64 {
    2000
}

/// Value ranges and plausibility thresholds of the cockpit protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeConfig {
    #[serde(default = "default_min_rpm")]
    pub min_rpm: u8,
    #[serde(default = "default_max_rpm")]
    pub max_rpm: u8,
    /// Largest upward rpm delta accepted between two cycles. A bigger jump
    /// is treated as single-byte corruption.
    #[serde(default = "default_rpm_jump_threshold")]
    pub rpm_jump_threshold: u8,

    #[serde(default = "default_min_gear")]
    pub min_gear: u8,
    #[serde(default = "default_max_gear")]
    pub max_gear: u8,

    #[serde(default = "default_min_program")]
    pub min_program: u8,
    #[serde(default = "default_max_program")]
    pub max_program: u8,
    /// The manual watt program the bridge drives the cockpit in.
    #[serde(default = "default_manual_program")]
    pub manual_program: u8,

    #[serde(default = "default_max_person")]
    pub max_person: u8,

    /// Power bounds and factor in raw device units. The cockpit reports and
    /// accepts power in steps of `power_factor` watts.
    #[serde(default = "default_min_power")]
    pub min_power: u8,
    #[serde(default = "default_max_power")]
    pub max_power: u8,
    /// Raw values at or above this are implausible and fall back to the
    /// last known power.
    #[serde(default = "default_power_threshold")]
    pub power_threshold: u8,
    #[serde(default = "default_power_factor")]
    pub power_factor: u16,

    #[serde(default = "default_min_speed")]
    pub min_speed: f64,
    #[serde(default = "default_max_speed")]
    pub max_speed: f64,

    /// Gears (or power steps) moved by one fast shift.
    #[serde(default = "default_max_shift")]
    pub max_shift: u8,
}

fn default_min_rpm() -> u8 {
    0
}

fn default_max_rpm() -> u8 {
    199
}

fn default_rpm_jump_threshold() -> u8 {
    40
}

fn default_min_gear() -> u8 {
    1
}

fn default_max_gear() -> u8 {
    28
}

fn default_min_program() -> u8 {
    0
}

fn default_max_program() -> u8 {
    79
}

fn default_manual_program() -> u8 {
    0
}

fn default_max_person() -> u8 {
    7
}

fn default_min_power() -> u8 {
    5
}

fn default_max_power() -> u8 {
    160
}

fn default_power_threshold() -> u8 {
    130
}

fn default_power_factor() -> u16 {
    5
}

fn default_min_speed() -> f64 {
    0.0
}

fn default_max_speed() -> f64 {
    99.0
}

fn default_max_shift() -> u8 {
    5
}

/// Drivetrain geometry used to derive road speed from cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GearConfig {
    /// Wheel circumference in centimeters.
    #[serde(default = "default_circumference")]
    pub circumference_cm: f64,

    /// Converts rpm x cm-per-rotation into km/h.
    #[serde(default = "default_speed_conversion")]
    pub speed_conversion: f64,

    /// Gear ratio per gear, lowest gear first. The stock table matches the
    /// cockpit's own gearbox, 42:24 up to 53:12, so the derived speed agrees
    /// with the cockpit display.
    #[serde(default = "default_gear_ratios")]
    pub ratios: Vec<f64>,
}

fn default_circumference() -> f64 {
    210.0
}

fn default_speed_conversion() -> f64 {
    0.0006
}

fn default_gear_ratios() -> Vec<f64> {
    (0..28).map(|g| 1.75 + g as f64 * 0.098767).collect()
}

impl GearConfig {
    /// Ratio for a 1-based gear number, clamped to the table bounds.
    pub fn ratio_for(&self, gear: u8) -> f64 {
        let index = (gear as usize).saturating_sub(1);
        self.ratios
            .get(index)
            .or_else(|| self.ratios.last())
            .copied()
            .unwrap_or(1.75)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Queue cap; the oldest entry is evicted beyond this.
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,

    /// A command whose retry counter reaches this is dropped.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Retry counter increments per missed tick, by priority. Low defaults
    /// to the retry bound itself: a telemetry poll that missed its ack is
    /// stale and gets dropped instead of competing with control commands.
    #[serde(default = "default_retry_increment_high")]
    pub retry_increment_high: u32,
    #[serde(default = "default_retry_increment_medium")]
    pub retry_increment_medium: u32,
    #[serde(default = "default_retry_increment_low")]
    pub retry_increment_low: u32,
}

fn default_max_pending() -> usize {
    20
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_increment_high() -> u32 {
    1
}

fn default_retry_increment_medium() -> u32 {
    1
}

fn default_retry_increment_low() -> u32 {
    3
}

/// Physical constants for the SIM mode power calculation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default = "default_rider_mass")]
    pub rider_mass_kg: f64,

    #[serde(default = "default_bike_mass")]
    pub bike_mass_kg: f64,

    /// Gradients above this are clamped; steeper values from the remote
    /// application make for an unrealistic riding experience.
    #[serde(default = "default_max_grade")]
    pub max_grade_percent: f64,

    #[serde(default = "default_gravity")]
    pub gravity: f64,

    /// Air density in kg/m^3, sea level at 15 degrees C.
    #[serde(default = "default_air_density")]
    pub air_density: f64,

    #[serde(default = "default_drivetrain_efficiency")]
    pub drivetrain_efficiency: f64,
}

fn default_rider_mass() -> f64 {
    80.0
}

fn default_bike_mass() -> f64 {
    7.0
}

fn default_max_grade() -> f64 {
    8.0
}

fn default_gravity() -> f64 {
    9.8067
}

fn default_air_density() -> f64 {
    1.225
}

fn default_drivetrain_efficiency() -> f64 {
    0.97
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Mode the session starts in.
    #[serde(default = "default_mode")]
    pub mode: SessionMode,

    /// What the shift buttons drive until switched at runtime.
    #[serde(default = "default_shift_target")]
    pub shift_target: ShiftTarget,

    /// Gear ceiling imposed by the host, independent of what the cockpit
    /// supports. Reported gears above it are clamped and corrected.
    #[serde(default = "default_host_max_gear")]
    pub host_max_gear: u8,

    /// Consecutive unrecognized responses before the session restarts.
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
}

fn default_mode() -> SessionMode {
    SessionMode::Erg
}

fn default_shift_target() -> ShiftTarget {
    ShiftTarget::Gear
}

fn default_host_max_gear() -> u8 {
    28
}

fn default_max_failures() -> u32 {
    10
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            parity: default_parity(),
            stop_bits: default_stop_bits(),
            window_gap_ms: default_window_gap(),
        }
    }
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self {
            queue_tick_ms: default_queue_tick(),
            run_data_ms: default_run_data(),
            address_retry_ms: default_address_retry(),
            open_retry_ms: default_open_retry(),
            reopen_delay_ms: default_reopen_delay(),
            startup_delay_ms: default_startup_delay(),
        }
    }
}

impl Default for RangeConfig {
    fn default() -> Self {
        Self {
            min_rpm: default_min_rpm(),
            max_rpm: default_max_rpm(),
            rpm_jump_threshold: default_rpm_jump_threshold(),
            min_gear: default_min_gear(),
            max_gear: default_max_gear(),
            min_program: default_min_program(),
            max_program: default_max_program(),
            manual_program: default_manual_program(),
            max_person: default_max_person(),
            min_power: default_min_power(),
            max_power: default_max_power(),
            power_threshold: default_power_threshold(),
            power_factor: default_power_factor(),
            min_speed: default_min_speed(),
            max_speed: default_max_speed(),
            max_shift: default_max_shift(),
        }
    }
}

impl Default for GearConfig {
    fn default() -> Self {
        Self {
            circumference_cm: default_circumference(),
            speed_conversion: default_speed_conversion(),
            ratios: default_gear_ratios(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_pending: default_max_pending(),
            max_retries: default_max_retries(),
            retry_increment_high: default_retry_increment_high(),
            retry_increment_medium: default_retry_increment_medium(),
            retry_increment_low: default_retry_increment_low(),
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            rider_mass_kg: default_rider_mass(),
            bike_mass_kg: default_bike_mass(),
            max_grade_percent: default_max_grade(),
            gravity: default_gravity(),
            air_density: default_air_density(),
            drivetrain_efficiency: default_drivetrain_efficiency(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            shift_target: default_shift_target(),
            host_max_gear: default_host_max_gear(),
            max_failures: default_max_failures(),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn from_file_or_default<P: AsRef<Path>>(path: P) -> Self {
        Self::from_file(path).unwrap_or_default()
    }

    /// Load config from file, then apply environment variable overrides.
    /// Environment variables take precedence over file values.
    pub fn load<P: AsRef<Path>>(config_path: P) -> Self {
        let mut config = Self::from_file_or_default(config_path);
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("ERGO_SERIAL_PORT") {
            self.serial.port = Some(val);
        }
        if let Ok(val) = std::env::var("ERGO_BAUD_RATE") {
            if let Ok(baud) = val.parse() {
                self.serial.baud_rate = baud;
            }
        }
        if let Ok(val) = std::env::var("ERGO_MODE") {
            match val.to_uppercase().as_str() {
                "ERG" => self.session.mode = SessionMode::Erg,
                "SIM" => self.session.mode = SessionMode::Sim,
                other => tracing::warn!("ignoring unknown ERGO_MODE value: {}", other),
            }
        }
        if let Ok(val) = std::env::var("ERGO_HOST_MAX_GEAR") {
            if let Ok(gear) = val.parse() {
                self.session.host_max_gear = gear;
            }
        }
    }
}
