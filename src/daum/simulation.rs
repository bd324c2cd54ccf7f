//! Physics based power calculation for SIM mode.
//!
//! Force model after the cycling wattage calculators the cockpit firmware
//! cannot do itself: gravity along the slope, rolling resistance, and
//! aerodynamic drag against the combined head wind. The result is the
//! wattage the rider would need on a real road at the current speed, which
//! the session feeds straight back into a set watt command.

use serde::{Deserialize, Serialize};

use crate::config::SimulationConfig;

/// km/h to m/s.
const SPEED_TO_MS: f64 = 0.2778;

/// Parameters pushed by the remote application while the session is in SIM
/// mode: head wind in m/s, gradient in percent, rolling resistance and drag
/// coefficients.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimulationParameters {
    pub wind_speed: f64,
    pub grade: f64,
    pub crr: f64,
    pub cd: f64,
}

impl Default for SimulationParameters {
    fn default() -> Self {
        Self {
            wind_speed: 0.0,
            grade: 0.0,
            crr: 0.004,
            cd: 0.51,
        }
    }
}

/// Instantaneous target power in watts for the given road speed in km/h.
/// Pure function, no state between calls.
pub fn compute_power(params: &SimulationParameters, speed_kmh: f64, config: &SimulationConfig) -> f64 {
    // remote applications send gradients well beyond realistic riding;
    // resistance stops growing at the configured maximum
    let grade = params.grade.min(config.max_grade_percent);
    let mass = config.rider_mass_kg + config.bike_mass_kg;
    let velocity = speed_kmh * SPEED_TO_MS;
    let slope = (grade / 100.0).atan();

    let force_gravity = config.gravity * slope.sin() * mass;
    let force_rolling = config.gravity * slope.cos() * mass * params.crr;
    let force_aero =
        0.5 * params.cd * config.air_density * (velocity + params.wind_speed).powi(2);

    (force_gravity + force_rolling + force_aero) * velocity / config.drivetrain_efficiency
}
