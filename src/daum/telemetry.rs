//! Interpretation of validated run data windows into telemetry samples.
//!
//! The cockpit's run data is noisy: a flaky adapter can flip single bytes,
//! and the native speed field is integer only. Each field therefore passes
//! its own plausibility filter with the last known value as fallback, and
//! speed is derived from cadence and the gear ratio table instead of being
//! read off the wire. That derived speed matches the cockpit display as
//! long as the ratio table matches the cockpit gearbox.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use super::frame::{OFFSET_GEAR, OFFSET_POWER, OFFSET_PROGRAM, OFFSET_RPM};
use super::SessionMode;
use crate::config::{GearConfig, RangeConfig};

/// One telemetry sample pushed to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunDataSample {
    pub program: u8,
    pub rpm: u8,
    pub gear: u8,
    /// Watts, already scaled out of the device's raw 5 watt steps.
    pub power: u16,
    /// km/h, derived from rpm and gear ratio, one decimal.
    pub speed: f64,
    pub timestamp: DateTime<Utc>,
}

/// The last accepted field values, the fallback source whenever a cycle
/// fails validation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LastValues {
    pub program: u8,
    pub rpm: u8,
    pub gear: u8,
    pub power: u16,
    pub speed: f64,
}

impl LastValues {
    pub fn to_sample(&self, timestamp: DateTime<Utc>) -> RunDataSample {
        RunDataSample {
            program: self.program,
            rpm: self.rpm,
            gear: self.gear,
            power: self.power,
            speed: self.speed,
            timestamp,
        }
    }
}

/// Outcome of interpreting one window.
#[derive(Debug, Clone)]
pub struct Interpretation {
    /// Field values after this cycle, accepted or carried over.
    pub values: LastValues,
    /// Whether anything differs from the previous cycle. Unchanged cycles
    /// are not worth a downstream notification.
    pub changed: bool,
    /// The rpm jump filter tripped; dependent fields were frozen.
    pub failure: bool,
    /// The cockpit reported a gear above the host ceiling; send this gear
    /// back to the device.
    pub corrective_gear: Option<u8>,
}

/// Interpret a run data window that already passed `check_run_data`.
pub fn interpret(
    window: &[u8],
    last: &LastValues,
    mode: SessionMode,
    ranges: &RangeConfig,
    gears: &GearConfig,
    host_max_gear: u8,
) -> Interpretation {
    let mut values = last.clone();
    let mut failure = false;
    let mut corrective_gear = None;

    let rpm = window[OFFSET_RPM];
    if (ranges.min_rpm..=ranges.max_rpm).contains(&rpm) {
        if rpm.saturating_sub(last.rpm) >= ranges.rpm_jump_threshold {
            // a jump this size within one cycle is a corrupted byte, not legs
            debug!("rpm jump {} -> {} over threshold", last.rpm, rpm);
            failure = true;
        } else {
            values.rpm = rpm;
        }
    }

    let gear = window[OFFSET_GEAR];
    if (ranges.min_gear..=ranges.max_gear).contains(&gear) && !failure {
        if gear > host_max_gear {
            // the cockpit supports more gears than the host allows; clamp
            // and push the ceiling back to the device
            corrective_gear = Some(host_max_gear);
            values.gear = host_max_gear;
        } else {
            values.gear = gear;
        }
    }

    let program = window[OFFSET_PROGRAM];
    if !failure && (ranges.min_program..=ranges.max_program).contains(&program) {
        values.program = program;
    }

    if values.rpm == 0 && mode != SessionMode::Erg {
        // no pedaling, no resistance, otherwise a coasting rider keeps
        // rolling in the remote application; in ERG mode the remote target
        // stands even at zero cadence
        values.power = 0;
    } else {
        let power = window[OFFSET_POWER];
        if (ranges.min_power..=ranges.max_power).contains(&power) {
            if failure || power >= ranges.power_threshold {
                debug!("power byte {} untrusted, keeping {}", power, last.power);
            } else {
                values.power = power as u16 * ranges.power_factor;
            }
        }
    }

    let ratio = gears.ratio_for(values.gear);
    let distance_cm = ratio * gears.circumference_cm;
    let speed = values.rpm as f64 * distance_cm * gears.speed_conversion;
    if speed >= ranges.min_speed && speed <= ranges.max_speed {
        values.speed = (speed * 10.0).round() / 10.0;
    }

    let changed = values != *last;
    Interpretation {
        values,
        changed,
        failure,
        corrective_gear,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daum::frame::{OFFSET_PERSON, OFFSET_SPEED, RUN_DATA_MIN_LEN};

    fn window(power: u8, rpm: u8, gear: u8) -> Vec<u8> {
        let mut w = vec![0u8; RUN_DATA_MIN_LEN];
        w[0] = 0x40;
        w[1] = 0x07;
        w[OFFSET_PROGRAM] = 0;
        w[OFFSET_PERSON] = 0;
        w[OFFSET_POWER] = power;
        w[OFFSET_RPM] = rpm;
        w[OFFSET_SPEED] = 26; // unused by design, speed is derived
        w[OFFSET_GEAR] = gear;
        w
    }

    fn interpret_with_last(w: &[u8], last: &LastValues, mode: SessionMode) -> Interpretation {
        interpret(
            w,
            last,
            mode,
            &RangeConfig::default(),
            &GearConfig::default(),
            28,
        )
    }

    fn expected_speed(rpm: u8, gear: u8) -> f64 {
        let gears = GearConfig::default();
        let speed = rpm as f64 * gears.ratio_for(gear) * gears.circumference_cm * gears.speed_conversion;
        (speed * 10.0).round() / 10.0
    }

    #[test]
    fn scales_power_and_derives_speed() {
        let last = LastValues {
            rpm: 78,
            gear: 10,
            power: 140,
            speed: 25.9,
            program: 0,
        };
        let outcome = interpret_with_last(&window(30, 80, 10), &last, SessionMode::Sim);

        assert!(!outcome.failure);
        assert!(outcome.changed);
        assert_eq!(outcome.values.rpm, 80);
        assert_eq!(outcome.values.gear, 10);
        assert_eq!(outcome.values.power, 150); // 30 raw x factor 5
        let expected = expected_speed(80, 10);
        assert!((outcome.values.speed - expected).abs() < 1e-9);
    }

    #[test]
    fn derived_speed_ignores_the_wire_speed_byte() {
        let last = LastValues {
            rpm: 78,
            gear: 10,
            ..LastValues::default()
        };
        let mut a = window(30, 80, 10);
        let mut b = window(30, 80, 10);
        a[OFFSET_SPEED] = 5;
        b[OFFSET_SPEED] = 95;
        let speed_a = interpret_with_last(&a, &last, SessionMode::Sim).values.speed;
        let speed_b = interpret_with_last(&b, &last, SessionMode::Sim).values.speed;
        assert_eq!(speed_a, speed_b);
    }

    #[test]
    fn rpm_jump_freezes_the_cycle_at_previous_values() {
        let last = LastValues {
            rpm: 80,
            gear: 10,
            power: 150,
            speed: 26.6,
            program: 0,
        };
        // 80 -> 150 in one cycle, far over the jump threshold; the bogus
        // power byte of the same window must not get through either
        let outcome = interpret_with_last(&window(60, 150, 12), &last, SessionMode::Sim);

        assert!(outcome.failure);
        assert_eq!(outcome.values.rpm, 80);
        assert_eq!(outcome.values.gear, 10);
        assert_eq!(outcome.values.power, 150);
        assert!(!outcome.changed);
    }

    #[test]
    fn zero_cadence_forces_power_to_zero_outside_erg() {
        let last = LastValues {
            rpm: 10,
            gear: 10,
            power: 150,
            speed: 3.3,
            program: 0,
        };
        let outcome = interpret_with_last(&window(30, 0, 10), &last, SessionMode::Sim);
        assert_eq!(outcome.values.power, 0);
        assert_eq!(outcome.values.speed, 0.0);
    }

    #[test]
    fn erg_mode_keeps_the_remote_target_at_zero_cadence() {
        let last = LastValues {
            rpm: 10,
            gear: 10,
            power: 150,
            speed: 3.3,
            program: 0,
        };
        let outcome = interpret_with_last(&window(30, 0, 10), &last, SessionMode::Erg);
        // the cockpit holds the commanded wattage regardless of cadence
        assert_eq!(outcome.values.power, 150);
    }

    #[test]
    fn gear_above_host_ceiling_is_clamped_and_corrected() {
        let last = LastValues {
            rpm: 78,
            gear: 10,
            ..LastValues::default()
        };
        let outcome = interpret(
            &window(30, 80, 24),
            &last,
            SessionMode::Sim,
            &RangeConfig::default(),
            &GearConfig::default(),
            14,
        );
        assert_eq!(outcome.corrective_gear, Some(14));
        assert_eq!(outcome.values.gear, 14);
    }

    #[test]
    fn power_threshold_falls_back_to_last_known() {
        let last = LastValues {
            rpm: 78,
            gear: 10,
            power: 150,
            speed: 25.9,
            program: 0,
        };
        // raw 140 is inside the valid range but above the trust threshold
        let outcome = interpret_with_last(&window(140, 80, 10), &last, SessionMode::Sim);
        assert!(!outcome.failure);
        assert_eq!(outcome.values.power, 150);
    }

    #[test]
    fn identical_cycle_reports_nothing_changed() {
        let last = LastValues {
            rpm: 80,
            gear: 10,
            power: 150,
            speed: expected_speed(80, 10),
            program: 0,
        };
        let outcome = interpret_with_last(&window(30, 80, 10), &last, SessionMode::Sim);
        assert!(!outcome.changed);
    }
}
