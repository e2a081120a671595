//! Temperature to fan-duty mapping with a thread-safe override.

use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// One step of the fan curve: at `temperature` °C the fan runs at
/// `percent` duty cycle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub temperature: f64,
    pub percent: u8,
}

/// Fan curve configuration as it appears in the agent config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanCurveConfig {
    pub steps: Vec<Step>,
}

/// Fan speed override. `Forced` displaces the curve entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanOverride {
    Auto,
    Forced(u8),
}

/// Linear fan controller: clamps outside the curve, interpolates between
/// the bracketing steps inside it.
#[derive(Debug)]
pub struct FanController {
    steps: Vec<Step>,
    override_state: Mutex<FanOverride>,
}

impl FanController {
    /// Validates the curve and builds a controller. Violations are fatal
    /// configuration errors.
    pub fn new(config: FanCurveConfig) -> Result<Self> {
        let mut steps = config.steps;
        steps.sort_by(|a, b| {
            a.temperature
                .partial_cmp(&b.temperature)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        if steps.len() < 2 {
            bail!(
                "fan curve needs at least two steps; define at least a low and a high \
                 temperature step in the fan_curve section of the config"
            );
        }

        for pair in steps.windows(2) {
            let (curr, next) = (pair[0], pair[1]);
            if curr.temperature >= next.temperature {
                bail!(
                    "fan curve steps must have strictly increasing temperatures \
                     ({:.2} is not below {:.2}); ensure the temperatures are in \
                     ascending order and do not overlap",
                    curr.temperature,
                    next.temperature
                );
            }
            if curr.percent > next.percent {
                bail!(
                    "fan curve percent must not decrease ({}% at {:.2}°C is above {}% \
                     at {:.2}°C); higher temperatures need at least the same duty cycle",
                    curr.percent,
                    curr.temperature,
                    next.percent,
                    next.temperature
                );
            }
        }

        for step in &steps {
            if step.percent > 100 {
                bail!(
                    "fan percent must be between 0 and 100, got {}% at {:.2}°C",
                    step.percent,
                    step.temperature
                );
            }
        }

        Ok(Self {
            steps,
            override_state: Mutex::new(FanOverride::Auto),
        })
    }

    /// Convenience constructor adding configuration context to errors.
    pub fn from_config(config: &FanCurveConfig) -> Result<Self> {
        Self::new(config.clone()).context("invalid fan_curve configuration")
    }

    /// Fan duty in percent for the given temperature.
    ///
    /// An installed override wins unconditionally. Outside the curve the
    /// first/last step clamps; between two adjacent steps the percent is
    /// interpolated linearly and truncated toward zero.
    pub fn speed_for(&self, temperature: f64) -> u8 {
        if let FanOverride::Forced(percent) = *self
            .override_state
            .lock()
            .expect("fan override mutex poisoned")
        {
            return percent;
        }

        let first = self.steps[0];
        let last = self.steps[self.steps.len() - 1];
        if temperature <= first.temperature {
            return first.percent;
        }
        if temperature >= last.temperature {
            return last.percent;
        }

        for pair in self.steps.windows(2) {
            let (low, high) = (pair[0], pair[1]);
            if temperature < high.temperature {
                let slope =
                    f64::from(high.percent - low.percent) / (high.temperature - low.temperature);
                let speed = f64::from(low.percent) + slope * (temperature - low.temperature);
                return speed as u8;
            }
        }

        last.percent
    }

    /// Installs or clears the override atomically.
    pub fn set_override(&self, override_state: FanOverride) {
        *self
            .override_state
            .lock()
            .expect("fan override mutex poisoned") = override_state;
    }

    /// True while no override is installed.
    pub fn is_automatic(&self) -> bool {
        matches!(
            *self
                .override_state
                .lock()
                .expect("fan override mutex poisoned"),
            FanOverride::Auto
        )
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn two_step_curve() -> FanCurveConfig {
        FanCurveConfig {
            steps: vec![
                Step {
                    temperature: 20.0,
                    percent: 30,
                },
                Step {
                    temperature: 30.0,
                    percent: 60,
                },
            ],
        }
    }

    #[test]
    fn speed_for_clamps_and_interpolates() {
        let controller = FanController::new(two_step_curve()).unwrap();

        assert_eq!(controller.speed_for(15.0), 30); // below: clamp to minimum
        assert_eq!(controller.speed_for(25.0), 45); // between: linear
        assert_eq!(controller.speed_for(35.0), 60); // above: clamp to maximum
        assert!(controller.is_automatic());
    }

    #[test]
    fn speed_for_with_override() {
        let controller = FanController::new(two_step_curve()).unwrap();
        controller.set_override(FanOverride::Forced(99));

        assert_eq!(controller.speed_for(15.0), 99);
        assert_eq!(controller.speed_for(35.0), 99);
        assert!(!controller.is_automatic());

        controller.set_override(FanOverride::Auto);
        assert_eq!(controller.speed_for(35.0), 60);
        assert!(controller.is_automatic());
    }

    #[test]
    fn speed_for_interpolates_between_bracketing_pair() {
        // Three steps: interpolation must use the bracketing pair, not
        // only the first two.
        let controller = FanController::new(FanCurveConfig {
            steps: vec![
                Step {
                    temperature: 20.0,
                    percent: 20,
                },
                Step {
                    temperature: 40.0,
                    percent: 40,
                },
                Step {
                    temperature: 60.0,
                    percent: 100,
                },
            ],
        })
        .unwrap();

        assert_eq!(controller.speed_for(30.0), 30);
        assert_eq!(controller.speed_for(50.0), 70);
        assert_eq!(controller.speed_for(59.0), 97);
        assert_eq!(controller.speed_for(75.0), 100);
    }

    #[test]
    fn speed_is_monotone_over_temperature() {
        let controller = FanController::new(FanCurveConfig {
            steps: vec![
                Step {
                    temperature: 25.0,
                    percent: 10,
                },
                Step {
                    temperature: 45.0,
                    percent: 35,
                },
                Step {
                    temperature: 70.0,
                    percent: 90,
                },
            ],
        })
        .unwrap();

        let mut previous = 0u8;
        let mut t = 0.0;
        while t <= 100.0 {
            let speed = controller.speed_for(t);
            assert!(speed >= previous, "speed decreased at {t}°C");
            assert!((10..=90).contains(&speed));
            previous = speed;
            t += 0.5;
        }
    }

    #[test]
    fn construction_rejects_overlapping_temperatures() {
        let err = FanController::new(FanCurveConfig {
            steps: vec![
                Step {
                    temperature: 20.0,
                    percent: 60,
                },
                Step {
                    temperature: 20.0,
                    percent: 30,
                },
            ],
        })
        .unwrap_err();
        assert!(err.to_string().contains("strictly increasing temperatures"));
    }

    #[test]
    fn construction_rejects_decreasing_percent() {
        let err = FanController::new(FanCurveConfig {
            steps: vec![
                Step {
                    temperature: 20.0,
                    percent: 60,
                },
                Step {
                    temperature: 30.0,
                    percent: 30,
                },
            ],
        })
        .unwrap_err();
        assert!(err.to_string().contains("must not decrease"));
    }

    #[test]
    fn construction_rejects_percent_above_100() {
        let err = FanController::new(FanCurveConfig {
            steps: vec![
                Step {
                    temperature: 20.0,
                    percent: 10,
                },
                Step {
                    temperature: 30.0,
                    percent: 200,
                },
            ],
        })
        .unwrap_err();
        assert!(err.to_string().contains("between 0 and 100"));
    }

    #[test]
    fn construction_rejects_single_step() {
        let err = FanController::new(FanCurveConfig {
            steps: vec![Step {
                temperature: 20.0,
                percent: 10,
            }],
        })
        .unwrap_err();
        assert!(err.to_string().contains("at least two steps"));
    }

    #[test]
    fn validation_covers_all_adjacent_pairs() {
        // The violation sits between the second and third step.
        let err = FanController::new(FanCurveConfig {
            steps: vec![
                Step {
                    temperature: 20.0,
                    percent: 10,
                },
                Step {
                    temperature: 40.0,
                    percent: 50,
                },
                Step {
                    temperature: 60.0,
                    percent: 40,
                },
            ],
        })
        .unwrap_err();
        assert!(err.to_string().contains("must not decrease"));
    }
}
