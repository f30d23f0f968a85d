//! Amplitude patterns modulating the simulated alpha rhythm

use serde::{Deserialize, Serialize};
use std::f32::consts::PI;

/// Time course of the alpha rhythm amplitude (1.0 = configured amplitude)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalPattern {
    /// Constant modulation level
    Constant { level: f32 },
    /// Slow sinusoidal waxing and waning
    Sinusoidal {
        frequency: f32,
        amplitude: f32,
        baseline: f32,
    },
    /// Linear change over `duration` seconds, then constant
    Ramp {
        start_level: f32,
        end_level: f32,
        duration: f32,
    },
    /// Alternating eyes-closed (on) and eyes-open (off) blocks
    Burst {
        on_duration: f32,
        off_duration: f32,
        amplitude: f32,
    },
}

impl SignalPattern {
    /// Get modulation level at given time
    pub fn level_at_time(&self, time: f32) -> f32 {
        let level = match self {
            SignalPattern::Constant { level } => *level,

            SignalPattern::Sinusoidal { frequency, amplitude, baseline } => {
                baseline + amplitude * (2.0 * PI * frequency * time).sin()
            }

            SignalPattern::Ramp { start_level, end_level, duration } => {
                if time >= *duration {
                    *end_level
                } else {
                    start_level + (end_level - start_level) * (time / duration)
                }
            }

            SignalPattern::Burst { on_duration, off_duration, amplitude } => {
                let phase = time % (on_duration + off_duration);
                if phase < *on_duration {
                    *amplitude
                } else {
                    0.0
                }
            }
        };
        level.max(0.0)
    }

    /// Get pattern description
    pub fn description(&self) -> &'static str {
        match self {
            SignalPattern::Constant { .. } => "Constant alpha",
            SignalPattern::Sinusoidal { .. } => "Waxing and waning alpha",
            SignalPattern::Ramp { .. } => "Gradual alpha change",
            SignalPattern::Burst { .. } => "Eyes closed / eyes open blocks",
        }
    }

    /// Create common preset patterns
    pub fn presets() -> Vec<(&'static str, SignalPattern)> {
        vec![
            ("Relaxed", SignalPattern::Constant { level: 1.0 }),
            ("Attentive", SignalPattern::Constant { level: 0.2 }),
            ("Drowsy", SignalPattern::Sinusoidal {
                frequency: 0.1, amplitude: 0.4, baseline: 0.6
            }),
            ("Relaxing", SignalPattern::Ramp {
                start_level: 0.2, end_level: 1.0, duration: 20.0
            }),
            ("Eyes Open/Closed", SignalPattern::Burst {
                on_duration: 5.0, off_duration: 5.0, amplitude: 1.0
            }),
        ]
    }
}

impl Default for SignalPattern {
    fn default() -> Self {
        SignalPattern::Constant { level: 1.0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_pattern() {
        let pattern = SignalPattern::Burst { on_duration: 2.0, off_duration: 1.0, amplitude: 0.8 };
        assert_eq!(pattern.level_at_time(0.5), 0.8);
        assert_eq!(pattern.level_at_time(2.5), 0.0);
        assert_eq!(pattern.level_at_time(3.5), 0.8);
    }

    #[test]
    fn test_ramp_saturates() {
        let pattern = SignalPattern::Ramp { start_level: 0.0, end_level: 1.0, duration: 10.0 };
        assert!((pattern.level_at_time(5.0) - 0.5).abs() < 1e-6);
        assert_eq!(pattern.level_at_time(12.0), 1.0);
    }

    #[test]
    fn test_level_never_negative() {
        let pattern = SignalPattern::Sinusoidal { frequency: 1.0, amplitude: 1.0, baseline: 0.0 };
        assert_eq!(pattern.level_at_time(0.75), 0.0);
    }

    #[test]
    fn test_serde_format() {
        let pattern: SignalPattern =
            serde_json::from_str(r#"{ "type": "constant", "level": 0.5 }"#).unwrap();
        assert_eq!(pattern, SignalPattern::Constant { level: 0.5 });
        assert_eq!(SignalPattern::presets().len(), 5);
    }
}
