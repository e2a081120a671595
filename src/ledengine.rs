//! LED pattern engine: renders a replaceable time-parameterised pattern
//! onto exactly one LED.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::{info, warn};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::hal::{ComputeBladeHal, LedIndex};
use crate::led::Color;

/// Hold duration for static patterns. Kept short enough that a pattern
/// swap is picked up within one frame.
const STATIC_HOLD: Duration = Duration::from_secs(1);

const BURST_PULSE: Duration = Duration::from_millis(100);
const BURST_PAUSE: Duration = Duration::from_millis(700);
const SLOW_BLINK_HOLD: Duration = Duration::from_millis(500);

/// One rendered sample: paint `color`, hold for `hold`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub color: Color,
    pub hold: Duration,
}

/// Parametric LED pattern. Each pattern expands to a deterministic
/// cyclic frame sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedPattern {
    /// Constant color.
    Static(Color),
    /// Two short pulses followed by a pause; used for identify.
    Burst { base: Color, active: Color },
    /// Symmetric 1 Hz blink; used for the critical alarm.
    SlowBlink { base: Color, active: Color },
}

impl LedPattern {
    /// The frame cycle for this pattern.
    pub fn frames(&self) -> Vec<Frame> {
        match *self {
            LedPattern::Static(color) => vec![Frame {
                color,
                hold: STATIC_HOLD,
            }],
            LedPattern::Burst { base, active } => vec![
                Frame {
                    color: active,
                    hold: BURST_PULSE,
                },
                Frame {
                    color: base,
                    hold: BURST_PULSE,
                },
                Frame {
                    color: active,
                    hold: BURST_PULSE,
                },
                Frame {
                    color: base,
                    hold: BURST_PAUSE,
                },
            ],
            LedPattern::SlowBlink { base, active } => vec![
                Frame {
                    color: active,
                    hold: SLOW_BLINK_HOLD,
                },
                Frame {
                    color: base,
                    hold: SLOW_BLINK_HOLD,
                },
            ],
        }
    }
}

struct ActivePattern {
    frames: Vec<Frame>,
    cursor: usize,
}

/// Renders the current pattern onto one LED via the HAL.
///
/// `set_pattern` atomically swaps the pattern; the render loop uses the
/// new frames from its next tick onward. LED write failures are logged
/// and retried on the next frame, they never stop the engine.
pub struct LedEngine {
    index: LedIndex,
    hal: Arc<dyn ComputeBladeHal>,
    active: Mutex<ActivePattern>,
}

impl LedEngine {
    pub fn new(index: LedIndex, hal: Arc<dyn ComputeBladeHal>) -> Arc<Self> {
        Arc::new(Self {
            index,
            hal,
            active: Mutex::new(ActivePattern {
                frames: LedPattern::Static(Color::OFF).frames(),
                cursor: 0,
            }),
        })
    }

    /// Swaps the active pattern and restarts its frame cycle.
    pub fn set_pattern(&self, pattern: LedPattern) -> Result<()> {
        let mut active = self.active.lock();
        active.frames = pattern.frames();
        active.cursor = 0;
        Ok(())
    }

    /// Renders frames until the token is cancelled.
    pub async fn run(&self, token: &CancellationToken) -> Result<()> {
        info!("LED engine for {:?} started", self.index);
        loop {
            let frame = {
                let mut active = self.active.lock();
                let frame = active.frames[active.cursor % active.frames.len()];
                active.cursor = (active.cursor + 1) % active.frames.len();
                frame
            };

            if let Err(e) = self.hal.set_led(self.index, frame.color).await {
                warn!("failed to set {:?} LED: {e}", self.index);
            }

            tokio::select! {
                () = token.cancelled() => {
                    info!("LED engine for {:?} cancelled", self.index);
                    return Ok(());
                }
                () = tokio::time::sleep(frame.hold) => {}
            }
        }
    }
}
