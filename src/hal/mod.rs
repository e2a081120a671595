//! Hardware abstraction layer consumed by the agent core.
//!
//! The core depends only on [`ComputeBladeHal`]; concrete drivers (GPIO,
//! PWM timers, register maps) live behind it. The [`simulated`] backend
//! implements the trait in memory and doubles as the test double.

pub mod simulated;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::led::Color;

/// Addressable LEDs on the blade carrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LedIndex {
    /// Front-edge LED, visible when the blade is racked.
    Edge,
    /// Top LED, visible with the chassis open.
    Top,
}

/// Power source reported by the carrier, opaque to the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerStatus {
    PoeOrWall,
    PoePlusOr802_3bt,
}

/// Capability set the agent consumes. Implementations must be internally
/// thread-safe across all methods.
#[async_trait]
pub trait ComputeBladeHal: Send + Sync {
    /// Long-running reconciliation loop driving interrupt-to-event
    /// translation. Returns when the token is cancelled.
    async fn run(&self, token: &CancellationToken) -> Result<()>;

    /// Sets the fan duty cycle; values above 100 are clamped. Idempotent.
    async fn set_fan_speed(&self, percent: u8) -> Result<()>;

    /// Best-effort tach reading; 0 on a stopped fan.
    async fn get_fan_rpm(&self) -> Result<f64>;

    /// SoC temperature in °C.
    async fn get_temperature(&self) -> Result<f64>;

    async fn set_led(&self, index: LedIndex, color: Color) -> Result<()>;

    async fn set_stealth_mode(&self, enabled: bool) -> Result<()>;

    fn stealth_mode_active(&self) -> bool;

    async fn get_power_status(&self) -> Result<PowerStatus>;

    /// Suspends until the next physical edge-button press or until the
    /// token is cancelled (in which case an error is returned).
    async fn wait_for_edge_button_press(&self, token: &CancellationToken) -> Result<()>;

    /// Restores safe defaults and releases kernel resources.
    async fn close(&self) -> Result<()>;
}
