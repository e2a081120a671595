//! In-memory reference backend for [`ComputeBladeHal`].
//!
//! Emulates the carrier's registers so the agent can run on any host:
//! fan duty and tach, stealth GPIO, both LEDs and the edge button. Tests
//! drive it directly; a demo deployment can poke it via
//! [`SimulatedHal::press_edge_button`] and [`SimulatedHal::set_temperature`].

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::debug;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::{ComputeBladeHal, LedIndex, PowerStatus};
use crate::led::Color;

/// Tach reading reported per percent of fan duty.
const RPM_PER_PERCENT: f64 = 70.0;

#[derive(Debug)]
struct Registers {
    fan_percent: u8,
    stealth: bool,
    leds: HashMap<LedIndex, Color>,
    temperature: f64,
    power: PowerStatus,
    fail_temperature: bool,
    fail_led: bool,
}

/// Simulated blade hardware. All state sits behind one mutex; the
/// methods never await while holding it.
pub struct SimulatedHal {
    registers: Mutex<Registers>,
    button: Notify,
}

impl SimulatedHal {
    pub fn new(initial_temperature: f64) -> Arc<Self> {
        Arc::new(Self {
            registers: Mutex::new(Registers {
                fan_percent: 0,
                stealth: false,
                leds: HashMap::new(),
                temperature: initial_temperature,
                power: PowerStatus::PoeOrWall,
                fail_temperature: false,
                fail_led: false,
            }),
            button: Notify::new(),
        })
    }

    /// Simulates a physical press of the edge button.
    pub fn press_edge_button(&self) {
        self.button.notify_waiters();
    }

    pub fn set_temperature(&self, temperature: f64) {
        self.registers.lock().temperature = temperature;
    }

    pub fn set_power_status(&self, power: PowerStatus) {
        self.registers.lock().power = power;
    }

    /// Makes subsequent temperature reads fail (transient sensor fault).
    pub fn fail_temperature_reads(&self, fail: bool) {
        self.registers.lock().fail_temperature = fail;
    }

    /// Makes subsequent LED writes fail.
    pub fn fail_led_writes(&self, fail: bool) {
        self.registers.lock().fail_led = fail;
    }

    pub fn fan_percent(&self) -> u8 {
        self.registers.lock().fan_percent
    }

    pub fn led(&self, index: LedIndex) -> Color {
        self.registers
            .lock()
            .leds
            .get(&index)
            .copied()
            .unwrap_or(Color::OFF)
    }
}

#[async_trait]
impl ComputeBladeHal for SimulatedHal {
    async fn run(&self, token: &CancellationToken) -> Result<()> {
        // No interrupt sources to reconcile in the simulation; park
        // until shutdown.
        token.cancelled().await;
        Ok(())
    }

    async fn set_fan_speed(&self, percent: u8) -> Result<()> {
        let clamped = percent.min(100);
        self.registers.lock().fan_percent = clamped;
        debug!("simulated fan duty set to {clamped}%");
        Ok(())
    }

    async fn get_fan_rpm(&self) -> Result<f64> {
        Ok(f64::from(self.registers.lock().fan_percent) * RPM_PER_PERCENT)
    }

    async fn get_temperature(&self) -> Result<f64> {
        let registers = self.registers.lock();
        if registers.fail_temperature {
            return Err(anyhow!("simulated temperature sensor fault"));
        }
        Ok(registers.temperature)
    }

    async fn set_led(&self, index: LedIndex, color: Color) -> Result<()> {
        let mut registers = self.registers.lock();
        if registers.fail_led {
            return Err(anyhow!("simulated LED write fault"));
        }
        registers.leds.insert(index, color);
        Ok(())
    }

    async fn set_stealth_mode(&self, enabled: bool) -> Result<()> {
        self.registers.lock().stealth = enabled;
        Ok(())
    }

    fn stealth_mode_active(&self) -> bool {
        self.registers.lock().stealth
    }

    async fn get_power_status(&self) -> Result<PowerStatus> {
        Ok(self.registers.lock().power)
    }

    async fn wait_for_edge_button_press(&self, token: &CancellationToken) -> Result<()> {
        let pressed = self.button.notified();
        tokio::select! {
            () = token.cancelled() => Err(anyhow!("edge button wait cancelled")),
            () = pressed => Ok(()),
        }
    }

    async fn close(&self) -> Result<()> {
        let mut registers = self.registers.lock();
        registers.fan_percent = 100;
        registers.leds.insert(LedIndex::Edge, Color::OFF);
        registers.leds.insert(LedIndex::Top, Color::OFF);
        Ok(())
    }
}
