//! Agent core: wires the HAL, LED engines, fan controller and blade
//! state together behind a bounded event queue.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{info, warn};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::events::Event;
use crate::fan_controller::{FanController, FanOverride, Step};
use crate::hal::{ComputeBladeHal, LedIndex, PowerStatus};
use crate::led::Color;
use crate::ledengine::{LedEngine, LedPattern};
use crate::metrics;
use crate::state::{BladeState, WaitError};
use crate::task_manager::TaskManager;

/// Queue backlog for domain events. Events process fast; the backlog
/// only has to absorb e.g. a burst of button presses.
const EVENT_BACKLOG: usize = 10;

/// Cadence of the periodic fan reconciliation.
const FAN_TICK: Duration = Duration::from_secs(5);

/// Substitute temperature when the sensor read fails; high enough to
/// drive the curve to its maximum step.
const SAFE_HIGH_TEMPERATURE: f64 = 100.0;

/// Errors surfaced to the control plane.
#[derive(Debug, Error)]
pub enum ControlError {
    /// Operator setters are rejected while the blade protects itself.
    #[error("cannot {action} while the blade is in a critical state; improve cooling before retrying")]
    CriticalActive { action: &'static str },

    /// The event queue is gone; the agent is shutting down.
    #[error("agent event queue closed")]
    QueueClosed,

    /// Underlying hardware failure.
    #[error("hardware error: {0:#}")]
    Hardware(anyhow::Error),

    /// The caller's wait ended with the agent shutting down.
    #[error("wait cancelled")]
    Cancelled,
}

/// Aggregate blade status snapshot for the control plane.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub stealth_mode: bool,
    pub identify_active: bool,
    pub critical_active: bool,
    pub temperature: f64,
    pub fan_rpm: f64,
    pub fan_percent: u8,
    pub fan_automatic: bool,
    pub power_status: PowerStatus,
    pub fan_curve_steps: Vec<Step>,
    pub critical_temperature_threshold: u32,
}

/// The reconciliation core of the blade supervision agent.
pub struct ComputeBladeAgent {
    config: AgentConfig,
    blade: Arc<dyn ComputeBladeHal>,
    state: Arc<BladeState>,
    fan_controller: Arc<FanController>,
    edge_led: Arc<LedEngine>,
    top_led: Arc<LedEngine>,
    event_tx: mpsc::Sender<Event>,
    event_rx: std::sync::Mutex<Option<mpsc::Receiver<Event>>>,
}

impl ComputeBladeAgent {
    /// Builds the agent. Fan curve violations are fatal here.
    pub fn new(config: AgentConfig, blade: Arc<dyn ComputeBladeHal>) -> Result<Arc<Self>> {
        let fan_controller = Arc::new(FanController::from_config(&config.fan_curve)?);
        let edge_led = LedEngine::new(LedIndex::Edge, blade.clone());
        let top_led = LedEngine::new(LedIndex::Top, blade.clone());
        let (event_tx, event_rx) = mpsc::channel(EVENT_BACKLOG);

        Ok(Arc::new(Self {
            config,
            blade,
            state: BladeState::new(),
            fan_controller,
            edge_led,
            top_led,
            event_tx,
            event_rx: std::sync::Mutex::new(Some(event_rx)),
        }))
    }

    /// Runs the agent until the token is cancelled or a task fails.
    /// Safe-cleanup runs in every exit path.
    pub async fn run(self: Arc<Self>, token: CancellationToken) -> Result<()> {
        info!("Starting compute blade agent");

        // Ingest a noop to initialise the metric families.
        self.state.register_event(Event::Noop);

        // Defaults before any task observes the hardware.
        self.blade
            .set_stealth_mode(self.config.stealth_mode)
            .await
            .context("failed to apply default stealth mode")?;
        self.edge_led
            .set_pattern(LedPattern::Static(self.config.idle_led_color))?;
        self.top_led.set_pattern(LedPattern::Static(Color::OFF))?;

        let mut tasks = TaskManager::new(token.clone());

        let blade = self.blade.clone();
        tasks.spawn_task("hal_run", move |task_token| async move {
            blade.run(&task_token).await.context("HAL failed")
        });

        let agent = self.clone();
        tasks.spawn_task("edge_button_pump", move |task_token| async move {
            agent.run_edge_button_pump(task_token).await
        });

        let edge_led = self.edge_led.clone();
        tasks.spawn_task("edge_led_engine", move |task_token| async move {
            edge_led.run(&task_token).await.context("edge LED engine failed")
        });

        let top_led = self.top_led.clone();
        tasks.spawn_task("top_led_engine", move |task_token| async move {
            top_led.run(&task_token).await.context("top LED engine failed")
        });

        let blade = self.blade.clone();
        let fan_controller = self.fan_controller.clone();
        tasks.spawn_task("fan_loop", move |task_token| async move {
            run_fan_loop(blade, fan_controller, FAN_TICK, task_token).await
        });

        let agent = self.clone();
        let event_rx = self
            .event_rx
            .lock()
            .expect("event receiver mutex poisoned")
            .take()
            .context("agent already running: event receiver taken")?;
        tasks.spawn_task("event_dispatcher", move |task_token| async move {
            agent.run_dispatcher(event_rx, task_token).await
        });

        token.cancelled().await;

        let shutdown_result = tasks.shutdown_all().await;
        self.cleanup().await;
        shutdown_result
    }

    /// Restores safe defaults before exiting. Runs on error exit too.
    async fn cleanup(&self) {
        info!("Exiting, restoring safe settings");
        if let Err(e) = self.blade.set_fan_speed(100).await {
            warn!("failed to set fan speed to 100%: {e:#}");
        }
        if let Err(e) = self.blade.set_led(LedIndex::Edge, Color::OFF).await {
            warn!("failed to turn off edge LED: {e:#}");
        }
        if let Err(e) = self.blade.set_led(LedIndex::Top, Color::OFF).await {
            warn!("failed to turn off top LED: {e:#}");
        }
        if let Err(e) = self.blade.close().await {
            warn!("failed to close blade HAL: {e:#}");
        }
    }

    /// Blocking emit used by the control plane: waits for queue space
    /// until the caller's request future is dropped.
    pub async fn emit_event(&self, event: Event) -> Result<(), ControlError> {
        self.event_tx
            .send(event)
            .await
            .map_err(|_| ControlError::QueueClosed)
    }

    /// Non-blocking emit used by hardware producers; drops the event and
    /// counts it when the backlog is full.
    pub fn emit_hardware_event(&self, event: Event) {
        match self.event_tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!("{event} event dropped due to backlog");
                metrics::EVENTS_DROPPED.inc(event.as_str());
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Installs a fixed fan speed. Rejected while critical.
    pub fn set_fan_speed(&self, percent: u8) -> Result<(), ControlError> {
        if self.state.critical_active() {
            return Err(ControlError::CriticalActive {
                action: "set fan speed",
            });
        }
        self.fan_controller.set_override(FanOverride::Forced(percent));
        Ok(())
    }

    /// Returns fan control to the curve. Always permitted; during a
    /// critical episode this re-enables automatic control, which the
    /// curve will drive to its maximum while the blade stays hot.
    pub fn set_fan_speed_auto(&self) {
        self.fan_controller.set_override(FanOverride::Auto);
    }

    /// Passes stealth mode through to the HAL. Rejected while critical.
    pub async fn set_stealth_mode(&self, enabled: bool) -> Result<(), ControlError> {
        if self.state.critical_active() {
            return Err(ControlError::CriticalActive {
                action: "set stealth mode",
            });
        }
        self.blade
            .set_stealth_mode(enabled)
            .await
            .map_err(ControlError::Hardware)
    }

    /// Blocks until the next identify confirmation.
    pub async fn wait_for_identify_confirm(
        &self,
        token: &CancellationToken,
    ) -> Result<(), ControlError> {
        self.state
            .wait_for_identify_confirm(token)
            .await
            .map_err(|WaitError::Cancelled| ControlError::Cancelled)
    }

    /// Blocks until the critical state clears.
    pub async fn wait_for_critical_clear(
        &self,
        token: &CancellationToken,
    ) -> Result<(), ControlError> {
        self.state
            .wait_for_critical_clear(token)
            .await
            .map_err(|WaitError::Cancelled| ControlError::Cancelled)
    }

    /// Aggregate status for the control plane.
    pub async fn status(&self) -> Result<StatusSnapshot> {
        let temperature = self
            .blade
            .get_temperature()
            .await
            .context("failed to read temperature")?;
        let fan_rpm = self
            .blade
            .get_fan_rpm()
            .await
            .context("failed to read fan tach")?;
        let power_status = self
            .blade
            .get_power_status()
            .await
            .context("failed to read power status")?;

        Ok(StatusSnapshot {
            stealth_mode: self.blade.stealth_mode_active(),
            identify_active: self.state.identify_active(),
            critical_active: self.state.critical_active(),
            temperature,
            fan_rpm,
            fan_percent: self.fan_controller.speed_for(temperature),
            fan_automatic: self.fan_controller.is_automatic(),
            power_status,
            fan_curve_steps: self.fan_controller.steps().to_vec(),
            critical_temperature_threshold: self.config.critical_temperature_threshold,
        })
    }

    pub fn state(&self) -> &BladeState {
        &self.state
    }

    /// Pulls edge-button presses from the HAL and feeds them into the
    /// queue without ever blocking on it.
    async fn run_edge_button_pump(&self, token: CancellationToken) -> Result<()> {
        info!("Starting edge button pump");
        loop {
            if let Err(e) = self.blade.wait_for_edge_button_press(&token).await {
                if token.is_cancelled() {
                    return Ok(());
                }
                return Err(e).context("edge button wait failed");
            }
            self.emit_hardware_event(Event::EdgeButton);
        }
    }

    /// Single consumer of the event queue: registers state, counts the
    /// event and runs its effect handler. Effects for event n complete
    /// before event n+1 is dequeued.
    async fn run_dispatcher(
        &self,
        mut event_rx: mpsc::Receiver<Event>,
        token: CancellationToken,
    ) -> Result<()> {
        info!("Starting event dispatcher");
        loop {
            let event = tokio::select! {
                () = token.cancelled() => return Ok(()),
                maybe = event_rx.recv() => match maybe {
                    Some(event) => event,
                    None => return Ok(()),
                },
            };

            self.handle_event(event).await?;
        }
    }

    async fn handle_event(&self, event: Event) -> Result<()> {
        info!("Handling event: {event}");
        metrics::EVENTS_TOTAL.inc(event.as_str());
        self.state.register_event(event);

        match event {
            Event::Critical => self.handle_critical_active().await,
            Event::CriticalReset => self.handle_critical_reset().await,
            Event::Identify => self.handle_identify_active(),
            Event::IdentifyConfirm => self.handle_identify_confirm(),
            Event::EdgeButton => {
                // The button toggles identify mode.
                let follow_up = if self.state.identify_active() {
                    Event::IdentifyConfirm
                } else {
                    Event::Identify
                };
                self.emit_hardware_event(follow_up);
                Ok(())
            }
            Event::Noop => Ok(()),
        }
    }

    fn handle_identify_active(&self) -> Result<()> {
        info!("Identify active");
        self.edge_led.set_pattern(LedPattern::Burst {
            base: Color::OFF,
            active: self.config.identify_led_color,
        })
    }

    fn handle_identify_confirm(&self) -> Result<()> {
        info!("Identify confirmed/cleared");
        self.edge_led
            .set_pattern(LedPattern::Static(self.config.idle_led_color))
    }

    async fn handle_critical_active(&self) -> Result<()> {
        warn!("Blade in critical state, forcing fan to 100% and turning on LEDs");

        self.fan_controller.set_override(FanOverride::Forced(100));

        // Disable stealth mode so the alarm pattern is visible; keep
        // going even if that write fails and report both outcomes.
        let stealth_result = self.blade.set_stealth_mode(false).await;
        let pattern_result = self.top_led.set_pattern(LedPattern::SlowBlink {
            base: Color::OFF,
            active: self.config.critical_led_color,
        });

        stealth_result.and(pattern_result)
    }

    async fn handle_critical_reset(&self) -> Result<()> {
        info!("Critical state cleared, restoring fan curve and LEDs");

        self.fan_controller.set_override(FanOverride::Auto);
        self.blade
            .set_stealth_mode(self.config.stealth_mode)
            .await?;
        self.top_led.set_pattern(LedPattern::Static(Color::OFF))
    }
}

/// Periodic fan reconciliation: temperature in, duty cycle out. Sensor
/// failures substitute a safe-high temperature; PWM write failures are
/// retried on the next tick.
pub(crate) async fn run_fan_loop(
    blade: Arc<dyn ComputeBladeHal>,
    fan_controller: Arc<FanController>,
    tick: Duration,
    token: CancellationToken,
) -> Result<()> {
    info!("Starting fan loop");
    let mut interval = tokio::time::interval(tick);

    loop {
        tokio::select! {
            () = token.cancelled() => return Ok(()),
            _ = interval.tick() => {}
        }

        let temperature = match blade.get_temperature().await {
            Ok(t) => t,
            Err(e) => {
                warn!("failed to read temperature, assuming safe-high: {e:#}");
                SAFE_HIGH_TEMPERATURE
            }
        };

        let percent = fan_controller.speed_for(temperature);
        if let Err(e) = blade.set_fan_speed(percent).await {
            warn!("failed to set fan speed: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::simulated::SimulatedHal;
    use pretty_assertions::assert_eq;
    use tokio::time::{sleep, timeout};

    fn test_config() -> AgentConfig {
        AgentConfig {
            stealth_mode: true,
            ..AgentConfig::default()
        }
    }

    fn spawn_agent(
        config: AgentConfig,
        hal: Arc<SimulatedHal>,
    ) -> (Arc<ComputeBladeAgent>, CancellationToken) {
        let agent = ComputeBladeAgent::new(config, hal).unwrap();
        let token = CancellationToken::new();
        let runner = agent.clone();
        let run_token = token.clone();
        tokio::spawn(async move { runner.run(run_token).await });
        (agent, token)
    }

    async fn wait_until<F: Fn() -> bool>(what: &str, check: F) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !check() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {what}"
            );
            sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn critical_event_forces_fan_stealth_and_alarm_pattern() {
        let hal = SimulatedHal::new(40.0);
        hal.set_stealth_mode(true).await.unwrap();
        let (agent, token) = spawn_agent(test_config(), hal.clone());

        agent.emit_event(Event::Critical).await.unwrap();

        wait_until("critical state", || agent.state().critical_active()).await;
        // Effects apply after the state transition; stealth-off is the
        // last hardware write of the handler.
        wait_until("stealth disabled", || !hal.stealth_mode_active()).await;
        let status = agent.status().await.unwrap();
        assert_eq!(status.fan_percent, 100);
        assert!(!status.fan_automatic);
        assert!(!hal.stealth_mode_active());

        // The alarm pattern alternates critical color and off; observe
        // the active phase within one blink period.
        let critical_color = agent.config.critical_led_color;
        wait_until("alarm pattern on top LED", || {
            hal.led(LedIndex::Top) == critical_color
        })
        .await;

        token.cancel();
    }

    #[tokio::test]
    async fn critical_reset_restores_defaults() {
        let hal = SimulatedHal::new(40.0);
        let (agent, token) = spawn_agent(test_config(), hal.clone());

        agent.emit_event(Event::Critical).await.unwrap();
        wait_until("critical state", || agent.state().critical_active()).await;

        agent.emit_event(Event::CriticalReset).await.unwrap();
        wait_until("critical cleared", || !agent.state().critical_active()).await;
        // Stealth returning to its configured default (true) marks the
        // reset effects as applied; the override was cleared before it.
        wait_until("stealth restored", || hal.stealth_mode_active()).await;

        let status = agent.status().await.unwrap();
        assert!(status.fan_automatic);

        token.cancel();
    }

    #[tokio::test]
    async fn edge_button_toggles_identify() {
        let hal = SimulatedHal::new(40.0);
        let (agent, token) = spawn_agent(test_config(), hal.clone());

        // Give the pump time to register before pressing.
        sleep(Duration::from_millis(50)).await;

        hal.press_edge_button();
        wait_until("identify active", || agent.state().identify_active()).await;

        hal.press_edge_button();
        wait_until("identify cleared", || !agent.state().identify_active()).await;

        token.cancel();
    }

    #[tokio::test]
    async fn setters_rejected_while_critical_without_mutation() {
        let hal = SimulatedHal::new(40.0);
        let (agent, token) = spawn_agent(test_config(), hal.clone());

        agent.emit_event(Event::Critical).await.unwrap();
        wait_until("critical state", || agent.state().critical_active()).await;
        wait_until("critical effects applied", || !hal.stealth_mode_active()).await;
        let stealth_before = hal.stealth_mode_active();

        let err = agent.set_fan_speed(10).unwrap_err();
        assert!(err.to_string().contains("critical state"));
        let err = agent.set_stealth_mode(true).await.unwrap_err();
        assert!(err.to_string().contains("critical state"));

        // No state changed: override still forced to 100, stealth as-is.
        let status = agent.status().await.unwrap();
        assert_eq!(status.fan_percent, 100);
        assert!(!status.fan_automatic);
        assert_eq!(hal.stealth_mode_active(), stealth_before);

        token.cancel();
    }

    #[tokio::test]
    async fn fan_speed_override_round_trip() {
        let hal = SimulatedHal::new(40.0);
        let (agent, token) = spawn_agent(test_config(), hal.clone());

        agent.set_fan_speed(77).unwrap();
        let status = agent.status().await.unwrap();
        assert_eq!(status.fan_percent, 77);
        assert!(!status.fan_automatic);

        agent.set_fan_speed_auto();
        let status = agent.status().await.unwrap();
        assert!(status.fan_automatic);

        token.cancel();
    }

    #[tokio::test]
    async fn hardware_producers_drop_on_full_queue() {
        // Agent built but not running: nothing drains the queue.
        let hal = SimulatedHal::new(40.0);
        let agent = ComputeBladeAgent::new(test_config(), hal).unwrap();

        let dropped_before = metrics::EVENTS_DROPPED.get(Event::EdgeButton.as_str());

        // Fill the backlog, then overflow by exactly one.
        for _ in 0..EVENT_BACKLOG {
            agent.emit_hardware_event(Event::EdgeButton);
        }
        agent.emit_hardware_event(Event::EdgeButton);

        let dropped_after = metrics::EVENTS_DROPPED.get(Event::EdgeButton.as_str());
        assert_eq!(dropped_after - dropped_before, 1);
    }

    #[tokio::test]
    async fn rpc_emit_blocks_until_dequeued() {
        let hal = SimulatedHal::new(40.0);
        let agent = ComputeBladeAgent::new(test_config(), hal.clone()).unwrap();

        // Fill the queue; the next blocking emit must wait.
        for _ in 0..EVENT_BACKLOG {
            agent.emit_hardware_event(Event::Noop);
        }

        let blocked = {
            let agent = agent.clone();
            tokio::spawn(async move { agent.emit_event(Event::Identify).await })
        };
        sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        // Start the dispatcher; the queued events drain and the blocked
        // emit lands.
        let token = CancellationToken::new();
        let runner = agent.clone();
        let run_token = token.clone();
        tokio::spawn(async move { runner.run(run_token).await });

        timeout(Duration::from_secs(2), blocked)
            .await
            .expect("blocked emit must complete once the queue drains")
            .unwrap()
            .unwrap();

        wait_until("identify processed", || agent.state().identify_active()).await;
        token.cancel();
    }

    #[tokio::test]
    async fn fan_loop_follows_curve_and_substitutes_safe_high() {
        let hal = SimulatedHal::new(65.0);
        let fan_controller = Arc::new(
            FanController::from_config(&AgentConfig::default().fan_curve).unwrap(),
        );
        let token = CancellationToken::new();

        let loop_handle = {
            let hal = hal.clone();
            let fan_controller = fan_controller.clone();
            let token = token.clone();
            tokio::spawn(async move {
                run_fan_loop(hal, fan_controller, Duration::from_millis(20), token).await
            })
        };

        // Default curve: 60°C→50%, 70°C→100%; 65°C interpolates to 75%.
        wait_until("fan follows curve", || hal.fan_percent() == 75).await;

        // Sensor fault drives the curve to its maximum step.
        hal.fail_temperature_reads(true);
        wait_until("safe-high fan speed", || hal.fan_percent() == 100).await;

        token.cancel();
        timeout(Duration::from_secs(1), loop_handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn shutdown_runs_safe_cleanup() {
        let hal = SimulatedHal::new(40.0);
        let agent = ComputeBladeAgent::new(test_config(), hal.clone()).unwrap();
        let token = CancellationToken::new();

        let runner = agent.clone();
        let run_token = token.clone();
        let run = tokio::spawn(async move { runner.run(run_token).await });

        sleep(Duration::from_millis(50)).await;
        token.cancel();

        timeout(Duration::from_secs(2), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(hal.fan_percent(), 100);
        assert_eq!(hal.led(LedIndex::Edge), Color::OFF);
        assert_eq!(hal.led(LedIndex::Top), Color::OFF);
    }

    #[tokio::test]
    async fn wait_for_identify_confirm_via_rpc_path() {
        let hal = SimulatedHal::new(40.0);
        let (agent, token) = spawn_agent(test_config(), hal);

        agent.emit_event(Event::Identify).await.unwrap();
        wait_until("identify active", || agent.state().identify_active()).await;

        let waiter = {
            let agent = agent.clone();
            let token = token.clone();
            tokio::spawn(async move { agent.wait_for_identify_confirm(&token).await })
        };
        sleep(Duration::from_millis(50)).await;

        agent.emit_event(Event::IdentifyConfirm).await.unwrap();

        let result = timeout(Duration::from_secs(2), waiter).await.unwrap();
        assert!(result.unwrap().is_ok());

        token.cancel();
    }
}
