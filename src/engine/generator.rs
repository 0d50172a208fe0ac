//! Pulse generator control.
//!
//! Owns the serial link to the generator, the stacked disable requests
//! that gate arming, parameter changes with charge-rate coupling, and
//! the self-heal loop that keeps an unattended rig going overnight.

use crate::error::{DeviceError, DeviceResult};
use crate::model::{ExperimentEvent, InfoEvent, ScanConfig};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

use super::sleep_unless_stopping;

const GENERATOR: &str = "pulse generator";

pub const DEAD_TIME_MIN_MS: u32 = 1;
pub const DEAD_TIME_MAX_MS: u32 = 1000;
/// Worst-case capacitor charge rate in volts per millisecond.
pub const CHARGE_RATE_V_PER_MS: u32 = 30;

const CONNECT_ATTEMPTS: u32 = 3;
const ARM_ATTEMPTS: u32 = 3;
const SELF_HEAL_ATTEMPTS: u32 = 20;
const RETRY_BACKOFF: Duration = Duration::from_secs(5);
const READY_TIMEOUT: Duration = Duration::from_secs(10);
const ARMING_SETTLE: Duration = Duration::from_secs(10);
const RESET_SETTLE: Duration = Duration::from_secs(5);
const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Armed,
    Disarmed,
    Arming,
    Fault,
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeviceState::Armed => "armed",
            DeviceState::Disarmed => "disarmed",
            DeviceState::Arming => "arming",
            DeviceState::Fault => "fault",
        };
        f.write_str(s)
    }
}

/// Blocking control surface of the pulse generator hardware.
pub trait PulseDevice: Send {
    /// (Re)establish the link. Does not touch device settings.
    fn open(&mut self) -> DeviceResult<()>;
    /// Cheap liveness probe.
    fn status(&mut self) -> DeviceResult<bool>;
    fn state(&mut self) -> DeviceResult<DeviceState>;
    fn set_armed(&mut self, armed: bool) -> DeviceResult<()>;
    /// Block until the device accepts commands again.
    fn wait_ready(&mut self, timeout: Duration) -> DeviceResult<()>;
    fn faults_current(&mut self) -> DeviceResult<Vec<String>>;
    fn clear_faults(&mut self) -> DeviceResult<()>;
    fn voltage_set(&mut self) -> DeviceResult<u32>;
    fn voltage_measured(&mut self) -> DeviceResult<f64>;
    fn set_voltage(&mut self, volts: u32) -> DeviceResult<()>;
    fn pattern(&mut self) -> DeviceResult<Vec<u8>>;
    fn set_pattern(&mut self, pattern: &[u8]) -> DeviceResult<()>;
    fn dead_time_ms(&mut self) -> DeviceResult<u32>;
    fn set_dead_time_ms(&mut self, ms: u32) -> DeviceResult<()>;
    /// Static trigger and safety profile, applied once per (re)connect:
    /// hardware trigger with termination, single pulse per trigger,
    /// transformer mute on, external mode off, 20 minute arm timeout.
    fn configure_static(&mut self) -> DeviceResult<()>;
    /// Fire the device reboot. The link is unusable afterwards until
    /// reopened.
    fn trigger_reset(&mut self) -> DeviceResult<()>;
    fn identity(&mut self) -> DeviceResult<String>;
}

/// Render a slot pattern as a compact bit string, e.g. `0001110`.
pub fn pattern_string(pattern: &[u8]) -> String {
    pattern.iter().map(|&b| char::from(b'0' + b)).collect()
}

/// Build the slot pattern for a requested high time: leading zeros pad
/// the window, then one slot per slot-width of high time, then a
/// trailing zero. Returns `None` when the high time is below one slot.
pub fn pattern_for_high_time(high_time_ns: u32, slot_ns: u32, slots: u32) -> Option<Vec<u8>> {
    let ones = high_time_ns / slot_ns;
    if ones == 0 {
        return None;
    }
    let zeros = slots.saturating_sub(ones);
    let mut pattern = vec![0u8; zeros as usize];
    pattern.extend(std::iter::repeat(1u8).take(ones as usize));
    pattern.push(0);
    Some(pattern)
}

/// Minimum dead time in ms for a voltage, from the worst-case charge rate.
pub fn min_dead_time_for_voltage(volts: u32) -> u32 {
    volts / CHARGE_RATE_V_PER_MS + 1
}

#[derive(Debug, Clone, Copy)]
pub struct PulseLimits {
    pub voltage_min: u32,
    pub voltage_max: u32,
    pub high_time_min_ns: u32,
    pub high_time_max_ns: u32,
    pub pattern_slots: u32,
}

impl PulseLimits {
    pub fn from_config(cfg: &ScanConfig) -> Self {
        PulseLimits {
            voltage_min: cfg.voltage_min,
            voltage_max: cfg.voltage_max,
            high_time_min_ns: cfg.high_time_min_ns,
            high_time_max_ns: cfg.high_time_max_ns,
            pattern_slots: cfg.pattern_slots,
        }
    }
}

/// Intended device settings, kept in agreement with device readbacks.
#[derive(Debug, Clone)]
pub struct PulseSettings {
    pub voltage: u32,
    pub high_time_ns: u32,
    pub dead_time_ms: u32,
    pub pattern: Vec<u8>,
}

/// Requested parameter update. Absent fields stay untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct PulseChange {
    pub high_time_ns: Option<u32>,
    pub voltage: Option<u32>,
    pub dead_time_ms: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ChangeOutcome {
    pub voltage_changed: bool,
    pub high_time_changed: bool,
    pub dead_time_changed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HealthCheck {
    None,
    Connection,
    Fault,
    Arm,
}

enum HealOutcome {
    Clean,
    Repaired,
    Again,
}

pub struct GeneratorController {
    device: Box<dyn PulseDevice>,
    /// Stacked disarm reasons. The generator may only be armed while
    /// this is empty.
    disable_requests: Vec<String>,
    /// Intended arm state, enforced by the self-heal loop.
    enabled: bool,
    healing: bool,
    settings: PulseSettings,
    limits: PulseLimits,
    events: UnboundedSender<ExperimentEvent>,
    stop: Arc<AtomicBool>,
}

impl GeneratorController {
    pub fn new(
        device: Box<dyn PulseDevice>,
        cfg: &ScanConfig,
        events: UnboundedSender<ExperimentEvent>,
        stop: Arc<AtomicBool>,
    ) -> DeviceResult<Self> {
        let limits = PulseLimits::from_config(cfg);
        let pattern = pattern_for_high_time(
            cfg.high_time_start_ns,
            limits.high_time_min_ns,
            limits.pattern_slots,
        )
        .ok_or_else(|| DeviceError::rejected("starting high time is below one pattern slot"))?;
        let high_time_ns =
            (cfg.high_time_start_ns / limits.high_time_min_ns) * limits.high_time_min_ns;
        let mut ctl = GeneratorController {
            device,
            disable_requests: Vec::new(),
            enabled: false,
            healing: false,
            settings: PulseSettings {
                voltage: cfg.voltage_start,
                high_time_ns,
                dead_time_ms: cfg.dead_time_start_ms,
                pattern,
            },
            limits,
            events,
            stop,
        };
        ctl.connect()?;
        if ctl.is_connected() {
            ctl.initialize()?;
        }
        Ok(ctl)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn disable_reasons(&self) -> &[String] {
        &self.disable_requests
    }

    pub fn settings(&self) -> &PulseSettings {
        &self.settings
    }

    pub fn is_connected(&mut self) -> bool {
        matches!(self.device.status(), Ok(true))
    }

    /// Current set/measured voltage and pattern for attributing results
    /// to the parameters that produced them.
    pub fn context_snapshot(&mut self) -> (u32, f64, String) {
        let measured = match self.device.voltage_measured() {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "measured voltage unavailable for snapshot");
                0.0
            }
        };
        (
            self.settings.voltage,
            measured,
            pattern_string(&self.settings.pattern),
        )
    }

    /// Connect with bounded retries. On repeated failure the controller
    /// stays unconnected and leaves recovery to the self-heal loop.
    pub fn connect(&mut self) -> DeviceResult<()> {
        if self.is_connected() {
            info!("pulse generator is already connected");
            return Ok(());
        }
        for attempt in 1..=CONNECT_ATTEMPTS {
            self.bail_if_stopping()?;
            match self.device.open() {
                Ok(()) => {
                    if self.is_connected() {
                        info!("connected to the pulse generator");
                        return Ok(());
                    }
                    warn!(
                        attempts_left = CONNECT_ATTEMPTS - attempt,
                        "generator link opened but the status probe failed, retrying"
                    );
                }
                Err(e) => warn!(
                    error = %e,
                    attempts_left = CONNECT_ATTEMPTS - attempt,
                    "could not open the generator link, retrying"
                ),
            }
            self.backoff(attempt);
        }
        error!("failed to connect to the pulse generator, continuing without a connection");
        Ok(())
    }

    /// Connect, reapply settings, and restore the intended arm state.
    pub fn reconnect(&mut self) -> DeviceResult<()> {
        info!("reconnecting the pulse generator");
        self.connect()?;
        if self.is_connected() {
            self.initialize()?;
            self.arm(self.enabled, "reconnect")
        } else {
            warn!("reconnect failed, resetting the generator");
            self.reset()
        }
    }

    /// Push the stored settings and the static profile to the device.
    pub fn initialize(&mut self) -> DeviceResult<()> {
        debug!("initializing the pulse generator");
        self.with_recovery("initialize", |g| {
            g.device.wait_ready(READY_TIMEOUT)?;
            g.device.set_armed(false)?;
            g.device.set_pattern(&g.settings.pattern)?;
            g.device.set_voltage(g.settings.voltage)?;
            g.device.set_dead_time_ms(g.settings.dead_time_ms)?;
            g.device.configure_static()?;
            g.device.wait_ready(READY_TIMEOUT)
        })?;
        let identity = self
            .device
            .identity()
            .unwrap_or_else(|_| "unknown".to_string());
        info!(
            voltage = self.settings.voltage,
            high_time_ns = self.settings.high_time_ns,
            dead_time_ms = self.settings.dead_time_ms,
            "initialized pulse generator ({identity})"
        );
        Ok(())
    }

    /// Disarm and stack a reason. The generator stays down until every
    /// pushed reason has been released.
    pub fn request_disable(&mut self, reason: &str) -> DeviceResult<()> {
        if self.disable_requests.iter().any(|r| r == reason) {
            warn!(
                reason,
                pending = ?self.disable_requests,
                "duplicate disable request"
            );
        }
        let was_enabled = self.enabled;
        self.disable_requests.push(reason.to_string());
        if was_enabled {
            self.emit(InfoEvent::DisableHeld {
                reason: reason.to_string(),
            });
            self.arm(false, reason)
        } else {
            debug!(
                reason,
                pending = ?self.disable_requests,
                "generator is already disarmed, stacking the request"
            );
            Ok(())
        }
    }

    /// Drop a stacked reason and rearm once the stack is empty. An
    /// unknown reason drops the most recent hold; releasing with an
    /// empty stack arms anyway.
    pub fn release_disable(&mut self, reason: &str) -> DeviceResult<()> {
        if self.disable_requests.is_empty() {
            warn!(
                reason,
                "release without any pending disable request, arming anyway"
            );
        } else if let Some(idx) = self.disable_requests.iter().position(|r| r == reason) {
            self.disable_requests.remove(idx);
        } else {
            warn!(
                reason,
                pending = ?self.disable_requests,
                "unknown release reason, dropping the most recent hold"
            );
            self.disable_requests.pop();
        }
        if self.disable_requests.is_empty() {
            self.emit(InfoEvent::DisableReleased {
                reason: reason.to_string(),
            });
            self.arm(true, reason)
        } else {
            debug!(
                reason,
                pending = ?self.disable_requests,
                "holds still pending, staying disarmed"
            );
            Ok(())
        }
    }

    /// Drive the device to the requested arm state and verify it got
    /// there. Arming with pending disable requests clears them.
    pub fn arm(&mut self, arm: bool, reason: &str) -> DeviceResult<()> {
        let want = if arm {
            DeviceState::Armed
        } else {
            DeviceState::Disarmed
        };
        if arm && !self.disable_requests.is_empty() {
            warn!(
                pending = ?self.disable_requests,
                "arming overrides the disable stack, clearing it"
            );
            self.disable_requests.clear();
        }
        self.enabled = arm;
        info!(reason, "changing generator state to {want}");

        let mut attempt = 0u32;
        loop {
            self.bail_if_stopping()?;
            if attempt >= ARM_ATTEMPTS {
                error!("generator did not reach {want} after {ARM_ATTEMPTS} attempts, recovering");
                self.recover_from(&DeviceError::needs_self_heal(
                    GENERATOR,
                    "arm attempts exhausted",
                ))?;
                return match self.try_arm_once(want) {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(DeviceError::needs_self_heal(
                        GENERATOR,
                        format!("still not {want} after recovery"),
                    )),
                    Err(e) => Err(e),
                };
            }
            attempt += 1;
            match self.try_arm_once(want) {
                Ok(true) => {
                    info!("generator is now {want}");
                    return Ok(());
                }
                Ok(false) => {
                    warn!(
                        attempts_left = ARM_ATTEMPTS - attempt,
                        "generator did not settle at {want}, retrying"
                    );
                    self.backoff(attempt);
                }
                Err(DeviceError::Stopped) => return Err(DeviceError::Stopped),
                Err(e @ DeviceError::NeedsSelfHeal { .. }) => {
                    self.recover_from(&e)?;
                }
                Err(e) => {
                    error!(
                        error = %e,
                        attempts_left = ARM_ATTEMPTS - attempt,
                        "arm step failed, retrying"
                    );
                    self.backoff(attempt);
                }
            }
        }
    }

    fn try_arm_once(&mut self, want: DeviceState) -> DeviceResult<bool> {
        let state = self.device.state()?;
        if state == want {
            return Ok(true);
        }
        if state == DeviceState::Fault {
            return Err(DeviceError::needs_self_heal(
                GENERATOR,
                "fault state while changing arm state",
            ));
        }
        self.device.set_armed(want == DeviceState::Armed)?;
        self.device.wait_ready(READY_TIMEOUT)?;
        if self.device.state()? == DeviceState::Arming {
            // capacitor bank needs a moment after the arm command
            self.sleep(ARMING_SETTLE);
        }
        Ok(self.device.state()? == want)
    }

    /// Apply a parameter update. The whole request is validated against
    /// limits and the charge-rate coupling before anything is sent to
    /// the device; rejected requests leave device and stored settings
    /// untouched. After applying, the device readback is the source of
    /// truth on any divergence.
    pub fn change(&mut self, req: PulseChange, silent: bool) -> DeviceResult<ChangeOutcome> {
        self.bail_if_stopping()?;
        self.validate(&req)?;
        let mut outcome = ChangeOutcome::default();

        if let Some(high_time_ns) = req.high_time_ns {
            let ones = high_time_ns / self.limits.high_time_min_ns;
            if ones == 0 {
                // high time below one slot: disarm instead of
                // programming an empty pattern
                self.request_disable("user")?;
            } else {
                let pattern = pattern_for_high_time(
                    high_time_ns,
                    self.limits.high_time_min_ns,
                    self.limits.pattern_slots,
                )
                .ok_or_else(|| DeviceError::rejected("high time below one pattern slot"))?;
                self.with_recovery("set pulse pattern", |g| g.device.set_pattern(&pattern))?;
                let echoed = self.with_recovery("read back pulse pattern", |g| g.device.pattern())?;
                if echoed == pattern {
                    let zeros = self.limits.pattern_slots - ones;
                    self.settings.high_time_ns = ones * self.limits.high_time_min_ns;
                    self.settings.pattern = pattern;
                    outcome.high_time_changed = true;
                    if !silent {
                        info!(
                            delay_ns = zeros * self.limits.high_time_min_ns,
                            high_ns = self.settings.high_time_ns,
                            "changed the pulse pattern"
                        );
                    }
                } else {
                    error!(
                        requested = pattern_string(&pattern),
                        reported = pattern_string(&echoed),
                        "device reports a different pattern than requested, adopting the readback"
                    );
                    let reported_ones = echoed.iter().filter(|&&b| b == 1).count() as u32;
                    self.settings.high_time_ns = reported_ones * self.limits.high_time_min_ns;
                    self.settings.pattern = echoed;
                }
            }
        }

        if let Some(volts) = req.voltage {
            self.with_recovery("set voltage", |g| g.device.set_voltage(volts))?;
            let reported = self.with_recovery("read back voltage", |g| g.device.voltage_set())?;
            if reported == volts {
                self.settings.voltage = volts;
                outcome.voltage_changed = true;
                if !silent {
                    info!(volts, "changed the fault voltage");
                }
            } else {
                error!(
                    requested = volts,
                    reported, "device reports a different voltage than requested, adopting the readback"
                );
                self.settings.voltage = reported;
            }
        }

        if let Some(dead_time) = req.dead_time_ms {
            self.with_recovery("set dead time", |g| g.device.set_dead_time_ms(dead_time))?;
            let reported = self.with_recovery("read back dead time", |g| g.device.dead_time_ms())?;
            if reported == dead_time {
                self.settings.dead_time_ms = dead_time;
                outcome.dead_time_changed = true;
                if !silent {
                    info!(dead_time_ms = dead_time, "changed the dead time");
                }
            } else {
                error!(
                    requested = dead_time,
                    reported,
                    "device reports a different dead time than requested, adopting the readback"
                );
                self.settings.dead_time_ms = reported;
            }
        }

        self.with_recovery("settle after parameter change", |g| {
            g.device.wait_ready(READY_TIMEOUT)
        })?;
        Ok(outcome)
    }

    fn validate(&self, req: &PulseChange) -> DeviceResult<()> {
        let volts = req.voltage.unwrap_or(self.settings.voltage);
        let dead_time = req.dead_time_ms.unwrap_or(self.settings.dead_time_ms);

        if let Some(high_time_ns) = req.high_time_ns {
            if high_time_ns > self.limits.high_time_max_ns {
                return Err(DeviceError::rejected(format!(
                    "high time {high_time_ns} ns exceeds the maximum of {} ns",
                    self.limits.high_time_max_ns
                )));
            }
        }
        if let Some(v) = req.voltage {
            if v < self.limits.voltage_min || v > self.limits.voltage_max {
                return Err(DeviceError::rejected(format!(
                    "voltage {v} V outside {}..={} V",
                    self.limits.voltage_min, self.limits.voltage_max
                )));
            }
            if min_dead_time_for_voltage(v) > dead_time {
                return Err(DeviceError::rejected(format!(
                    "voltage {v} V needs at least {} ms dead time to recharge, have {dead_time} ms",
                    min_dead_time_for_voltage(v)
                )));
            }
        }
        if let Some(d) = req.dead_time_ms {
            if !(DEAD_TIME_MIN_MS..=DEAD_TIME_MAX_MS).contains(&d) {
                return Err(DeviceError::rejected(format!(
                    "dead time {d} ms outside {DEAD_TIME_MIN_MS}..={DEAD_TIME_MAX_MS} ms"
                )));
            }
            if d < min_dead_time_for_voltage(volts) {
                return Err(DeviceError::rejected(format!(
                    "dead time {d} ms too short to recharge for {volts} V, need {} ms",
                    min_dead_time_for_voltage(volts)
                )));
            }
        }
        Ok(())
    }

    /// Run the health checks (connection, fault state, arm agreement)
    /// and repair what fails. Returns `true` when no repair was needed.
    /// Failing the same check twice in a row escalates to a device
    /// reset; an exhausted loop sets the stop flag.
    pub fn self_heal(&mut self) -> DeviceResult<bool> {
        if self.healing {
            // re-entered from a repair action, reset instead of recursing
            self.reset()?;
            return Ok(false);
        }
        self.healing = true;
        let result = self.self_heal_inner();
        self.healing = false;
        result
    }

    fn self_heal_inner(&mut self) -> DeviceResult<bool> {
        let mut failed_on = HealthCheck::None;
        let mut iterations = 0u32;
        loop {
            if iterations >= SELF_HEAL_ATTEMPTS {
                error!("self-heal ran {iterations} times without success, giving up");
                self.stop.store(true, Ordering::SeqCst);
                return Err(DeviceError::Fatal("generator self-heal exhausted".into()));
            }
            iterations += 1;
            match self.self_heal_pass(&mut failed_on) {
                Ok(HealOutcome::Clean) => {
                    debug!("generator self-test passed, no repair was required");
                    return Ok(true);
                }
                Ok(HealOutcome::Repaired) => {
                    debug!("generator self-heal finished");
                    return Ok(false);
                }
                Ok(HealOutcome::Again) => continue,
                Err(DeviceError::Stopped) => return Err(DeviceError::Stopped),
                Err(e) => {
                    error!(error = %e, "self-heal pass failed, resetting and retrying");
                    self.backoff(iterations);
                    self.reset()?;
                }
            }
        }
    }

    fn self_heal_pass(&mut self, failed_on: &mut HealthCheck) -> DeviceResult<HealOutcome> {
        self.bail_if_stopping()?;

        if !self.is_connected() {
            warn!("self-test: generator is not connected");
            if *failed_on == HealthCheck::Connection {
                error!("self-test failed twice on the connection check, resetting the generator");
                self.reset()?;
            } else {
                info!("self-heal: reconnecting");
                *failed_on = HealthCheck::Connection;
                self.reconnect()?;
            }
            return Ok(HealOutcome::Again);
        }

        if self.device.state()? == DeviceState::Fault {
            warn!("self-test: generator reports a fault state");
            if *failed_on == HealthCheck::Fault {
                error!("self-test failed twice on the fault check, resetting the generator");
                self.reset()?;
                return Ok(HealOutcome::Again);
            }
            info!("self-heal: clearing faults");
            *failed_on = HealthCheck::Fault;
            self.clear_faults()?;
        }

        let state = self.device.state()?;
        let disagrees = (self.enabled && state == DeviceState::Disarmed)
            || (!self.enabled && state == DeviceState::Armed);
        if disagrees {
            warn!(
                intended_armed = self.enabled,
                "self-test: arm state disagrees with intent"
            );
            if *failed_on == HealthCheck::Arm {
                error!("self-test failed twice on the arm check, resetting the generator");
                self.reset()?;
                return Ok(HealOutcome::Again);
            }
            info!("self-heal: restoring the arm state");
            *failed_on = HealthCheck::Arm;
            self.arm(self.enabled, "selfheal")?;
        }

        Ok(if *failed_on == HealthCheck::None {
            HealOutcome::Clean
        } else {
            HealOutcome::Repaired
        })
    }

    fn clear_faults(&mut self) -> DeviceResult<()> {
        let faults = match self.device.faults_current() {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "latched faults cannot be read, resetting the generator");
                return self.reset();
            }
        };
        if faults.is_empty() {
            info!("fault state with no latched faults, clearing anyway");
        } else {
            info!(?faults, "clearing latched generator faults");
        }
        if let Err(e) = self.device.clear_faults() {
            warn!(error = %e, "clearing faults failed, resetting the generator");
            return self.reset();
        }
        match self.device.state() {
            Ok(DeviceState::Fault) => {
                warn!("fault state persists after clearing, resetting the generator");
                self.reset()
            }
            Ok(_) => {
                info!("generator fault state cleared");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "could not verify the fault clearing, resetting the generator");
                self.reset()
            }
        }
    }

    /// Reboot the device and loop until it comes back, then do a full
    /// reconnect. Only the stop flag gets us out of here early.
    pub fn reset(&mut self) -> DeviceResult<()> {
        info!("resetting the pulse generator and reconnecting");
        let mut attempt = 0u32;
        loop {
            self.bail_if_stopping()?;
            attempt += 1;
            if let Err(e) = self.device.trigger_reset() {
                error!(error = %e, attempt, "could not send the reset command, retrying");
                self.sleep(RESET_SETTLE);
                let _ = self.device.open();
                continue;
            }
            self.sleep(RESET_SETTLE);
            if let Err(e) = self.device.open() {
                error!(error = %e, attempt, "reopening the link after reset failed, retrying");
                self.sleep(RESET_SETTLE);
                continue;
            }
            if self.is_connected() {
                info!("generator came back after the reset, performing a full reconnect");
                return self.reconnect();
            }
            error!(attempt, "generator reopened but the status probe failed, retrying");
            self.sleep(RESET_SETTLE);
        }
    }

    /// Run an operation with the standard recovery policy: classify the
    /// first failure, repair, retry once, and reset the device if the
    /// retry fails too.
    fn with_recovery<T>(
        &mut self,
        what: &str,
        mut op: impl FnMut(&mut Self) -> DeviceResult<T>,
    ) -> DeviceResult<T> {
        match op(self) {
            Ok(v) => Ok(v),
            Err(DeviceError::Stopped) => Err(DeviceError::Stopped),
            Err(e) => {
                warn!(error = %e, "{what} failed, attempting recovery");
                self.recover_from(&e)?;
                self.bail_if_stopping()?;
                match op(self) {
                    Ok(v) => Ok(v),
                    Err(e2) => {
                        error!(error = %e2, "{what} failed again after recovery, resetting the generator");
                        self.reset()?;
                        Err(e2)
                    }
                }
            }
        }
    }

    fn recover_from(&mut self, e: &DeviceError) -> DeviceResult<()> {
        match e {
            DeviceError::NeedsReconnect { .. } => {
                warn!("connection-level failure, reconnecting after a short wait");
                self.sleep(RETRY_BACKOFF);
                self.reconnect()
            }
            _ => {
                if self.healing {
                    self.reset()
                } else {
                    self.self_heal().map(|_| ())
                }
            }
        }
    }

    fn emit(&self, event: InfoEvent) {
        let _ = self.events.send(ExperimentEvent::Info(event));
    }

    fn bail_if_stopping(&self) -> DeviceResult<()> {
        if self.stop.load(Ordering::SeqCst) {
            return Err(DeviceError::Stopped);
        }
        Ok(())
    }

    fn sleep(&self, dur: Duration) {
        sleep_unless_stopping(&self.stop, dur);
    }

    fn backoff(&self, attempt: u32) {
        self.sleep(RETRY_BACKOFF * attempt);
    }
}

/// Pulse generator behind a serial console. One command per line, one
/// reply per line, errors prefixed with `err`.
pub struct SerialPulseDevice {
    port_path: String,
    baud: u32,
    link: Option<Box<dyn serialport::SerialPort>>,
}

impl SerialPulseDevice {
    pub fn new(port_path: impl Into<String>, baud: u32) -> Self {
        SerialPulseDevice {
            port_path: port_path.into(),
            baud,
            link: None,
        }
    }

    fn command(&mut self, cmd: &str) -> DeviceResult<String> {
        let port = self
            .link
            .as_mut()
            .ok_or_else(|| DeviceError::needs_reconnect(GENERATOR, "serial link not open"))?;
        port.write_all(cmd.as_bytes())?;
        port.write_all(b"\r\n")?;
        port.flush()?;

        let mut reply = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match port.read(&mut byte) {
                Ok(0) => {
                    return Err(DeviceError::needs_reconnect(GENERATOR, "serial link closed"))
                }
                Ok(_) => {
                    if byte[0] == b'\n' {
                        break;
                    }
                    if byte[0] != b'\r' {
                        reply.push(byte[0]);
                    }
                    if reply.len() > 512 {
                        return Err(DeviceError::Protocol("oversized generator reply".into()));
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    return Err(DeviceError::Timeout {
                        what: "generator reply",
                        after: REPLY_TIMEOUT,
                    })
                }
                Err(e) => return Err(e.into()),
            }
        }
        let text = String::from_utf8_lossy(&reply).trim().to_string();
        if let Some(rest) = text.strip_prefix("err ") {
            return Err(DeviceError::Protocol(rest.to_string()));
        }
        Ok(text)
    }

    fn query_u32(&mut self, cmd: &str) -> DeviceResult<u32> {
        let reply = self.command(cmd)?;
        reply
            .parse()
            .map_err(|_| DeviceError::Protocol(format!("expected a number, got '{reply}'")))
    }
}

impl PulseDevice for SerialPulseDevice {
    fn open(&mut self) -> DeviceResult<()> {
        let port = serialport::new(self.port_path.as_str(), self.baud)
            .timeout(REPLY_TIMEOUT)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .open()?;
        self.link = Some(port);
        Ok(())
    }

    fn status(&mut self) -> DeviceResult<bool> {
        self.command("state").map(|_| true)
    }

    fn state(&mut self) -> DeviceResult<DeviceState> {
        let reply = self.command("state")?;
        match reply.as_str() {
            "armed" => Ok(DeviceState::Armed),
            "disarmed" => Ok(DeviceState::Disarmed),
            "arming" => Ok(DeviceState::Arming),
            "fault" => Ok(DeviceState::Fault),
            other => Err(DeviceError::Protocol(format!(
                "unknown generator state '{other}'"
            ))),
        }
    }

    fn set_armed(&mut self, armed: bool) -> DeviceResult<()> {
        self.command(if armed { "arm 1" } else { "arm 0" })?;
        Ok(())
    }

    fn wait_ready(&mut self, timeout: Duration) -> DeviceResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.command("state") {
                Ok(_) => return Ok(()),
                Err(DeviceError::Timeout { .. }) => {}
                Err(e) => return Err(e),
            }
            if Instant::now() >= deadline {
                return Err(DeviceError::Timeout {
                    what: "generator ready",
                    after: timeout,
                });
            }
            std::thread::sleep(Duration::from_millis(250));
        }
    }

    fn faults_current(&mut self) -> DeviceResult<Vec<String>> {
        let reply = self.command("faults")?;
        Ok(reply
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn clear_faults(&mut self) -> DeviceResult<()> {
        self.command("faults clear")?;
        Ok(())
    }

    fn voltage_set(&mut self) -> DeviceResult<u32> {
        self.query_u32("voltage set")
    }

    fn voltage_measured(&mut self) -> DeviceResult<f64> {
        let reply = self.command("voltage measured")?;
        reply
            .parse()
            .map_err(|_| DeviceError::Protocol(format!("expected a voltage, got '{reply}'")))
    }

    fn set_voltage(&mut self, volts: u32) -> DeviceResult<()> {
        self.command(&format!("voltage {volts}"))?;
        Ok(())
    }

    fn pattern(&mut self) -> DeviceResult<Vec<u8>> {
        let reply = self.command("pattern")?;
        reply
            .chars()
            .map(|c| match c {
                '0' => Ok(0u8),
                '1' => Ok(1u8),
                other => Err(DeviceError::Protocol(format!(
                    "unexpected pattern character '{other}'"
                ))),
            })
            .collect()
    }

    fn set_pattern(&mut self, pattern: &[u8]) -> DeviceResult<()> {
        self.command(&format!("pattern {}", pattern_string(pattern)))?;
        Ok(())
    }

    fn dead_time_ms(&mut self) -> DeviceResult<u32> {
        self.query_u32("deadtime")
    }

    fn set_dead_time_ms(&mut self, ms: u32) -> DeviceResult<()> {
        self.command(&format!("deadtime {ms}"))?;
        Ok(())
    }

    fn configure_static(&mut self) -> DeviceResult<()> {
        for cmd in [
            "pattern_enable 1",
            "pulse_repeat 1",
            "trigger_hw term 1",
            "trigger_hw mode 1",
            "emode 0",
            "mute 1",
            "arm_timeout 20",
        ] {
            self.command(cmd)?;
        }
        Ok(())
    }

    fn trigger_reset(&mut self) -> DeviceResult<()> {
        // the device reboots immediately, a reply may never arrive
        match self.command("reset") {
            Ok(_) | Err(DeviceError::Timeout { .. }) => {
                self.link = None;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn identity(&mut self) -> DeviceResult<String> {
        self.command("id")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::sim::SimPulseDevice;
    use tokio::sync::mpsc::unbounded_channel;

    fn controller() -> (GeneratorController, crate::engine::sim::SimDeviceHandle) {
        let (device, handle) = SimPulseDevice::new();
        let cfg = ScanConfig::baseline("testchip");
        let (tx, _rx) = unbounded_channel();
        let stop = Arc::new(AtomicBool::new(false));
        let ctl = GeneratorController::new(Box::new(device), &cfg, tx, stop)
            .unwrap();
        (ctl, handle)
    }

    #[test]
    fn pattern_math_pads_and_terminates() {
        let p = pattern_for_high_time(60, 20, 66).unwrap();
        assert_eq!(p.len(), 67);
        assert_eq!(p.iter().filter(|&&b| b == 1).count(), 3);
        assert_eq!(p[66], 0);
        assert_eq!(&p[..63], vec![0u8; 63].as_slice());
        assert_eq!(&p[63..66], &[1, 1, 1]);
    }

    #[test]
    fn sub_slot_high_time_has_no_pattern() {
        assert!(pattern_for_high_time(19, 20, 66).is_none());
        assert!(pattern_for_high_time(0, 20, 66).is_none());
    }

    #[test]
    fn charge_rate_floor() {
        assert_eq!(min_dead_time_for_voltage(500), 17);
        assert_eq!(min_dead_time_for_voltage(280), 10);
        assert_eq!(min_dead_time_for_voltage(0), 1);
    }

    #[test]
    fn armed_only_while_disable_stack_is_empty() {
        let (mut ctl, handle) = controller();
        ctl.arm(true, "test").unwrap();
        assert!(handle.armed());

        ctl.request_disable("a").unwrap();
        assert!(!handle.armed());
        ctl.request_disable("b").unwrap();
        assert!(!handle.armed());

        ctl.release_disable("a").unwrap();
        assert!(!handle.armed());
        ctl.release_disable("b").unwrap();
        assert!(handle.armed());
    }

    #[test]
    fn duplicate_reason_is_stacked_twice() {
        let (mut ctl, handle) = controller();
        ctl.arm(true, "test").unwrap();
        ctl.request_disable("jogging").unwrap();
        ctl.request_disable("jogging").unwrap();
        ctl.release_disable("jogging").unwrap();
        assert!(!handle.armed());
        ctl.release_disable("jogging").unwrap();
        assert!(handle.armed());
    }

    #[test]
    fn unknown_release_drops_the_most_recent_hold() {
        let (mut ctl, _handle) = controller();
        ctl.arm(true, "test").unwrap();
        ctl.request_disable("first").unwrap();
        ctl.request_disable("second").unwrap();
        ctl.release_disable("nonsense").unwrap();
        assert_eq!(ctl.disable_reasons(), &["first".to_string()]);
    }

    #[test]
    fn release_on_empty_stack_arms_anyway() {
        let (mut ctl, handle) = controller();
        assert!(!handle.armed());
        ctl.release_disable("ghost").unwrap();
        assert!(handle.armed());
    }

    #[test]
    fn arming_clears_pending_holds() {
        let (mut ctl, handle) = controller();
        ctl.request_disable("a").unwrap();
        ctl.request_disable("b").unwrap();
        ctl.arm(true, "override").unwrap();
        assert!(ctl.disable_reasons().is_empty());
        assert!(handle.armed());
    }

    #[test]
    fn out_of_range_voltage_is_rejected_without_mutation() {
        let (mut ctl, handle) = controller();
        let before = ctl.settings().voltage;
        let err = ctl
            .change(
                PulseChange {
                    voltage: Some(600),
                    ..Default::default()
                },
                false,
            )
            .unwrap_err();
        assert!(matches!(err, DeviceError::Rejected { .. }));
        assert_eq!(ctl.settings().voltage, before);
        assert_eq!(handle.voltage(), before);
    }

    #[test]
    fn voltage_needs_enough_dead_time() {
        let (mut ctl, _handle) = controller();
        // shrink the dead time first so a high voltage cannot recharge
        ctl.change(
            PulseChange {
                dead_time_ms: Some(10),
                ..Default::default()
            },
            true,
        )
        .unwrap();
        let err = ctl
            .change(
                PulseChange {
                    voltage: Some(400),
                    ..Default::default()
                },
                false,
            )
            .unwrap_err();
        assert!(matches!(err, DeviceError::Rejected { .. }));
    }

    #[test]
    fn paired_voltage_and_dead_time_validate_against_each_other() {
        let (mut ctl, handle) = controller();
        ctl.change(
            PulseChange {
                voltage: Some(450),
                dead_time_ms: Some(16),
                ..Default::default()
            },
            true,
        )
        .unwrap_err();
        // 16 ms cannot recharge 450 V, nothing may have been applied
        assert_eq!(ctl.settings().voltage, 280);
        assert_eq!(handle.voltage(), 280);

        let outcome = ctl
            .change(
                PulseChange {
                    voltage: Some(450),
                    dead_time_ms: Some(20),
                    ..Default::default()
                },
                true,
            )
            .unwrap();
        assert!(outcome.voltage_changed);
        assert!(outcome.dead_time_changed);
        assert_eq!(handle.voltage(), 450);
    }

    #[test]
    fn zero_high_time_disarms_via_the_stack() {
        let (mut ctl, handle) = controller();
        ctl.arm(true, "test").unwrap();
        let outcome = ctl
            .change(
                PulseChange {
                    high_time_ns: Some(0),
                    ..Default::default()
                },
                false,
            )
            .unwrap();
        assert!(!outcome.high_time_changed);
        assert!(!handle.armed());
        assert_eq!(ctl.disable_reasons(), &["user".to_string()]);
    }

    #[test]
    fn self_heal_reports_healthy_rig() {
        let (mut ctl, _handle) = controller();
        assert!(ctl.self_heal().unwrap());
    }

    #[test]
    fn self_heal_clears_an_injected_fault() {
        let (mut ctl, handle) = controller();
        handle.inject_fault("probe_temp");
        let was_healthy = ctl.self_heal().unwrap();
        assert!(!was_healthy);
        assert!(!handle.faulted());
    }

    #[test]
    fn self_heal_restores_intended_arm_state() {
        let (mut ctl, handle) = controller();
        ctl.arm(true, "test").unwrap();
        handle.force_disarm();
        assert!(!handle.armed());
        let was_healthy = ctl.self_heal().unwrap();
        assert!(!was_healthy);
        assert!(handle.armed());
    }

    #[test]
    fn voltage_change_flags_the_outcome() {
        let (mut ctl, handle) = controller();
        let outcome = ctl
            .change(
                PulseChange {
                    voltage: Some(290),
                    ..Default::default()
                },
                false,
            )
            .unwrap();
        assert!(outcome.voltage_changed);
        assert!(!outcome.high_time_changed);
        assert_eq!(handle.voltage(), 290);
        assert_eq!(ctl.settings().voltage, 290);
    }
}
