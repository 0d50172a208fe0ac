//! Simulated bench hardware for dry runs and tests.
//!
//! Every double exposes a cloneable handle onto its internal state so
//! tests can observe and perturb the device behind the controller's
//! back, the same way a flaky bench would.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info};

use crate::engine::generator::{DeviceState, PulseDevice};
use crate::engine::motion::{
    Axis, AxisFactory, AxisMap, AxisName, ACCELERATION_MM_S2, MAX_VELOCITY_MM_S, STAGE_SCALE,
};
use crate::engine::target::{
    load_banner_lines, ResetLine, TargetLink, SIGNATURE_PREFIX,
};
use crate::engine::{lock, sleep_unless_stopping};
use crate::error::{DeviceError, DeviceResult};
use crate::model::ScanConfig;

/// Clean frames the emulated target sends between two fault episodes.
const FAULT_FREE_READS: u32 = 20;
/// Chance of a corrupted signature while the pulse generator is armed
/// above its starting voltage.
const INDUCED_FAULT_PROBABILITY: f64 = 0.02;
const SIM_RESET_SETTLE: Duration = Duration::from_millis(200);

/// Signature the emulated target signs with when no valid signature is
/// configured (a real RSA-1024 PKCS#1 v1.5 signature, so lengths and
/// hex shape match live targets).
pub const SIM_SIGNATURE: &str = "2df71ed42d6bf9174c938555aae4f3ddf50c1bdcb3ee226adeb647612c45f5c32ea27075937e5ee98d9879e4acbd4dd63a7b40b5b35f3f6f8a76f17845a96f210e28ab25979176ed09ea287c229dfcebc2cd7d511d8e8a3c55bcbee7a16093343f1b670bc180ead2f26af5d391ef29e15cf0707f588abc9c3e11365ca96ce529";

#[derive(Debug)]
struct PulseCore {
    open: bool,
    armed: bool,
    voltage: u32,
    dead_time_ms: u32,
    pattern: Vec<u8>,
    faults: Vec<String>,
}

/// Pulse generator double. Settings apply instantly and read back
/// exactly; the handle can latch faults and flip the arm relay.
pub struct SimPulseDevice {
    core: Arc<Mutex<PulseCore>>,
}

#[derive(Clone)]
pub struct SimDeviceHandle {
    core: Arc<Mutex<PulseCore>>,
}

impl SimPulseDevice {
    pub fn new() -> (SimPulseDevice, SimDeviceHandle) {
        let core = Arc::new(Mutex::new(PulseCore {
            open: false,
            armed: false,
            voltage: 0,
            dead_time_ms: 0,
            pattern: Vec::new(),
            faults: Vec::new(),
        }));
        (
            SimPulseDevice { core: core.clone() },
            SimDeviceHandle { core },
        )
    }

    fn live(&self) -> DeviceResult<std::sync::MutexGuard<'_, PulseCore>> {
        let core = lock(&self.core);
        if !core.open {
            return Err(DeviceError::needs_reconnect(
                "pulse generator",
                "link is closed",
            ));
        }
        Ok(core)
    }
}

impl SimDeviceHandle {
    pub fn armed(&self) -> bool {
        lock(&self.core).armed
    }

    pub fn voltage(&self) -> u32 {
        lock(&self.core).voltage
    }

    pub fn faulted(&self) -> bool {
        !lock(&self.core).faults.is_empty()
    }

    /// Latches a fault; the device reports the fault state until the
    /// controller clears it.
    pub fn inject_fault(&self, name: &str) {
        lock(&self.core).faults.push(name.to_string());
    }

    /// Drops the arm relay behind the controller's back.
    pub fn force_disarm(&self) {
        lock(&self.core).armed = false;
    }
}

impl PulseDevice for SimPulseDevice {
    fn open(&mut self) -> DeviceResult<()> {
        lock(&self.core).open = true;
        Ok(())
    }

    fn status(&mut self) -> DeviceResult<bool> {
        Ok(lock(&self.core).open)
    }

    fn state(&mut self) -> DeviceResult<DeviceState> {
        let core = self.live()?;
        Ok(if !core.faults.is_empty() {
            DeviceState::Fault
        } else if core.armed {
            DeviceState::Armed
        } else {
            DeviceState::Disarmed
        })
    }

    fn set_armed(&mut self, armed: bool) -> DeviceResult<()> {
        self.live()?.armed = armed;
        Ok(())
    }

    fn wait_ready(&mut self, _timeout: Duration) -> DeviceResult<()> {
        self.live().map(|_| ())
    }

    fn faults_current(&mut self) -> DeviceResult<Vec<String>> {
        Ok(self.live()?.faults.clone())
    }

    fn clear_faults(&mut self) -> DeviceResult<()> {
        self.live()?.faults.clear();
        Ok(())
    }

    fn voltage_set(&mut self) -> DeviceResult<u32> {
        Ok(self.live()?.voltage)
    }

    fn voltage_measured(&mut self) -> DeviceResult<f64> {
        Ok(f64::from(self.live()?.voltage))
    }

    fn set_voltage(&mut self, volts: u32) -> DeviceResult<()> {
        self.live()?.voltage = volts;
        Ok(())
    }

    fn pattern(&mut self) -> DeviceResult<Vec<u8>> {
        Ok(self.live()?.pattern.clone())
    }

    fn set_pattern(&mut self, pattern: &[u8]) -> DeviceResult<()> {
        self.live()?.pattern = pattern.to_vec();
        Ok(())
    }

    fn dead_time_ms(&mut self) -> DeviceResult<u32> {
        Ok(self.live()?.dead_time_ms)
    }

    fn set_dead_time_ms(&mut self, ms: u32) -> DeviceResult<()> {
        self.live()?.dead_time_ms = ms;
        Ok(())
    }

    fn configure_static(&mut self) -> DeviceResult<()> {
        self.live().map(|_| ())
    }

    fn trigger_reset(&mut self) -> DeviceResult<()> {
        let mut core = lock(&self.core);
        core.open = false;
        core.armed = false;
        core.faults.clear();
        Ok(())
    }

    fn identity(&mut self) -> DeviceResult<String> {
        self.live()?;
        Ok("simulated pulse generator 1.0".to_string())
    }
}

#[derive(Debug)]
struct AxisCore {
    position: f64,
    homed: bool,
    moves: Vec<f64>,
    drift_once: Option<f64>,
    drift_every: Option<f64>,
}

/// One simulated MTS50-Z8 axis. Moves land instantly, optionally off
/// target by a configured drift.
struct SimAxis {
    core: Arc<Mutex<AxisCore>>,
}

#[derive(Clone)]
pub struct SimAxisHandle {
    core: Arc<Mutex<AxisCore>>,
}

impl SimAxisHandle {
    pub fn position(&self) -> f64 {
        lock(&self.core).position
    }

    /// Commanded targets of every move so far. Homing is not a move.
    pub fn move_history(&self) -> Vec<f64> {
        lock(&self.core).moves.clone()
    }

    /// The next move lands this far off target, then the axis behaves.
    pub fn set_drift_once(&self, mm: f64) {
        lock(&self.core).drift_once = Some(mm);
    }

    /// Every move from now on lands this far off target.
    pub fn set_drift_every(&self, mm: f64) {
        lock(&self.core).drift_every = Some(mm);
    }
}

pub struct SimAxisHandles {
    pub x: SimAxisHandle,
    pub y: SimAxisHandle,
    pub z: SimAxisHandle,
}

impl Axis for SimAxis {
    fn is_homed(&mut self) -> DeviceResult<bool> {
        Ok(lock(&self.core).homed)
    }

    fn home(&mut self) -> DeviceResult<()> {
        let mut core = lock(&self.core);
        core.homed = true;
        core.position = 0.0;
        Ok(())
    }

    fn wait_for_home(&mut self) -> DeviceResult<()> {
        Ok(())
    }

    fn is_moving(&mut self) -> DeviceResult<bool> {
        Ok(false)
    }

    fn wait_for_stop(&mut self) -> DeviceResult<()> {
        Ok(())
    }

    fn move_to(&mut self, position_mm: f64) -> DeviceResult<()> {
        let mut core = lock(&self.core);
        core.moves.push(position_mm);
        let drift = core.drift_once.take().or(core.drift_every);
        core.position = position_mm + drift.unwrap_or(0.0);
        Ok(())
    }

    fn position(&mut self) -> DeviceResult<f64> {
        Ok(lock(&self.core).position)
    }

    fn scale(&mut self) -> DeviceResult<(f64, f64, f64)> {
        Ok(STAGE_SCALE)
    }

    fn velocity_parameters(&mut self) -> DeviceResult<(f64, f64, f64)> {
        Ok((0.0, ACCELERATION_MM_S2, MAX_VELOCITY_MM_S))
    }

    fn scale_units(&mut self) -> DeviceResult<String> {
        Ok("user".to_string())
    }

    fn close(&mut self) {}
}

/// Three simulated axes sharing state across factory rebuilds, the way
/// real stages keep their position when the link is reopened.
pub fn sim_axis_map() -> (AxisFactory, SimAxisHandles) {
    let fresh_core = || {
        Arc::new(Mutex::new(AxisCore {
            position: 0.0,
            homed: false,
            moves: Vec::new(),
            drift_once: None,
            drift_every: None,
        }))
    };
    let x = fresh_core();
    let y = fresh_core();
    let z = fresh_core();
    let handles = SimAxisHandles {
        x: SimAxisHandle { core: x.clone() },
        y: SimAxisHandle { core: y.clone() },
        z: SimAxisHandle { core: z.clone() },
    };
    let factory = Box::new(move || {
        let mut axes: AxisMap = AxisMap::new();
        axes.insert(AxisName::X, Box::new(SimAxis { core: x.clone() }) as Box<dyn Axis>);
        axes.insert(AxisName::Y, Box::new(SimAxis { core: y.clone() }) as Box<dyn Axis>);
        axes.insert(AxisName::Z, Box::new(SimAxis { core: z.clone() }) as Box<dyn Axis>);
        Ok(axes)
    });
    (factory, handles)
}

/// How one emulated line comes out of the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineDamage {
    Clean,
    Garbled,
    Overlong,
    Empty,
    Silent,
}

const DAMAGE_KINDS: [LineDamage; 5] = [
    LineDamage::Clean,
    LineDamage::Garbled,
    LineDamage::Overlong,
    LineDamage::Empty,
    LineDamage::Silent,
];

/// Active fault episode: how the keyword and the payload lines are
/// mangled until the target gets reset.
#[derive(Debug, Clone, Copy)]
struct FaultPlan {
    keyword: LineDamage,
    payload: LineDamage,
}

impl FaultPlan {
    /// Both lines missing models a power loss: nothing comes out of the
    /// UART at all, reads fail.
    fn is_power_loss(self) -> bool {
        self.keyword == LineDamage::Silent && self.payload == LineDamage::Silent
    }

    fn from_index(index: usize) -> FaultPlan {
        FaultPlan {
            keyword: DAMAGE_KINDS[index / DAMAGE_KINDS.len()],
            payload: DAMAGE_KINDS[index % DAMAGE_KINDS.len()],
        }
    }
}

#[derive(Debug)]
struct BenchState {
    boot_queue: VecDeque<Vec<u8>>,
    banner: Vec<String>,
    payload_pending: bool,
    reads_since_fault: u32,
    plan: Option<FaultPlan>,
    /// Rotation index over the keyword/payload damage combinations,
    /// skipping the all-clean entry at zero.
    next_fault: usize,
    deterministic: bool,
    error_probability: f64,
}

impl BenchState {
    fn arm_next_fault(&mut self) -> FaultPlan {
        let plan = FaultPlan::from_index(self.next_fault);
        self.next_fault += 1;
        if self.next_fault >= DAMAGE_KINDS.len() * DAMAGE_KINDS.len() {
            self.next_fault = 1;
            if self.deterministic {
                info!("Emulated target has cycled through every fault combination");
            }
        }
        self.plan = Some(plan);
        plan
    }

    fn clear_fault(&mut self) {
        self.plan = None;
        self.reads_since_fault = 0;
        self.payload_pending = false;
    }
}

/// Emulated RSA target. Sends the signature keyword and the prefixed
/// signature bytes in alternation, and every so often enters a fault
/// episode that persists until the reset line clears it.
pub struct SimTargetLink {
    state: Arc<Mutex<BenchState>>,
    signature: Vec<u8>,
    delay: Duration,
    baud: u32,
    generator: Option<SimDeviceHandle>,
    voltage_start: u32,
    stop: Arc<AtomicBool>,
}

/// Reset side of the emulated target: clears the fault episode and
/// queues the boot banner for replay.
pub struct SimResetLine {
    state: Arc<Mutex<BenchState>>,
    stop: Arc<AtomicBool>,
}

/// Builds the linked read and reset halves of the emulated target.
/// `generator` couples fault injection to the armed voltage.
pub fn sim_target(
    cfg: &ScanConfig,
    generator: Option<SimDeviceHandle>,
    stop: Arc<AtomicBool>,
) -> (SimTargetLink, SimResetLine) {
    let banner = cfg
        .banner_file
        .as_deref()
        .and_then(|path: &Path| load_banner_lines(path).ok())
        .unwrap_or_default();
    let signature = decode_hex(&cfg.valid_signature)
        .unwrap_or_else(|| cfg.valid_signature.as_bytes().to_vec());
    let state = Arc::new(Mutex::new(BenchState {
        boot_queue: VecDeque::new(),
        banner,
        payload_pending: false,
        reads_since_fault: 0,
        plan: None,
        next_fault: 1,
        deterministic: true,
        error_probability: 0.05,
    }));
    (
        SimTargetLink {
            state: state.clone(),
            signature,
            delay: cfg.signature_period / 2,
            baud: cfg.primary_baud,
            generator,
            voltage_start: cfg.voltage_start,
            stop: stop.clone(),
        },
        SimResetLine { state, stop },
    )
}

impl SimTargetLink {
    fn keyword_frame(&self) -> Vec<u8> {
        b"Signature:\r\n".to_vec()
    }

    fn payload_frame(&self) -> Vec<u8> {
        let mut signature = self.signature.clone();
        if let Some(generator) = &self.generator {
            // An armed probe above the starting voltage occasionally
            // flips a byte of the signature.
            if generator.armed()
                && generator.voltage() > self.voltage_start
                && rand::thread_rng().gen_bool(INDUCED_FAULT_PROBABILITY)
            {
                if let Some(byte) = signature.last_mut() {
                    *byte ^= 0x0f;
                }
                debug!("emulated target produced a faulted signature");
            }
        }
        let mut frame = SIGNATURE_PREFIX.to_vec();
        frame.extend_from_slice(&signature);
        frame.extend_from_slice(b"\r\n");
        frame
    }

    fn apply_damage(frame: Vec<u8>, damage: LineDamage) -> Vec<u8> {
        match damage {
            LineDamage::Clean => frame,
            LineDamage::Garbled => {
                let half = frame.len() / 2;
                let mut out = frame[..half].to_vec();
                out.resize(frame.len(), 0xff);
                out.extend_from_slice(b"\r\n");
                out
            }
            LineDamage::Overlong => {
                let mut out = frame;
                out.truncate(out.len().saturating_sub(2));
                let filler = out.last().copied().unwrap_or(b'A');
                out.extend(std::iter::repeat(filler).take(2000));
                out.extend_from_slice(b"\r\n");
                out
            }
            LineDamage::Empty | LineDamage::Silent => Vec::new(),
        }
    }
}

impl TargetLink for SimTargetLink {
    fn read_frame(&mut self, max_len: usize) -> DeviceResult<Vec<u8>> {
        sleep_unless_stopping(&self.stop, self.delay);
        if self.stop.load(Ordering::SeqCst) {
            return Ok(Vec::new());
        }

        let mut state = lock(&self.state);

        if let Some(line) = state.boot_queue.pop_front() {
            return Ok(line);
        }

        let plan = match state.plan {
            Some(plan) => Some(plan),
            None => {
                let high_voltage = self
                    .generator
                    .as_ref()
                    .map(|g| g.voltage() >= 300)
                    .unwrap_or(false);
                let roll = state.deterministic
                    || high_voltage
                    || rand::thread_rng().gen_bool(state.error_probability);
                if roll && state.reads_since_fault > FAULT_FREE_READS {
                    let plan = state.arm_next_fault();
                    info!(
                        "Emulated target enters a fault episode: {:?} keyword, {:?} payload",
                        plan.keyword, plan.payload
                    );
                    Some(plan)
                } else {
                    state.reads_since_fault += 1;
                    None
                }
            }
        };

        if let Some(plan) = plan {
            if plan.is_power_loss() {
                return Err(DeviceError::Protocol(
                    "emulated target lost power".to_string(),
                ));
            }
        }

        let mut frame = if !state.payload_pending {
            state.payload_pending = true;
            let keyword_damage = plan.map(|p| p.keyword).unwrap_or(LineDamage::Clean);
            if keyword_damage == LineDamage::Silent {
                // The payload arrives without its announcing keyword.
                state.payload_pending = false;
                let payload_damage = plan.map(|p| p.payload).unwrap_or(LineDamage::Clean);
                Self::apply_damage(self.payload_frame(), payload_damage)
            } else {
                Self::apply_damage(self.keyword_frame(), keyword_damage)
            }
        } else {
            state.payload_pending = false;
            let payload_damage = plan.map(|p| p.payload).unwrap_or(LineDamage::Clean);
            Self::apply_damage(self.payload_frame(), payload_damage)
        };
        frame.truncate(max_len);
        Ok(frame)
    }

    fn switch_baud(&mut self, baud: u32) -> DeviceResult<()> {
        self.baud = baud;
        Ok(())
    }

    fn baud(&self) -> u32 {
        self.baud
    }
}

impl ResetLine for SimResetLine {
    fn trigger(&mut self) -> DeviceResult<String> {
        sleep_unless_stopping(&self.stop, SIM_RESET_SETTLE);
        let mut state = lock(&self.state);
        state.clear_fault();
        let banner: Vec<Vec<u8>> = state
            .banner
            .iter()
            .map(|line| format!("{line}\r\n").into_bytes())
            .collect();
        state.boot_queue = banner.into();
        Ok("reset".to_string())
    }
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bench_cfg() -> ScanConfig {
        let mut cfg = ScanConfig::baseline("testchip");
        cfg.valid_signature = "a1b2c3d4e5f60718".to_string();
        cfg.signature_period = Duration::from_millis(0);
        cfg
    }

    fn stop_flag() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(false))
    }

    #[test]
    fn hex_decoding_round_trips_the_signature() {
        assert_eq!(
            decode_hex("a1b2c3d4e5f60718"),
            Some(vec![0xa1, 0xb2, 0xc3, 0xd4, 0xe5, 0xf6, 0x07, 0x18])
        );
        assert_eq!(decode_hex("abc"), None);
        assert_eq!(decode_hex("zz"), None);
    }

    #[test]
    fn fault_rotation_covers_all_combinations_and_skips_all_clean() {
        let mut seen_power_loss = false;
        for index in 1..DAMAGE_KINDS.len() * DAMAGE_KINDS.len() {
            let plan = FaultPlan::from_index(index);
            assert!(
                !(plan.keyword == LineDamage::Clean && plan.payload == LineDamage::Clean),
                "index {index} produced the all-clean plan"
            );
            seen_power_loss |= plan.is_power_loss();
        }
        assert!(seen_power_loss);
    }

    #[test]
    fn bench_alternates_keyword_and_prefixed_signature() {
        let cfg = bench_cfg();
        let (mut link, _reset) = sim_target(&cfg, None, stop_flag());
        // stay below the fault threshold
        let keyword = link.read_frame(4096).unwrap();
        let payload = link.read_frame(4096).unwrap();
        assert_eq!(keyword, b"Signature:\r\n".to_vec());
        assert!(payload.starts_with(SIGNATURE_PREFIX));
        assert!(payload.ends_with(b"\r\n"));
        assert_eq!(payload.len(), SIGNATURE_PREFIX.len() + 8 + 2);
    }

    #[test]
    fn bench_faults_persist_until_the_reset_line_clears_them() {
        let cfg = bench_cfg();
        let (mut link, mut reset) = sim_target(&cfg, None, stop_flag());

        let clean_payload = {
            let _ = link.read_frame(4096).unwrap();
            link.read_frame(4096).unwrap()
        };

        // Push past the fault-free window; the rotation starts with a
        // damaged payload.
        let mut damaged = None;
        for _ in 0..60 {
            let frame = link.read_frame(4096).unwrap();
            if !frame.is_empty() && frame != b"Signature:\r\n".to_vec() && frame != clean_payload {
                damaged = Some(frame);
                break;
            }
        }
        // The rotation starts with a garbled payload: intact head, 0xff fill.
        let damaged = damaged.expect("the deterministic rotation must damage a frame");
        assert!(damaged.contains(&0xff));

        reset.trigger().unwrap();
        let state = lock(&link.state);
        assert!(state.plan.is_none());
        assert_eq!(state.reads_since_fault, 0);
    }

    #[test]
    fn reset_replays_the_banner() {
        let mut cfg = bench_cfg();
        let banner = std::env::temp_dir().join(format!("emfi-sim-banner-{}.txt", std::process::id()));
        std::fs::write(&banner, "boot v1\nready\n").unwrap();
        cfg.banner_file = Some(banner.clone());

        let (mut link, mut reset) = sim_target(&cfg, None, stop_flag());
        assert_eq!(reset.trigger().unwrap(), "reset");
        assert_eq!(link.read_frame(4096).unwrap(), b"boot v1\r\n".to_vec());
        assert_eq!(link.read_frame(4096).unwrap(), b"ready\r\n".to_vec());
        // banner exhausted, back to the protocol
        assert_eq!(link.read_frame(4096).unwrap(), b"Signature:\r\n".to_vec());

        let _ = std::fs::remove_file(banner);
    }

    #[test]
    fn overlong_frames_are_capped_at_the_read_limit() {
        let frame = SimTargetLink::apply_damage(b"Signature:\r\n".to_vec(), LineDamage::Overlong);
        assert!(frame.len() > 2000);
        let cfg = bench_cfg();
        let (mut link, _reset) = sim_target(&cfg, None, stop_flag());
        lock(&link.state).plan = Some(FaultPlan {
            keyword: LineDamage::Overlong,
            payload: LineDamage::Clean,
        });
        lock(&link.state).reads_since_fault = FAULT_FREE_READS + 1;
        let read = link.read_frame(64).unwrap();
        assert_eq!(read.len(), 64);
    }
}
