//! XYZ stage control.
//!
//! Movement targets for X and Y are in mm relative to the reference
//! point; Z always travels in absolute stage coordinates. Every move is
//! verified against the encoder readback and re-tried once via homing
//! when it lands measurably off target.

use crate::error::{DeviceError, DeviceResult};
use crate::model::{Boundaries, Position, ReferencePoint, ScanConfig};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

const STAGE: &str = "motion stage";

/// MTS50-Z8 stage parameters: encoder counts per mm and the velocity
/// and acceleration scale factors.
pub const STAGE_SCALE: (f64, f64, f64) = (34554.96, 772981.3692, 263.8443072);
pub const MAX_VELOCITY_MM_S: f64 = 2.4;
pub const ACCELERATION_MM_S2: f64 = 1.5;
pub const MAX_TRAVEL_MM: f64 = 50.0;
/// A finished move may be off by less than this before we re-home.
pub const DIVERGENCE_LIMIT_MM: f64 = 0.01;
const PARAM_TOLERANCE: f64 = 0.1;
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AxisName {
    X,
    Y,
    Z,
}

impl AxisName {
    pub const ALL: [AxisName; 3] = [AxisName::X, AxisName::Y, AxisName::Z];
}

impl std::fmt::Display for AxisName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AxisName::X => "X",
            AxisName::Y => "Y",
            AxisName::Z => "Z",
        };
        f.write_str(s)
    }
}

/// Blocking control surface of one stage axis.
pub trait Axis: Send {
    fn is_homed(&mut self) -> DeviceResult<bool>;
    fn home(&mut self) -> DeviceResult<()>;
    fn wait_for_home(&mut self) -> DeviceResult<()>;
    fn is_moving(&mut self) -> DeviceResult<bool>;
    fn wait_for_stop(&mut self) -> DeviceResult<()>;
    /// Absolute stage target in mm.
    fn move_to(&mut self, position_mm: f64) -> DeviceResult<()>;
    fn position(&mut self) -> DeviceResult<f64>;
    fn scale(&mut self) -> DeviceResult<(f64, f64, f64)>;
    /// Minimum velocity, acceleration, maximum velocity.
    fn velocity_parameters(&mut self) -> DeviceResult<(f64, f64, f64)>;
    fn scale_units(&mut self) -> DeviceResult<String>;
    fn close(&mut self);
}

pub type AxisMap = BTreeMap<AxisName, Box<dyn Axis>>;
/// Builds a fresh axis map; used at startup and by the self-heal path.
pub type AxisFactory = Box<dyn FnMut() -> DeviceResult<AxisMap> + Send>;

#[derive(Debug, Clone, Copy)]
pub struct MoveOptions {
    pub ignore_divergence: bool,
    pub lift_z: bool,
    /// Bypasses the movement gate (used for parking and recovery moves).
    pub force: bool,
    pub relative: bool,
}

impl Default for MoveOptions {
    fn default() -> Self {
        MoveOptions {
            ignore_divergence: false,
            lift_z: true,
            force: false,
            relative: true,
        }
    }
}

pub struct MotionController {
    axes: AxisMap,
    factory: AxisFactory,
    boundaries: Boundaries,
    reference: ReferencePoint,
    allow_movement: bool,
    stop: Arc<AtomicBool>,
}

impl MotionController {
    /// Build the axes, verify their motor parameters, and home them.
    pub fn new(
        mut factory: AxisFactory,
        cfg: &ScanConfig,
        stop: Arc<AtomicBool>,
    ) -> DeviceResult<Self> {
        info!("initializing the motion controllers");
        let mut axes = factory()?;
        Self::validate_axes(&mut axes)?;
        let mut ctl = MotionController {
            axes,
            factory,
            boundaries: cfg.boundaries,
            reference: cfg.reference,
            allow_movement: cfg.allow_movement,
            stop,
        };
        ctl.home_axes()?;
        Ok(ctl)
    }

    fn validate_axes(axes: &mut AxisMap) -> DeviceResult<()> {
        if axes.len() != AxisName::ALL.len() || !AxisName::ALL.iter().all(|n| axes.contains_key(n))
        {
            return Err(DeviceError::Fatal(format!(
                "expected axes X, Y and Z but found {:?}",
                axes.keys().collect::<Vec<_>>()
            )));
        }
        info!("checking motor parameters");
        for (name, axis) in axes.iter_mut() {
            let scale = axis.scale()?;
            let close = |a: f64, b: f64| (a - b).abs() < 1e-6;
            if !(close(scale.0, STAGE_SCALE.0)
                && close(scale.1, STAGE_SCALE.1)
                && close(scale.2, STAGE_SCALE.2))
            {
                return Err(DeviceError::Fatal(format!(
                    "axis {name} reports scale {scale:?} instead of {STAGE_SCALE:?}"
                )));
            }
            let (_, accel, max_v) = axis.velocity_parameters()?;
            if max_v > MAX_VELOCITY_MM_S {
                return Err(DeviceError::Fatal(format!(
                    "axis {name} has max velocity {max_v} instead of {MAX_VELOCITY_MM_S}"
                )));
            }
            if accel > ACCELERATION_MM_S2 {
                return Err(DeviceError::Fatal(format!(
                    "axis {name} has acceleration {accel} instead of {ACCELERATION_MM_S2}"
                )));
            }
            let mut notes = Vec::new();
            if MAX_VELOCITY_MM_S - max_v > PARAM_TOLERANCE {
                notes.push(format!("max velocity is {max_v} instead of {MAX_VELOCITY_MM_S}"));
            }
            if ACCELERATION_MM_S2 - accel > PARAM_TOLERANCE {
                notes.push(format!("acceleration is {accel} instead of {ACCELERATION_MM_S2}"));
            }
            if axis.scale_units()? != "user" {
                notes.push("does not report user-supplied scale units".to_string());
            }
            if notes.is_empty() {
                info!("   - {name}: OK");
            } else {
                info!("   - {name}: OK, warnings: {}", notes.join(", "));
            }
        }
        Ok(())
    }

    /// Home every axis that lost its home flag. A homed Z is parked at
    /// zero first so nothing is dragged across the target.
    pub fn home_axes(&mut self) -> DeviceResult<()> {
        self.home_subset(&AxisName::ALL)
    }

    fn home_subset(&mut self, names: &[AxisName]) -> DeviceResult<()> {
        info!("homing axes {names:?}");
        let mut required = false;
        for name in names {
            if !self.axis(*name)?.is_homed()? {
                required = true;
                break;
            }
        }
        if !required {
            info!("no homing required");
            return Ok(());
        }
        if names.contains(&AxisName::Z) {
            let z = self.axis(AxisName::Z)?;
            if z.is_homed()? {
                z.move_to(0.0)?;
                z.wait_for_stop()?;
            } else {
                z.home()?;
            }
        }
        for name in names {
            let axis = self.axis(*name)?;
            if !axis.is_homed()? {
                axis.home()?;
            }
        }
        for name in names {
            let axis = self.axis(*name)?;
            if !axis.is_homed()? {
                axis.wait_for_home()?;
            }
            let position = axis.position()?;
            info!("   - {name}: homed, position {position:.5} mm");
        }
        Ok(())
    }

    /// Current probe position: X/Y relative to the reference point, Z
    /// absolute. Read failures rebuild the axes and try again.
    pub fn store_positions(&mut self) -> DeviceResult<Position> {
        loop {
            self.bail_if_stopping()?;
            match self.read_positions() {
                Ok(p) => return Ok(p),
                Err(e) => {
                    error!(error = %e, "cannot read axis positions, rebuilding the axes");
                    self.selfheal_axes()?;
                }
            }
        }
    }

    fn read_positions(&mut self) -> DeviceResult<Position> {
        let reference = self.reference;
        let mut values = [0.0f64; 3];
        for (i, name) in AxisName::ALL.iter().enumerate() {
            let axis = self.axis(*name)?;
            if axis.is_moving()? {
                axis.wait_for_stop()?;
            }
            let absolute = axis.position()?;
            values[i] = match name {
                AxisName::X => absolute - reference.x,
                AxisName::Y => absolute - reference.y,
                AxisName::Z => absolute,
            };
        }
        Ok(Position {
            x: values[0],
            y: values[1],
            z: values[2],
        })
    }

    /// Execute a set of axis moves. Unless suppressed, Z is lifted to
    /// its upper boundary first and lowered to the probing height after
    /// all other axes settled. Hardware failures rebuild the axes and
    /// repeat the move.
    pub fn move_axes(&mut self, moves: &[(AxisName, f64)], opts: MoveOptions) -> DeviceResult<()> {
        if !(self.allow_movement || opts.force) {
            debug!("movement is disabled, ignoring the move request");
            return Ok(());
        }
        if moves.is_empty() {
            return Err(DeviceError::rejected("no movements provided"));
        }
        self.validate_moves(moves, opts)?;

        let mut opts = opts;
        loop {
            self.bail_if_stopping()?;
            match self.move_axes_once(moves, opts) {
                Ok(()) => return Ok(()),
                Err(
                    e @ (DeviceError::Stopped | DeviceError::Rejected { .. } | DeviceError::Fatal(_)),
                ) => return Err(e),
                Err(e) => {
                    error!(error = %e, "movement failed, rebuilding the axes and repeating");
                    self.selfheal_axes()?;
                    opts.force = true;
                }
            }
        }
    }

    fn validate_moves(&mut self, moves: &[(AxisName, f64)], opts: MoveOptions) -> DeviceResult<()> {
        for (name, target) in moves {
            let absolute = self.absolute_target(*name, *target, opts.relative);
            if !absolute.is_finite() || absolute >= MAX_TRAVEL_MM {
                error!(
                    axis = %name,
                    target = absolute,
                    "movement beyond {MAX_TRAVEL_MM} mm stage travel, stopping"
                );
                self.stop.store(true, Ordering::SeqCst);
                return Err(DeviceError::rejected(format!(
                    "{name} target {absolute} mm is outside the stage travel"
                )));
            }
        }
        Ok(())
    }

    fn move_axes_once(&mut self, moves: &[(AxisName, f64)], opts: MoveOptions) -> DeviceResult<()> {
        let moves_z = moves.iter().any(|(n, _)| *n == AxisName::Z);
        let lift = opts.lift_z && !moves_z;
        let overview = moves
            .iter()
            .map(|(n, t)| format!("{n} to {t:.3} mm"))
            .collect::<Vec<_>>()
            .join(" and ");
        debug!("moving {overview}");

        if lift {
            let z_up = self.boundaries.z_up;
            let z = self.axis(AxisName::Z)?;
            z.move_to(z_up)?;
            z.wait_for_stop()?;
        }

        let mut results = Vec::new();
        for (name, target) in moves {
            let absolute = self.absolute_target(*name, *target, opts.relative);
            {
                let axis = self.axis(*name)?;
                if axis.is_moving()? {
                    info!("   - waiting for {name} to finish its prior movement");
                    axis.wait_for_stop()?;
                }
                axis.move_to(absolute)?;
                axis.wait_for_stop()?;
            }
            let mut achieved = self.relative_position(*name, opts.relative)?;
            let mut divergence = (target - achieved).abs();
            if divergence >= DIVERGENCE_LIMIT_MM && !opts.ignore_divergence {
                error!(
                    axis = %name,
                    achieved,
                    target,
                    "axis landed off target by {divergence:.5} mm, homing and retrying"
                );
                self.retry_movement(*name, *target, opts.relative)?;
                achieved = self.relative_position(*name, opts.relative)?;
                divergence = (target - achieved).abs();
                if divergence >= DIVERGENCE_LIMIT_MM {
                    error!(
                        axis = %name,
                        achieved,
                        target,
                        "axis still off target after homing, aborting the run"
                    );
                    self.stop.store(true, Ordering::SeqCst);
                    return Err(DeviceError::Fatal(format!(
                        "axis {name} diverges by {divergence:.5} mm even after homing"
                    )));
                }
            }
            results.push(format!("{name} -> {achieved:.3} (div +-{divergence:.5} mm)"));
        }

        if lift {
            let z_down = self.boundaries.z_down;
            let z = self.axis(AxisName::Z)?;
            z.move_to(z_down)?;
            z.wait_for_stop()?;
        }
        info!("moved | {}", results.join(" | "));
        Ok(())
    }

    /// Park Z out of the way, re-home the offending axis, and repeat
    /// its move with divergence checking off.
    fn retry_movement(&mut self, name: AxisName, target: f64, relative: bool) -> DeviceResult<()> {
        info!(axis = %name, "retrying the movement");
        let z_prev = if name != AxisName::Z {
            let z_prev = self.axis(AxisName::Z)?.position()?;
            self.move_axes(
                &[(AxisName::Z, 0.0)],
                MoveOptions {
                    force: true,
                    ..Default::default()
                },
            )?;
            Some(z_prev)
        } else {
            None
        };

        loop {
            self.bail_if_stopping()?;
            match self.home_subset(&[name]) {
                Ok(()) => break,
                Err(e) => {
                    error!(error = %e, axis = %name, "homing failed, rebuilding the axes");
                    self.selfheal_axes()?;
                }
            }
        }

        self.move_axes(
            &[(name, target)],
            MoveOptions {
                ignore_divergence: true,
                force: true,
                relative,
                ..Default::default()
            },
        )?;

        if let Some(z_prev) = z_prev {
            self.move_axes(
                &[(AxisName::Z, z_prev)],
                MoveOptions {
                    force: true,
                    ..Default::default()
                },
            )?;
        }
        Ok(())
    }

    /// Tear down and rebuild all axes, re-validate, and re-home.
    pub fn selfheal_axes(&mut self) -> DeviceResult<()> {
        info!("re-initializing the motion controllers");
        self.close_all();
        let mut fresh = (self.factory)()?;
        Self::validate_axes(&mut fresh)?;
        self.axes = fresh;
        self.home_axes()
    }

    pub fn close_all(&mut self) {
        for (name, axis) in self.axes.iter_mut() {
            debug!("closing axis {name}");
            axis.close();
        }
    }

    fn absolute_target(&self, name: AxisName, target: f64, relative: bool) -> f64 {
        if relative && name != AxisName::Z {
            target + self.axis_reference(name)
        } else {
            target
        }
    }

    fn relative_position(&mut self, name: AxisName, relative: bool) -> DeviceResult<f64> {
        let reference = self.axis_reference(name);
        let absolute = self.axis(name)?.position()?;
        if relative && name != AxisName::Z {
            Ok(absolute - reference)
        } else {
            Ok(absolute)
        }
    }

    fn axis_reference(&self, name: AxisName) -> f64 {
        match name {
            AxisName::X => self.reference.x,
            AxisName::Y => self.reference.y,
            AxisName::Z => 0.0,
        }
    }

    fn axis(&mut self, name: AxisName) -> DeviceResult<&mut Box<dyn Axis>> {
        self.axes
            .get_mut(&name)
            .ok_or_else(|| DeviceError::needs_reconnect(STAGE, format!("axis {name} is missing")))
    }

    fn bail_if_stopping(&self) -> DeviceResult<()> {
        if self.stop.load(Ordering::SeqCst) {
            return Err(DeviceError::Stopped);
        }
        Ok(())
    }
}

/// One stage axis behind a serial console, same line discipline as the
/// generator: one command per line, `err`-prefixed failures.
pub struct SerialAxis {
    port_path: String,
    baud: u32,
    link: Option<Box<dyn serialport::SerialPort>>,
    stop: Arc<AtomicBool>,
}

impl SerialAxis {
    pub fn open(
        port_path: impl Into<String>,
        baud: u32,
        stop: Arc<AtomicBool>,
    ) -> DeviceResult<Self> {
        let port_path = port_path.into();
        let link = serialport::new(port_path.as_str(), baud)
            .timeout(REPLY_TIMEOUT)
            .open()?;
        Ok(SerialAxis {
            port_path,
            baud,
            link: Some(link),
            stop,
        })
    }

    fn command(&mut self, cmd: &str) -> DeviceResult<String> {
        let port = self
            .link
            .as_mut()
            .ok_or_else(|| DeviceError::needs_reconnect(STAGE, "serial link not open"))?;
        port.write_all(cmd.as_bytes())?;
        port.write_all(b"\r\n")?;
        port.flush()?;
        let mut reply = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match port.read(&mut byte) {
                Ok(0) => return Err(DeviceError::needs_reconnect(STAGE, "serial link closed")),
                Ok(_) => {
                    if byte[0] == b'\n' {
                        break;
                    }
                    if byte[0] != b'\r' {
                        reply.push(byte[0]);
                    }
                    if reply.len() > 256 {
                        return Err(DeviceError::Protocol("oversized axis reply".into()));
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    return Err(DeviceError::Timeout {
                        what: "axis reply",
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

    fn query_bool(&mut self, cmd: &str) -> DeviceResult<bool> {
        let reply = self.command(cmd)?;
        match reply.as_str() {
            "0" => Ok(false),
            "1" => Ok(true),
            other => Err(DeviceError::Protocol(format!(
                "expected 0 or 1, got '{other}'"
            ))),
        }
    }

    fn query_f64(&mut self, cmd: &str) -> DeviceResult<f64> {
        let reply = self.command(cmd)?;
        reply
            .parse()
            .map_err(|_| DeviceError::Protocol(format!("expected a number, got '{reply}'")))
    }

    fn poll_until_clear(&mut self, cmd: &'static str) -> DeviceResult<()> {
        loop {
            if self.stop.load(Ordering::SeqCst) {
                return Err(DeviceError::Stopped);
            }
            if !self.query_bool(cmd)? {
                return Ok(());
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

impl Axis for SerialAxis {
    fn is_homed(&mut self) -> DeviceResult<bool> {
        self.query_bool("homed")
    }

    fn home(&mut self) -> DeviceResult<()> {
        self.command("home")?;
        Ok(())
    }

    fn wait_for_home(&mut self) -> DeviceResult<()> {
        loop {
            if self.stop.load(Ordering::SeqCst) {
                return Err(DeviceError::Stopped);
            }
            if self.query_bool("homed")? {
                return Ok(());
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn is_moving(&mut self) -> DeviceResult<bool> {
        self.query_bool("moving")
    }

    fn wait_for_stop(&mut self) -> DeviceResult<()> {
        self.poll_until_clear("moving")
    }

    fn move_to(&mut self, position_mm: f64) -> DeviceResult<()> {
        self.command(&format!("move {position_mm:.5}"))?;
        Ok(())
    }

    fn position(&mut self) -> DeviceResult<f64> {
        self.query_f64("position")
    }

    fn scale(&mut self) -> DeviceResult<(f64, f64, f64)> {
        let reply = self.command("scale")?;
        let parts: Vec<&str> = reply.split(',').map(str::trim).collect();
        if parts.len() != 3 {
            return Err(DeviceError::Protocol(format!(
                "expected three scale factors, got '{reply}'"
            )));
        }
        let parse = |s: &str| {
            s.parse::<f64>()
                .map_err(|_| DeviceError::Protocol(format!("bad scale factor '{s}'")))
        };
        Ok((parse(parts[0])?, parse(parts[1])?, parse(parts[2])?))
    }

    fn velocity_parameters(&mut self) -> DeviceResult<(f64, f64, f64)> {
        let reply = self.command("velocity")?;
        let parts: Vec<&str> = reply.split(',').map(str::trim).collect();
        if parts.len() != 3 {
            return Err(DeviceError::Protocol(format!(
                "expected three velocity parameters, got '{reply}'"
            )));
        }
        let parse = |s: &str| {
            s.parse::<f64>()
                .map_err(|_| DeviceError::Protocol(format!("bad velocity parameter '{s}'")))
        };
        Ok((parse(parts[0])?, parse(parts[1])?, parse(parts[2])?))
    }

    fn scale_units(&mut self) -> DeviceResult<String> {
        self.command("units")
    }

    fn close(&mut self) {
        self.link = None;
        debug!(port = %self.port_path, baud = self.baud, "closed axis link");
    }
}

/// Factory opening one serial link per stage axis. The self-heal path
/// calls it again with the same ports whenever a link goes dead.
pub fn serial_axis_map(cfg: &ScanConfig, stop: Arc<AtomicBool>) -> DeviceResult<AxisFactory> {
    let mut ports = Vec::new();
    for (name, path) in [
        (AxisName::X, cfg.x_port.clone()),
        (AxisName::Y, cfg.y_port.clone()),
        (AxisName::Z, cfg.z_port.clone()),
    ] {
        match path {
            Some(path) => ports.push((name, path)),
            None => {
                return Err(DeviceError::Fatal(format!(
                    "no serial port configured for the {name} axis"
                )))
            }
        }
    }
    let baud = cfg.stage_baud;
    Ok(Box::new(move || {
        let mut map = AxisMap::new();
        for (name, path) in &ports {
            let axis = SerialAxis::open(path.as_str(), baud, stop.clone())?;
            map.insert(*name, Box::new(axis));
        }
        Ok(map)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::sim::{sim_axis_map, SimAxisHandles};

    fn controller(cfg: &ScanConfig) -> (MotionController, SimAxisHandles) {
        let (factory, handles) = sim_axis_map();
        let stop = Arc::new(AtomicBool::new(false));
        let ctl = MotionController::new(factory, cfg, stop).unwrap();
        (ctl, handles)
    }

    #[test]
    fn x_and_y_move_relative_to_the_reference_point() {
        let mut cfg = ScanConfig::baseline("testchip");
        cfg.reference = ReferencePoint { x: 2.0, y: 3.0 };
        let (mut ctl, handles) = controller(&cfg);

        ctl.move_axes(&[(AxisName::X, 4.0)], MoveOptions::default())
            .unwrap();
        assert!((handles.x.position() - 6.0).abs() < 1e-9);

        let position = ctl.store_positions().unwrap();
        assert!((position.x - 4.0).abs() < 1e-9);
    }

    #[test]
    fn z_travels_in_absolute_coordinates() {
        let mut cfg = ScanConfig::baseline("testchip");
        cfg.reference = ReferencePoint { x: 2.0, y: 3.0 };
        let (mut ctl, handles) = controller(&cfg);

        ctl.move_axes(&[(AxisName::Z, 4.5)], MoveOptions::default())
            .unwrap();
        assert!((handles.z.position() - 4.5).abs() < 1e-9);
    }

    #[test]
    fn z_lifts_before_and_lowers_after_lateral_moves() {
        let cfg = ScanConfig::baseline("testchip");
        let (mut ctl, handles) = controller(&cfg);

        ctl.move_axes(&[(AxisName::X, 5.0)], MoveOptions::default())
            .unwrap();
        let z_moves = handles.z.move_history();
        let first = z_moves.first().copied();
        let last = z_moves.last().copied();
        assert_eq!(first, Some(cfg.boundaries.z_up));
        assert_eq!(last, Some(cfg.boundaries.z_down));
        assert!((handles.z.position() - cfg.boundaries.z_down).abs() < 1e-9);
    }

    #[test]
    fn one_off_divergence_is_fixed_by_homing() {
        let cfg = ScanConfig::baseline("testchip");
        let (mut ctl, handles) = controller(&cfg);

        handles.x.set_drift_once(0.05);
        ctl.move_axes(&[(AxisName::X, 5.0)], MoveOptions::default())
            .unwrap();
        assert!((handles.x.position() - 5.0).abs() < DIVERGENCE_LIMIT_MM);
    }

    #[test]
    fn persistent_divergence_aborts_the_run() {
        let cfg = ScanConfig::baseline("testchip");
        let (factory, handles) = sim_axis_map();
        let stop = Arc::new(AtomicBool::new(false));
        let mut ctl = MotionController::new(factory, &cfg, stop.clone()).unwrap();

        handles.x.set_drift_every(0.05);
        let err = ctl
            .move_axes(&[(AxisName::X, 5.0)], MoveOptions::default())
            .unwrap_err();
        assert!(matches!(err, DeviceError::Fatal(_)));
        assert!(stop.load(Ordering::SeqCst));
    }

    #[test]
    fn moves_beyond_stage_travel_are_rejected() {
        let cfg = ScanConfig::baseline("testchip");
        let (mut ctl, _handles) = controller(&cfg);
        let err = ctl
            .move_axes(&[(AxisName::X, MAX_TRAVEL_MM + 1.0)], MoveOptions::default())
            .unwrap_err();
        assert!(matches!(err, DeviceError::Rejected { .. }));
    }

    #[test]
    fn movement_gate_blocks_unforced_moves() {
        let mut cfg = ScanConfig::baseline("testchip");
        cfg.allow_movement = false;
        let (mut ctl, handles) = controller(&cfg);
        let before = handles.x.move_history().len();
        ctl.move_axes(&[(AxisName::X, 5.0)], MoveOptions::default())
            .unwrap();
        assert_eq!(handles.x.move_history().len(), before);

        ctl.move_axes(
            &[(AxisName::X, 5.0)],
            MoveOptions {
                force: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(handles.x.move_history().len() > before);
    }
}
