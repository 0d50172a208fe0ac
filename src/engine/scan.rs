//! Raster walk across the scan window and the per-position pulse
//! schedule.
//!
//! The probe covers the XY window boustrophedon style: sweep a row
//! along X, drop one step in Y, sweep back. While a position's trial
//! budget drains, the pulse parameters optionally walk a three-stage
//! schedule around their start values.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::UnboundedSender;
use tracing::{error, info, warn};

use crate::engine::generator::{GeneratorController, PulseChange};
use crate::engine::motion::{AxisName, MotionController, MoveOptions};
use crate::engine::{lock, ExperimentState};
use crate::error::{DeviceError, DeviceResult};
use crate::model::{
    Boundaries, ExperimentEvent, InfoEvent, Position, ScanConfig, ScanDirection,
};

/// Next action of the raster walk.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RasterStep {
    /// Move one axis to `target` (relative to the reference point) and
    /// continue scanning in `direction`.
    Move {
        axis: AxisName,
        target: f64,
        direction: ScanDirection,
    },
    /// The walk has covered the whole window.
    Finished,
}

/// Selects the next raster cell from the current relative position.
///
/// Scanning right means X decreases toward `x_right`; left means X
/// increases toward `x_left`. When no X step fits the row is done: the
/// probe drops `step` in Y and the direction flips. No remaining Y drop
/// means the walk is finished.
pub fn next_raster_step(
    position: &Position,
    direction: ScanDirection,
    bounds: &Boundaries,
    step: f64,
) -> RasterStep {
    let row_done = match direction {
        ScanDirection::Right => position.x - step < bounds.x_right,
        ScanDirection::Left => position.x + step > bounds.x_left,
    };

    if row_done {
        if position.y - step < bounds.y_down {
            return RasterStep::Finished;
        }
        return RasterStep::Move {
            axis: AxisName::Y,
            target: position.y - step,
            direction: direction.flipped(),
        };
    }

    let target = match direction {
        ScanDirection::Right => position.x - step,
        ScanDirection::Left => position.x + step,
    };
    RasterStep::Move {
        axis: AxisName::X,
        target,
        direction,
    }
}

/// High-time start rounded down to whole pattern slots, matching what
/// the generator actually programs.
pub fn quantized_high_time_start(cfg: &ScanConfig) -> u32 {
    let slot = cfg.high_time_min_ns.max(1);
    (cfg.high_time_start_ns / slot) * slot
}

/// Stage-1 high time: one slot above the start, unless the start
/// already sits at the ceiling, then one below it.
pub fn raised_high_time(start_ns: u32, cfg: &ScanConfig) -> u32 {
    let inc = cfg.high_time_min_ns;
    if start_ns >= cfg.high_time_max_ns {
        start_ns.saturating_sub(inc)
    } else {
        (start_ns + inc).min(cfg.high_time_max_ns)
    }
}

/// Stage-2 high time: one slot below the start, clamped to the floor.
/// A start at the ceiling drops two slots instead, so both probes of
/// the schedule land below it.
pub fn lowered_high_time(start_ns: u32, cfg: &ScanConfig) -> u32 {
    let inc = cfg.high_time_min_ns;
    if start_ns >= cfg.high_time_max_ns {
        start_ns.saturating_sub(2 * inc)
    } else {
        start_ns.saturating_sub(inc).max(cfg.high_time_min_ns)
    }
}

/// Stage-1 voltage relative to the position's baseline.
pub fn raised_voltage(baseline: u32, cfg: &ScanConfig) -> u32 {
    let inc = cfg.voltage_increment;
    if baseline >= cfg.voltage_max.saturating_sub(inc) {
        baseline.saturating_sub(inc)
    } else {
        (baseline + inc).min(cfg.voltage_max)
    }
}

/// Stage-2 voltage relative to the position's baseline.
pub fn lowered_voltage(baseline: u32, cfg: &ScanConfig) -> u32 {
    let inc = cfg.voltage_increment;
    if baseline >= cfg.voltage_max {
        baseline.saturating_sub(2 * inc)
    } else {
        baseline.saturating_sub(inc).max(cfg.voltage_min)
    }
}

/// Drives position changes. Both the dispatch worker (trial budget
/// exhausted) and the UART listener (voltage floor reached) need to
/// advance the scan, so everything lives behind shared handles and the
/// struct is cheap to clone.
#[derive(Clone)]
pub struct Scanner {
    cfg: Arc<ScanConfig>,
    state: Arc<Mutex<ExperimentState>>,
    motion: Arc<Mutex<MotionController>>,
    generator: Arc<Mutex<GeneratorController>>,
    events: UnboundedSender<ExperimentEvent>,
}

impl Scanner {
    pub fn new(
        cfg: Arc<ScanConfig>,
        state: Arc<Mutex<ExperimentState>>,
        motion: Arc<Mutex<MotionController>>,
        generator: Arc<Mutex<GeneratorController>>,
        events: UnboundedSender<ExperimentEvent>,
    ) -> Self {
        Scanner {
            cfg,
            state,
            motion,
            generator,
            events,
        }
    }

    /// Moves the probe to the next raster cell and resets the
    /// per-position budgets. `Ok(true)` means the walk is complete.
    ///
    /// A failed generator self-test keeps the probe where it is; the
    /// position is then retried with a fresh budget.
    pub fn advance_position(&self) -> DeviceResult<bool> {
        let stage = {
            let mut st = lock(&self.state);
            st.unparseables_at_position = 0;
            st.unparseables_in_a_row = 0;
            st.recovery_attempts_at_position = 0;
            st.tries_left = self.cfg.tries_per_position;
            st.voltage_baseline = self.cfg.voltage_start;
            let stage = st.schedule_stage;
            st.schedule_stage = 0;
            stage
        };

        {
            let mut generator = lock(&self.generator);

            // The device keeps whatever the schedule left behind, so
            // push the start values before the next position begins.
            let restore = PulseChange {
                high_time_ns: Some(quantized_high_time_start(&self.cfg)),
                voltage: Some(self.cfg.voltage_start),
                dead_time_ms: None,
            };
            match generator.change(restore, true) {
                Ok(_) => {}
                Err(DeviceError::Stopped) => return Err(DeviceError::Stopped),
                Err(err) => warn!("Could not restore start pulse settings: {err}"),
            }

            if !generator.self_heal()? {
                info!(
                    "Pulse generator self-test returned negative. Repair concluded. \
                     Repeating the current position."
                );
                return Ok(false);
            }
            generator.request_disable("jogging")?;
        }

        if stage != 2
            && (self.cfg.vary_high_time || self.cfg.vary_voltage)
            && self.cfg.tries_per_position >= 12
        {
            error!("Position finished but the pulse schedule never reached its last stage.");
        }

        let moved = self.step_to_next_cell();

        if let Err(err) = lock(&self.generator).release_disable("jogging") {
            warn!("Could not release the jogging hold: {err}");
        }

        match moved {
            Ok(finished) => Ok(finished),
            Err(err @ DeviceError::Stopped) => Err(err),
            Err(err @ DeviceError::Fatal(_)) => Err(err),
            Err(err) => {
                error!("Jogging failed: {err}");
                Ok(false)
            }
        }
    }

    fn step_to_next_cell(&self) -> DeviceResult<bool> {
        let (position, direction) = {
            let mut st = lock(&self.state);
            st.position_counter += 1;
            (st.position, st.direction)
        };

        let step = next_raster_step(
            &position,
            direction,
            &self.cfg.boundaries,
            self.cfg.step_size_mm,
        );
        let (axis, target, new_direction) = match step {
            RasterStep::Finished => {
                info!(
                    "Scan finished. Current position: {:.3}mm (X), {:.3}mm (Y)",
                    position.x, position.y
                );
                return Ok(true);
            }
            RasterStep::Move {
                axis,
                target,
                direction,
            } => (axis, target, direction),
        };

        let reached = {
            let mut motion = lock(&self.motion);
            motion.move_axes(&[(axis, target)], MoveOptions::default())?;
            motion.store_positions()?
        };

        let index = {
            let mut st = lock(&self.state);
            st.direction = new_direction;
            st.position = reached;
            st.position_counter
        };
        let _ = self.events.send(ExperimentEvent::PositionStarted {
            index,
            position: reached,
        });
        Ok(false)
    }

    /// Reacts to a pile-up of unparseable signatures at the current
    /// position: lower the pulse voltage one increment, or move on to
    /// the next position once the floor is reached. `Ok(true)` means
    /// the scan is complete.
    pub fn reduce_voltage_or_advance(&self) -> DeviceResult<bool> {
        let threshold = (self.cfg.tries_per_position / 3).max(10);
        let unparseables = {
            let mut st = lock(&self.state);
            let seen = st.unparseables_at_position;
            if seen < threshold {
                return Ok(false);
            }
            st.unparseables_at_position = 0;
            st.unparseables_in_a_row = 0;
            st.tries_left = self.cfg.tries_per_position;
            seen
        };

        info!("Received {unparseables} unparseable signatures. Lowering voltage.");

        let inc = self.cfg.voltage_increment;
        let current = lock(&self.generator).settings().voltage;

        if current > self.cfg.voltage_min + inc {
            let lowered = current - inc;
            {
                let mut st = lock(&self.state);
                st.voltage_baseline = st.voltage_baseline.saturating_sub(inc);
            }
            let change = PulseChange {
                voltage: Some(lowered),
                ..PulseChange::default()
            };
            let outcome = lock(&self.generator).change(change, false)?;
            if outcome.voltage_changed {
                let mut st = lock(&self.state);
                st.unparseables_at_position = 0;
                st.recovery_attempts_at_position = 0;
            }
            let _ = self
                .events
                .send(ExperimentEvent::Info(InfoEvent::VoltageLowered {
                    volts: lowered,
                }));
            Ok(false)
        } else {
            warn!("Voltage already too low ({current} V). Jogging to next position.");
            lock(&self.state).schedule_stage = 0;
            self.advance_position()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window() -> Boundaries {
        Boundaries {
            x_left: 10.0,
            x_right: 0.0,
            y_up: 10.0,
            y_down: 0.0,
            z_up: 0.0,
            z_down: 5.0,
        }
    }

    fn at(x: f64, y: f64) -> Position {
        Position { x, y, z: 5.0 }
    }

    #[test]
    fn steps_right_by_decreasing_x() {
        let step = next_raster_step(&at(5.0, 10.0), ScanDirection::Right, &window(), 1.0);
        assert_eq!(
            step,
            RasterStep::Move {
                axis: AxisName::X,
                target: 4.0,
                direction: ScanDirection::Right,
            }
        );
    }

    #[test]
    fn row_end_drops_a_row_and_flips_direction() {
        let step = next_raster_step(&at(0.0, 10.0), ScanDirection::Right, &window(), 1.0);
        assert_eq!(
            step,
            RasterStep::Move {
                axis: AxisName::Y,
                target: 9.0,
                direction: ScanDirection::Left,
            }
        );
    }

    #[test]
    fn finishes_in_the_last_corner() {
        let step = next_raster_step(&at(0.0, 0.0), ScanDirection::Right, &window(), 1.0);
        assert_eq!(step, RasterStep::Finished);

        let step = next_raster_step(&at(10.0, 0.0), ScanDirection::Left, &window(), 1.0);
        assert_eq!(step, RasterStep::Finished);
    }

    #[test]
    fn walk_covers_every_cell_of_the_window() {
        let bounds = window();
        let mut position = at(bounds.x_left, bounds.y_up);
        let mut direction = ScanDirection::Right;
        let mut cells = 1u32;

        loop {
            match next_raster_step(&position, direction, &bounds, 1.0) {
                RasterStep::Finished => break,
                RasterStep::Move {
                    axis,
                    target,
                    direction: dir,
                } => {
                    match axis {
                        AxisName::X => position.x = target,
                        AxisName::Y => position.y = target,
                        AxisName::Z => panic!("raster walk must not move Z"),
                    }
                    direction = dir;
                    cells += 1;
                    assert!(position.x >= bounds.x_right - 1e-9);
                    assert!(position.x <= bounds.x_left + 1e-9);
                    assert!(position.y >= bounds.y_down - 1e-9);
                    assert!(cells <= 200, "walk did not terminate");
                }
            }
        }

        // 11 columns x 11 rows for a 10mm window at 1mm steps.
        assert_eq!(cells, 121);
    }

    #[test]
    fn high_time_schedule_probes_above_then_below_start() {
        let cfg = ScanConfig::baseline("test");
        assert_eq!(quantized_high_time_start(&cfg), 60);
        assert_eq!(raised_high_time(60, &cfg), 80);
        assert_eq!(lowered_high_time(60, &cfg), 40);
        // Floor is one slot.
        assert_eq!(lowered_high_time(20, &cfg), 20);
    }

    #[test]
    fn high_time_start_at_ceiling_probes_below_twice() {
        let cfg = ScanConfig::baseline("test");
        let max = cfg.high_time_max_ns;
        assert_eq!(raised_high_time(max, &cfg), max - 20);
        assert_eq!(lowered_high_time(max, &cfg), max - 40);
    }

    #[test]
    fn voltage_schedule_probes_above_then_below_baseline() {
        let cfg = ScanConfig::baseline("test");
        assert_eq!(raised_voltage(280, &cfg), 290);
        assert_eq!(lowered_voltage(280, &cfg), 270);
        assert_eq!(lowered_voltage(150, &cfg), 150);
    }

    #[test]
    fn voltage_near_ceiling_probes_below() {
        let cfg = ScanConfig::baseline("test");
        // 490 + 10 would hit the 500V limit.
        assert_eq!(raised_voltage(490, &cfg), 480);
        assert_eq!(raised_voltage(500, &cfg), 490);
        assert_eq!(lowered_voltage(500, &cfg), 480);
    }

    #[test]
    fn odd_high_time_start_rounds_down_to_slots() {
        let mut cfg = ScanConfig::baseline("test");
        cfg.high_time_start_ns = 70;
        assert_eq!(quantized_high_time_start(&cfg), 60);
    }
}
