//! G-code Parser and Dispatcher
//!
//! This module provides a parser for G-code commands and a central dispatcher
//! that receives commands from a channel, feeds them through the `motion`
//! crate's G-code motion state machine / arc interpolator / toolhead, and
//! forwards the resulting moves to the MCU client.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::sync::mpsc::{Receiver, Sender};
use tracing::{info, warn};

use motion::arc::{plan_arc, Plane};
use motion::coord::{AxisSet, Coord};
use motion::gcode_state::{GCodeMove, Params};
use motion::kinematics::{CartKinematics, NullStepper, Rail};
use motion::toolhead::{McuClock, Toolhead};

use crate::{
    config::PrinterConfig,
    state::{Position, PrinterState, ToolheadStatus},
};

/// A command to be sent to the MCU. The motion core's own step-time solver
/// is out of scope for this crate (see `motion::kinematics::StepperHandle`);
/// this is the wire-level command this host hands to whatever transport is
/// actually talking to a board (`mcu_client`/virtual printer/mock).
#[derive(Debug, Clone)]
pub enum McuCommand {
    Move { target: Coord, speed: f64 },
    Home,
    EmergencyStop,
    GetTemp,
}

/// Represents a single parsed G-code command.
///
/// Two parameter shapes coexist in the surface this dispatcher accepts:
/// classic axis-letter-prefixed numbers (`G1 X10 F600`) and the
/// `KEYWORD=value` form used by the named utility commands (`SET_GCODE_OFFSET
/// X_ADJUST=0.2 MOVE=1`, `SAVE_GCODE_STATE NAME=pre_probe`). Both are
/// tokenized here; handlers pick whichever shape their command uses.
#[derive(Debug, PartialEq, Clone, Default)]
pub struct GCode {
    pub command: String,
    pub params: Vec<(char, f32)>,
    pub named: Vec<(String, String)>,
}

impl GCode {
    pub fn named(&self, key: &str) -> Option<&str> {
        self.named.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn named_f64(&self, key: &str) -> Option<f64> {
        self.named(key).and_then(|v| v.parse().ok())
    }

    pub fn named_bool(&self, key: &str, default: bool) -> bool {
        self.named_f64(key).map(|v| v != 0.0).unwrap_or(default)
    }
}

/// G-code parser that handles commands, parameters, and comments.
pub fn parse_gcode(line: &str) -> Option<GCode> {
    let clean_line = line.split(';').next().unwrap_or("").trim();
    if clean_line.is_empty() {
        return None;
    }

    let mut parts = clean_line.split_whitespace();
    let command = parts.next()?.to_uppercase();
    let mut params = Vec::new();
    let mut named = Vec::new();

    for part in parts {
        if let Some((key, value)) = part.split_once('=') {
            named.push((key.to_uppercase(), value.to_string()));
            continue;
        }
        let mut chars = part.chars();
        if let Some(key) = chars.next() {
            let value_str = chars.as_str();
            if let Ok(value) = value_str.parse::<f32>() {
                params.push((key.to_ascii_uppercase(), value));
            }
        }
    }

    Some(GCode { command, params, named })
}

/// Stands in for the (out-of-scope) MCU clock-sync layer: reports elapsed
/// wall-clock time as the print time the board has already reached. A real
/// deployment replaces this with a clock derived from the serial link's
/// clock-sync messages.
struct HostClock {
    started: Instant,
}

impl HostClock {
    fn new() -> Self {
        HostClock { started: Instant::now() }
    }
}

impl McuClock for HostClock {
    fn estimated_print_time(&self, _system_time: f64) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    fn flush_moves(&mut self, upto_print_time: f64) {
        tracing::trace!(upto_print_time, "flushing queued step generation");
    }
}

fn axis_letter_for_stepper(name: &str) -> Option<char> {
    name.strip_prefix("stepper_")?.chars().next().map(|c| c.to_ascii_uppercase())
}

fn build_primary_group(config: &PrinterConfig) -> CartKinematics {
    let mut group = CartKinematics::new_primary(config.printer.max_velocity, config.printer.max_accel);
    group.max_z_velocity = config.printer.max_z_velocity;
    group.max_z_accel = config.printer.max_z_accel;
    for (name, stepper) in &config.steppers {
        let Some(letter) = axis_letter_for_stepper(name) else { continue };
        if !matches!(letter, 'X' | 'Y' | 'Z') {
            continue;
        }
        let mut rail = Rail::new(name.clone(), stepper.position_min, stepper.position_max, stepper.position_endstop);
        rail.homing_speed = stepper.homing_speed;
        rail.second_homing_speed = stepper.second_homing_speed;
        rail.homing_retract_dist = stepper.homing_retract_dist;
        rail.homing_direction = stepper.homing_direction;
        rail.steppers.push(Box::new(NullStepper::default()));
        group.rails.push(rail);
    }
    group
}

fn build_abc_group(config: &PrinterConfig, letters: &str) -> CartKinematics {
    let full = AxisSet::xyzabc();
    let axis_names: Vec<char> = letters.chars().map(|c| c.to_ascii_uppercase()).collect();
    let axis_indices: Vec<usize> = axis_names.iter().filter_map(|&c| full.index_of(c)).collect();
    let mut group = CartKinematics::new_abc(
        axis_names.clone(),
        axis_indices,
        config.printer.max_velocity,
        config.printer.max_accel,
    );
    for &letter in &axis_names {
        let name = format!("stepper_{}", letter.to_ascii_lowercase());
        if let Some((_, stepper)) = config.steppers.iter().find(|(n, _)| n == &name) {
            let mut rail = Rail::new(name.clone(), stepper.position_min, stepper.position_max, stepper.position_endstop);
            rail.homing_speed = stepper.homing_speed;
            rail.second_homing_speed = stepper.second_homing_speed;
            rail.homing_retract_dist = stepper.homing_retract_dist;
            rail.homing_direction = stepper.homing_direction;
            rail.steppers.push(Box::new(NullStepper::default()));
            group.rails.push(rail);
        }
    }
    group
}

/// The central dispatcher for processing G-code commands.
pub struct GCodeDispatcher {
    state: Arc<Mutex<PrinterState>>,
    mcu_tx: Sender<McuCommand>,
    gcode_move: GCodeMove,
    toolhead: Toolhead<HostClock>,
    arc_resolution: f64,
    /// Active arc plane, selected by G17/G18/G19 (default G17/XY).
    plane: Plane,
}

impl GCodeDispatcher {
    /// Creates a new `GCodeDispatcher`, wiring the configured steppers into
    /// the toolhead's primary (and, if configured, ABC) kinematic group.
    pub fn new(config: Arc<PrinterConfig>, state: Arc<Mutex<PrinterState>>, mcu_tx: Sender<McuCommand>) -> Self {
        let mut toolhead = Toolhead::new(config.printer.to_toolhead_config(), HostClock::new());
        toolhead.groups[0] = ("XYZ".to_string(), build_primary_group(&config));
        if let Some(abc) = &config.printer.kinematics_abc {
            toolhead.add_group(abc.to_uppercase(), build_abc_group(&config, abc));
        }

        Self {
            state,
            mcu_tx,
            gcode_move: GCodeMove::new(AxisSet::xyz()),
            arc_resolution: config.printer.arc_resolution,
            plane: Plane::Xy,
            toolhead,
        }
    }

    /// The main run loop that listens for and processes G-code commands.
    pub async fn run(&mut self, mut gcode_rx: Receiver<GCode>) {
        info!("G-code dispatcher is running.");
        while let Some(gcode) = gcode_rx.recv().await {
            info!("Dispatching G-code: {:?}", gcode);
            if let Err(e) = self.dispatch(gcode).await {
                warn!("Error dispatching G-code: {}", e);
            }
        }
    }

    fn params_f64(gcode: &GCode) -> Params {
        Params(gcode.params.iter().map(|&(c, v)| (c, v as f64)).collect())
    }

    /// Routes a G-code command to the appropriate handler. `pub(crate)` so
    /// the batch processor can drive the dispatcher one line at a time
    /// without a channel in between.
    pub(crate) async fn dispatch(&mut self, gcode: GCode) -> Result<()> {
        match gcode.command.as_str() {
            "G0" | "G1" => self.handle_linear_move(gcode).await?,
            "G2" => self.handle_arc(gcode, true).await?,
            "G3" => self.handle_arc(gcode, false).await?,
            "G4" => self.handle_dwell(gcode),
            "G17" => self.plane = Plane::Xy,
            "G18" => self.plane = Plane::Zx,
            "G19" => self.plane = Plane::Yz,
            "G20" => self.gcode_move.cmd_g20()?,
            "G21" => {}
            "G28" => self.handle_g28().await?,
            "G90" => self.gcode_move.set_absolute_coord(true),
            "G91" => self.gcode_move.set_absolute_coord(false),
            "G92" => self.gcode_move.cmd_g92(&Self::params_f64(&gcode)),
            "M82" => self.gcode_move.set_absolute_extrude(true),
            "M83" => self.gcode_move.set_absolute_extrude(false),
            "M112" => self.handle_m112().await?,
            "M114" | "GET_POSITION" => self.handle_m114(),
            "M204" => self.handle_m204(&gcode)?,
            "M220" => self.gcode_move.cmd_m220(&Self::params_f64(&gcode))?,
            "M221" => self.gcode_move.cmd_m221(&Self::params_f64(&gcode))?,
            "M400" => self.toolhead.wait_moves(),
            "SAVE_GCODE_STATE" => self.handle_save_state(&gcode),
            "RESTORE_GCODE_STATE" => self.handle_restore_state(&gcode).await?,
            "SET_GCODE_OFFSET" => self.handle_set_gcode_offset(&gcode).await?,
            "SET_VELOCITY_LIMIT" => self.handle_set_velocity_limit(&gcode),
            _ => warn!("Unknown G-code command: {}", gcode.command),
        }
        self.sync_state();
        Ok(())
    }

    /// Handles G0/G1 (Linear Move) commands.
    async fn handle_linear_move(&mut self, gcode: GCode) -> Result<()> {
        let params = Self::params_f64(&gcode);
        let target = self.gcode_move.cmd_g1(&params)?;
        let speed = self.gcode_move.speed;
        self.toolhead.move_to(target, speed)?;
        self.mcu_tx.send(McuCommand::Move { target, speed }).await?;
        Ok(())
    }

    /// Handles G2/G3 (arc move) commands: decomposes the arc into linear
    /// segments via `motion::arc::plan_arc` and dispatches each in turn.
    async fn handle_arc(&mut self, gcode: GCode, clockwise: bool) -> Result<()> {
        if gcode.params.iter().any(|&(c, _)| c == 'R') {
            return Err(anyhow::anyhow!("G2/G3 R (radius-format) arcs are not supported"));
        }
        let params = Self::params_f64(&gcode);
        let offset_i = params.get('I').unwrap_or(0.0);
        let offset_j = params.get('J').unwrap_or(0.0);
        let offset_k = params.get('K').unwrap_or(0.0);
        // I/J/K map to the plane's (alpha, beta) offset: XY uses I,J; XZ
        // uses I,K; YZ uses J,K, per the axis each plane's helical slot
        // omits.
        let (offset_alpha, offset_beta) = match self.plane {
            Plane::Xy => (offset_i, offset_j),
            Plane::Zx => (offset_k, offset_i),
            Plane::Yz => (offset_j, offset_k),
        };

        let start = self.toolhead.get_position();
        let target = self.gcode_move.cmd_g1(&params)?;
        let e_total = target.e - start.e;
        let speed = self.gcode_move.speed;
        let resolution = self.arc_resolution;

        let segments = plan_arc(
            (start.axes[0], start.axes[1], start.axes[2]),
            (target.axes[0], target.axes[1], target.axes[2]),
            offset_alpha,
            offset_beta,
            clockwise,
            self.plane,
            e_total,
            resolution,
        )?;

        let mut e_cursor = start.e;
        for seg in segments {
            e_cursor += seg.e;
            let mut p = target;
            // Map the plane-local (alpha, beta, helical) frame back onto
            // (X, Y, Z), inverse of `arc::select_plane`.
            match self.plane {
                Plane::Xy => {
                    p.axes[0] = seg.alpha;
                    p.axes[1] = seg.beta;
                    p.axes[2] = seg.helical;
                }
                Plane::Zx => {
                    p.axes[2] = seg.alpha;
                    p.axes[0] = seg.beta;
                    p.axes[1] = seg.helical;
                }
                Plane::Yz => {
                    p.axes[1] = seg.alpha;
                    p.axes[2] = seg.beta;
                    p.axes[0] = seg.helical;
                }
            }
            p.e = e_cursor;
            self.toolhead.move_to(p, speed)?;
            self.mcu_tx.send(McuCommand::Move { target: p, speed }).await?;
        }
        self.gcode_move.reset_last_position(self.toolhead.get_position());
        Ok(())
    }

    /// G4 Pxxx (dwell, milliseconds).
    fn handle_dwell(&mut self, gcode: GCode) {
        let params = Self::params_f64(&gcode);
        let seconds = params.get('P').map(|ms| ms / 1000.0).unwrap_or(0.0);
        self.toolhead.dwell(seconds);
    }

    /// Handles G28 (Auto Home). The endstop trigger layer itself is out of
    /// scope for the motion core; this simplified host treats homing as
    /// instantaneous, snapping each rail straight to its configured endstop.
    async fn handle_g28(&mut self) -> Result<()> {
        info!("Homing axes...");
        self.mcu_tx.send(McuCommand::Home).await?;

        let mut pos = self.toolhead.get_position();
        let homed_letters: String;
        {
            let (_, primary) = &mut self.toolhead.groups[0];
            let letters = primary.axis_names.clone();
            let full = AxisSet::xyzabc();
            for &letter in &letters {
                if let Ok((_, endstop)) = primary.home_targets(letter) {
                    if let Some(idx) = full.index_of(letter) {
                        pos.set(idx, endstop);
                    }
                }
                primary.note_homed(letter);
            }
            homed_letters = letters.into_iter().collect();
        }
        self.toolhead.set_position(pos);
        self.gcode_move.reset_last_position(pos);
        self.gcode_move.note_homing_end(&homed_letters);
        info!(homed = %homed_letters, "homing complete");
        Ok(())
    }

    /// M112 (Emergency Stop): disables further reactor pausing, matching
    /// the "toolhead must shut down" fatal-shutdown semantics.
    async fn handle_m112(&mut self) -> Result<()> {
        warn!("Emergency stop requested!");
        self.toolhead.reactor.disable_pausing();
        self.mcu_tx.send(McuCommand::EmergencyStop).await?;
        let mut state = self.state.lock();
        state.status = crate::state::PrinterStatus::Error;
        state.status_message = "Emergency Stop".to_string();
        Ok(())
    }

    /// M114 / GET_POSITION.
    fn handle_m114(&self) {
        info!("{}", self.gcode_move.position_report());
    }

    /// M204 Sxxx or Pxxx Txxx.
    fn handle_m204(&mut self, gcode: &GCode) -> Result<()> {
        let params = Self::params_f64(gcode);
        let hard_max = self.toolhead.cfg.max_accel;
        let accel = self.gcode_move.cmd_m204(&params, hard_max)?;
        self.toolhead.set_accel_limit(accel);
        Ok(())
    }

    /// SAVE_GCODE_STATE [NAME=<name>]; defaults to the name Klipper itself
    /// uses when none is given.
    fn handle_save_state(&mut self, gcode: &GCode) {
        let name = gcode.named("NAME").unwrap_or("default").to_string();
        self.gcode_move.save_state(name);
    }

    /// RESTORE_GCODE_STATE [NAME=] [MOVE=0|1] [MOVE_SPEED=].
    async fn handle_restore_state(&mut self, gcode: &GCode) -> Result<()> {
        let name = gcode.named("NAME").unwrap_or("default").to_string();
        let also_move = gcode.named_bool("MOVE", false);
        let move_speed = gcode.named_f64("MOVE_SPEED");
        if let Some(target) = self.gcode_move.restore_state(&name, also_move)? {
            let speed = move_speed.unwrap_or(self.gcode_move.speed);
            self.toolhead.move_to(target, speed)?;
            self.mcu_tx.send(McuCommand::Move { target, speed }).await?;
        }
        Ok(())
    }

    /// SET_GCODE_OFFSET [X= X_ADJUST= ...] [MOVE=0|1] [MOVE_SPEED=]: each
    /// axis letter is either the absolute (`X=`) or delta (`X_ADJUST=`)
    /// form; both may appear for different axes in the same command.
    async fn handle_set_gcode_offset(&mut self, gcode: &GCode) -> Result<()> {
        let also_move = gcode.named_bool("MOVE", false);
        let move_speed = gcode.named_f64("MOVE_SPEED");

        let mut absolute = Vec::new();
        let mut adjust = Vec::new();
        for (key, value) in &gcode.named {
            if matches!(key.as_str(), "MOVE" | "MOVE_SPEED") {
                continue;
            }
            let Ok(value) = value.parse::<f64>() else { continue };
            if let Some(axis) = key.strip_suffix("_ADJUST") {
                if let Some(letter) = axis.chars().next() {
                    adjust.push((letter, value));
                }
            } else if key.len() == 1 {
                if let Some(letter) = key.chars().next() {
                    absolute.push((letter, value));
                }
            }
        }
        absolute.push(('M', if also_move { 1.0 } else { 0.0 }));

        let mut target = self.gcode_move.cmd_set_gcode_offset(&Params(absolute));
        if !adjust.is_empty() {
            if let Some(t) = self.gcode_move.cmd_set_gcode_offset_adjust(&Params(adjust), also_move) {
                target = Some(t);
            }
        }
        if let Some(target) = target {
            let speed = move_speed.unwrap_or(self.gcode_move.speed);
            self.toolhead.move_to(target, speed)?;
            self.mcu_tx.send(McuCommand::Move { target, speed }).await?;
        }
        Ok(())
    }

    /// SET_VELOCITY_LIMIT [VELOCITY=] [ACCEL=] [SQUARE_CORNER_VELOCITY=]
    /// [ACCEL_TO_DECEL=].
    fn handle_set_velocity_limit(&mut self, gcode: &GCode) {
        self.toolhead.set_velocity_limit(
            gcode.named_f64("VELOCITY"),
            gcode.named_f64("ACCEL"),
            gcode.named_f64("SQUARE_CORNER_VELOCITY"),
            gcode.named_f64("ACCEL_TO_DECEL"),
        );
    }

    /// Refreshes the shared `PrinterState` snapshot from the toolhead/gcode
    /// motion state after every processed command.
    fn sync_state(&self) {
        let pos = self.toolhead.get_position();
        let (_, primary) = &self.toolhead.groups[0];
        let status = primary.get_status();

        let mut state = self.state.lock();
        state.position = Position {
            x: pos.axes[0] as f32,
            y: pos.axes[1] as f32,
            z: pos.axes[2] as f32,
            e: pos.e as f32,
        };
        state.toolhead = ToolheadStatus {
            homed_axes: status.homed_axes,
            speed_factor: self.gcode_move.speed_factor,
            extrude_factor: self.gcode_move.extrude_factor,
            print_time: self.toolhead.print_time,
            axis_minimum: status.axis_minimum,
            axis_maximum: status.axis_maximum,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tokio::sync::mpsc;

    #[test]
    fn parse_gcode_splits_axis_params_from_named_params() {
        let g = parse_gcode("SET_GCODE_OFFSET X=1.5 X_ADJUST=0.2 MOVE=1").unwrap();
        assert_eq!(g.command, "SET_GCODE_OFFSET");
        assert_eq!(g.named("X"), Some("1.5"));
        assert_eq!(g.named("X_ADJUST"), Some("0.2"));
        assert!(g.named_bool("MOVE", false));
    }

    #[test]
    fn parse_gcode_keeps_classic_axis_letter_params() {
        let g = parse_gcode("G1 X10 Y-5.5 F600").unwrap();
        assert_eq!(g.params, vec![('X', 10.0), ('Y', -5.5), ('F', 600.0)]);
        assert!(g.named.is_empty());
    }

    /// Writes a minimal printer.cfg to a unique temp path and builds a
    /// dispatcher around it, mirroring the batch runner's own setup.
    fn test_dispatcher() -> GCodeDispatcher {
        let path = std::env::temp_dir().join(format!("printer-test-{}.cfg", rand::random::<u32>()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[mcu]\nserial: /dev/null\n\n[printer]\nkinematics: cartesian\nmax_velocity: 300\nmax_accel: 3000\n\n\
             [stepper_x]\nsteps_per_mm: 80\nposition_min: 0\nposition_max: 200\nposition_endstop: 0\n\n\
             [stepper_y]\nsteps_per_mm: 80\nposition_min: 0\nposition_max: 200\nposition_endstop: 0\n\n\
             [stepper_z]\nsteps_per_mm: 400\nposition_min: 0\nposition_max: 200\nposition_endstop: 0\n"
        )
        .unwrap();
        let config = Arc::new(PrinterConfig::load(&path).unwrap());
        let _ = std::fs::remove_file(&path);
        let state = Arc::new(Mutex::new(PrinterState::new()));
        let (mcu_tx, mut mcu_rx) = mpsc::channel(256);
        tokio::spawn(async move { while mcu_rx.recv().await.is_some() {} });
        GCodeDispatcher::new(config, state, mcu_tx)
    }

    #[tokio::test]
    async fn save_and_restore_gcode_state_round_trips_through_dispatch() {
        let mut d = test_dispatcher();
        d.dispatch(parse_gcode("G28").unwrap()).await.unwrap();
        d.dispatch(parse_gcode("G90").unwrap()).await.unwrap();
        d.dispatch(parse_gcode("G1 X5 F600").unwrap()).await.unwrap();
        d.dispatch(parse_gcode("SAVE_GCODE_STATE NAME=a").unwrap()).await.unwrap();
        d.dispatch(parse_gcode("G1 X50 F600").unwrap()).await.unwrap();
        d.dispatch(parse_gcode("RESTORE_GCODE_STATE NAME=a MOVE=1").unwrap())
            .await
            .unwrap();
        assert!((d.toolhead.get_position().axes[0] - 5.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn set_gcode_offset_adjust_translates_last_position() {
        let mut d = test_dispatcher();
        d.dispatch(parse_gcode("G28").unwrap()).await.unwrap();
        d.dispatch(parse_gcode("G90").unwrap()).await.unwrap();
        d.dispatch(parse_gcode("G1 X5 F600").unwrap()).await.unwrap();
        d.dispatch(parse_gcode("SET_GCODE_OFFSET X_ADJUST=2").unwrap()).await.unwrap();
        assert!((d.gcode_move.base_position.axes[0] - 2.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn set_velocity_limit_updates_toolhead_ceiling() {
        let mut d = test_dispatcher();
        d.dispatch(parse_gcode("SET_VELOCITY_LIMIT VELOCITY=123 ACCEL=456").unwrap())
            .await
            .unwrap();
        assert!((d.toolhead.cfg.max_velocity - 123.0).abs() < 1e-6);
        assert!((d.toolhead.cfg.max_accel - 456.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn plane_selection_is_tracked_across_g17_g18_g19() {
        let mut d = test_dispatcher();
        assert_eq!(d.plane, Plane::Xy);
        d.dispatch(parse_gcode("G18").unwrap()).await.unwrap();
        assert_eq!(d.plane, Plane::Zx);
        d.dispatch(parse_gcode("G19").unwrap()).await.unwrap();
        assert_eq!(d.plane, Plane::Yz);
        d.dispatch(parse_gcode("G17").unwrap()).await.unwrap();
        assert_eq!(d.plane, Plane::Xy);
    }

    #[tokio::test]
    async fn g2_r_radius_format_is_rejected() {
        let mut d = test_dispatcher();
        d.dispatch(parse_gcode("G90").unwrap()).await.unwrap();
        let err = d.dispatch(parse_gcode("G2 X10 Y0 R5 F600").unwrap()).await;
        assert!(err.is_err());
    }
}
