//! Printer configuration loader.
//!
//! Parses an INI-style `printer.cfg` (the same format Klipper itself uses)
//! via `configparser`, and supplies the motion core's toolhead/kinematics
//! constants with the defaults named in the design document when a key is
//! omitted.

use anyhow::{Context, Result};
use configparser::ini::Ini;
use std::path::Path;

use motion::kinematics::HomingDirection;
use motion::toolhead::ToolheadConfig;

/// Represents the `[mcu]` section of the config.
#[derive(Debug, Clone)]
pub struct McuConfig {
    pub serial_port: String,
    pub baud_rate: u32,
}

/// Represents one `[stepper_*]` section: rail travel range, endstop
/// metadata, and step conversion.
#[derive(Debug, Clone)]
pub struct StepperConfig {
    pub steps_per_mm: f64,
    pub position_min: f64,
    pub position_max: f64,
    pub position_endstop: f64,
    pub homing_speed: f64,
    pub second_homing_speed: f64,
    pub homing_retract_dist: f64,
    pub homing_direction: HomingDirection,
}

/// Represents the main `[printer]` section.
#[derive(Debug, Clone)]
pub struct PrinterInfoConfig {
    pub kinematics: String,
    pub axis: String,
    pub kinematics_abc: Option<String>,
    pub max_velocity: f64,
    pub max_accel: f64,
    pub max_accel_to_decel: f64,
    pub max_z_velocity: f64,
    pub max_z_accel: f64,
    pub square_corner_velocity: f64,
    pub buffer_time_low: f64,
    pub buffer_time_high: f64,
    pub buffer_time_start: f64,
    pub move_flush_time: f64,
    pub arc_resolution: f64,
}

impl PrinterInfoConfig {
    pub fn to_toolhead_config(&self) -> ToolheadConfig {
        ToolheadConfig {
            max_velocity: self.max_velocity,
            max_accel: self.max_accel,
            max_accel_to_decel: self.max_accel_to_decel,
            square_corner_velocity: self.square_corner_velocity,
            buffer_time_low: self.buffer_time_low,
            buffer_time_high: self.buffer_time_high,
            buffer_time_start: self.buffer_time_start,
            move_flush_time: self.move_flush_time,
        }
    }
}

/// Holds the entire parsed printer configuration.
#[derive(Debug, Clone)]
pub struct PrinterConfig {
    pub mcu: McuConfig,
    pub printer: PrinterInfoConfig,
    pub steppers: Vec<(String, StepperConfig)>,
}

impl PrinterConfig {
    /// Loads and parses the configuration file from the given path.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = Ini::new();
        config
            .load(path)
            .map_err(|e| anyhow::anyhow!(e))
            .with_context(|| format!("Failed to load configuration file: {:?}", path))?;

        let mcu = McuConfig {
            serial_port: config.get("mcu", "serial").context("[mcu] serial not found")?,
            baud_rate: config.getuint("mcu", "baud").ok().flatten().unwrap_or(250_000) as u32,
        };

        let max_accel = config.getfloat("printer", "max_accel").ok().flatten().unwrap_or(3000.0);
        let printer = PrinterInfoConfig {
            kinematics: config
                .get("printer", "kinematics")
                .unwrap_or_else(|| "cartesian".to_string()),
            axis: config.get("printer", "axis").unwrap_or_else(|| "XYZ".to_string()),
            kinematics_abc: config.get("printer", "kinematics_abc"),
            max_velocity: config.getfloat("printer", "max_velocity").ok().flatten().unwrap_or(300.0),
            max_accel,
            max_accel_to_decel: config
                .getfloat("printer", "max_accel_to_decel")
                .ok()
                .flatten()
                .unwrap_or(0.5 * max_accel),
            max_z_velocity: config
                .getfloat("printer", "max_z_velocity")
                .ok()
                .flatten()
                .unwrap_or(25.0),
            max_z_accel: config.getfloat("printer", "max_z_accel").ok().flatten().unwrap_or(100.0),
            square_corner_velocity: config
                .getfloat("printer", "square_corner_velocity")
                .ok()
                .flatten()
                .unwrap_or(5.0),
            buffer_time_low: 1.0,
            buffer_time_high: 2.0,
            buffer_time_start: 0.25,
            move_flush_time: 0.05,
            arc_resolution: config.getfloat("printer", "arc_resolution").ok().flatten().unwrap_or(1.0),
        };

        let mut steppers = Vec::new();
        for name in ["stepper_x", "stepper_y", "stepper_z"] {
            if config.get_map_ref().contains_key(name) {
                steppers.push((name.to_string(), Self::load_stepper(&config, name)?));
            }
        }
        if let Some(abc) = &printer.kinematics_abc {
            for letter in ['a', 'b', 'c'] {
                let name = format!("stepper_{letter}");
                if config.get_map_ref().contains_key(&name) {
                    steppers.push((name.clone(), Self::load_stepper(&config, &name)?));
                }
            }
            tracing::debug!(group = %abc, "configured ABC kinematic group");
        }

        Ok(Self { mcu, printer, steppers })
    }

    fn load_stepper(config: &Ini, section: &str) -> Result<StepperConfig> {
        let homing_direction = match config.get(section, "homing_direction").as_deref() {
            Some("max") => HomingDirection::Max,
            _ => HomingDirection::Min,
        };
        Ok(StepperConfig {
            steps_per_mm: config
                .getfloat(section, "steps_per_mm")
                .ok()
                .flatten()
                .with_context(|| format!("[{section}] steps_per_mm not found"))?,
            position_min: config.getfloat(section, "position_min").ok().flatten().unwrap_or(0.0),
            position_max: config
                .getfloat(section, "position_max")
                .ok()
                .flatten()
                .with_context(|| format!("[{section}] position_max not found"))?,
            position_endstop: config
                .getfloat(section, "position_endstop")
                .ok()
                .flatten()
                .unwrap_or(0.0),
            homing_speed: config.getfloat(section, "homing_speed").ok().flatten().unwrap_or(5.0),
            second_homing_speed: config
                .getfloat(section, "second_homing_speed")
                .ok()
                .flatten()
                .unwrap_or(2.5),
            homing_retract_dist: config
                .getfloat(section, "homing_retract_dist")
                .ok()
                .flatten()
                .unwrap_or(5.0),
            homing_direction,
        })
    }
}
