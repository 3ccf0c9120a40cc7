//! Batch G-code Processor
//!
//! A CLI subcommand for driving the G-code dispatcher over a file instead of
//! a live printer connection, for testing and analysis without hardware.

use crate::config::PrinterConfig;
use crate::gcode::{parse_gcode, GCodeDispatcher, McuCommand};
use crate::state::PrinterState;
use anyhow::{Context, Result};
use clap::Parser;
use parking_lot::Mutex;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Arguments for the `batch` subcommand.
#[derive(Parser, Debug)]
pub struct BatchArgs {
    /// Path to the G-code file to process.
    #[arg(required = true)]
    gcode_file: PathBuf,

    /// Path to the Klipper printer configuration file.
    #[arg(short, long, default_value = "printer.cfg")]
    config_path: PathBuf,
}

/// Runs the batch processing logic.
pub async fn run_batch_processing(args: BatchArgs) -> Result<()> {
    info!("Starting batch processing for file: {:?}", args.gcode_file);
    info!("Using config file: {:?}", args.config_path);

    let config = Arc::new(PrinterConfig::load(&args.config_path)?);
    let state = Arc::new(Mutex::new(PrinterState::new()));

    // Drain MCU-bound commands to stdout instead of a real/mock transport.
    let (mcu_tx, mut mcu_rx) = mpsc::channel::<McuCommand>(256);
    let drain = tokio::spawn(async move {
        while let Some(command) = mcu_rx.recv().await {
            println!("  -> MCU Command: {:?}", command);
        }
    });

    let mut dispatcher = GCodeDispatcher::new(config, state, mcu_tx);

    let file = File::open(&args.gcode_file)
        .with_context(|| format!("Failed to open G-code file: {:?}", args.gcode_file))?;
    let reader = BufReader::new(file);

    for (line_num, line_result) in reader.lines().enumerate() {
        let line = line_result?;
        if let Some(gcode) = parse_gcode(&line) {
            println!("\n[L{}] G-code: {:?}", line_num + 1, gcode);
            if let Err(e) = dispatcher.dispatch(gcode).await {
                warn!("Error on line {}: {}", line_num + 1, e);
            }
        }
    }

    // Drop the dispatcher so its mcu_tx closes and the drain task exits.
    drop(dispatcher);
    let _ = drain.await;

    info!("Batch processing finished.");
    Ok(())
}
