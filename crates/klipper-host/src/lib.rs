//! Library surface for the Klipper host process, exposed so integration
//! tests can exercise the API server, G-code dispatcher, and virtual
//! printer socket without going through the `main` binary.

pub mod api;
pub mod batch;
pub mod config;
pub mod gcode;
pub mod mcu_client;
pub mod state;
pub mod virtual_printer;
