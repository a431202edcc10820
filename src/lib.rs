//! Shunt linearity calibration with a synchronized reference meter.
//!
//! A bipolar current source sweeps through the shunts under test. At every
//! stimulus level a reference meter and a multiplexed scanner meter are
//! triggered back to back, so the reference current and the shunt voltage
//! describe the same instant of a noisy source. Each level becomes one row of
//! a semicolon-delimited result table with per-channel scale factors.
//!
//! Layering, leaves first:
//! - [`adapters`]: transports (Prologix GPIB bridge, raw socket, VISA, mock)
//! - [`instrument`]: instrument channel and typed per-role command builders
//! - [`range`], [`sampler`], [`sweep`]: range coordination, synchronized
//!   sampling, sweep planning
//! - [`aggregate`], [`storage`], [`runner`]: rows, the table, the run loop

pub mod adapters;
pub mod aggregate;
pub mod config;
pub mod error;
pub mod instrument;
pub mod measurement;
pub mod range;
pub mod runner;
pub mod sampler;
pub mod storage;
pub mod sweep;

pub use config::Settings;
pub use error::{AppResult, CalError};
