//! tritone-emu library
//!
//! Tick-synchronous model of the Tritone TPU control core.

pub mod config;
pub mod device;
pub mod emu;
