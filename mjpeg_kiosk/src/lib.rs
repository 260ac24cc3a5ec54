// THEORY:
// This file is the main entry point for the `mjpeg_kiosk` library crate. The
// binary in `main.rs` is a thin shell around it: load the configuration, prepare
// the display, run the `KioskPipeline` until a signal arrives.
//
// The public surface is the `KioskPipeline` with its `PipelineConfig`, the two
// seams a deployment may want to replace (`FrameDecoder` and `Renderer`), and the
// `Alert` hook for motion notifications. The `core_modules` are public as well
// so that each stage can be run and tested on its own.

pub mod config;
pub mod core_modules;
pub mod error;
pub mod pipeline;
pub mod system;

pub use config::KioskConfig;
pub use core_modules::decoder::{FrameDecoder, JpegFrameDecoder};
pub use core_modules::renderer::{LogRenderer, Renderer};
pub use pipeline::{KioskPipeline, PipelineConfig, PipelineSummary, run_display_loop};
pub use system::{Alert, CommandAlert};
