//! CLI module for Ballbet

pub mod app;
pub mod commands;

pub use app::{BallbetApp, ReplayScript, ReplayStep, SimulationSummary, StepResult};
pub use commands::{Cli, Commands, OutcomeArg};
