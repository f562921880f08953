//! CLI command implementations.

pub mod config;
pub mod stress;

pub use config::{load_config, show_config};
pub use stress::{run_stress, StressOptions};
