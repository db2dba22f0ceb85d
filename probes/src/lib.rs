// Expose modules for testing
pub mod cli;
pub mod domain;
pub mod ftrace;
pub mod output;
pub mod preflight;
