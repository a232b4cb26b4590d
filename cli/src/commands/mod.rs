pub mod config;
pub mod preflight;
pub mod start;
pub mod status;
