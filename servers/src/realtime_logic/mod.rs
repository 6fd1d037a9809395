pub mod collaborators;
pub mod config;
pub mod downstream;
pub mod metrics;
pub mod state;
