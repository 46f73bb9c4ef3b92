//! Stratum CLI - layered container image builder.

pub mod commands;
pub mod output;
