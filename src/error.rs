//! Error types for the adc-batteryd daemon.
//!
//! This module defines custom error enums for each component of the daemon,
//! providing descriptive error messages with context information.

use thiserror::Error;

/// Errors related to ADC channel access.
#[derive(Error, Debug)]
pub enum AdcError {
    #[error("Failed to open ADC channel '{path}': {source}")]
    OpenFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read ADC sample: {0}")]
    ReadFailed(std::io::Error),

    #[error("Invalid ADC sample '{0}'")]
    InvalidSample(String),

    #[error("No completed conversion available yet")]
    NotReady,
}

/// Errors related to GPIO line access.
#[derive(Error, Debug)]
pub enum GpioError {
    #[error("Failed to read GPIO {pin}: {source}")]
    ReadFailed {
        pin: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid GPIO value '{value}' on pin {pin}")]
    InvalidValue { pin: u32, value: String },
}

/// Errors related to the persisted capacity record.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to read capacity record: {0}")]
    ReadFailed(#[from] std::io::Error),

    #[error("Capacity record too short ({0} bytes)")]
    Truncated(usize),

    #[error("Capacity record magic mismatch (got {0:#x})")]
    BadMagic(u32),

    #[error("Persisted capacity {0} outside 0-100")]
    OutOfRange(i32),
}

/// Errors related to configuration management.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    #[error("Failed to write configuration: {0}")]
    WriteError(#[from] std::io::Error),
}

/// Top-level daemon errors.
#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("ADC error: {0}")]
    Adc(#[from] AdcError),

    #[error("GPIO error: {0}")]
    Gpio(#[from] GpioError),

    #[error("Capacity store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Runtime error: {0}")]
    Runtime(String),
}
