//! # Error Types
//!
//! This module provides the error types used throughout the eitgen library.
//! It defines a central error type `EitError` that encapsulates all possible
//! errors that can occur during transport stream and EIT processing.
//!
//! ## Example Usage
//!
//! ```rust
//! use eitgen::error::{Result, EitError};
//!
//! fn process_section_data(data: &[u8]) -> Result<()> {
//!     if data.is_empty() {
//!         return Err(EitError::InvalidData("Empty section data".to_string()));
//!     }
//!
//!     // Process section data...
//!     Ok(())
//! }
//! ```

use thiserror::Error;

/// Primary error type for the eitgen library
#[derive(Error, Debug)]
pub enum EitError {
    /// I/O errors that occur during file or stream operations
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors that occur during parsing of sections, events or dates
    #[error("parser error: {0}")]
    Parser(String),

    /// Errors for invalid or malformed input data
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Errors raised when serialized content exceeds DVB size limits
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// A specialized Result type for eitgen operations.
///
/// This type is used throughout the eitgen library to handle operations
/// that can produce an `EitError`.
///
/// ## Example
///
/// ```rust
/// use eitgen::error::{Result, EitError};
///
/// fn validate_pid(pid: u16) -> Result<u16> {
///     if pid > 0x1FFF {
///         return Err(EitError::InvalidData(format!("PID out of range: {}", pid)));
///     }
///     Ok(pid)
/// }
/// ```
pub type Result<T> = std::result::Result<T, EitError>;
