//! # Utility Functions and Types
//!
//! This module provides common utility functions and types used throughout the eitgen library.
//! It includes implementations for:
//!
//! - CRC calculation and validation
//! - DVB time encodings (Modified Julian Date, BCD)
//!
//! ## CRC Calculation
//!
//! The crc module provides MPEG-2 CRC32 calculation:
//!
//! ```rust
//! use eitgen::utils::Crc32Mpeg2;
//!
//! # fn main() {
//! let data = b"Hello, world!";
//! let crc = Crc32Mpeg2::new();
//! println!("CRC32: {:08x}", crc.calculate(data));
//! # }
//! ```
//!
//! ## DVB Time Encodings
//!
//! The time module converts between UTC wall-clock values and the 40-bit
//! MJD + BCD representation used by EIT, TDT and TOT:
//!
//! ```rust
//! use eitgen::utils::time::{encode_mjd, decode_mjd};
//! use chrono::{TimeZone, Utc};
//!
//! # fn main() {
//! let time = Utc.with_ymd_and_hms(1993, 10, 13, 12, 45, 0).unwrap();
//! let encoded = encode_mjd(&time);
//! assert_eq!(decode_mjd(&encoded), Some(time));
//! # }
//! ```

/// CRC calculation implementations
pub mod crc;

/// DVB time encodings (MJD dates, BCD durations)
pub mod time;

// Re-export commonly used types
pub use crc::Crc32Mpeg2;
