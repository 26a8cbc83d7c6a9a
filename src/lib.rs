#![doc(html_root_url = "https://docs.rs/eitgen/0.1.0")]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(rustdoc::missing_crate_level_docs)]

//! # eitgen - DVB EIT Generation Toolkit
//!
//! `eitgen` generates and injects DVB Event Information Tables (EIT) into
//! MPEG-2 Transport Streams. It maintains an EPG database of binary events,
//! produces correctly-formed EIT present/following and schedule sections,
//! and packetizes them on the EIT PID with repetition rates conforming to
//! ETSI EN 300 468 and ETSI TS 101 211.
//!
//! ## Features
//!
//! ### EIT Generation and Injection
//! - EPG database of services, 3-hour segments and binary events over the
//!   64-day DVB horizon
//! - Time-driven regeneration of present/following and schedule sections
//! - Packet replacement on the EIT PID with bitrate and repetition control
//!
//! ### Section Processing
//! - Generic PSI/SI section packetizer with pointer_field and stuffing
//!   discipline
//! - Cycling packetizer with per-section repetition rates
//! - Section demultiplexer for PAT, TDT/TOT and EIT inputs
//! - Batch reorganization of EIT section bags per ETSI TS 101 211
//!
//! ## Quick Start
//!
//! Add this to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! eitgen = "0.1.0"
//! ```
//!
//! ### EIT Injection Example
//!
//! ```rust,no_run
//! use eitgen::eit::{EitGenerator, ServiceIdTriplet};
//! use eitgen::ts::TsPacket;
//! use chrono::{TimeZone, Utc};
//!
//! fn main() -> eitgen::Result<()> {
//!     let mut gen = EitGenerator::new(0x0012);
//!     gen.set_transport_stream_bit_rate(10_000_000);
//!     gen.set_max_bit_rate(100_000);
//!     gen.set_current_time(Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap());
//!
//!     // Load binary EPG events for one service.
//!     let service = ServiceIdTriplet::new(100, 10, 1);
//!     let events: Vec<u8> = std::fs::read("epg.bin")?;
//!     gen.load_events(service, &events)?;
//!
//!     // Process the transport stream packet by packet.
//!     let mut packet = TsPacket::null();
//!     loop {
//!         // ... read the next packet from the input ...
//!         gen.process_packet(&mut packet);
//!         // ... write the packet to the output ...
//!     }
//! }
//! ```
//!
//! ### EIT Normalization Example
//!
//! ```rust
//! use eitgen::eit::{reorganize_sections, EitOptions};
//!
//! let mut sections = Vec::new();
//! // ... load sections from a section file ...
//! reorganize_sections(&mut sections, None, EitOptions::GEN_ALL);
//! ```
//!
//! ## Module Overview
//!
//! - `ts`: Transport Stream packet abstraction and well-known PIDs
//!
//! - `psi`: PSI/SI section layer
//!   - Section blobs with typed accessors and copy-on-write mutators
//!   - Section demultiplexer
//!   - Section bag post-processing
//!
//! - `packetizer`: section-to-packet conversion
//!   - Generic packetizer over a section provider
//!   - Cycling packetizer with repetition rates
//!
//! - `eit`: Event Information Table machinery
//!   - EIT generator and injector
//!   - Repetition profiles
//!   - Batch reorganizer
//!
//! - `error`: Error handling types and utilities
//!
//! - `utils`: CRC32 and DVB time encodings

/// Error types and utilities
pub mod error;

/// Event Information Table machinery
pub mod eit;

/// Section packetizers
pub mod packetizer;

/// PSI/SI section layer
pub mod psi;

/// Transport Stream layer
pub mod ts;

/// Common utilities and helper functions
pub mod utils;

pub use error::{EitError, Result};
