//! # PSI/SI Section Layer
//!
//! This module provides the MPEG/DVB section abstraction shared by the
//! packetizers, the demultiplexer and the EIT machinery:
//!
//! - [`Section`]: an immutable-on-the-wire section blob with typed header
//!   accessors and copy-on-write mutators
//! - [`SectionDemux`]: reassembly of sections from TS packets on subscribed PIDs
//! - [`file`]: post-load processing of section bags (EIT normalization,
//!   orphan packing)

/// Section type and header accessors
pub mod section;

/// Section reassembly from TS packets
pub mod demux;

/// Section-bag post-processing
pub mod file;

// Re-export commonly used types
pub use demux::SectionDemux;
pub use file::SectionFileArgs;
pub use section::Section;

/// Size of a short section header in bytes
pub const SHORT_SECTION_HEADER_SIZE: usize = 3;
/// Size of a long section header in bytes
pub const LONG_SECTION_HEADER_SIZE: usize = 8;
/// Size of the trailing CRC32 of a long section in bytes
pub const SECTION_CRC32_SIZE: usize = 4;
/// Maximum total size of a private section (DVB), header and CRC included
pub const MAX_PRIVATE_SECTION_SIZE: usize = 4096;
/// Maximum payload size of a private long section: total size minus the
/// 8-byte long header and the 4-byte CRC32
pub const MAX_PRIVATE_LONG_SECTION_PAYLOAD_SIZE: usize =
    MAX_PRIVATE_SECTION_SIZE - LONG_SECTION_HEADER_SIZE - SECTION_CRC32_SIZE;

/// Table ID for Program Association Table (PAT)
pub const TID_PAT: u8 = 0x00;
/// Table ID for Time and Date Table (TDT)
pub const TID_TDT: u8 = 0x70;
/// Table ID for Time Offset Table (TOT)
pub const TID_TOT: u8 = 0x73;
/// Table ID used for stuffing sections
pub const TID_STUFFING: u8 = 0xFF;
