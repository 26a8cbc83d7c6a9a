//! # DVB Event Information Tables
//!
//! This module implements the EIT machinery of the library:
//!
//! - [`EitGenerator`]: time-driven generation and injection of EIT sections
//!   into a transport stream from an EPG event database
//! - [`reorganize`]: batch transformation of arbitrary EIT sections into the
//!   canonical form mandated by ETSI TS 101 211
//! - [`EitRepetitionProfile`]: DVB repetition rates per section priority class
//! - [`EitOptions`]: generation option mask
//! - segment arithmetic shared by all of the above
//!
//! ## EIT structure (ETSI EN 300 468)
//!
//! EIT schedule tables describe events over a sliding window of 64 days,
//! split into sixteen 4-day subtables per actual/other category. Each
//! subtable covers 32 "segments" of 3 hours, and each segment owns up to 8
//! sections. EIT present/following tables carry exactly two sections: the
//! current event and the next one.

/// Identity types (transport stream, service triplet)
pub mod ids;

/// EIT generation options
pub mod options;

/// Repetition rate profiles
pub mod profile;

/// EIT generation and injection engine
pub mod generator;

/// Batch reorganization of EIT sections
pub mod reorganize;

pub use generator::EitGenerator;
pub use ids::{ServiceIdTriplet, TransportStreamId};
pub use options::EitOptions;
pub use profile::{EitProfile, EitRepetitionProfile};
pub use reorganize::{fix_table, reorganize_sections, set_standalone_schedule, FixMode};

use crate::psi::section::Section;
use crate::utils::time::this_day;
use chrono::{DateTime, Duration, Utc};

/// Table id of an EIT present/following actual.
pub const TID_EIT_PF_ACT: u8 = 0x4E;
/// Table id of an EIT present/following other.
pub const TID_EIT_PF_OTH: u8 = 0x4F;
/// First table id of an EIT schedule actual.
pub const TID_EIT_S_ACT_MIN: u8 = 0x50;
/// Last table id of an EIT schedule actual.
pub const TID_EIT_S_ACT_MAX: u8 = 0x5F;
/// First table id of an EIT schedule other.
pub const TID_EIT_S_OTH_MIN: u8 = 0x60;
/// Last table id of an EIT schedule other.
pub const TID_EIT_S_OTH_MAX: u8 = 0x6F;

/// Number of 3-hour segments in one EIT schedule subtable (4 days).
pub const SEGMENTS_PER_TABLE: usize = 32;
/// Number of segments per day.
pub const SEGMENTS_PER_DAY: usize = 8;
/// Number of sections in one segment.
pub const SECTIONS_PER_SEGMENT: usize = 8;
/// Number of EIT schedule subtables per service and actual/other category.
pub const TOTAL_TABLES_COUNT: usize = 16;
/// Total number of segments over the whole EPG depth.
pub const TOTAL_SEGMENTS_COUNT: usize = SEGMENTS_PER_TABLE * TOTAL_TABLES_COUNT;
/// Total number of days covered by EIT schedule.
pub const TOTAL_DAYS: i64 = 64;

/// Fixed part of an EIT section payload, before the event loop.
pub const EIT_PAYLOAD_FIXED_SIZE: usize = 6;
/// Fixed part of an EIT event record, before the descriptor loop.
pub const EIT_EVENT_FIXED_SIZE: usize = 12;

/// Duration of one EIT schedule segment.
pub fn segment_duration() -> Duration {
    Duration::hours(3)
}

/// Returns true for any EIT table id.
pub fn is_eit(tid: u8) -> bool {
    (TID_EIT_PF_ACT..=TID_EIT_S_OTH_MAX).contains(&tid)
}

/// Returns true for EIT-actual table ids (p/f or schedule).
pub fn is_actual(tid: u8) -> bool {
    tid == TID_EIT_PF_ACT || (TID_EIT_S_ACT_MIN..=TID_EIT_S_ACT_MAX).contains(&tid)
}

/// Returns true for EIT present/following table ids.
pub fn is_present_following(tid: u8) -> bool {
    tid == TID_EIT_PF_ACT || tid == TID_EIT_PF_OTH
}

/// Returns true for EIT schedule table ids.
pub fn is_schedule(tid: u8) -> bool {
    (TID_EIT_S_ACT_MIN..=TID_EIT_S_OTH_MAX).contains(&tid)
}

/// Flips an EIT table id between actual and other. Non-EIT ids pass through.
pub fn toggle_actual(tid: u8, actual: bool) -> u8 {
    if tid == TID_EIT_PF_ACT && !actual {
        TID_EIT_PF_OTH
    } else if tid == TID_EIT_PF_OTH && actual {
        TID_EIT_PF_ACT
    } else if (TID_EIT_S_ACT_MIN..=TID_EIT_S_ACT_MAX).contains(&tid) && !actual {
        tid + 0x10
    } else if (TID_EIT_S_OTH_MIN..=TID_EIT_S_OTH_MAX).contains(&tid) && actual {
        tid - 0x10
    } else {
        tid
    }
}

/// Returns the table id of the EIT schedule subtable owning a segment.
///
/// Each subtable spans 32 segments; segment numbers beyond the EPG depth
/// are clamped into the last subtable.
pub fn segment_to_table_id(actual: bool, segment: usize) -> u8 {
    let base = if actual { TID_EIT_S_ACT_MIN } else { TID_EIT_S_OTH_MIN };
    base + (segment.min(TOTAL_SEGMENTS_COUNT - 1) / SEGMENTS_PER_TABLE) as u8
}

/// Returns the first section number of a segment inside its subtable.
pub fn segment_to_section(segment: usize) -> u8 {
    ((segment % SEGMENTS_PER_TABLE) * SECTIONS_PER_SEGMENT) as u8
}

/// Returns the segment number of an event start time, relative to a
/// reference midnight. Events before the reference land in segment 0.
pub fn time_to_segment(last_midnight: &DateTime<Utc>, event_start_time: &DateTime<Utc>) -> usize {
    if event_start_time < last_midnight {
        0
    } else {
        let elapsed = *event_start_time - *last_midnight;
        (elapsed.num_seconds() / segment_duration().num_seconds()) as usize
    }
}

/// Returns the start time of the segment containing an event start time:
/// the latest 3-hour boundary from the event's own midnight.
pub fn segment_start_time(event_start_time: &DateTime<Utc>) -> DateTime<Utc> {
    let midnight = this_day(event_start_time);
    midnight + segment_duration() * time_to_segment(&midnight, event_start_time) as i32
}

/// Extracts the service id triplet from an EIT section.
///
/// Returns the default triplet when the payload is too short to carry the
/// transport stream and original network identifiers.
pub fn get_service(section: &Section, include_version: bool) -> ServiceIdTriplet {
    let payload = section.payload();
    if payload.len() < EIT_PAYLOAD_FIXED_SIZE {
        ServiceIdTriplet::default()
    } else {
        ServiceIdTriplet {
            service_id: section.table_id_extension(),
            transport_stream_id: ((payload[0] as u16) << 8) | payload[1] as u16,
            original_network_id: ((payload[2] as u16) << 8) | payload[3] as u16,
            version: if include_version { section.version() } else { 0 },
        }
    }
}

/// Builds an event-less EIT section for one service.
///
/// The 14-byte body is the 8-byte long-section header followed by the fixed
/// EIT payload: transport_stream_id, original_network_id,
/// segment_last_section_number (set to `last_section_number`) and
/// last_table_id (set to the section's own table id). The version comes
/// from the service triplet and the CRC32 is computed.
pub(crate) fn build_empty_section(
    tid: u8,
    section_number: u8,
    last_section_number: u8,
    service: &ServiceIdTriplet,
) -> Section {
    use crate::psi::{LONG_SECTION_HEADER_SIZE, SECTION_CRC32_SIZE};
    use bytes::{BufMut, BytesMut};

    let total = LONG_SECTION_HEADER_SIZE + EIT_PAYLOAD_FIXED_SIZE + SECTION_CRC32_SIZE;
    let mut buf = BytesMut::with_capacity(total);
    buf.put_u8(tid);
    buf.put_u16(0xF000 | (total as u16 - 3));
    buf.put_u16(service.service_id);
    buf.put_u8(0xC1 | ((service.version & 0x1F) << 1));
    buf.put_u8(section_number);
    buf.put_u8(last_section_number);
    buf.put_u16(service.transport_stream_id);
    buf.put_u16(service.original_network_id);
    buf.put_u8(last_section_number);
    buf.put_u8(tid);
    buf.put_u32(0); // CRC placeholder
    let mut section = Section::new_unchecked(buf.freeze());
    section.recompute_crc();
    section
}
