//! Batch reorganization of EIT sections per ETSI TS 101 211.
//!
//! [`reorganize_sections`] rewrites an arbitrary bag of EIT sections into a
//! canonical set: one two-section p/f subtable per service and completely
//! rebuilt schedule sections with consistent `last_section_number`,
//! `segment_last_section_number` and `last_table_id` fields. It is a
//! stateless transform: events are extracted as raw bytes and redistributed,
//! so descriptor payloads round-trip bit-exact.
//!
//! [`fix_table`] is the legacy variant for callers holding one subtable as
//! a dense array of sections.

use super::ids::ServiceIdTriplet;
use super::options::EitOptions;
use super::{
    build_empty_section, get_service, is_actual, is_eit, is_present_following, is_schedule,
    segment_to_section, segment_to_table_id, time_to_segment, EIT_EVENT_FIXED_SIZE,
    EIT_PAYLOAD_FIXED_SIZE, SECTIONS_PER_SEGMENT, SEGMENTS_PER_TABLE, TID_EIT_PF_ACT,
    TID_EIT_PF_OTH, TID_EIT_S_ACT_MAX, TID_EIT_S_OTH_MAX,
};
use crate::psi::section::Section;
use crate::psi::MAX_PRIVATE_LONG_SECTION_PAYLOAD_SIZE;
use crate::utils::time::{decode_mjd, this_day};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// One event extracted from an EIT section: raw record plus sort keys.
struct BinaryEvent {
    actual: bool,
    start_time: DateTime<Utc>,
    data: Bytes,
}

type EventMap = BTreeMap<ServiceIdTriplet, Vec<BinaryEvent>>;

/// Extracts all binary events of one EIT section into the per-service map.
fn extract_binary_events(section: &Section, events: &mut EventMap) {
    let payload = section.payload();
    if payload.len() < EIT_PAYLOAD_FIXED_SIZE {
        return;
    }
    let service = get_service(section, true);
    let actual = is_actual(section.table_id());
    let mut data = &payload[EIT_PAYLOAD_FIXED_SIZE..];
    while data.len() >= EIT_EVENT_FIXED_SIZE {
        let desc_len = (((data[10] & 0x0F) as usize) << 8) | data[11] as usize;
        let size = EIT_EVENT_FIXED_SIZE + desc_len;
        if data.len() < size {
            // EIT payload is probably corrupted.
            break;
        }
        let Some(start_time) = decode_mjd(&data[2..7]) else {
            break;
        };
        events.entry(service).or_default().push(BinaryEvent {
            actual,
            start_time,
            data: Bytes::copy_from_slice(&data[..size]),
        });
        data = &data[size..];
    }
}

/// Sorts all event lists by start time and returns the oldest start time.
fn sort_events(events: &mut EventMap, oldest: &mut Option<DateTime<Utc>>) {
    for list in events.values_mut() {
        list.sort_by(|a, b| a.start_time.cmp(&b.start_time).then_with(|| a.data.cmp(&b.data)));
        if let Some(first) = list.first() {
            if oldest.is_none_or(|current| first.start_time < current) {
                *oldest = Some(first.start_time);
            }
        }
    }
}

/// Reorganizes all EIT sections of a bag according to ETSI TS 101 211.
///
/// Non-EIT sections are kept first, in their original order. EIT p/f
/// sections are coalesced into exactly two sections per service; schedule
/// sections are rebuilt from scratch around `reftime` (or the oldest event
/// when absent), one segment per 3 hours from the reference midnight.
/// `options` selects which EIT categories appear in the output; events of
/// unselected categories are dropped.
pub fn reorganize_sections(
    sections: &mut Vec<Section>,
    reftime: Option<DateTime<Utc>>,
    options: EitOptions,
) {
    let mut out: Vec<Section> = Vec::new();
    let mut events_pf: EventMap = EventMap::new();
    let mut events_sched: EventMap = EventMap::new();

    // Pass 1: extract binary events from EIT sections, keep the others.
    for section in sections.drain(..) {
        if is_eit(section.table_id()) {
            let target = if is_present_following(section.table_id()) {
                &mut events_pf
            } else {
                &mut events_sched
            };
            extract_binary_events(&section, target);
        } else {
            out.push(section);
        }
    }

    // Pass 2: sort events per service and find the oldest start time.
    let mut oldest: Option<DateTime<Utc>> = None;
    sort_events(&mut events_pf, &mut oldest);
    sort_events(&mut events_sched, &mut oldest);
    let last_midnight = reftime.or(oldest).map(|t| this_day(&t));

    // Pass 3: one p/f subtable of exactly two sections per service. With a
    // single known event it is the present one; with more, the last two
    // become present and following.
    for (service, events) in &events_pf {
        let Some(first) = events.first() else { continue };
        let gen_pf = if first.actual { EitOptions::GEN_ACTUAL_PF } else { EitOptions::GEN_OTHER_PF };
        if !options.contains(gen_pf) {
            continue;
        }
        let tid = if first.actual { TID_EIT_PF_ACT } else { TID_EIT_PF_OTH };
        let mut present = build_empty_section(tid, 0, 0, service);
        let mut following = build_empty_section(tid, 1, 1, service);
        if events.len() == 1 {
            let _ = present.append_payload(&events[0].data, false);
        } else {
            let _ = present.append_payload(&events[events.len() - 2].data, false);
            let _ = following.append_payload(&events[events.len() - 1].data, false);
        }
        for section in [&mut present, &mut following] {
            section.set_last_section_number(1, false);
            section.set_payload_u8(4, 1, true);
        }
        out.push(present);
        out.push(following);
    }

    // Pass 4: rebuild all schedule sections per service. Every segment from
    // the reference midnight through the last event gets at least one
    // (possibly empty) section; events before the reference are dropped.
    if let Some(last_midnight) = last_midnight {
        for (service, events) in &events_sched {
            let Some(first) = events.first() else { continue };
            let actual = first.actual;
            let gen_sched =
                if actual { EitOptions::GEN_ACTUAL_SCHED } else { EitOptions::GEN_OTHER_SCHED };
            if !options.contains(gen_sched) {
                continue;
            }

            let mut cur_segment = 0usize;
            out.push(build_empty_section(
                segment_to_table_id(actual, cur_segment),
                segment_to_section(cur_segment),
                segment_to_section(cur_segment),
                service,
            ));
            let mut cur = out.len() - 1;

            for event in events {
                if event.start_time < last_midnight {
                    continue;
                }
                let segment = time_to_segment(&last_midnight, &event.start_time);

                // Changing segment creates all intermediate segments, empty.
                while cur_segment < segment {
                    cur_segment += 1;
                    out.push(build_empty_section(
                        segment_to_table_id(actual, cur_segment),
                        segment_to_section(cur_segment),
                        segment_to_section(cur_segment),
                        service,
                    ));
                    cur = out.len() - 1;
                }

                // Start another section when the event does not fit.
                if out[cur].payload_size() + event.data.len()
                    > MAX_PRIVATE_LONG_SECTION_PAYLOAD_SIZE
                {
                    let number = out[cur].section_number() as usize + 1;
                    if number >= segment_to_section(cur_segment) as usize + SECTIONS_PER_SEGMENT {
                        // Segment quota exhausted, drop this event.
                        log::warn!(
                            "segment {} of {} overflows {} sections, dropping event",
                            cur_segment,
                            service,
                            SECTIONS_PER_SEGMENT
                        );
                        continue;
                    }
                    out.push(build_empty_section(
                        segment_to_table_id(actual, cur_segment),
                        number as u8,
                        number as u8,
                        service,
                    ));
                    cur = out.len() - 1;
                }

                let _ = out[cur].append_payload(&event.data, false);
            }
        }
    }

    // Pass 5: fix the synthetic fields of the schedule sections, browsing
    // from the end since the "last" values propagate backwards. Recompute
    // every CRC on the way. Schedule sections are contiguous at the tail.
    let mut last_section_number = 0u8;
    let mut segment_last_section_number = 0u8;
    let mut last_table_id = 0u8;
    let mut cur_service = ServiceIdTriplet::default();
    let mut cur_table_id = 0u8;
    let mut new_service = true;
    let mut new_table = true;
    let mut new_segment = true;

    for section in out.iter_mut().rev() {
        if !is_schedule(section.table_id()) {
            break;
        }
        let this_service = get_service(section, true);
        let this_table_id = section.table_id();
        let this_section_number = section.section_number();

        if new_service || cur_service != this_service {
            cur_service = this_service;
            last_table_id = this_table_id;
            new_service = false;
            new_table = true;
        }
        if new_table || cur_table_id != this_table_id {
            cur_table_id = this_table_id;
            last_section_number = this_section_number;
            new_table = false;
            new_segment = true;
        }
        if new_segment {
            segment_last_section_number = this_section_number;
        }
        new_segment = this_section_number as usize % SECTIONS_PER_SEGMENT == 0;

        section.set_last_section_number(last_section_number, false);
        section.set_payload_u8(4, segment_last_section_number, false);
        section.set_payload_u8(5, last_table_id, true);
    }

    *sections = out;
}

/// Rewrites a schedule section as a standalone single-section object:
/// section 0 of 0, its own table id as `last_table_id`. Returns true when
/// the section was modified.
pub fn set_standalone_schedule(section: &mut Section) -> bool {
    if !is_schedule(section.table_id())
        || (section.section_number() == 0 && section.last_section_number() == 0)
    {
        return false;
    }
    section.set_section_number(0, false);
    section.set_last_section_number(0, false);
    section.set_payload_u8(4, 0, false);
    section.set_payload_u8(5, section.table_id(), true);
    true
}

/// Fixing modes for [`fix_table`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FixMode {
    /// Add empty sections at the end of segments, after
    /// `segment_last_section_number`.
    FillSegments,
    /// Add all missing sections in the table.
    AddMissing,
    /// Additionally fix `segment_last_section_number` and `last_table_id`
    /// in existing sections.
    FixExisting,
}

/// Fixes one EIT subtable seen as a dense array indexed by section number.
///
/// Missing entries are filled with empty sections according to `mode`;
/// with [`FixMode::FixExisting`] the synthetic fields of existing sections
/// are rewritten as well. Callers able to use the sparse representation
/// should prefer [`reorganize_sections`].
pub fn fix_table(sections: &mut Vec<Option<Section>>, mode: FixMode) {
    // Table-wide characteristics from the first valid section.
    let Some(first) = sections.iter().flatten().next() else {
        return;
    };
    let tid = first.table_id();
    if !is_eit(tid) {
        return;
    }
    let tid_ext = first.table_id_extension();
    let version = first.version();
    let schedule = is_schedule(tid);
    let actual = is_actual(tid);
    let last_section = (sections.len() - 1) as u8;
    let mut is_private = true;
    let mut is_current = true;

    // Last table id: the section's own for p/f, highest seen for schedule.
    let mut last_table_id = tid;
    let max_table_id =
        if schedule { if actual { TID_EIT_S_ACT_MAX } else { TID_EIT_S_OTH_MAX } } else { tid };

    // Per-segment last section number, with defaults.
    let mut segment_last: [u8; SEGMENTS_PER_TABLE] = [last_section; SEGMENTS_PER_TABLE];
    if schedule {
        for (segment, entry) in segment_last.iter_mut().enumerate() {
            *entry = (segment * SECTIONS_PER_SEGMENT) as u8;
        }
    }

    // Harvest meaningful content from existing sections.
    let mut empty_payload = [0u8; EIT_PAYLOAD_FIXED_SIZE];
    let mut got_payload = false;
    for (index, section) in sections.iter().enumerate() {
        let Some(section) = section else { continue };
        if section.payload_size() < EIT_PAYLOAD_FIXED_SIZE {
            continue;
        }
        let payload = section.payload();
        if !got_payload {
            empty_payload.copy_from_slice(&payload[..EIT_PAYLOAD_FIXED_SIZE]);
            got_payload = true;
            is_private = section.is_private_section();
            is_current = section.is_current();
        }
        if schedule {
            last_table_id = payload[5].max(last_table_id).min(max_table_id);
            let segment = (index / SECTIONS_PER_SEGMENT).min(SEGMENTS_PER_TABLE - 1);
            let max_section = last_section.min(((segment + 1) * SECTIONS_PER_SEGMENT - 1) as u8);
            segment_last[segment] = payload[4].max(segment_last[segment]).min(max_section);
        }
    }
    empty_payload[5] = last_table_id;

    // Add or fix sections.
    for index in 0..sections.len() {
        let segment = index / SECTIONS_PER_SEGMENT;
        let seg_last = segment_last[segment.min(SEGMENTS_PER_TABLE - 1)];
        match &mut sections[index] {
            None => {
                if mode > FixMode::FillSegments || index as u8 > seg_last {
                    empty_payload[4] = seg_last;
                    if let Ok(section) = Section::new_long(
                        tid,
                        is_private,
                        tid_ext,
                        version,
                        is_current,
                        index as u8,
                        last_section,
                        &empty_payload,
                    ) {
                        sections[index] = Some(section);
                    }
                }
            }
            Some(section) => {
                if mode == FixMode::FixExisting
                    && section.payload_size() >= EIT_PAYLOAD_FIXED_SIZE
                {
                    let payload = section.payload();
                    if payload[4] != seg_last || payload[5] != last_table_id {
                        section.set_payload_u8(4, seg_last, false);
                        section.set_payload_u8(5, last_table_id, true);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::time::{encode_duration, encode_mjd};
    use chrono::{Duration, TimeZone};

    fn event_bytes(event_id: u16, start: DateTime<Utc>, duration_min: i64, desc_len: usize) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&event_id.to_be_bytes());
        data.extend_from_slice(&encode_mjd(&start));
        data.extend_from_slice(&encode_duration(Duration::minutes(duration_min)));
        data.push((desc_len >> 8) as u8 & 0x0F);
        data.push((desc_len & 0xFF) as u8);
        data.extend(std::iter::repeat_n(0xA5, desc_len));
        data
    }

    fn eit_section(tid: u8, service: &ServiceIdTriplet, number: u8, events: &[Vec<u8>]) -> Section {
        let mut section = build_empty_section(tid, number, number, service);
        for event in events {
            section.append_payload(event, false).unwrap();
        }
        section.recompute_crc();
        section
    }

    fn service() -> ServiceIdTriplet {
        ServiceIdTriplet::new(100, 10, 1)
    }

    #[test]
    fn test_pf_coalescing() {
        let start = Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap();
        let ev1 = event_bytes(1, start, 30, 5);
        let ev2 = event_bytes(2, start + Duration::minutes(30), 30, 5);
        let ev3 = event_bytes(3, start + Duration::hours(1), 30, 5);

        // Three events spread over malformed p/f sections.
        let mut sections = vec![
            eit_section(0x4E, &service(), 0, &[ev1.clone()]),
            eit_section(0x4E, &service(), 0, &[ev2.clone(), ev3.clone()]),
        ];
        reorganize_sections(&mut sections, None, EitOptions::GEN_ALL);

        // Exactly two sections, last two events as present and following.
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].section_number(), 0);
        assert_eq!(sections[1].section_number(), 1);
        for section in &sections {
            assert_eq!(section.table_id(), 0x4E);
            assert_eq!(section.last_section_number(), 1);
            assert_eq!(section.payload()[4], 1);
            assert!(section.has_valid_crc());
        }
        assert_eq!(&sections[0].payload()[EIT_PAYLOAD_FIXED_SIZE..], &ev2[..]);
        assert_eq!(&sections[1].payload()[EIT_PAYLOAD_FIXED_SIZE..], &ev3[..]);
    }

    #[test]
    fn test_single_event_is_present() {
        let start = Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap();
        let ev = event_bytes(1, start, 30, 0);
        let mut sections = vec![eit_section(0x4F, &service(), 1, &[ev.clone()])];
        reorganize_sections(&mut sections, None, EitOptions::GEN_ALL);
        assert_eq!(sections.len(), 2);
        assert_eq!(&sections[0].payload()[EIT_PAYLOAD_FIXED_SIZE..], &ev[..]);
        assert_eq!(sections[1].payload_size(), EIT_PAYLOAD_FIXED_SIZE);
    }

    #[test]
    fn test_schedule_rebuild_consistency() {
        let midnight = Utc.with_ymd_and_hms(2024, 6, 15, 0, 0, 0).unwrap();
        // Events in segments 0, 2 and 9 (day 2, second subtable still 0x50).
        let ev_a = event_bytes(1, midnight + Duration::hours(1), 30, 10);
        let ev_b = event_bytes(2, midnight + Duration::hours(7), 30, 10);
        let ev_c = event_bytes(3, midnight + Duration::hours(27), 30, 10);

        // Malformed input: wrong section numbers, inconsistent last fields.
        let mut sections = vec![
            eit_section(0x50, &service(), 3, &[ev_b.clone()]),
            eit_section(0x50, &service(), 17, &[ev_c.clone()]),
            eit_section(0x51, &service(), 0, &[ev_a.clone()]),
        ];
        reorganize_sections(&mut sections, Some(midnight), EitOptions::GEN_ALL);

        // Segments 0 through 9, one section each.
        assert_eq!(sections.len(), 10);
        for (index, section) in sections.iter().enumerate() {
            assert_eq!(section.table_id(), 0x50);
            assert_eq!(section.section_number(), (index * SECTIONS_PER_SEGMENT) as u8);
            assert_eq!(section.last_section_number(), sections[9].section_number());
            assert_eq!(section.payload()[5], 0x50);
            assert!(section.has_valid_crc());
        }
        assert_eq!(&sections[0].payload()[EIT_PAYLOAD_FIXED_SIZE..], &ev_a[..]);
        assert_eq!(&sections[2].payload()[EIT_PAYLOAD_FIXED_SIZE..], &ev_b[..]);
        assert_eq!(&sections[9].payload()[EIT_PAYLOAD_FIXED_SIZE..], &ev_c[..]);
        // Empty intermediate segments still carry one section.
        assert_eq!(sections[1].payload_size(), EIT_PAYLOAD_FIXED_SIZE);
    }

    #[test]
    fn test_non_eit_sections_kept_first() {
        let pat = Section::new_long(0x00, false, 1, 0, true, 0, 0, &[0x00, 0x01, 0xE1, 0x00]).unwrap();
        let start = Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap();
        let ev = event_bytes(1, start, 30, 0);
        let mut sections = vec![
            eit_section(0x50, &service(), 0, &[ev]),
            pat.clone(),
        ];
        reorganize_sections(&mut sections, None, EitOptions::GEN_ALL);
        assert_eq!(sections[0].content(), pat.content());
        assert!(is_schedule(sections[1].table_id()));
    }

    #[test]
    fn test_options_filter_categories() {
        let start = Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap();
        let ev = event_bytes(1, start, 30, 0);
        let mut sections = vec![
            eit_section(0x4E, &service(), 0, &[ev.clone()]),
            eit_section(0x50, &service(), 0, &[ev.clone()]),
        ];
        // Only schedule requested: the p/f events disappear.
        reorganize_sections(&mut sections, None, EitOptions::GEN_SCHED);
        assert!(sections.iter().all(|s| is_schedule(s.table_id())));
    }

    #[test]
    fn test_reorganize_idempotent() {
        let midnight = Utc.with_ymd_and_hms(2024, 6, 15, 0, 0, 0).unwrap();
        let mut sections = vec![
            eit_section(0x50, &service(), 7, &[event_bytes(1, midnight + Duration::hours(2), 30, 50)]),
            eit_section(0x4E, &service(), 0, &[event_bytes(2, midnight + Duration::hours(1), 30, 8)]),
            eit_section(0x50, &service(), 2, &[event_bytes(3, midnight + Duration::hours(5), 30, 0)]),
        ];
        reorganize_sections(&mut sections, Some(midnight), EitOptions::GEN_ALL);
        let first: Vec<Vec<u8>> = sections.iter().map(|s| s.content().to_vec()).collect();
        reorganize_sections(&mut sections, Some(midnight), EitOptions::GEN_ALL);
        let second: Vec<Vec<u8>> = sections.iter().map(|s| s.content().to_vec()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_set_standalone_schedule() {
        let mut section = eit_section(0x50, &service(), 9, &[]);
        section.set_last_section_number(24, true);
        assert!(set_standalone_schedule(&mut section));
        assert_eq!(section.section_number(), 0);
        assert_eq!(section.last_section_number(), 0);
        assert_eq!(section.payload()[4], 0);
        assert_eq!(section.payload()[5], 0x50);
        assert!(section.has_valid_crc());

        // Already standalone: untouched.
        assert!(!set_standalone_schedule(&mut section));
        // p/f sections are not eligible.
        let mut pf = eit_section(0x4E, &service(), 1, &[]);
        assert!(!set_standalone_schedule(&mut pf));
    }

    #[test]
    fn test_fix_table_add_missing() {
        let service = service();
        let mut table: Vec<Option<Section>> = vec![
            Some(eit_section(0x50, &service, 0, &[])),
            None,
            Some(eit_section(0x50, &service, 2, &[])),
            None,
        ];
        // Mark section 2 as last of the segment.
        if let Some(section) = table[2].as_mut() {
            section.set_payload_u8(4, 2, true);
        }
        fix_table(&mut table, FixMode::AddMissing);
        assert!(table.iter().all(|s| s.is_some()));
        let added = table[1].as_ref().unwrap();
        assert_eq!(added.table_id(), 0x50);
        assert_eq!(added.section_number(), 1);
        assert_eq!(added.last_section_number(), 3);
        assert!(added.has_valid_crc());
    }

    #[test]
    fn test_fix_table_fix_existing() {
        let service = service();
        let mut table: Vec<Option<Section>> = vec![
            Some(eit_section(0x50, &service, 0, &[])),
            Some(eit_section(0x52, &service, 1, &[])),
        ];
        // Inconsistent last_table_id values across the sections.
        fix_table(&mut table, FixMode::FixExisting);
        let first = table[0].as_ref().unwrap();
        assert_eq!(first.payload()[5], 0x52);
        assert_eq!(first.payload()[4], 1);
        assert!(first.has_valid_crc());
    }
}
