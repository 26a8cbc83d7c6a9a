//! EIT generation and injection engine.
//!
//! The [`EitGenerator`] maintains an EPG database of binary events, organized
//! as services, 3-hour segments and sections, and continuously injects
//! correctly-formed EIT sections into a transport stream on the EIT PID.
//!
//! Principles:
//!
//! - Events are stored as raw binary data so descriptor payloads round-trip
//!   bit-exact and remain opaque to the generator.
//! - EIT sections are regenerated lazily: loading events or moving the clock
//!   only flags services and segments as stale; the actual section rebuild
//!   happens when a section must be produced or saved.
//! - Sections are shared between the database and the injection queues via
//!   reference-counted handles; a section blob referenced by the active
//!   packetizer is never mutated in place (copy-on-write through
//!   [`Section`]'s buffer semantics).
//! - Each section lives in exactly one of six injection queues, ordered by
//!   due time, one queue per repetition priority class.

use super::ids::ServiceIdTriplet;
use super::options::EitOptions;
use super::profile::{EitRepetitionProfile, PROFILE_COUNT};
use super::{
    build_empty_section, get_service, is_actual, is_eit, segment_duration, segment_start_time,
    segment_to_section, segment_to_table_id, toggle_actual, EIT_EVENT_FIXED_SIZE,
    EIT_PAYLOAD_FIXED_SIZE, SECTIONS_PER_SEGMENT, SEGMENTS_PER_TABLE, TID_EIT_PF_ACT,
    TID_EIT_PF_OTH, TOTAL_DAYS,
};
use crate::error::{EitError, Result};
use crate::packetizer::{Packetizer, SectionProvider};
use crate::psi::demux::SectionDemux;
use crate::psi::section::Section;
use crate::psi::{MAX_PRIVATE_LONG_SECTION_PAYLOAD_SIZE, TID_PAT, TID_TDT, TID_TOT};
use crate::ts::{TsPacket, PID_NULL, PID_PAT, PID_TDT};
use crate::utils::time::{decode_duration, decode_mjd, this_day, MJD_SIZE};
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::rc::Rc;

/// One binary EPG event: identification, decoded times and the full on-wire
/// record from event_id through the end of the descriptor loop.
#[derive(Clone)]
struct Event {
    event_id: u16,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    data: Bytes,
}

impl Event {
    /// Parses the next binary event record, advancing the input slice.
    fn parse(input: &mut &[u8]) -> Result<Self> {
        let data = *input;
        if data.len() < EIT_EVENT_FIXED_SIZE {
            return Err(EitError::Parser("truncated EPG event data".into()));
        }
        let desc_len = (((data[10] & 0x0F) as usize) << 8) | data[11] as usize;
        let size = EIT_EVENT_FIXED_SIZE + desc_len;
        if data.len() < size {
            return Err(EitError::Parser("truncated EPG event descriptor loop".into()));
        }
        let event_id = ((data[0] as u16) << 8) | data[1] as u16;
        let start_time = decode_mjd(&data[2..7])
            .ok_or_else(|| EitError::Parser(format!("invalid start time in event 0x{event_id:04X}")))?;
        let duration = decode_duration(&data[7..10])
            .ok_or_else(|| EitError::Parser(format!("invalid duration in event 0x{event_id:04X}")))?;
        let event = Self {
            event_id,
            start_time,
            end_time: start_time + duration,
            data: Bytes::copy_from_slice(&data[..size]),
        };
        *input = &data[size..];
        Ok(event)
    }
}

/// One EIT section under the generator's control.
struct ESection {
    /// The section was dropped from the database; discard it when it
    /// surfaces in an injection queue.
    obsolete: bool,
    /// The section blob is (or was recently) referenced by the packetizer.
    injected: bool,
    /// Due time of the next injection.
    next_inject: DateTime<Utc>,
    section: Section,
}

type ESectionRef = Rc<RefCell<ESection>>;

impl ESection {
    /// Declares an upcoming mutation. The buffer semantics of [`Section`]
    /// already guarantee that a clone inside the packetizer keeps its view,
    /// so this only drops the "in packetizer" mark.
    fn start_modifying(&mut self) {
        self.injected = false;
    }

    /// Flips the section between actual and other when needed.
    fn toggle_actual(&mut self, actual: bool) {
        if is_actual(self.section.table_id()) != actual {
            self.start_modifying();
            let tid = toggle_actual(self.section.table_id(), actual);
            self.section.set_table_id(tid, true);
        }
    }
}

/// A 3-hour slice of one service's EPG.
struct ESegment {
    start_time: DateTime<Utc>,
    /// The sections no longer reflect the events.
    regenerate: bool,
    /// Events ordered by start time, all within the 3-hour window.
    events: VecDeque<Event>,
    /// Up to 8 schedule sections covering the events.
    sections: Vec<ESectionRef>,
}

impl ESegment {
    fn new(start_time: DateTime<Utc>) -> Self {
        // A fresh segment always needs at least one (possibly empty) section.
        Self { start_time, regenerate: true, events: VecDeque::new(), sections: Vec::new() }
    }
}

/// Description of one service in the EPG database.
#[derive(Default)]
struct EService {
    /// Some segments of the service must be regenerated.
    regenerate: bool,
    /// Present (index 0) and following (index 1) sections.
    pf: [Option<ESectionRef>; 2],
    /// Contiguous 3-hour segments, ordered by start time.
    segments: VecDeque<ESegment>,
}

type EServiceRef = Rc<RefCell<EService>>;

/// Generator state which is also the packetizer's section provider.
struct EitCore {
    options: EitOptions,
    profile: EitRepetitionProfile,
    actual_ts_id: Option<u16>,
    /// Some services must be regenerated.
    regenerate: bool,
    packet_index: u64,
    ts_bitrate: u64,
    max_bitrate: u64,
    /// Reference clock: UTC time at packet `ref_time_pkt`.
    ref_time: Option<DateTime<Utc>>,
    ref_time_pkt: u64,
    /// Minimum number of packets between two EIT packets (0 = no limit).
    eit_inter_pkt: u64,
    last_eit_pkt: u64,
    /// Minimum delay between two sections of one subtable, DVB requires
    /// at least 25 ms.
    section_gap: Duration,
    /// (table id, table id extension, queue index) of the last injected section.
    last_injected: Option<(u8, u16, usize)>,
    services: BTreeMap<ServiceIdTriplet, EServiceRef>,
    /// Injection queues, one per priority class, sorted by due time.
    injects: [VecDeque<ESectionRef>; PROFILE_COUNT],
    /// Obsolete sections still sitting in injection queues.
    obsolete_count: usize,
    /// Last used version per section identity key.
    versions: HashMap<u64, u8>,
}

/// Duration of `packets` TS packets at `bitrate` bits per second.
fn packet_interval(bitrate: u64, packets: u64) -> Duration {
    if bitrate == 0 {
        Duration::zero()
    } else {
        Duration::milliseconds((packets * 188 * 8 * 1000 / bitrate) as i64)
    }
}

impl EitCore {
    fn new(options: EitOptions, profile: EitRepetitionProfile) -> Self {
        Self {
            options,
            profile,
            actual_ts_id: None,
            regenerate: false,
            packet_index: 0,
            ts_bitrate: 0,
            max_bitrate: 0,
            ref_time: None,
            ref_time_pkt: 0,
            eit_inter_pkt: 0,
            last_eit_pkt: 0,
            section_gap: Duration::milliseconds(30),
            last_injected: None,
            services: BTreeMap::new(),
            injects: std::array::from_fn(|_| VecDeque::new()),
            obsolete_count: 0,
            versions: HashMap::new(),
        }
    }

    /// Current UTC time, extrapolated from the reference time by the number
    /// of packets elapsed at the TS bitrate. `None` while the clock is unknown.
    fn current_time(&self) -> Option<DateTime<Utc>> {
        self.ref_time
            .map(|t| t + packet_interval(self.ts_bitrate, self.packet_index - self.ref_time_pkt))
    }

    fn set_current_time(&mut self, utc: DateTime<Utc>) {
        self.ref_time = Some(utc);
        self.ref_time_pkt = self.packet_index;
        log::debug!("TS time set to {} at packet {}", utc, self.packet_index);
        self.update_for_new_time();
    }

    fn update_inter_packet(&mut self) {
        self.eit_inter_pkt = if self.ts_bitrate == 0 || self.max_bitrate == 0 {
            // Cannot compute an interval, use cycle-driven insertion only.
            0
        } else {
            self.ts_bitrate / self.max_bitrate
        };
    }

    /// Allocates the next version for a section identity. Under
    /// `SYNC_VERSIONS` the section number is ignored so that all sections of
    /// one subtable share a version counter.
    fn next_version(&mut self, service: &ServiceIdTriplet, table_id: u8, section_number: u8) -> u8 {
        let number = if self.options.contains(EitOptions::SYNC_VERSIONS) { 0 } else { section_number };
        let key = ((table_id as u64) << 56)
            | ((service.original_network_id as u64) << 40)
            | ((service.transport_stream_id as u64) << 24)
            | ((service.service_id as u64) << 8)
            | number as u64;
        let entry = self.versions.entry(key);
        match entry {
            std::collections::hash_map::Entry::Vacant(vacant) => {
                vacant.insert(0);
                0
            }
            std::collections::hash_map::Entry::Occupied(mut occupied) => {
                let next = (*occupied.get() + 1) & 0x1F;
                *occupied.get_mut() = next;
                next
            }
        }
    }

    /// Bumps the version of one section, unless versions are synchronized
    /// per subtable (they are then updated in a dedicated pass).
    fn update_version(&mut self, sec: &ESectionRef, recompute_crc: bool) {
        if self.options.contains(EitOptions::SYNC_VERSIONS) {
            return;
        }
        let (service, table_id, section_number) = {
            let guard = sec.borrow();
            (get_service(&guard.section, false), guard.section.table_id(), guard.section.section_number())
        };
        let version = self.next_version(&service, table_id, section_number);
        let mut guard = sec.borrow_mut();
        guard.start_modifying();
        guard.section.set_version(version, recompute_crc);
    }

    /// Builds an empty EIT section for one service and assigns its version.
    fn new_esection(
        &mut self,
        service: &ServiceIdTriplet,
        table_id: u8,
        section_number: u8,
        last_section_number: u8,
    ) -> ESectionRef {
        let section = build_empty_section(table_id, section_number, last_section_number, service);
        let esec = Rc::new(RefCell::new(ESection {
            obsolete: false,
            injected: false,
            next_inject: DateTime::<Utc>::MIN_UTC,
            section,
        }));
        self.update_version(&esec, true);
        esec
    }

    /// Marks a section obsolete and garbage-collects the injection queues
    /// when too many obsolete sections accumulate (bandwidth starvation can
    /// keep low-priority queues from draining naturally).
    fn mark_obsolete_section(&mut self, sec: &ESectionRef) {
        {
            let mut guard = sec.borrow_mut();
            if guard.obsolete {
                return;
            }
            guard.obsolete = true;
        }
        self.obsolete_count += 1;
        if self.obsolete_count > 100 {
            for list in &mut self.injects {
                list.retain(|entry| !entry.borrow().obsolete);
            }
            self.obsolete_count = 0;
        }
    }

    fn mark_obsolete_segment(&mut self, seg: &ESegment) {
        for sec in &seg.sections {
            self.mark_obsolete_section(sec);
        }
    }

    /// Enqueues a section in the priority queue matching its profile,
    /// keeping the queue sorted by due time.
    fn enqueue_inject_section(&mut self, sec: ESectionRef, next_inject: DateTime<Utc>, try_front: bool) {
        let index = {
            let mut guard = sec.borrow_mut();
            guard.next_inject = next_inject;
            self.profile.section_to_profile(&guard.section) as usize
        };
        let list = &mut self.injects[index];
        let position = if try_front {
            list.iter()
                .position(|entry| entry.borrow().next_inject > next_inject)
                .unwrap_or(list.len())
        } else {
            list.iter()
                .rposition(|entry| entry.borrow().next_inject <= next_inject)
                .map(|p| p + 1)
                .unwrap_or(0)
        };
        list.insert(position, sec);
    }

    /// Loads binary events into one service (see [`EitGenerator::load_events`]).
    fn load_events(&mut self, service_id: ServiceIdTriplet, data: &[u8]) -> Result<()> {
        let now = self.current_time();
        let ref_midnight = now.map(|n| this_day(&n));
        let mut input = data;
        let mut loaded = 0usize;
        let mut outcome = Ok(());

        while !input.is_empty() {
            let event = match Event::parse(&mut input) {
                Ok(event) => event,
                Err(err) => {
                    log::error!("error loading EPG event for {}: {}", service_id, err);
                    outcome = Err(err);
                    break;
                }
            };

            if let (Some(now), Some(midnight)) = (now, ref_midnight) {
                // Discard events in the past.
                if event.end_time <= now {
                    log::debug!(
                        "discard obsolete event 0x{:04X} ({}), ending {}",
                        event.event_id,
                        service_id,
                        event.end_time
                    );
                    continue;
                }
                // Discard events beyond the EPG depth.
                if event.start_time >= midnight + Duration::days(TOTAL_DAYS) {
                    log::debug!(
                        "discard event 0x{:04X} ({}), starting {}, too far in the future",
                        event.event_id,
                        service_id,
                        event.start_time
                    );
                    continue;
                }
            }

            // Create the service only when there is an event to insert.
            let srv_rc = self
                .services
                .entry(service_id)
                .or_insert_with(|| Rc::new(RefCell::new(EService::default())))
                .clone();
            let mut srv = srv_rc.borrow_mut();

            // Locate or create the segment of that event. Intermediate empty
            // segments are not created here; regenerate_schedule() does that.
            let seg_start = segment_start_time(&event.start_time);
            let seg_index = srv
                .segments
                .iter()
                .position(|seg| seg.start_time >= seg_start)
                .unwrap_or(srv.segments.len());
            if srv.segments.get(seg_index).is_none_or(|seg| seg.start_time != seg_start) {
                log::debug!("creating EIT segment at {} for {}", seg_start, service_id);
                srv.segments.insert(seg_index, ESegment::new(seg_start));
            }
            let seg = &mut srv.segments[seg_index];

            // Insert the event in start-time order, dropping duplicates.
            let ev_index = seg
                .events
                .iter()
                .position(|existing| existing.start_time >= event.start_time)
                .unwrap_or(seg.events.len());
            if seg.events.get(ev_index).is_some_and(|existing| {
                existing.event_id == event.event_id && existing.data == event.data
            }) {
                continue;
            }
            log::trace!(
                "loaded event 0x{:04X} ({}), starting {}",
                event.event_id,
                service_id,
                event.start_time
            );
            seg.events.insert(ev_index, event);
            loaded += 1;

            seg.regenerate = true;
            srv.regenerate = true;
            self.regenerate = true;
        }

        if loaded > 0 {
            self.regenerate_present_following(&service_id);
        }
        outcome
    }

    /// Loads events from one EIT section, optionally learning the actual
    /// TS id from an EIT-actual section.
    fn load_events_section(&mut self, section: &Section, get_actual_ts: bool) -> Result<()> {
        if !is_eit(section.table_id()) || section.payload_size() < EIT_PAYLOAD_FIXED_SIZE {
            return Err(EitError::InvalidData("not a usable EIT section".into()));
        }
        let payload = section.payload();
        if get_actual_ts && self.actual_ts_id.is_none() && is_actual(section.table_id()) {
            let ts_id = ((payload[0] as u16) << 8) | payload[1] as u16;
            self.set_transport_stream_id(ts_id);
        }
        let service = get_service(section, false);
        self.load_events(service, &payload[EIT_PAYLOAD_FIXED_SIZE..])
    }

    /// Defines the "actual" transport stream and reclassifies every stored
    /// section between actual and other accordingly.
    fn set_transport_stream_id(&mut self, new_ts_id: u16) {
        if self.actual_ts_id == Some(new_ts_id) {
            return;
        }
        log::debug!("EIT generator TS id set to 0x{:04X}", new_ts_id);
        let old_ts_id = self.actual_ts_id.unwrap_or(0xFFFF);
        self.actual_ts_id = Some(new_ts_id);

        // Cannot retarget the sections without a reference time.
        let Some(_now) = self.current_time() else {
            return;
        };

        let entries: Vec<(ServiceIdTriplet, EServiceRef)> =
            self.services.iter().map(|(k, v)| (*k, v.clone())).collect();
        for (service_id, srv_rc) in entries {
            let new_actual = service_id.transport_stream_id == new_ts_id;
            let new_other = service_id.transport_stream_id == old_ts_id;
            if !new_actual && !new_other {
                continue;
            }
            let need_eit = (new_actual && self.options.intersects(EitOptions::GEN_ACTUAL))
                || (new_other && self.options.intersects(EitOptions::GEN_OTHER));

            // EIT p/f of the service.
            let gen_pf =
                if new_actual { EitOptions::GEN_ACTUAL_PF } else { EitOptions::GEN_OTHER_PF };
            if self.options.contains(gen_pf) {
                let missing = {
                    let srv = srv_rc.borrow();
                    srv.pf[0].is_none() || srv.pf[1].is_none()
                };
                if need_eit && missing {
                    self.regenerate_present_following(&service_id);
                } else {
                    let mut srv = srv_rc.borrow_mut();
                    for slot in &mut srv.pf {
                        if need_eit {
                            if let Some(sec) = slot {
                                sec.borrow_mut().toggle_actual(new_actual);
                            }
                        } else if let Some(sec) = slot.take() {
                            self.mark_obsolete_section(&sec);
                        }
                    }
                }
            }

            // EIT schedule of the service (all segments, all sections).
            if self.options.intersects(EitOptions::GEN_SCHED) {
                let mut srv = srv_rc.borrow_mut();
                if self.options.contains(EitOptions::GEN_ACTUAL | EitOptions::GEN_OTHER) {
                    // Actual and other both requested: flip existing sections.
                    for seg in &srv.segments {
                        for sec in &seg.sections {
                            sec.borrow_mut().toggle_actual(new_actual);
                        }
                    }
                } else if need_eit {
                    // The schedule sections were absent, regenerate later.
                    self.regenerate = true;
                    srv.regenerate = true;
                    for seg in srv.segments.iter_mut() {
                        seg.regenerate = true;
                    }
                } else {
                    // The schedule sections are no longer needed.
                    for index in 0..srv.segments.len() {
                        let sections = std::mem::take(&mut srv.segments[index].sections);
                        for sec in &sections {
                            self.mark_obsolete_section(sec);
                        }
                        srv.segments[index].regenerate = false;
                    }
                }
            }
        }
    }

    /// Applies a new option mask, deleting now-unwanted sections and
    /// scheduling regeneration of newly-wanted ones.
    fn set_options(&mut self, options: EitOptions) {
        let old_options = self.options;
        self.options = options;

        let pf_changed = (options & EitOptions::GEN_PF) != (old_options & EitOptions::GEN_PF);
        let sched_changed =
            (options & EitOptions::GEN_SCHED) != (old_options & EitOptions::GEN_SCHED);
        let Some(actual_ts_id) = self.actual_ts_id else { return };
        if (!pf_changed && !sched_changed) || self.current_time().is_none() {
            return;
        }

        let entries: Vec<(ServiceIdTriplet, EServiceRef)> =
            self.services.iter().map(|(k, v)| (*k, v.clone())).collect();
        for (service_id, srv_rc) in entries {
            let actual = service_id.transport_stream_id == actual_ts_id;
            let need_eit = (actual && self.options.intersects(EitOptions::GEN_ACTUAL))
                || (!actual && self.options.intersects(EitOptions::GEN_OTHER));
            let gen_pf = if actual { EitOptions::GEN_ACTUAL_PF } else { EitOptions::GEN_OTHER_PF };
            let gen_sched =
                if actual { EitOptions::GEN_ACTUAL_SCHED } else { EitOptions::GEN_OTHER_SCHED };

            if pf_changed {
                if !need_eit || !self.options.contains(gen_pf) {
                    let mut srv = srv_rc.borrow_mut();
                    for slot in &mut srv.pf {
                        if let Some(sec) = slot.take() {
                            self.mark_obsolete_section(&sec);
                        }
                    }
                } else {
                    let missing = {
                        let srv = srv_rc.borrow();
                        srv.pf[0].is_none() || srv.pf[1].is_none()
                    };
                    if missing {
                        self.regenerate_present_following(&service_id);
                    }
                }
            }

            if sched_changed {
                let mut srv = srv_rc.borrow_mut();
                if !need_eit || !self.options.contains(gen_sched) {
                    for index in 0..srv.segments.len() {
                        let sections = std::mem::take(&mut srv.segments[index].sections);
                        for sec in &sections {
                            self.mark_obsolete_section(sec);
                        }
                        srv.segments[index].regenerate = false;
                    }
                } else {
                    self.regenerate = true;
                    srv.regenerate = true;
                    for seg in srv.segments.iter_mut() {
                        seg.regenerate = true;
                    }
                }
            }
        }
    }

    /// Rebuilds, when necessary, the two p/f sections of one service.
    fn regenerate_present_following(&mut self, service_id: &ServiceIdTriplet) {
        let (Some(actual_ts_id), Some(now)) = (self.actual_ts_id, self.current_time()) else {
            return;
        };
        let Some(srv_rc) = self.services.get(service_id).cloned() else {
            return;
        };
        let actual = actual_ts_id == service_id.transport_stream_id;
        let gen_pf = if actual { EitOptions::GEN_ACTUAL_PF } else { EitOptions::GEN_OTHER_PF };

        if !self.options.contains(gen_pf) {
            // This category is not generated; drop existing sections.
            let mut srv = srv_rc.borrow_mut();
            for slot in &mut srv.pf {
                if let Some(sec) = slot.take() {
                    self.mark_obsolete_section(&sec);
                }
            }
            return;
        }

        // Find the first two events of the service.
        let mut events: [Option<Event>; 2] = [None, None];
        {
            let srv = srv_rc.borrow();
            let mut slot = 0;
            'outer: for seg in &srv.segments {
                for event in &seg.events {
                    events[slot] = Some(event.clone());
                    slot += 1;
                    if slot == events.len() {
                        break 'outer;
                    }
                }
            }
        }

        // If the first event has not started yet, it is the "following" one.
        if events[0].as_ref().is_some_and(|ev| now < ev.start_time) {
            events[1] = events[0].take();
        }

        let tid = if actual { TID_EIT_PF_ACT } else { TID_EIT_PF_OTH };
        let [present, following] = events;
        let modified_p = self.regenerate_pf_section(service_id, &srv_rc, 0, tid, present, now);
        let modified_f = self.regenerate_pf_section(service_id, &srv_rc, 1, tid, following, now);

        // With synchronized versions, one new version covers both sections.
        if (modified_p || modified_f) && self.options.contains(EitOptions::SYNC_VERSIONS) {
            let version = self.next_version(service_id, tid, 0);
            let srv = srv_rc.borrow();
            for slot in &srv.pf {
                if let Some(sec) = slot {
                    sec.borrow_mut().section.set_version(version, true);
                }
            }
        }
    }

    /// Rebuilds one p/f section when its content does not match the event.
    /// Returns true when the section was created or modified.
    fn regenerate_pf_section(
        &mut self,
        service_id: &ServiceIdTriplet,
        srv_rc: &EServiceRef,
        slot: usize,
        tid: u8,
        event: Option<Event>,
        inject_time: DateTime<Utc>,
    ) -> bool {
        let existing = srv_rc.borrow().pf[slot].clone();
        match existing {
            None => {
                // The section did not exist, create it.
                let sec = self.new_esection(service_id, tid, slot as u8, 1);
                {
                    let mut guard = sec.borrow_mut();
                    if let Some(event) = &event {
                        if let Err(err) = guard.section.append_payload(&event.data, false) {
                            log::warn!("cannot build EIT p/f for {}: {}", service_id, err);
                        }
                    }
                    if !self.options.contains(EitOptions::SYNC_VERSIONS) {
                        guard.section.recompute_crc();
                    }
                }
                self.enqueue_inject_section(sec.clone(), inject_time, true);
                srv_rc.borrow_mut().pf[slot] = Some(sec);
                true
            }
            Some(sec) => {
                let mut guard = sec.borrow_mut();
                match &event {
                    None => {
                        // No more event: truncate the section to its fixed part.
                        if guard.section.table_id() != tid
                            || guard.section.payload_size() != EIT_PAYLOAD_FIXED_SIZE
                        {
                            guard.start_modifying();
                            guard.section.set_table_id(tid, false);
                            guard.section.truncate_payload(EIT_PAYLOAD_FIXED_SIZE, false);
                            drop(guard);
                            self.update_version(&sec, true);
                            true
                        } else {
                            false
                        }
                    }
                    Some(event) => {
                        let same_event = guard.section.payload_size()
                            == EIT_PAYLOAD_FIXED_SIZE + event.data.len()
                            && guard.section.payload()[EIT_PAYLOAD_FIXED_SIZE..] == event.data[..];
                        if !same_event {
                            // Different event: rebuild the payload.
                            guard.start_modifying();
                            guard.section.set_table_id(tid, false);
                            guard.section.truncate_payload(EIT_PAYLOAD_FIXED_SIZE, false);
                            if let Err(err) = guard.section.append_payload(&event.data, false) {
                                log::warn!("cannot rebuild EIT p/f for {}: {}", service_id, err);
                            }
                            drop(guard);
                            self.update_version(&sec, true);
                            true
                        } else if guard.section.table_id() != tid {
                            // Same event but the TS id changed the table id.
                            guard.start_modifying();
                            guard.section.set_table_id(tid, false);
                            drop(guard);
                            self.update_version(&sec, true);
                            true
                        } else {
                            false
                        }
                    }
                }
            }
        }
    }

    /// Rebuilds all stale EIT schedule sections: trims obsolete segments,
    /// creates missing ones, repacks events into sections and fixes the
    /// synthetic fields (`last_section_number`, `segment_last_section_number`,
    /// `last_table_id`) across each service.
    fn regenerate_schedule(&mut self) {
        let (Some(actual_ts_id), Some(now)) = (self.actual_ts_id, self.current_time()) else {
            return;
        };
        if !self.regenerate {
            return;
        }
        let last_midnight = this_day(&now);
        let sync_versions = self.options.contains(EitOptions::SYNC_VERSIONS);

        let entries: Vec<(ServiceIdTriplet, EServiceRef)> =
            self.services.iter().map(|(k, v)| (*k, v.clone())).collect();
        for (service_id, srv_rc) in entries {
            if !srv_rc.borrow().regenerate {
                continue;
            }
            let mut srv = srv_rc.borrow_mut();
            let actual = service_id.transport_stream_id == actual_ts_id;
            let gen_sched =
                if actual { EitOptions::GEN_ACTUAL_SCHED } else { EitOptions::GEN_OTHER_SCHED };
            let need_eits = self.options.contains(gen_sched);
            log::debug!("regenerating schedule for {}", service_id);

            // Subtables which need a synchronized version bump.
            let mut sync_tids: BTreeSet<u8> = BTreeSet::new();

            // Remove initial segments before last midnight.
            while srv.segments.front().is_some_and(|seg| seg.start_time < last_midnight) {
                if let Some(seg) = srv.segments.pop_front() {
                    self.mark_obsolete_segment(&seg);
                }
            }

            // Remove trailing empty segments, keeping at least last midnight's.
            while srv.segments.back().is_some_and(|seg| {
                seg.events.is_empty() && seg.start_time > last_midnight
            }) {
                if let Some(seg) = srv.segments.pop_back() {
                    self.mark_obsolete_segment(&seg);
                }
            }

            // Guarantee the first segment at last midnight.
            if srv.segments.front().is_none_or(|seg| seg.start_time != last_midnight) {
                log::debug!("creating EIT segment at {} for {}", last_midnight, service_id);
                srv.segments.push_front(ESegment::new(last_midnight));
            }

            // Walk all segments in time order, filling the gaps.
            let mut segment_start = last_midnight;
            let mut segment_number = 0usize;
            let mut index = 0usize;
            while index < srv.segments.len() {
                if srv.segments[index].start_time != segment_start {
                    log::debug!("creating EIT segment at {} for {}", segment_start, service_id);
                    srv.segments.insert(index, ESegment::new(segment_start));
                }

                if !need_eits {
                    // No EIT schedule wanted here, delete all sections.
                    let sections = std::mem::take(&mut srv.segments[index].sections);
                    for sec in &sections {
                        self.mark_obsolete_section(sec);
                    }
                } else if srv.segments[index].regenerate {
                    self.regenerate_segment(
                        &service_id,
                        &mut srv.segments[index],
                        actual,
                        segment_number,
                        now,
                        sync_versions,
                        &mut sync_tids,
                    );
                }

                srv.segments[index].regenerate = false;
                segment_start += segment_duration();
                segment_number += 1;
                index += 1;
            }

            // Fix the synthetic fields in all schedule sections, walking the
            // segments from last to first.
            if need_eits {
                let mut segment_number = srv.segments.len();
                let mut previous_table_id: Option<u8> = None;
                let mut last_table_id = 0u8;
                let mut last_section_number = 0u8;
                let mut version_bumps: Vec<ESectionRef> = Vec::new();

                for (rev_index, seg) in srv.segments.iter().rev().enumerate() {
                    segment_number -= 1;
                    let table_id = segment_to_table_id(actual, segment_number);
                    let first_section = segment_to_section(segment_number);
                    let segment_last_section =
                        first_section + seg.sections.len().max(1) as u8 - 1;

                    if previous_table_id != Some(table_id) {
                        // Entering (from the back) the last segment of a table.
                        last_section_number = segment_last_section;
                        previous_table_id = Some(table_id);
                    }
                    if rev_index == 0 {
                        last_table_id = table_id;
                    }

                    let mut section_number = first_section;
                    for sec in &seg.sections {
                        let mut guard = sec.borrow_mut();
                        let payload_ok = guard.section.payload_size() >= EIT_PAYLOAD_FIXED_SIZE;
                        let needs_patch = payload_ok
                            && (guard.section.section_number() != section_number
                                || guard.section.last_section_number() != last_section_number
                                || guard.section.payload()[4] != segment_last_section
                                || guard.section.payload()[5] != last_table_id);
                        if needs_patch {
                            let number_changed = guard.section.section_number() != section_number;
                            guard.start_modifying();
                            if number_changed {
                                guard.section.set_section_number(section_number, false);
                            }
                            guard.section.set_last_section_number(last_section_number, false);
                            guard.section.set_payload_u8(4, segment_last_section, false);
                            guard.section.set_payload_u8(5, last_table_id, !sync_versions);
                            drop(guard);
                            if number_changed {
                                version_bumps.push(sec.clone());
                            }
                            if sync_versions {
                                sync_tids.insert(table_id);
                            }
                        }
                        section_number += 1;
                    }
                }
                for sec in version_bumps {
                    self.update_version(&sec, true);
                }
            }

            // Synchronized version bump for all sections of updated subtables.
            if !sync_tids.is_empty() {
                let mut segment_number = 0usize;
                let mut index = 0usize;
                while index < srv.segments.len() {
                    let table_id = segment_to_table_id(actual, segment_number);
                    let version = self.next_version(&service_id, table_id, 0);
                    let update = sync_tids.contains(&table_id);
                    for _ in 0..SEGMENTS_PER_TABLE {
                        if index >= srv.segments.len() {
                            break;
                        }
                        if update {
                            for sec in &srv.segments[index].sections {
                                let mut guard = sec.borrow_mut();
                                guard.start_modifying();
                                guard.section.set_version(version, true);
                            }
                        }
                        segment_number += 1;
                        index += 1;
                    }
                }
            }

            srv.regenerate = false;
        }

        self.regenerate = false;
    }

    /// Rebuilds the sections of one segment around its current event list.
    /// Sections which already contain exactly the right events are kept.
    #[allow(clippy::too_many_arguments)]
    fn regenerate_segment(
        &mut self,
        service_id: &ServiceIdTriplet,
        seg: &mut ESegment,
        actual: bool,
        segment_number: usize,
        now: DateTime<Utc>,
        sync_versions: bool,
        sync_tids: &mut BTreeSet<u8>,
    ) {
        let table_id = segment_to_table_id(actual, segment_number);
        let first_section_number = segment_to_section(segment_number);
        let mut section_number = first_section_number;
        let mut ev_index = 0usize;
        let mut sec_index = 0usize;

        while ev_index < seg.events.len() {
            let saved_ev_index = ev_index;

            // A section is still valid when its payload is exactly the fixed
            // part followed by a prefix of the event list, and the next
            // event (if any) would not fit anyway.
            let mut still_valid = seg
                .sections
                .get(sec_index)
                .is_some_and(|sec| sec.borrow().section.payload_size() >= EIT_PAYLOAD_FIXED_SIZE);
            if still_valid {
                let sec = seg.sections[sec_index].borrow();
                let payload = &sec.section.payload()[EIT_PAYLOAD_FIXED_SIZE..];
                let mut offset = 0usize;
                while still_valid && offset < payload.len() && ev_index < seg.events.len() {
                    let event_data = &seg.events[ev_index].data;
                    still_valid = payload.len() - offset >= event_data.len()
                        && payload[offset..offset + event_data.len()] == event_data[..];
                    if still_valid {
                        offset += event_data.len();
                        ev_index += 1;
                    }
                }
                if still_valid {
                    still_valid = ev_index >= seg.events.len()
                        || sec.section.payload_size() + seg.events[ev_index].data.len()
                            > MAX_PRIVATE_LONG_SECTION_PAYLOAD_SIZE;
                }
            }
            if still_valid {
                sec_index += 1;
                section_number += 1;
                continue;
            }

            // The section is stale or absent, rebuild it from the events.
            let sec = self.new_esection(service_id, table_id, section_number, section_number);
            if sec_index < seg.sections.len() {
                let old = seg.sections[sec_index].clone();
                self.mark_obsolete_section(&old);
                seg.sections[sec_index] = sec.clone();
            } else if seg.sections.len() >= SECTIONS_PER_SEGMENT {
                // Segment quota exhausted, the remaining events are dropped.
                log::warn!(
                    "segment at {} of {} overflows {} sections, dropping events",
                    seg.start_time,
                    service_id,
                    SECTIONS_PER_SEGMENT
                );
                break;
            } else {
                seg.sections.push(sec.clone());
            }

            ev_index = saved_ev_index;
            {
                let mut guard = sec.borrow_mut();
                while ev_index < seg.events.len()
                    && guard.section.payload_size() + seg.events[ev_index].data.len()
                        <= MAX_PRIVATE_LONG_SECTION_PAYLOAD_SIZE
                {
                    if guard.section.append_payload(&seg.events[ev_index].data, false).is_err() {
                        break;
                    }
                    ev_index += 1;
                }
                if sync_versions {
                    sync_tids.insert(table_id);
                } else {
                    guard.section.recompute_crc();
                }
            }
            self.enqueue_inject_section(sec, now, true);

            sec_index += 1;
            section_number += 1;
        }

        // Clip sections beyond the needed count.
        while seg.sections.len() > sec_index {
            if let Some(sec) = seg.sections.pop() {
                self.mark_obsolete_section(&sec);
            }
        }

        // Every segment carries at least one (possibly empty) section.
        if seg.sections.is_empty() {
            let sec =
                self.new_esection(service_id, table_id, first_section_number, first_section_number);
            seg.sections.push(sec.clone());
            self.enqueue_inject_section(sec, now, true);
        }
    }

    /// Updates the EPG database for the current time: empties past segments,
    /// drops completed events, trims the horizon, refreshes p/f.
    fn update_for_new_time(&mut self) {
        let (Some(_), Some(now)) = (self.actual_ts_id, self.current_time()) else {
            return;
        };
        let last_midnight = this_day(&now);
        let lazy = self.options.contains(EitOptions::LAZY_SCHED_UPDATE);

        let entries: Vec<(ServiceIdTriplet, EServiceRef)> =
            self.services.iter().map(|(k, v)| (*k, v.clone())).collect();
        for (service_id, srv_rc) in entries {
            {
                let mut srv = srv_rc.borrow_mut();
                if srv.segments.is_empty() {
                    continue;
                }

                // A day change moves the whole segment numbering.
                if srv.segments[0].start_time != last_midnight {
                    self.regenerate = true;
                    srv.regenerate = true;
                }

                // Segments fully in the past keep one empty section.
                let mut index = 0usize;
                while index < srv.segments.len()
                    && srv.segments[index].start_time + segment_duration() <= now
                {
                    srv.segments[index].events.clear();
                    let already_empty = {
                        let seg = &srv.segments[index];
                        seg.sections.len() == 1
                            && seg.sections[0].borrow().section.payload_size()
                                == EIT_PAYLOAD_FIXED_SIZE
                    };
                    if !already_empty {
                        self.regenerate = true;
                        srv.regenerate = true;
                        srv.segments[index].regenerate = true;
                    }
                    index += 1;
                }

                // Completed events leave the segment containing "now".
                let mut completed_events_removed = false;
                if let Some(seg) = srv.segments.get_mut(index) {
                    while seg.events.front().is_some_and(|ev| ev.end_time <= now) {
                        seg.events.pop_front();
                        if !lazy {
                            seg.regenerate = true;
                            completed_events_removed = true;
                        }
                    }
                }
                if completed_events_removed {
                    self.regenerate = true;
                    srv.regenerate = true;
                }

                // Trim segments beyond the EPG depth.
                while srv.segments.back().is_some_and(|seg| {
                    seg.start_time >= last_midnight + Duration::days(TOTAL_DAYS)
                }) {
                    if let Some(seg) = srv.segments.pop_back() {
                        self.mark_obsolete_segment(&seg);
                    }
                }
            }
            self.regenerate_present_following(&service_id);
        }
    }

    /// Saves a snapshot of all current EIT sections: p/f first, then all
    /// schedule sections in service, segment and section order.
    fn save_eits_into(&mut self, out: &mut Vec<Section>) {
        // Without a reference time, use the oldest event as the clock origin.
        if self.ref_time.is_none() {
            let mut oldest: Option<DateTime<Utc>> = None;
            for srv_rc in self.services.values() {
                let srv = srv_rc.borrow();
                for seg in &srv.segments {
                    if let Some(first) = seg.events.front() {
                        if oldest.is_none_or(|current| first.start_time < current) {
                            oldest = Some(first.start_time);
                        }
                        break;
                    }
                }
            }
            if let Some(time) = oldest {
                self.ref_time = Some(time);
                self.ref_time_pkt = self.packet_index;
                log::debug!("forcing TS time to {} (oldest event start time)", time);
            }
        }

        self.update_for_new_time();
        self.regenerate_schedule();

        let mut pf_count = 0usize;
        let mut sched_count = 0usize;
        for srv_rc in self.services.values() {
            let srv = srv_rc.borrow();
            for slot in srv.pf.iter().flatten() {
                out.push(slot.borrow().section.clone());
                pf_count += 1;
            }
        }
        for srv_rc in self.services.values() {
            let srv = srv_rc.borrow();
            for seg in &srv.segments {
                for sec in &seg.sections {
                    out.push(sec.borrow().section.clone());
                    sched_count += 1;
                }
            }
        }
        log::debug!("saved {} EIT sections ({} p/f, {} schedule)", pf_count + sched_count, pf_count, sched_count);
    }

    /// Handles a section reassembled from the input stream.
    fn handle_section(&mut self, section: &Section) {
        let tid = section.table_id();
        if tid == TID_PAT && self.actual_ts_id.is_none() {
            // The PAT defines the transport stream id when not already known.
            self.set_transport_stream_id(section.table_id_extension());
        } else if is_eit(tid) && self.options.contains(EitOptions::LOAD_INPUT) {
            if let Err(err) = self.load_events_section(section, true) {
                log::warn!("ignoring input EIT section: {}", err);
            }
        } else if (tid == TID_TDT || tid == TID_TOT) && section.payload_size() >= MJD_SIZE {
            // The first 5 bytes of a TDT or TOT payload carry the UTC time.
            if let Some(utc) = decode_mjd(section.payload()) {
                self.set_current_time(utc);
            }
        }
    }
}

impl SectionProvider for EitCore {
    fn provide_section(&mut self, _counter: u64) -> Option<Section> {
        // Sections can only be due once the clock is known.
        let now = self.current_time()?;

        // Bring the database up to date before choosing a section.
        self.update_for_new_time();
        self.regenerate_schedule();

        // Section-gap enforcement: push away upcoming sections of the same
        // subtable as the previously injected one.
        if let Some((last_tid, last_tidext, last_index)) = self.last_injected.take() {
            let limit = now + self.section_gap;
            let list = &mut self.injects[last_index];
            let mut bumped = 0i32;
            let mut index = 0usize;
            while index < list.len() {
                let (due, tid, tidext) = {
                    let guard = list[index].borrow();
                    (guard.next_inject, guard.section.table_id(), guard.section.table_id_extension())
                };
                if due >= limit {
                    break;
                }
                if tid != last_tid || tidext != last_tidext {
                    index += 1;
                    continue;
                }
                // Same subtable due too soon: reschedule it, each bumped
                // section one extra gap later than the previous one.
                let Some(sec) = list.remove(index) else { break };
                let new_due = limit + self.section_gap * bumped;
                bumped += 1;
                sec.borrow_mut().next_inject = new_due;
                let mut insert_at = index;
                while insert_at < list.len() && list[insert_at].borrow().next_inject < new_due {
                    insert_at += 1;
                }
                list.insert(insert_at, sec);
                // Re-examine the element now at this position.
            }
        }

        // Walk the injection queues in decreasing order of priority.
        for index in 0..PROFILE_COUNT {
            while self.injects[index].front().is_some_and(|sec| sec.borrow().next_inject <= now) {
                let Some(sec) = self.injects[index].pop_front() else { break };
                if sec.borrow().obsolete {
                    // Dropped from the database, discard it.
                    self.obsolete_count = self.obsolete_count.saturating_sub(1);
                    continue;
                }
                let section = {
                    let mut guard = sec.borrow_mut();
                    guard.injected = true;
                    guard.section.clone()
                };
                let requeue_at = now + self.profile.repetition(&section);
                self.enqueue_inject_section(sec, requeue_at, false);
                log::trace!(
                    "inject section TID 0x{:02X} service 0x{:04X} at {}, requeued for {}",
                    section.table_id(),
                    section.table_id_extension(),
                    now,
                    requeue_at
                );
                self.last_injected = Some((section.table_id(), section.table_id_extension(), index));
                return Some(section);
            }
        }
        None
    }

    fn do_stuffing(&mut self) -> bool {
        self.options.contains(EitOptions::PACKET_STUFFING)
    }
}

/// Generator and injector of DVB Event Information Tables.
///
/// Feed every packet of the transport stream to
/// [`process_packet`](EitGenerator::process_packet): the generator learns
/// the TS id from the PAT, the UTC clock from TDT/TOT, optionally loads
/// input EIT sections as EPG data, and replaces null or EIT packets with
/// generated EIT sections at the configured bitrate and repetition rates.
///
/// ## Example
///
/// ```rust
/// use eitgen::eit::{EitGenerator, ServiceIdTriplet};
/// use eitgen::ts::TsPacket;
/// use chrono::{TimeZone, Utc};
///
/// let mut gen = EitGenerator::new(0x0012);
/// gen.set_transport_stream_id(10);
/// gen.set_current_time(Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap());
///
/// // Load EPG events (raw binary event records) for one service.
/// // gen.load_events(ServiceIdTriplet::new(100, 10, 1), &event_bytes)?;
///
/// let mut packet = TsPacket::null();
/// gen.process_packet(&mut packet);
/// ```
pub struct EitGenerator {
    eit_pid: u16,
    demux: SectionDemux,
    packetizer: Packetizer,
    core: EitCore,
}

impl EitGenerator {
    /// Creates an EIT generator for the given PID with the default options
    /// (generate everything, load input EIT's) and the satellite/cable
    /// repetition profile.
    pub fn new(pid: u16) -> Self {
        Self::with_options(pid, EitOptions::default(), EitRepetitionProfile::satellite_cable())
    }

    /// Creates an EIT generator with explicit options and repetition profile.
    pub fn with_options(pid: u16, options: EitOptions, profile: EitRepetitionProfile) -> Self {
        let mut demux = SectionDemux::new();
        // The PAT is needed as long as the TS id is unknown; TDT/TOT always.
        demux.add_pid(PID_PAT);
        demux.add_pid(PID_TDT);
        if options.contains(EitOptions::LOAD_INPUT) {
            demux.add_pid(pid);
        }
        Self {
            eit_pid: pid,
            demux,
            packetizer: Packetizer::new(pid),
            core: EitCore::new(options, profile),
        }
    }

    /// Returns the EIT PID.
    pub fn pid(&self) -> u16 {
        self.eit_pid
    }

    /// Returns the current option mask.
    pub fn options(&self) -> EitOptions {
        self.core.options
    }

    /// Returns the actual transport stream id, when known.
    pub fn transport_stream_id(&self) -> Option<u16> {
        self.core.actual_ts_id
    }

    /// Returns the current stream time, when known.
    pub fn current_time(&self) -> Option<DateTime<Utc>> {
        self.core.current_time()
    }

    /// Resets the generator to its construction state.
    pub fn reset(&mut self) {
        let options = self.core.options;
        let profile = self.core.profile;
        self.demux.reset();
        self.demux.add_pid(PID_PAT);
        self.demux.add_pid(PID_TDT);
        if options.contains(EitOptions::LOAD_INPUT) {
            self.demux.add_pid(self.eit_pid);
        }
        self.packetizer.reset();
        self.core = EitCore::new(options, profile);
    }

    /// Defines the "actual" transport stream id for generated EIT's.
    ///
    /// Also learned automatically from the first PAT or, with
    /// [`EitOptions::LOAD_INPUT`], from the first EIT-actual section.
    pub fn set_transport_stream_id(&mut self, ts_id: u16) {
        self.core.set_transport_stream_id(ts_id);
        // The PAT is no longer needed once the TS id is known.
        self.demux.remove_pid(PID_PAT);
    }

    /// Sets the current UTC time of the stream. Also learned automatically
    /// from TDT/TOT sections in the stream.
    pub fn set_current_time(&mut self, utc: DateTime<Utc>) {
        self.core.set_current_time(utc);
    }

    /// Sets the transport stream bitrate in bits per second, used to drive
    /// the stream clock and the EIT insertion rate.
    pub fn set_transport_stream_bit_rate(&mut self, bitrate: u64) {
        if self.core.ts_bitrate != bitrate {
            self.core.ts_bitrate = bitrate;
            self.core.update_inter_packet();
        }
    }

    /// Caps the EIT injection bitrate in bits per second (0 = no cap).
    pub fn set_max_bit_rate(&mut self, bitrate: u64) {
        if self.core.max_bitrate != bitrate {
            self.core.max_bitrate = bitrate;
            self.core.update_inter_packet();
        }
    }

    /// Replaces the generation options.
    pub fn set_options(&mut self, options: EitOptions) {
        self.core.set_options(options);
        if options.contains(EitOptions::LOAD_INPUT) {
            self.demux.add_pid(self.eit_pid);
        } else {
            self.demux.remove_pid(self.eit_pid);
        }
    }

    /// Replaces the repetition profile for subsequently scheduled sections.
    pub fn set_profile(&mut self, profile: EitRepetitionProfile) {
        self.core.profile = profile;
    }

    /// Loads EPG data from a concatenation of binary event records for one
    /// service.
    ///
    /// Events ending in the past or starting beyond the 64-day horizon are
    /// discarded. On truncated input the events parsed so far are retained
    /// and an error is returned.
    pub fn load_events(&mut self, service_id: ServiceIdTriplet, data: &[u8]) -> Result<()> {
        self.core.load_events(service_id, data)
    }

    /// Loads EPG data from one EIT section. With `get_actual_ts`, an
    /// EIT-actual section also defines the TS id when still unknown.
    pub fn load_events_section(&mut self, section: &Section, get_actual_ts: bool) -> Result<()> {
        let result = self.core.load_events_section(section, get_actual_ts);
        if self.core.actual_ts_id.is_some() {
            self.demux.remove_pid(PID_PAT);
        }
        result
    }

    /// Loads EPG data from a set of EIT sections. Non-EIT sections are
    /// rejected individually; the first error is returned after all
    /// sections have been processed.
    pub fn load_events_sections(&mut self, sections: &[Section], get_actual_ts: bool) -> Result<()> {
        let mut outcome = Ok(());
        for section in sections {
            let result = self.load_events_section(section, get_actual_ts);
            if outcome.is_ok() {
                outcome = result;
            }
        }
        outcome
    }

    /// Returns a snapshot of all current EIT sections: all p/f sections
    /// first, then all schedule sections.
    ///
    /// When the clock is unknown it is first forced to the oldest event
    /// start time in the database.
    pub fn save_eits(&mut self) -> Vec<Section> {
        let mut sections = Vec::new();
        self.core.save_eits_into(&mut sections);
        sections
    }

    /// Appends the snapshot of [`save_eits`](EitGenerator::save_eits) to an
    /// existing section bag.
    pub fn save_eits_into(&mut self, out: &mut Vec<Section>) {
        self.core.save_eits_into(out);
    }

    /// Processes one transport stream packet.
    ///
    /// Input EIT packets are consumed (nullified); null and EIT packets are
    /// replaced with generated EIT packets, at most one every
    /// `ts_bitrate / max_bitrate` packets when both bitrates are known.
    pub fn process_packet(&mut self, pkt: &mut TsPacket) {
        // Feed the demux; handler effects (TS id, clock, events) apply now.
        for section in self.demux.feed_packet(pkt) {
            self.core.handle_section(&section);
        }
        if self.core.actual_ts_id.is_some() {
            self.demux.remove_pid(PID_PAT);
        }

        let pid = pkt.pid();
        let mut nullify = pid == self.eit_pid;

        // Outgoing EIT's replace null packets or the incoming EIT PID.
        if (pid == self.eit_pid || pid == PID_NULL)
            && (self.core.eit_inter_pkt == 0
                || self.core.packet_index >= self.core.last_eit_pkt + self.core.eit_inter_pkt)
        {
            let (out, real) = self.packetizer.next_packet(&mut self.core);
            *pkt = out;
            if real {
                self.core.last_eit_pkt = self.core.packet_index;
            }
            nullify = false;
        }

        self.core.packet_index += 1;

        if nullify {
            *pkt = TsPacket::null();
        }
    }
}
