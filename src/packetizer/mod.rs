//! # Section Packetizers
//!
//! This module converts PSI/SI sections into 188-byte Transport Stream
//! packets:
//!
//! - [`Packetizer`]: pulls sections from a [`SectionProvider`] and fills TS
//!   packets with correct pointer_field, continuity counter and stuffing
//! - [`CyclingPacketizer`]: a scheduler on top of the packetizer that
//!   multiplexes many sections on one PID with per-section repetition rates
//!
//! ## Example
//!
//! ```rust
//! use eitgen::packetizer::{CyclingPacketizer, StuffingPolicy};
//! use eitgen::psi::Section;
//!
//! # fn main() -> eitgen::Result<()> {
//! let mut pzer = CyclingPacketizer::new(0x0012, StuffingPolicy::AtEndOfCycle);
//! let section = Section::new_long(0x4E, true, 1, 0, true, 0, 1, &[0u8; 6])?;
//! pzer.add_section(section, 0);
//! let (packet, real) = pzer.next_packet();
//! assert!(real);
//! assert_eq!(packet.pid(), 0x0012);
//! # Ok(())
//! # }
//! ```

/// Cycling packetizer with repetition-rate scheduling
pub mod cycling;

pub use cycling::{CyclingPacketizer, StuffingPolicy};

use crate::psi::{Section, SHORT_SECTION_HEADER_SIZE};
use crate::ts::packet::SYNC_BYTE;
use crate::ts::{TsPacket, TS_PACKET_SIZE};

/// Capability of providing sections to a packetizer.
///
/// The packetizer calls [`provide_section`](SectionProvider::provide_section)
/// whenever it needs a new section, passing the number of sections provided
/// so far. Returning `None` means no section is currently available.
pub trait SectionProvider {
    /// Returns the next section to packetize, if any.
    fn provide_section(&mut self, counter: u64) -> Option<Section>;

    /// Returns true when the packetizer must stuff the current packet to the
    /// TS packet boundary before starting the next section, instead of
    /// packing sections back to back.
    fn do_stuffing(&mut self) -> bool;
}

/// Packetizer of PSI/SI sections into TS packets on one PID.
///
/// Every produced packet carries the configured PID and a continuity
/// counter incrementing mod 16. When no section is available a null packet
/// is produced instead, so the caller can maintain a constant packet rate.
pub struct Packetizer {
    pid: u16,
    continuity: u8,
    packet_count: u64,
    section_in_count: u64,
    section_out_count: u64,
    section: Option<Section>,
    next_byte: usize,
    split_headers: bool,
}

impl Packetizer {
    /// Creates a packetizer for the given PID.
    pub fn new(pid: u16) -> Self {
        Self {
            pid,
            continuity: 0,
            packet_count: 0,
            section_in_count: 0,
            section_out_count: 0,
            section: None,
            next_byte: 0,
            split_headers: false,
        }
    }

    /// Returns the configured PID.
    pub fn pid(&self) -> u16 {
        self.pid
    }

    /// Changes the PID of subsequently produced packets.
    pub fn set_pid(&mut self, pid: u16) {
        self.pid = pid & 0x1FFF;
    }

    /// Allows a section header to be split across a TS packet boundary.
    ///
    /// Disabled by default: some receivers cannot handle split headers, so
    /// the packet is stuffed when the remaining space cannot hold the next
    /// section header. MPEG itself permits the split.
    pub fn set_split_headers(&mut self, split: bool) {
        self.split_headers = split;
    }

    /// Number of packets produced so far, null packets included.
    pub fn packet_count(&self) -> u64 {
        self.packet_count
    }

    /// Number of sections pulled from the provider so far.
    pub fn section_in_count(&self) -> u64 {
        self.section_in_count
    }

    /// Number of sections completely emitted so far.
    pub fn section_out_count(&self) -> u64 {
        self.section_out_count
    }

    /// Returns true when the last produced packet ended on a section boundary.
    pub fn at_section_boundary(&self) -> bool {
        self.next_byte == 0
    }

    /// Drops any partially emitted section; the next packet starts fresh.
    pub fn reset(&mut self) {
        self.section = None;
        self.next_byte = 0;
    }

    /// Builds the next TS packet from the provider's sections.
    ///
    /// Returns the packet and a flag which is true when the packet carries
    /// section data; a null packet with flag false is produced when the
    /// provider has nothing to offer.
    pub fn next_packet(&mut self, provider: &mut dyn SectionProvider) -> (TsPacket, bool) {
        // If there is no current section, get the next one.
        if self.section.is_none() {
            self.section = provider.provide_section(self.section_in_count);
            self.next_byte = 0;
            if self.section.is_some() {
                self.section_in_count += 1;
            }
        }

        // If there is still no current section, return a null packet.
        let Some(mut section) = self.section.take() else {
            self.packet_count += 1;
            return (TsPacket::null(), false);
        };

        let mut remain_in_section = section.size() - self.next_byte;
        let mut do_stuffing = true;
        let mut next_section: Option<Section> = None;

        // Check if a new section may start in the middle of this packet: after
        // the remaining bytes of the current section there must be room for
        // the pointer field (5 = 4-byte TS header + 1-byte pointer field) and,
        // unless headers may be split, at least a short section header.
        let header_margin = if self.split_headers { 0 } else { SHORT_SECTION_HEADER_SIZE };
        if remain_in_section <= TS_PACKET_SIZE - 5 - header_margin {
            do_stuffing = provider.do_stuffing();
            if !do_stuffing {
                next_section = provider.provide_section(self.section_in_count);
                match &next_section {
                    None => do_stuffing = true,
                    Some(next) => {
                        // Recheck with the actual header size of the next section.
                        self.section_in_count += 1;
                        let margin = if self.split_headers { 0 } else { next.header_size() };
                        do_stuffing = remain_in_section > TS_PACKET_SIZE - 5 - margin;
                    }
                }
            }
        }

        // Decide on the pointer field.
        let (pusi, pointer_field) = if self.next_byte == 0 {
            // At the beginning of a section, it starts right after the pointer.
            (true, 0u8)
        } else if !do_stuffing {
            // A new section will start in the middle of the packet.
            (true, remain_in_section as u8)
        } else {
            (false, 0)
        };

        // Build the TS header.
        let mut pkt = TsPacket::null();
        {
            let b = pkt.as_bytes_mut();
            b[0] = SYNC_BYTE;
            b[1] = 0;
            b[2] = 0;
            b[3] = 0x10; // no adaptation field, has payload
        }
        pkt.set_pid(self.pid);
        pkt.set_payload_unit_start(pusi);
        pkt.set_continuity_counter(self.continuity);
        self.continuity = (self.continuity + 1) & 0x0F;
        self.packet_count += 1;

        let mut index = 4;
        if pusi {
            pkt.as_bytes_mut()[index] = pointer_field;
            index += 1;
        }

        // Fill the packet payload, chaining sections while allowed.
        while index < TS_PACKET_SIZE {
            let length = remain_in_section.min(TS_PACKET_SIZE - index);
            pkt.as_bytes_mut()[index..index + length]
                .copy_from_slice(&section.content()[self.next_byte..self.next_byte + length]);
            index += length;
            remain_in_section -= length;
            self.next_byte += length;

            if remain_in_section > 0 {
                break;
            }

            // End of current section reached.
            self.section_out_count += 1;
            self.next_byte = 0;
            match next_section.take() {
                Some(next) => section = next,
                None => {
                    if do_stuffing || provider.do_stuffing() {
                        self.section = None;
                        return Self::finish(pkt, index);
                    }
                    match provider.provide_section(self.section_in_count) {
                        None => {
                            self.section = None;
                            return Self::finish(pkt, index);
                        }
                        Some(next) => {
                            self.section_in_count += 1;
                            section = next;
                        }
                    }
                }
            }
            if do_stuffing {
                // Stuffing was requested at the end of the previous section:
                // keep the fetched section for the next packet.
                self.section = Some(section);
                return Self::finish(pkt, index);
            }
            // We no longer know about stuffing after the new section.
            do_stuffing = false;
            // If no room for the new section header, stuff the end of packet.
            if !self.split_headers && TS_PACKET_SIZE - index < section.header_size() {
                self.section = Some(section);
                return Self::finish(pkt, index);
            }
            remain_in_section = section.size();
        }

        self.section = Some(section);
        Self::finish(pkt, index)
    }

    fn finish(mut pkt: TsPacket, index: usize) -> (TsPacket, bool) {
        for byte in &mut pkt.as_bytes_mut()[index..] {
            *byte = 0xFF;
        }
        (pkt, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ListProvider {
        sections: Vec<Section>,
        stuffing: bool,
    }

    impl SectionProvider for ListProvider {
        fn provide_section(&mut self, _counter: u64) -> Option<Section> {
            if self.sections.is_empty() {
                None
            } else {
                Some(self.sections.remove(0))
            }
        }
        fn do_stuffing(&mut self) -> bool {
            self.stuffing
        }
    }

    fn small_section(table_id: u8, payload_len: usize) -> Section {
        Section::new_long(table_id, true, 1, 0, true, 0, 0, &vec![0xABu8; payload_len]).unwrap()
    }

    #[test]
    fn test_null_packet_when_empty() {
        let mut pzer = Packetizer::new(0x0012);
        let mut provider = ListProvider { sections: vec![], stuffing: true };
        let (pkt, real) = pzer.next_packet(&mut provider);
        assert!(!real);
        assert!(pkt.is_null());
        assert_eq!(pzer.packet_count(), 1);
    }

    #[test]
    fn test_single_section_single_packet() {
        let mut pzer = Packetizer::new(0x0012);
        let section = small_section(0x4E, 6);
        let size = section.size();
        let mut provider = ListProvider { sections: vec![section], stuffing: true };
        let (pkt, real) = pzer.next_packet(&mut provider);
        assert!(real);
        assert_eq!(pkt.pid(), 0x0012);
        assert!(pkt.payload_unit_start());
        let payload = pkt.payload().unwrap();
        assert_eq!(payload[0], 0); // pointer_field
        assert_eq!(payload[1], 0x4E); // table id right after
        // End-of-section stuffing.
        assert!(payload[1 + size..].iter().all(|&b| b == 0xFF));
        assert!(pzer.at_section_boundary());
        assert_eq!(pzer.section_out_count(), 1);
    }

    #[test]
    fn test_large_section_spans_packets() {
        let mut pzer = Packetizer::new(0x0012);
        let section = small_section(0x50, 400);
        let total = section.size();
        let mut provider = ListProvider { sections: vec![section], stuffing: true };

        let (first, _) = pzer.next_packet(&mut provider);
        assert!(first.payload_unit_start());
        assert_eq!(first.continuity_counter(), 0);
        assert!(!pzer.at_section_boundary());

        let (second, _) = pzer.next_packet(&mut provider);
        assert!(!second.payload_unit_start());
        assert_eq!(second.continuity_counter(), 1);

        let (third, real) = pzer.next_packet(&mut provider);
        assert!(real);
        assert_eq!(third.continuity_counter(), 2);
        assert!(pzer.at_section_boundary());

        // 412 section bytes + pointer field need three packets.
        assert_eq!(total + 1 > 2 * 184, true);
        assert_eq!(pzer.packet_count(), 3);
    }

    #[test]
    fn test_packed_sections_share_packet() {
        let mut pzer = Packetizer::new(0x0012);
        let sections = vec![small_section(0x4E, 6), small_section(0x4F, 6)];
        let first_size = sections[0].size();
        let mut provider = ListProvider { sections, stuffing: false };
        let (pkt, real) = pzer.next_packet(&mut provider);
        assert!(real);
        let payload = pkt.payload().unwrap();
        assert_eq!(payload[0], 0);
        assert_eq!(payload[1], 0x4E);
        // Second section follows the first immediately.
        assert_eq!(payload[1 + first_size], 0x4F);
        assert_eq!(pzer.section_out_count(), 2);
    }

    #[test]
    fn test_stuffing_between_sections() {
        let mut pzer = Packetizer::new(0x0012);
        let sections = vec![small_section(0x4E, 6), small_section(0x4F, 6)];
        let first_size = sections[0].size();
        let mut provider = ListProvider { sections, stuffing: true };
        let (pkt, _) = pzer.next_packet(&mut provider);
        let payload = pkt.payload().unwrap();
        assert!(payload[1 + first_size..].iter().all(|&b| b == 0xFF));
        assert_eq!(pzer.section_out_count(), 1);

        // The second section starts its own packet.
        let (pkt2, real) = pzer.next_packet(&mut provider);
        assert!(real);
        assert!(pkt2.payload_unit_start());
        assert_eq!(pkt2.payload().unwrap()[1], 0x4F);
    }

    #[test]
    fn test_reset_drops_partial_section() {
        let mut pzer = Packetizer::new(0x0012);
        let mut provider = ListProvider { sections: vec![small_section(0x50, 400)], stuffing: true };
        let (_, _) = pzer.next_packet(&mut provider);
        assert!(!pzer.at_section_boundary());
        pzer.reset();
        assert!(pzer.at_section_boundary());
        let (pkt, real) = pzer.next_packet(&mut provider);
        assert!(!real);
        assert!(pkt.is_null());
    }
}
