//! PSI/SI section representation.
//!
//! A [`Section`] wraps a reference-counted byte buffer ([`bytes::Bytes`]).
//! Cloning a section is cheap and shares the underlying storage; every
//! mutator rebuilds the buffer, so a clone held elsewhere (typically inside
//! a packetizer) keeps observing the pre-mutation bytes. This gives the
//! copy-on-write discipline required when sections are simultaneously
//! referenced by an EPG database and an active packetizer.

use super::{
    LONG_SECTION_HEADER_SIZE, MAX_PRIVATE_SECTION_SIZE, SECTION_CRC32_SIZE,
    SHORT_SECTION_HEADER_SIZE,
};
use crate::error::{EitError, Result};
use crate::utils::Crc32Mpeg2;
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::OnceLock;

fn crc32() -> &'static Crc32Mpeg2 {
    static CRC: OnceLock<Crc32Mpeg2> = OnceLock::new();
    CRC.get_or_init(Crc32Mpeg2::new)
}

/// A complete PSI/SI section.
#[derive(Clone)]
pub struct Section {
    data: Bytes,
}

impl Section {
    /// Wraps and validates a raw section blob.
    ///
    /// The blob must be a complete section: `section_length` must match the
    /// buffer size, and long sections must be large enough to carry the
    /// 8-byte header and the trailing CRC32. The CRC value itself is not
    /// verified here; use [`Section::has_valid_crc`].
    pub fn from_bytes(data: Bytes) -> Result<Self> {
        if data.len() < SHORT_SECTION_HEADER_SIZE {
            return Err(EitError::InvalidData("section shorter than header".into()));
        }
        let declared = 3 + ((((data[1] & 0x0F) as usize) << 8) | data[2] as usize);
        if declared != data.len() {
            return Err(EitError::InvalidData(format!(
                "section_length mismatch: declared {} bytes, got {}",
                declared,
                data.len()
            )));
        }
        if data.len() > MAX_PRIVATE_SECTION_SIZE {
            return Err(EitError::InvalidData("section exceeds 4096 bytes".into()));
        }
        let section = Self { data };
        if section.is_long_section() {
            if section.size() < LONG_SECTION_HEADER_SIZE + SECTION_CRC32_SIZE {
                return Err(EitError::InvalidData("long section too short".into()));
            }
            if section.section_number() > section.last_section_number() {
                return Err(EitError::InvalidData(
                    "section_number exceeds last_section_number".into(),
                ));
            }
        }
        Ok(section)
    }

    /// Builds a long section from header fields and payload, computing the CRC32.
    pub fn new_long(
        table_id: u8,
        is_private: bool,
        table_id_extension: u16,
        version: u8,
        is_current: bool,
        section_number: u8,
        last_section_number: u8,
        payload: &[u8],
    ) -> Result<Self> {
        let total = LONG_SECTION_HEADER_SIZE + payload.len() + SECTION_CRC32_SIZE;
        if total > MAX_PRIVATE_SECTION_SIZE {
            return Err(EitError::Serialization(format!(
                "section payload of {} bytes exceeds the private section limit",
                payload.len()
            )));
        }
        if section_number > last_section_number {
            return Err(EitError::InvalidData(
                "section_number exceeds last_section_number".into(),
            ));
        }
        let mut buf = BytesMut::with_capacity(total);
        buf.put_u8(table_id);
        let length = (total - 3) as u16;
        let flags: u16 = if is_private { 0xF000 } else { 0xB000 };
        buf.put_u16(flags | (length & 0x0FFF));
        buf.put_u16(table_id_extension);
        buf.put_u8(0xC0 | ((version & 0x1F) << 1) | if is_current { 0x01 } else { 0x00 });
        buf.put_u8(section_number);
        buf.put_u8(last_section_number);
        buf.put_slice(payload);
        let crc = crc32().calculate(&buf);
        buf.put_u32(crc);
        Ok(Self { data: buf.freeze() })
    }

    /// Wraps bytes known to form a consistent section, skipping validation.
    /// Reserved for internal builders that assemble sections field by field.
    pub(crate) fn new_unchecked(data: Bytes) -> Self {
        Self { data }
    }

    /// Returns the complete section bytes, header and CRC included.
    pub fn content(&self) -> &[u8] {
        &self.data
    }

    /// Returns a cheap reference-counted handle to the section bytes.
    pub fn bytes(&self) -> Bytes {
        self.data.clone()
    }

    /// Total section size in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Returns the table id.
    pub fn table_id(&self) -> u8 {
        self.data[0]
    }

    /// Returns true when the section_syntax_indicator bit is set.
    pub fn is_long_section(&self) -> bool {
        self.data[1] & 0x80 != 0
    }

    /// Returns true for short (syntax-less) sections.
    pub fn is_short_section(&self) -> bool {
        !self.is_long_section()
    }

    /// Returns true when the private_indicator bit is set.
    pub fn is_private_section(&self) -> bool {
        self.data[1] & 0x40 != 0
    }

    /// Returns the 12-bit section_length field.
    pub fn section_length(&self) -> usize {
        (((self.data[1] & 0x0F) as usize) << 8) | self.data[2] as usize
    }

    /// Header size: 8 bytes for long sections, 3 for short ones.
    pub fn header_size(&self) -> usize {
        if self.is_long_section() {
            LONG_SECTION_HEADER_SIZE
        } else {
            SHORT_SECTION_HEADER_SIZE
        }
    }

    /// Returns the table_id_extension of a long section, 0 for short ones.
    pub fn table_id_extension(&self) -> u16 {
        if self.is_long_section() {
            ((self.data[3] as u16) << 8) | self.data[4] as u16
        } else {
            0
        }
    }

    /// Returns the 5-bit version of a long section, 0 for short ones.
    pub fn version(&self) -> u8 {
        if self.is_long_section() {
            (self.data[5] >> 1) & 0x1F
        } else {
            0
        }
    }

    /// Returns the current_next_indicator bit; short sections are "current".
    pub fn is_current(&self) -> bool {
        self.is_short_section() || self.data[5] & 0x01 != 0
    }

    /// Returns the section_number of a long section, 0 for short ones.
    pub fn section_number(&self) -> u8 {
        if self.is_long_section() {
            self.data[6]
        } else {
            0
        }
    }

    /// Returns the last_section_number of a long section, 0 for short ones.
    pub fn last_section_number(&self) -> u8 {
        if self.is_long_section() {
            self.data[7]
        } else {
            0
        }
    }

    /// Returns the payload: the bytes after the header, excluding the CRC32
    /// on long sections.
    pub fn payload(&self) -> &[u8] {
        if self.is_long_section() {
            &self.data[LONG_SECTION_HEADER_SIZE..self.data.len() - SECTION_CRC32_SIZE]
        } else {
            &self.data[SHORT_SECTION_HEADER_SIZE..]
        }
    }

    /// Payload size in bytes.
    pub fn payload_size(&self) -> usize {
        self.payload().len()
    }

    /// Number of 188-byte TS packets needed to carry this section, counting
    /// the one-byte pointer field of the first packet.
    pub fn packet_count(&self) -> u64 {
        ((self.size() + 1).div_ceil(184)) as u64
    }

    /// Returns true when the trailing CRC32 of a long section validates.
    /// Short sections carry no CRC and always return true.
    pub fn has_valid_crc(&self) -> bool {
        self.is_short_section() || crc32().check(&self.data)
    }

    /// Recomputes and stores the trailing CRC32 of a long section.
    pub fn recompute_crc(&mut self) {
        if self.is_long_section() {
            let mut buf = BytesMut::from(self.data.as_ref());
            let body = self.data.len() - SECTION_CRC32_SIZE;
            let crc = crc32().calculate(&buf[..body]);
            buf[body..].copy_from_slice(&crc.to_be_bytes());
            self.data = buf.freeze();
        }
    }

    fn set_byte(&mut self, index: usize, value: u8, recompute_crc: bool) {
        let mut buf = BytesMut::from(self.data.as_ref());
        buf[index] = value;
        self.data = buf.freeze();
        if recompute_crc {
            self.recompute_crc();
        }
    }

    /// Replaces the table id.
    pub fn set_table_id(&mut self, table_id: u8, recompute_crc: bool) {
        self.set_byte(0, table_id, recompute_crc);
    }

    /// Replaces the 5-bit version of a long section.
    pub fn set_version(&mut self, version: u8, recompute_crc: bool) {
        if self.is_long_section() {
            let value = (self.data[5] & 0xC1) | ((version & 0x1F) << 1);
            self.set_byte(5, value, recompute_crc);
        }
    }

    /// Replaces the section_number of a long section.
    pub fn set_section_number(&mut self, section_number: u8, recompute_crc: bool) {
        if self.is_long_section() {
            self.set_byte(6, section_number, recompute_crc);
        }
    }

    /// Replaces the last_section_number of a long section.
    pub fn set_last_section_number(&mut self, last_section_number: u8, recompute_crc: bool) {
        if self.is_long_section() {
            self.set_byte(7, last_section_number, recompute_crc);
        }
    }

    /// Replaces one payload byte at the given payload offset.
    pub fn set_payload_u8(&mut self, offset: usize, value: u8, recompute_crc: bool) {
        if offset < self.payload_size() {
            self.set_byte(self.header_size() + offset, value, recompute_crc);
        }
    }

    /// Appends bytes at the end of the payload, before the CRC32 of a long
    /// section, and adjusts `section_length`.
    ///
    /// Returns an error when the result would exceed the private section
    /// size limit; the section is left unchanged in that case.
    pub fn append_payload(&mut self, extra: &[u8], recompute_crc: bool) -> Result<()> {
        let new_total = self.size() + extra.len();
        if new_total > MAX_PRIVATE_SECTION_SIZE {
            return Err(EitError::Serialization(format!(
                "appending {} bytes would exceed the private section limit",
                extra.len()
            )));
        }
        let insert_at = self.header_size() + self.payload_size();
        let mut buf = BytesMut::with_capacity(new_total);
        buf.extend_from_slice(&self.data[..insert_at]);
        buf.extend_from_slice(extra);
        buf.extend_from_slice(&self.data[insert_at..]);
        patch_section_length(&mut buf);
        self.data = buf.freeze();
        if recompute_crc {
            self.recompute_crc();
        }
        Ok(())
    }

    /// Truncates the payload to the given size, keeping the CRC32 slot of a
    /// long section, and adjusts `section_length`. A no-op when the payload
    /// is already no larger than the requested size.
    pub fn truncate_payload(&mut self, payload_size: usize, recompute_crc: bool) {
        if payload_size >= self.payload_size() {
            return;
        }
        let keep = self.header_size() + payload_size;
        let tail = self.header_size() + self.payload_size();
        let mut buf = BytesMut::with_capacity(keep + SECTION_CRC32_SIZE);
        buf.extend_from_slice(&self.data[..keep]);
        buf.extend_from_slice(&self.data[tail..]);
        patch_section_length(&mut buf);
        self.data = buf.freeze();
        if recompute_crc {
            self.recompute_crc();
        }
    }
}

/// Rewrites the 12-bit section_length from the buffer size, preserving the
/// indicator and reserved bits.
fn patch_section_length(buf: &mut BytesMut) {
    let length = (buf.len() - 3) as u16;
    buf[1] = (buf[1] & 0xF0) | ((length >> 8) as u8 & 0x0F);
    buf[2] = (length & 0xFF) as u8;
}

impl std::fmt::Debug for Section {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Section")
            .field("table_id", &format_args!("0x{:02X}", self.table_id()))
            .field("long", &self.is_long_section())
            .field("tid_ext", &self.table_id_extension())
            .field("section", &self.section_number())
            .field("last_section", &self.last_section_number())
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_section() -> Section {
        Section::new_long(0x4E, true, 0x0064, 3, true, 0, 1, &[0x00, 0x0A, 0x00, 0x01, 0x00, 0x4E])
            .unwrap()
    }

    #[test]
    fn test_new_long_fields() {
        let sec = sample_section();
        assert_eq!(sec.table_id(), 0x4E);
        assert!(sec.is_long_section());
        assert!(sec.is_private_section());
        assert_eq!(sec.table_id_extension(), 0x0064);
        assert_eq!(sec.version(), 3);
        assert!(sec.is_current());
        assert_eq!(sec.section_number(), 0);
        assert_eq!(sec.last_section_number(), 1);
        assert_eq!(sec.payload_size(), 6);
        assert_eq!(sec.size(), 18);
        assert_eq!(sec.section_length(), 15);
        assert!(sec.has_valid_crc());
    }

    #[test]
    fn test_from_bytes_round_trip() {
        let sec = sample_section();
        let parsed = Section::from_bytes(sec.bytes()).unwrap();
        assert_eq!(parsed.content(), sec.content());
    }

    #[test]
    fn test_from_bytes_rejects_bad_length() {
        let sec = sample_section();
        let mut raw = sec.content().to_vec();
        raw.pop();
        assert!(Section::from_bytes(Bytes::from(raw)).is_err());
    }

    #[test]
    fn test_from_bytes_rejects_inverted_numbers() {
        let mut sec = sample_section();
        sec.set_section_number(2, true); // last_section_number is 1
        assert!(Section::from_bytes(sec.bytes()).is_err());
    }

    #[test]
    fn test_mutators_update_crc() {
        let mut sec = sample_section();
        sec.set_table_id(0x4F, true);
        assert_eq!(sec.table_id(), 0x4F);
        assert!(sec.has_valid_crc());

        sec.set_version(4, true);
        assert_eq!(sec.version(), 4);
        assert!(sec.is_current());
        assert!(sec.has_valid_crc());
    }

    #[test]
    fn test_append_and_truncate_payload() {
        let mut sec = sample_section();
        let event = [0u8; 12];
        sec.append_payload(&event, true).unwrap();
        assert_eq!(sec.payload_size(), 18);
        assert_eq!(sec.section_length(), sec.size() - 3);
        assert!(sec.has_valid_crc());

        sec.truncate_payload(6, true);
        assert_eq!(sec.payload_size(), 6);
        assert_eq!(sec.size(), 18);
        assert!(sec.has_valid_crc());
    }

    #[test]
    fn test_clone_is_unaffected_by_mutation() {
        let mut sec = sample_section();
        let snapshot = sec.clone();
        let before = snapshot.content().to_vec();
        sec.set_table_id(0x4F, true);
        sec.append_payload(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12], true)
            .unwrap();
        assert_eq!(snapshot.content(), &before[..]);
    }

    #[test]
    fn test_packet_count() {
        let sec = sample_section();
        assert_eq!(sec.packet_count(), 1); // 18 + pointer fits one packet
        let big = Section::new_long(0x50, true, 1, 0, true, 0, 0, &vec![0u8; 400]).unwrap();
        assert_eq!(big.packet_count(), 3); // 412 + 1 bytes over 184-byte payloads
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let err = Section::new_long(0x50, true, 1, 0, true, 0, 0, &vec![0u8; 4085]);
        assert!(err.is_err());
        let mut sec = Section::new_long(0x50, true, 1, 0, true, 0, 0, &vec![0u8; 4084]).unwrap();
        assert_eq!(sec.size(), MAX_PRIVATE_SECTION_SIZE);
        assert!(sec.append_payload(&[0], true).is_err());
    }
}
