//! Post-load processing of section bags.
//!
//! A "section bag" is the content of a section file once an external loader
//! has turned it into raw sections. [`SectionFileArgs`] applies the two
//! post-load transformations: EIT normalization (via
//! [`reorganize_sections`](crate::eit::reorganize_sections)) and orphan
//! section packing.

use super::section::Section;
use crate::eit::{reorganize_sections, EitOptions};
use crate::error::{EitError, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};

/// Post-load processing options for a section bag.
#[derive(Debug, Clone, Copy)]
pub struct SectionFileArgs {
    /// Pack incomplete tables: renumber sections to remove holes.
    pub pack_and_flush: bool,
    /// Reorganize all EIT sections according to ETSI TS 101 211.
    pub eit_normalize: bool,
    /// Reference date for EIT normalization; the oldest event otherwise.
    pub eit_base_time: Option<DateTime<Utc>>,
    /// EIT categories to regenerate during normalization.
    pub eit_options: EitOptions,
}

impl Default for SectionFileArgs {
    fn default() -> Self {
        Self {
            pack_and_flush: false,
            eit_normalize: false,
            eit_base_time: None,
            eit_options: EitOptions::GEN_ALL,
        }
    }
}

impl SectionFileArgs {
    /// Parses a base date in `"YYYY/MM/DD"` or `"YYYY/MM/DD hh:mm:ss"` form.
    pub fn parse_base_date(value: &str) -> Result<DateTime<Utc>> {
        if let Ok(date) = NaiveDate::parse_from_str(value, "%Y/%m/%d") {
            return Ok(date.and_time(NaiveTime::MIN).and_utc());
        }
        if let Ok(datetime) = NaiveDateTime::parse_from_str(value, "%Y/%m/%d %H:%M:%S") {
            return Ok(datetime.and_utc());
        }
        Err(EitError::Parser(format!(
            "invalid date value \"{}\" (use \"year/month/day [hh:mm:ss]\")",
            value
        )))
    }

    /// Applies the selected transformations to a loaded section bag.
    pub fn process(&self, sections: &mut Vec<Section>) {
        if self.eit_normalize {
            reorganize_sections(sections, self.eit_base_time, self.eit_options);
        }
        if self.pack_and_flush {
            let packed = pack_orphan_sections(sections);
            if packed > 0 {
                log::warn!("packed {} incomplete tables, may be invalid", packed);
            }
        }
    }
}

/// Renumbers the sections of incomplete tables so that each table has a
/// dense 0..N-1 numbering. Returns the number of tables packed.
///
/// Sections are grouped by consecutive runs of identical
/// (table_id, table_id_extension, version); a run already forming a
/// complete table is left untouched.
pub fn pack_orphan_sections(sections: &mut [Section]) -> usize {
    let mut packed = 0usize;
    let mut start = 0usize;
    while start < sections.len() {
        let key = table_key(&sections[start]);
        let mut end = start + 1;
        while end < sections.len() && table_key(&sections[end]) == key {
            end += 1;
        }
        let run = &mut sections[start..end];

        // A complete table carries exactly the numbers 0..=last, in order.
        let last = run.len() as u8 - 1;
        let complete = run
            .iter()
            .enumerate()
            .all(|(i, s)| s.section_number() == i as u8 && s.last_section_number() == last);
        if !complete {
            for (i, section) in run.iter_mut().enumerate() {
                section.set_section_number(i as u8, false);
                section.set_last_section_number(last, true);
            }
            packed += 1;
        }
        start = end;
    }
    packed
}

fn table_key(section: &Section) -> (u8, u16, u8) {
    (section.table_id(), section.table_id_extension(), section.version())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn section(tid: u8, tid_ext: u16, number: u8, last: u8) -> Section {
        Section::new_long(tid, true, tid_ext, 0, true, number, last, &[0u8; 6]).unwrap()
    }

    #[test]
    fn test_parse_base_date() {
        let date = SectionFileArgs::parse_base_date("2024/06/15").unwrap();
        assert_eq!(date, Utc.with_ymd_and_hms(2024, 6, 15, 0, 0, 0).unwrap());
        let datetime = SectionFileArgs::parse_base_date("2024/06/15 13:45:10").unwrap();
        assert_eq!(datetime, Utc.with_ymd_and_hms(2024, 6, 15, 13, 45, 10).unwrap());
        assert!(SectionFileArgs::parse_base_date("15.06.2024").is_err());
    }

    #[test]
    fn test_pack_orphan_sections() {
        let mut sections = vec![
            // Complete 2-section table: untouched.
            section(0x42, 1, 0, 1),
            section(0x42, 1, 1, 1),
            // Orphans with holes: renumbered.
            section(0x42, 2, 3, 7),
            section(0x42, 2, 5, 7),
        ];
        let packed = pack_orphan_sections(&mut sections);
        assert_eq!(packed, 1);
        assert_eq!(sections[0].section_number(), 0);
        assert_eq!(sections[1].section_number(), 1);
        assert_eq!(sections[2].section_number(), 0);
        assert_eq!(sections[2].last_section_number(), 1);
        assert_eq!(sections[3].section_number(), 1);
        assert_eq!(sections[3].last_section_number(), 1);
        assert!(sections[2].has_valid_crc());
    }

    #[test]
    fn test_process_normalize_and_pack() {
        let args = SectionFileArgs {
            eit_normalize: true,
            eit_base_time: Some(Utc.with_ymd_and_hms(2024, 6, 15, 0, 0, 0).unwrap()),
            ..Default::default()
        };
        // An empty bag goes through unchanged.
        let mut sections = Vec::new();
        args.process(&mut sections);
        assert!(sections.is_empty());
    }
}
