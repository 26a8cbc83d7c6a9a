//! EIT repetition rate profiles.
//!
//! ETSI TS 101 211 recommends different repetition rates depending on the
//! delivery network and on how close the described events are: present/
//! following cycles fast, the first days of schedule ("prime" period) cycle
//! slower, the rest ("later") slower still.

use super::{is_actual, is_present_following, segment_to_section, segment_to_table_id};
use super::{SEGMENTS_PER_DAY, TOTAL_DAYS};
use crate::psi::Section;
use chrono::Duration;

/// Priority classes of an EIT section, in decreasing order of importance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EitProfile {
    /// Present/following, actual TS.
    PfActual = 0,
    /// Present/following, other TS.
    PfOther = 1,
    /// Schedule, actual TS, prime period.
    SchedActualPrime = 2,
    /// Schedule, other TS, prime period.
    SchedOtherPrime = 3,
    /// Schedule, actual TS, later period.
    SchedActualLater = 4,
    /// Schedule, other TS, later period.
    SchedOtherLater = 5,
}

/// Number of priority classes.
pub const PROFILE_COUNT: usize = 6;

/// Repetition rates for the six EIT priority classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EitRepetitionProfile {
    /// Number of days in the "prime" period, at most 64.
    pub prime_days: u8,
    /// Cycle time in seconds, indexed by [`EitProfile`].
    pub cycle_seconds: [u32; PROFILE_COUNT],
}

impl EitRepetitionProfile {
    /// Creates a profile, clamping `prime_days` to the EPG depth.
    pub fn new(prime_days: u8, cycle_seconds: [u32; PROFILE_COUNT]) -> Self {
        Self { prime_days: prime_days.min(TOTAL_DAYS as u8), cycle_seconds }
    }

    /// Standard profile for satellite and cable networks.
    pub fn satellite_cable() -> Self {
        Self::new(8, [2, 10, 10, 10, 30, 30])
    }

    /// Standard profile for terrestrial networks.
    pub fn terrestrial() -> Self {
        Self::new(1, [2, 20, 10, 60, 30, 300])
    }

    /// First schedule table id of the "later" period.
    pub fn later_table_id(&self, actual: bool) -> u8 {
        segment_to_table_id(actual, self.prime_days as usize * SEGMENTS_PER_DAY)
    }

    /// First section number of the "later" period inside its subtable.
    pub fn later_section_number(&self) -> u8 {
        segment_to_section(self.prime_days as usize * SEGMENTS_PER_DAY)
    }

    /// Classifies an EIT section into its priority class.
    pub fn section_to_profile(&self, section: &Section) -> EitProfile {
        let tid = section.table_id();
        let actual = is_actual(tid);
        if is_present_following(tid) {
            return if actual { EitProfile::PfActual } else { EitProfile::PfOther };
        }
        let later_tid = self.later_table_id(actual);
        if tid < later_tid || (tid == later_tid && section.section_number() < self.later_section_number()) {
            if actual { EitProfile::SchedActualPrime } else { EitProfile::SchedOtherPrime }
        } else if actual {
            EitProfile::SchedActualLater
        } else {
            EitProfile::SchedOtherLater
        }
    }

    /// Returns the cycle time of an EIT section.
    pub fn repetition(&self, section: &Section) -> Duration {
        Duration::seconds(self.cycle_seconds[self.section_to_profile(section) as usize] as i64)
    }
}

impl Default for EitRepetitionProfile {
    fn default() -> Self {
        Self::satellite_cable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule_section(tid: u8, number: u8) -> Section {
        Section::new_long(tid, true, 1, 0, true, number, 255, &[0u8; 6]).unwrap()
    }

    #[test]
    fn test_pf_classification() {
        let profile = EitRepetitionProfile::satellite_cable();
        let actual = schedule_section(0x4E, 0);
        let other = schedule_section(0x4F, 0);
        assert_eq!(profile.section_to_profile(&actual), EitProfile::PfActual);
        assert_eq!(profile.section_to_profile(&other), EitProfile::PfOther);
        assert_eq!(profile.repetition(&actual), Duration::seconds(2));
        assert_eq!(profile.repetition(&other), Duration::seconds(10));
    }

    #[test]
    fn test_prime_later_boundary_sat_cable() {
        // Sat/cable: 8 prime days = 64 segments = exactly 2 subtables.
        let profile = EitRepetitionProfile::satellite_cable();
        assert_eq!(profile.later_table_id(true), 0x52);
        assert_eq!(profile.later_section_number(), 0);
        assert_eq!(
            profile.section_to_profile(&schedule_section(0x51, 255)),
            EitProfile::SchedActualPrime
        );
        assert_eq!(
            profile.section_to_profile(&schedule_section(0x52, 0)),
            EitProfile::SchedActualLater
        );
        assert_eq!(
            profile.section_to_profile(&schedule_section(0x62, 0)),
            EitProfile::SchedOtherLater
        );
    }

    #[test]
    fn test_prime_later_boundary_terrestrial() {
        // Terrestrial: 1 prime day = 8 segments = section number 64 of table 0.
        let profile = EitRepetitionProfile::terrestrial();
        assert_eq!(profile.later_table_id(true), 0x50);
        assert_eq!(profile.later_section_number(), 64);
        assert_eq!(
            profile.section_to_profile(&schedule_section(0x50, 63)),
            EitProfile::SchedActualPrime
        );
        assert_eq!(
            profile.section_to_profile(&schedule_section(0x50, 64)),
            EitProfile::SchedActualLater
        );
        assert_eq!(profile.repetition(&schedule_section(0x60, 64)), Duration::seconds(300));
    }

    #[test]
    fn test_prime_days_clamped() {
        let profile = EitRepetitionProfile::new(100, [2, 10, 10, 10, 30, 30]);
        assert_eq!(profile.prime_days, 64);
    }
}
