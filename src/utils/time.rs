//! DVB time codecs: Modified Julian Date and BCD encodings.
//!
//! EIT `start_time` fields are 40 bits: a 16-bit MJD day number followed by
//! three BCD bytes for hours, minutes and seconds (ETSI EN 300 468, annex C).
//! Event durations are three BCD bytes. All wall-clock values are UTC.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Timelike, Utc};

/// Size in bytes of an encoded MJD date with time (16-bit day + 3 BCD bytes).
pub const MJD_SIZE: usize = 5;

/// Day 0 of the Modified Julian Date scale, 1858-11-17.
fn mjd_epoch() -> NaiveDate {
    // from_ymd_opt only fails on out-of-range dates.
    NaiveDate::from_ymd_opt(1858, 11, 17).unwrap_or_default()
}

/// Encodes one value in the range 0..=99 as a packed BCD byte.
pub fn encode_bcd(value: u8) -> u8 {
    ((value / 10) << 4) | (value % 10)
}

/// Decodes a packed BCD byte. Returns `None` when either nibble is not a digit.
pub fn decode_bcd(byte: u8) -> Option<u8> {
    let tens = byte >> 4;
    let units = byte & 0x0F;
    if tens > 9 || units > 9 {
        None
    } else {
        Some(tens * 10 + units)
    }
}

/// Encodes a UTC date and time as a 5-byte MJD + BCD field.
pub fn encode_mjd(time: &DateTime<Utc>) -> [u8; MJD_SIZE] {
    let days = (time.date_naive() - mjd_epoch()).num_days();
    let mjd = days as u16;
    [
        (mjd >> 8) as u8,
        (mjd & 0xFF) as u8,
        encode_bcd(time.hour() as u8),
        encode_bcd(time.minute() as u8),
        encode_bcd(time.second() as u8),
    ]
}

/// Decodes a 5-byte MJD + BCD field into a UTC date and time.
///
/// Returns `None` on short input, invalid BCD digits or out-of-range time
/// components.
pub fn decode_mjd(data: &[u8]) -> Option<DateTime<Utc>> {
    if data.len() < MJD_SIZE {
        return None;
    }
    let mjd = ((data[0] as i64) << 8) | data[1] as i64;
    let hour = decode_bcd(data[2])?;
    let minute = decode_bcd(data[3])?;
    let second = decode_bcd(data[4])?;
    let date = mjd_epoch().checked_add_signed(Duration::days(mjd))?;
    let time = NaiveTime::from_hms_opt(hour as u32, minute as u32, second as u32)?;
    Some(date.and_time(time).and_utc())
}

/// Encodes a duration as three BCD bytes (HH MM SS). Clamped to 99 hours.
pub fn encode_duration(duration: Duration) -> [u8; 3] {
    let total = duration.num_seconds().max(0);
    let hours = (total / 3600).min(99) as u8;
    let minutes = ((total / 60) % 60) as u8;
    let seconds = (total % 60) as u8;
    [encode_bcd(hours), encode_bcd(minutes), encode_bcd(seconds)]
}

/// Decodes a three-byte BCD duration (HH MM SS).
pub fn decode_duration(data: &[u8]) -> Option<Duration> {
    if data.len() < 3 {
        return None;
    }
    let hours = decode_bcd(data[0])? as i64;
    let minutes = decode_bcd(data[1])? as i64;
    let seconds = decode_bcd(data[2])? as i64;
    Some(Duration::seconds(hours * 3600 + minutes * 60 + seconds))
}

/// Truncates a UTC time to the preceding midnight ("last midnight").
pub fn this_day(time: &DateTime<Utc>) -> DateTime<Utc> {
    time.date_naive().and_time(NaiveTime::MIN).and_utc()
}
