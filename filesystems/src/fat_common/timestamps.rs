// MS-DOS date/time handling for FAT32 directory records
// date: bits 15-9 year (0=1980), bits 8-5 month, bits 4-0 day
// time: bits 15-11 hours, bits 10-5 minutes, bits 4-0 seconds/2

use chrono::{Datelike, Local, NaiveDate, NaiveDateTime, Timelike};

const BASE_YEAR: i32 = 1980;
const MAX_YEAR: i32 = BASE_YEAR + 127;
/// Smallest "last day of month"; clamping never goes below it
const MIN_MAX_DAY: u32 = 28;

struct DateFields {
    year: i32,
    month: u32,
    day: u32,
}

fn split_date(date: u16) -> DateFields {
    DateFields {
        year: ((date >> 9) & 0x7F) as i32 + BASE_YEAR,
        month: ((date >> 5) & 0x0F) as u32,
        day: (date & 0x1F) as u32,
    }
}

/// Build a date, optionally clamping month/day into range and stepping the
/// day back until the date exists (Feb 30 -> Feb 29/28)
fn make_date(fields: DateFields, fix: bool) -> Option<NaiveDate> {
    if !fix {
        return NaiveDate::from_ymd_opt(fields.year, fields.month, fields.day);
    }
    let month = fields.month.clamp(1, 12);
    let mut day = fields.day.clamp(1, 31);
    loop {
        if let Some(date) = NaiveDate::from_ymd_opt(fields.year, month, day) {
            return Some(date);
        }
        if day <= MIN_MAX_DAY {
            return None;
        }
        day -= 1;
    }
}

/// Decode a date field; zero means "not recorded"
pub fn decode_fat_date(date: u16, fix: bool) -> Option<NaiveDate> {
    if date == 0 {
        return None;
    }
    make_date(split_date(date), fix)
}

/// Decode a date/time pair plus the creation-time 10 ms field (0-199)
pub fn decode_fat_datetime(date: u16, time: u16, centiseconds: u8, fix: bool) -> Option<NaiveDateTime> {
    if date == 0 {
        return None;
    }
    let mut hour = ((time >> 11) & 0x1F) as u32;
    let mut minute = ((time >> 5) & 0x3F) as u32;
    let mut second = ((time & 0x1F) * 2) as u32;
    let mut centis = centiseconds as u32;

    if fix {
        hour = hour.min(23);
        minute = minute.min(59);
        centis = centis.min(199);
        second = (second + centis / 100).min(59);
    } else {
        second += centis / 100;
    }
    let nanos = (centis % 100) * 10_000_000;

    let date = make_date(split_date(date), fix)?;
    date.and_hms_nano_opt(hour, minute, second, nanos)
}

pub fn encode_fat_date(date: &NaiveDate) -> u16 {
    let year = date.year().clamp(BASE_YEAR, MAX_YEAR) - BASE_YEAR;
    ((year as u16) << 9) | ((date.month() as u16) << 5) | date.day() as u16
}

/// Encode to (date, time, centiseconds)
pub fn encode_fat_datetime(datetime: &NaiveDateTime) -> (u16, u16, u8) {
    let date = encode_fat_date(&datetime.date());
    let time = ((datetime.hour() as u16) << 11)
        | ((datetime.minute() as u16) << 5)
        | (datetime.second() / 2) as u16;
    let centis = (datetime.second() % 2) * 100 + datetime.nanosecond().min(999_999_999) / 10_000_000;
    (date, time, centis as u8)
}

/// Current local time truncated to what a FAT record can hold
pub fn current_fat_datetime() -> NaiveDateTime {
    let now = Local::now().naive_local();
    let (date, time, centis) = encode_fat_datetime(&now);
    decode_fat_datetime(date, time, centis, true).unwrap_or(now)
}
