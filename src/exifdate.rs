use std::io::Cursor;

use chrono::{Local, NaiveDateTime, TimeZone};
use exif::{In, Tag, Value};

/// Capture time from the file's EXIF block as Unix seconds, preferring
/// DateTimeOriginal over DateTimeDigitized over DateTime. EXIF timestamps
/// carry no zone, so they resolve against local time.
pub fn exif_timestamp(bytes: &[u8]) -> Option<i64> {
    let exif = exif::Reader::new().read_from_container(&mut Cursor::new(bytes)).ok()?;

    let field = [Tag::DateTimeOriginal, Tag::DateTimeDigitized, Tag::DateTime]
        .into_iter()
        .find_map(|tag| exif.get_field(tag, In::PRIMARY))?;

    let text = match &field.value {
        Value::Ascii(v) if !v.is_empty() => String::from_utf8_lossy(&v[0]).into_owned(),
        _ => return None,
    };

    let naive = parse_exif_datetime(text.trim())?;
    Local.from_local_datetime(&naive).earliest().map(|dt| dt.timestamp())
}

fn parse_exif_datetime(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, "%Y:%m:%d %H:%M:%S").ok()
}
