//! Date format used for `date`-typed properties.
//!
//! Dates are written as `dd.MM.yyyy HH:mm:ss.SSS UTC`. The reader also takes
//! the older second-resolution form and a trailing zone given as `UTC`,
//! `GMT`, `Z` or a numeric offset (`+0100`, `+01:00`, `GMT+01:00`).

use time::format_description::FormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

use crate::error::Result;

const WITH_MILLIS: &[FormatItem<'static>] = format_description!(
    "[day].[month].[year] [hour]:[minute]:[second].[subsecond digits:3]"
);

const WITHOUT_MILLIS: &[FormatItem<'static>] =
    format_description!("[day].[month].[year] [hour]:[minute]:[second]");

/// Formats `value` in UTC with millisecond precision.
pub fn format_date(value: OffsetDateTime) -> Result<String> {
    let utc = value.to_offset(UtcOffset::UTC);
    Ok(format!("{} UTC", utc.format(WITH_MILLIS)?))
}

/// Parses a date written by [`format_date`] or by the legacy format.
///
/// Returns `None` if the text is not a date in either form.
pub fn parse_date(text: &str) -> Option<OffsetDateTime> {
    let text = text.trim();
    let (stamp, zone) = match text.rsplit_once(' ') {
        Some((stamp, zone)) if zone.chars().any(|c| c.is_ascii_alphabetic() || c == '+' || c == '-') => {
            (stamp.trim_end(), Some(zone))
        }
        _ => (text, None),
    };
    let offset = match zone {
        Some(zone) => parse_zone(zone)?,
        None => UtcOffset::UTC,
    };
    let local = PrimitiveDateTime::parse(stamp, WITH_MILLIS)
        .or_else(|_| PrimitiveDateTime::parse(stamp, WITHOUT_MILLIS))
        .ok()?;
    Some(local.assume_offset(offset).to_offset(UtcOffset::UTC))
}

fn parse_zone(zone: &str) -> Option<UtcOffset> {
    let upper = zone.to_ascii_uppercase();
    let rest = upper
        .strip_prefix("GMT")
        .or_else(|| upper.strip_prefix("UTC"))
        .unwrap_or(&upper);
    if rest.is_empty() || rest == "Z" {
        return Some(UtcOffset::UTC);
    }
    let (sign, digits) = match rest.as_bytes().first()? {
        b'+' => (1, &rest[1..]),
        b'-' => (-1, &rest[1..]),
        _ => return None,
    };
    let digits: String = digits.chars().filter(|c| *c != ':').collect();
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let (hours, minutes) = match digits.len() {
        1 | 2 => (digits.parse::<i8>().ok()?, 0),
        4 => (digits[..2].parse::<i8>().ok()?, digits[2..].parse::<i8>().ok()?),
        _ => return None,
    };
    UtcOffset::from_hms(sign * hours, sign * minutes, 0).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn writes_utc_with_millis() {
        let d = datetime!(2024-03-05 06:07:08.123 +02:00);
        assert_eq!(format_date(d).unwrap(), "05.03.2024 04:07:08.123 UTC");
    }

    #[test]
    fn reads_back_to_the_millisecond() {
        let d = datetime!(1999-12-31 23:59:59.999 UTC);
        let text = format_date(d).unwrap();
        assert_eq!(parse_date(&text), Some(d));
    }

    #[test]
    fn accepts_legacy_and_offsets() {
        assert_eq!(
            parse_date("01.02.2003 04:05:06 GMT"),
            Some(datetime!(2003-02-01 04:05:06 UTC))
        );
        assert_eq!(
            parse_date("01.02.2003 04:05:06 +0100"),
            Some(datetime!(2003-02-01 03:05:06 UTC))
        );
        assert_eq!(
            parse_date("01.02.2003 04:05:06.500 GMT-01:30"),
            Some(datetime!(2003-02-01 05:35:06.5 UTC))
        );
        assert_eq!(
            parse_date("01.02.2003 04:05:06"),
            Some(datetime!(2003-02-01 04:05:06 UTC))
        );
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_date("yesterday"), None);
        assert_eq!(parse_date("01.02.2003 04:05:06 CEST"), None);
        assert_eq!(parse_date(""), None);
    }
}
