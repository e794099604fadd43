//! Numeric precision correction and date-serial conversion.
//!
//! Spreadsheet files store numbers as IEEE doubles, so a value the user typed
//! as `2087.025` may come back as `2087.0249999999996`. Every numeric read is
//! rounded to 15 significant digits (half-up) before being exposed; the raw
//! value stays available on [`crate::cell::Number::original`].
//!
//! Date serials count days from an epoch. The 1900 system starts at
//! 1900-01-00 and keeps the historical 1900-02-29 slot; the 1904 system starts
//! at 1904-01-01.

use chrono::{Duration, NaiveDate, NaiveDateTime};

/// Significant decimal digits kept by [`correct_precision`].
pub const SIGNIFICANT_DIGITS: usize = 15;

const MILLIS_PER_DAY: f64 = 86_400_000.0;

/// Round `raw` to 15 significant digits, half-up, starting from the shortest
/// decimal representation that round-trips to the same double.
pub fn correct_precision(raw: f64) -> f64 {
    round_significant(raw, SIGNIFICANT_DIGITS)
}

pub fn round_significant(raw: f64, digits: usize) -> f64 {
    if !raw.is_finite() || raw == 0.0 || digits == 0 {
        return raw;
    }

    // `{:e}` yields the shortest round-trip form, e.g. "2.0870249999999996e3"
    let repr = format!("{:e}", raw.abs());
    let Some((mantissa, exp)) = repr.split_once('e') else {
        return raw;
    };
    let Ok(mut exp) = exp.parse::<i32>() else {
        return raw;
    };

    let mut kept: Vec<u8> = mantissa.bytes().filter(u8::is_ascii_digit).collect();
    if kept.len() <= digits {
        return raw;
    }

    let round_up = kept[digits] >= b'5';
    kept.truncate(digits);
    if round_up {
        let mut i = digits;
        loop {
            if i == 0 {
                // All nines: 9.99..e3 rounds to 1.00..e4
                kept.insert(0, b'1');
                kept.truncate(digits);
                exp += 1;
                break;
            }
            i -= 1;
            if kept[i] == b'9' {
                kept[i] = b'0';
            } else {
                kept[i] += 1;
                break;
            }
        }
    }

    let digits_str = String::from_utf8_lossy(&kept);
    let (head, tail) = digits_str.split_at(1);
    let rebuilt = format!("{}.{}e{}", head, tail, exp);
    match rebuilt.parse::<f64>() {
        Ok(v) => v.copysign(raw),
        Err(_) => raw,
    }
}

fn epoch_1900() -> NaiveDate {
    NaiveDate::from_ymd_opt(1899, 12, 30).unwrap_or(NaiveDate::MIN)
}

fn epoch_1904() -> NaiveDate {
    NaiveDate::from_ymd_opt(1904, 1, 1).unwrap_or(NaiveDate::MIN)
}

/// Convert a date serial into a timestamp. Returns `None` for negative or
/// non-finite serials.
pub fn serial_to_datetime(serial: f64, use_1904: bool) -> Option<NaiveDateTime> {
    if !serial.is_finite() || serial < 0.0 {
        return None;
    }
    let whole_days = serial.floor();
    let millis = ((serial - whole_days) * MILLIS_PER_DAY).round() as i64;
    let whole_days = whole_days as i64;

    let date = if use_1904 {
        epoch_1904().checked_add_signed(Duration::days(whole_days))?
    } else if whole_days < 61 {
        // Serials before 1900-03-01 sit one day later because of the
        // phantom 1900-02-29 (serial 60).
        epoch_1900().checked_add_signed(Duration::days(whole_days + 1))?
    } else {
        epoch_1900().checked_add_signed(Duration::days(whole_days))?
    };
    date.and_hms_opt(0, 0, 0)?
        .checked_add_signed(Duration::milliseconds(millis))
}

/// Inverse of [`serial_to_datetime`].
pub fn datetime_to_serial(dt: NaiveDateTime, use_1904: bool) -> f64 {
    let epoch = if use_1904 { epoch_1904() } else { epoch_1900() };
    let start = epoch.and_hms_opt(0, 0, 0).unwrap_or(NaiveDateTime::MIN);
    let delta = dt - start;
    let mut days = delta.num_days();
    let rem = delta - Duration::days(days);
    if !use_1904 && days < 61 {
        days -= 1;
    }
    let fraction = rem.num_milliseconds() as f64 / MILLIS_PER_DAY;
    days as f64 + fraction
}

/// Built-in number format ids that render as a date or time.
pub fn is_builtin_date_format(index: u16) -> bool {
    matches!(index, 14..=22 | 27..=36 | 45..=47 | 50..=58)
}

/// True when a number format renders its value as a date/time, either by
/// built-in id or by date/time tokens in the pattern text.
pub fn is_date_format(index: u16, format: &str) -> bool {
    if is_builtin_date_format(index) {
        return true;
    }
    pattern_has_date_tokens(format)
}

fn pattern_has_date_tokens(format: &str) -> bool {
    // Only the first section (positive numbers) decides
    let section = format.split(';').next().unwrap_or("");
    let mut chars = section.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' => {
                for q in chars.by_ref() {
                    if q == '"' {
                        break;
                    }
                }
            }
            '\\' | '_' | '*' => {
                chars.next();
            }
            '[' => {
                let mut inner = String::new();
                for q in chars.by_ref() {
                    if q == ']' {
                        break;
                    }
                    inner.push(q);
                }
                // Elapsed time: [h], [mm], [ss]
                let lower = inner.to_ascii_lowercase();
                if !lower.is_empty() && lower.chars().all(|ch| matches!(ch, 'h' | 'm' | 's')) {
                    return true;
                }
            }
            '0' | '#' | '?' | '@' => return false,
            'y' | 'Y' | 'd' | 'D' | 'h' | 'H' | 's' | 'S' | 'm' | 'M' => return true,
            _ => {}
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dt(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    #[test]
    fn test_fifteen_digit_half_up() {
        let n = correct_precision(2087.0249999999996);
        assert_eq!(n, 2087.025);
        assert_eq!(correct_precision(0.1 + 0.2), 0.3);
        assert_eq!(correct_precision(-0.1 - 0.2), -0.3);
    }

    #[test]
    fn test_short_values_untouched() {
        assert_eq!(correct_precision(1.5), 1.5);
        assert_eq!(correct_precision(0.0), 0.0);
        assert_eq!(correct_precision(123456789.0), 123456789.0);
        assert!(correct_precision(f64::NAN).is_nan());
    }

    #[test]
    fn test_carry_through_nines() {
        assert_eq!(correct_precision(99.99999999999999), 100.0);
        assert_eq!(correct_precision(0.99999999999999989), 1.0);
    }

    #[test]
    fn test_1900_epoch() {
        assert_eq!(serial_to_datetime(1.0, false), Some(dt(1900, 1, 1)));
        assert_eq!(serial_to_datetime(59.0, false), Some(dt(1900, 2, 28)));
        assert_eq!(serial_to_datetime(61.0, false), Some(dt(1900, 3, 1)));
        assert_eq!(serial_to_datetime(45292.0, false), Some(dt(2024, 1, 1)));
    }

    #[test]
    fn test_1904_epoch() {
        assert_eq!(serial_to_datetime(0.0, true), Some(dt(1904, 1, 1)));
        assert_eq!(serial_to_datetime(43830.0, true), Some(dt(2024, 1, 1)));
    }

    #[test]
    fn test_time_fraction() {
        let v = serial_to_datetime(45292.5, false).unwrap();
        assert_eq!(v, dt(2024, 1, 1) + Duration::hours(12));
        assert_eq!(datetime_to_serial(v, false), 45292.5);
    }

    #[test]
    fn test_serial_round_trip_both_epochs() {
        for d in [dt(1900, 1, 1), dt(1900, 2, 28), dt(1900, 3, 1), dt(2031, 7, 9)] {
            let s = datetime_to_serial(d, false);
            assert_eq!(serial_to_datetime(s, false), Some(d));
        }
        let s = datetime_to_serial(dt(2010, 5, 5), true);
        assert_eq!(serial_to_datetime(s, true), Some(dt(2010, 5, 5)));
    }

    #[test]
    fn test_negative_serial_rejected() {
        assert_eq!(serial_to_datetime(-1.0, false), None);
    }

    #[test]
    fn test_date_format_detection() {
        assert!(is_date_format(14, ""));
        assert!(is_date_format(164, "yyyy-mm-dd"));
        assert!(is_date_format(164, "[h]:mm:ss"));
        assert!(is_date_format(164, "[$-409]d-mmm-yy;@"));
        assert!(!is_date_format(0, "General"));
        assert!(!is_date_format(2, "0.00"));
        assert!(!is_date_format(164, "#,##0 \"days\""));
        assert!(!is_date_format(164, "[Red]0.00"));
    }
}
