// Number and date text formatting used by the string converters

use chrono::{NaiveDate, NaiveDateTime};

use crate::cell::{DataFormat, Number};
use crate::error::BoxError;
use crate::numeric;

/// Default pattern for date → text when none is configured.
pub const DEFAULT_DATE_PATTERN: &str = "yyyy-MM-dd HH:mm:ss";

/// Format code of a built-in number format id.
pub fn builtin_format(index: u16) -> Option<&'static str> {
    let code = match index {
        0 => "General",
        1 => "0",
        2 => "0.00",
        3 => "#,##0",
        4 => "#,##0.00",
        9 => "0%",
        10 => "0.00%",
        11 => "0.00E+00",
        14 => "yyyy-mm-dd",
        15 => "d-mmm-yy",
        16 => "d-mmm",
        17 => "mmm-yy",
        18 => "h:mm AM/PM",
        19 => "h:mm:ss AM/PM",
        20 => "h:mm",
        21 => "h:mm:ss",
        22 => "yyyy-mm-dd hh:mm",
        37 => "#,##0 ;(#,##0)",
        38 => "#,##0 ;[Red](#,##0)",
        39 => "#,##0.00;(#,##0.00)",
        40 => "#,##0.00;[Red](#,##0.00)",
        45 => "mm:ss",
        46 => "[h]:mm:ss",
        47 => "mm:ss.0",
        48 => "##0.0E+0",
        49 => "@",
        27..=36 | 50..=58 => "yyyy-mm-dd",
        _ => return None,
    };
    Some(code)
}

/// Render a number as text. `pattern` is a spreadsheet-style number format
/// (`0.00`, `#,##0`, `0%`, `0.00E+00`, optionally with literal prefix/suffix).
pub fn format_number(value: f64, pattern: Option<&str>, scientific: bool) -> String {
    match pattern {
        Some(p) if !p.is_empty() && !p.eq_ignore_ascii_case("general") && p != "@" => {
            apply_numeric_pattern(value, p)
        }
        _ => plain_number(value, scientific),
    }
}

fn plain_number(value: f64, scientific: bool) -> String {
    if scientific {
        let abs = value.abs();
        if abs != 0.0 && !(1e-5..1e15).contains(&abs) {
            return to_scientific(value);
        }
    }
    format!("{}", value)
}

fn to_scientific(value: f64) -> String {
    let raw = format!("{:e}", value);
    match raw.split_once('e') {
        Some((mantissa, exp)) => {
            let (sign, digits) = match exp.strip_prefix('-') {
                Some(d) => ('-', d),
                None => ('+', exp),
            };
            format!("{}E{}{:0>2}", mantissa, sign, digits)
        }
        None => raw,
    }
}

struct NumericPattern {
    prefix: String,
    suffix: String,
    decimals: usize,
    grouping: bool,
    percent: bool,
    scientific: bool,
}

fn parse_numeric_pattern(pattern: &str) -> NumericPattern {
    let section = pattern.split(';').next().unwrap_or(pattern);
    let mut prefix = String::new();
    let mut suffix = String::new();
    let mut core = String::new();
    let mut seen_core = false;
    let mut chars = section.chars().peekable();

    while let Some(c) = chars.next() {
        let literal = match c {
            '"' => {
                let mut lit = String::new();
                for q in chars.by_ref() {
                    if q == '"' {
                        break;
                    }
                    lit.push(q);
                }
                Some(lit)
            }
            '\\' => chars.next().map(String::from),
            '[' => {
                // Colors and locale tags carry no text
                for q in chars.by_ref() {
                    if q == ']' {
                        break;
                    }
                }
                Some(String::new())
            }
            '_' | '*' => {
                chars.next();
                Some(String::new())
            }
            '0' | '#' | '?' | ',' | '.' => None,
            'E' | 'e' if seen_core => None,
            '+' | '-' if seen_core && core.ends_with(['E', 'e']) => None,
            other => Some(other.to_string()),
        };
        match literal {
            Some(text) if seen_core => suffix.push_str(&text),
            Some(text) => prefix.push_str(&text),
            None => {
                seen_core = true;
                core.push(c);
            }
        }
    }

    let (mantissa, scientific) = match core.find(['E', 'e']) {
        Some(i) => (&core[..i], true),
        None => (core.as_str(), false),
    };
    let decimals = mantissa
        .split_once('.')
        .map_or(0, |(_, frac)| frac.chars().filter(|c| matches!(c, '0' | '#' | '?')).count());

    NumericPattern {
        percent: prefix.contains('%') || suffix.contains('%'),
        grouping: mantissa.contains(','),
        prefix,
        suffix,
        decimals,
        scientific,
    }
}

fn group_thousands(int_part: &str) -> String {
    let bytes = int_part.as_bytes();
    let mut out = String::with_capacity(int_part.len() + int_part.len() / 3);
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 && (bytes.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(*b as char);
    }
    out
}

fn apply_numeric_pattern(value: f64, pattern: &str) -> String {
    let p = parse_numeric_pattern(pattern);
    let value = numeric::correct_precision(value);
    let scaled = if p.percent {
        numeric::correct_precision(value * 100.0)
    } else {
        value
    };

    let body = if !scaled.is_finite() {
        format!("{}", scaled.abs())
    } else if p.scientific {
        scientific_half_up(scaled.abs(), p.decimals)
    } else {
        let fixed = fixed_half_up(scaled.abs(), p.decimals);
        if p.grouping {
            match fixed.split_once('.') {
                Some((int, frac)) => format!("{}.{}", group_thousands(int), frac),
                None => group_thousands(&fixed),
            }
        } else {
            fixed
        }
    };

    // -0.00 is printed without the sign
    let negative = scaled < 0.0 && body.chars().any(|c| matches!(c, '1'..='9'));
    format!(
        "{}{}{}{}",
        if negative { "-" } else { "" },
        p.prefix,
        body,
        p.suffix
    )
}

/// Shortest round-trip decimal digits of a finite, non-negative value and
/// the power of ten of the first digit.
fn decimal_digits(value: f64) -> (Vec<u8>, i64) {
    let repr = format!("{:e}", value);
    let (mantissa, exp) = repr.split_once('e').unwrap_or((repr.as_str(), "0"));
    let digits = mantissa
        .bytes()
        .filter(u8::is_ascii_digit)
        .map(|b| b - b'0')
        .collect();
    (digits, exp.parse().unwrap_or(0))
}

/// Keep the first `keep` digits, rounding half up on the next one.
/// Returns true when the carry added a leading digit.
fn round_half_up(digits: &[u8], keep: usize) -> (Vec<u8>, bool) {
    let mut kept: Vec<u8> = digits.iter().take(keep).copied().collect();
    kept.resize(keep, 0);
    if digits.get(keep).is_some_and(|d| *d >= 5) {
        for d in kept.iter_mut().rev() {
            if *d == 9 {
                *d = 0;
            } else {
                *d += 1;
                return (kept, false);
            }
        }
        kept.insert(0, 1);
        return (kept, true);
    }
    (kept, false)
}

fn render_digits(digits: &[u8]) -> String {
    digits.iter().map(|d| char::from(b'0' + d)).collect()
}

fn fixed_half_up(value: f64, decimals: usize) -> String {
    let (digits, exp) = decimal_digits(value);
    // digits of value * 10^decimals that sit left of the point
    let keep = exp + 1 + decimals as i64;
    let mut units = if keep < 0 {
        Vec::new()
    } else {
        round_half_up(&digits, keep as usize).0
    };
    while units.len() <= decimals {
        units.insert(0, 0);
    }
    let text = render_digits(&units);
    let (int, frac) = text.split_at(text.len() - decimals);
    let int = match int.trim_start_matches('0') {
        "" => "0",
        trimmed => trimmed,
    };
    if decimals == 0 {
        int.to_string()
    } else {
        format!("{}.{}", int, frac)
    }
}

fn scientific_half_up(value: f64, decimals: usize) -> String {
    let (digits, mut exp) = if value == 0.0 {
        (vec![0], 0)
    } else {
        decimal_digits(value)
    };
    let (mut kept, carried) = round_half_up(&digits, decimals + 1);
    if carried {
        kept.truncate(decimals + 1);
        exp += 1;
    }
    let text = render_digits(&kept);
    let (lead, rest) = text.split_at(1);
    let mantissa = if rest.is_empty() {
        lead.to_string()
    } else {
        format!("{}.{}", lead, rest)
    };
    let sign = if exp < 0 { '-' } else { '+' };
    format!("{}E{}{:0>2}", mantissa, sign, exp.abs())
}

/// Parse text into a number. With a pattern, grouping separators, percent
/// signs and literal prefix/suffix text are tolerated.
pub fn parse_number(text: &str, pattern: Option<&str>) -> Result<f64, BoxError> {
    let trimmed = text.trim();
    let Some(pattern) = pattern else {
        return trimmed
            .parse::<f64>()
            .map_err(|e| format!("'{}' is not a number: {}", trimmed, e).into());
    };

    let p = parse_numeric_pattern(pattern);
    let mut s = trimmed;
    let negative = s.starts_with('-');
    if negative {
        s = &s[1..];
    }
    s = s.strip_prefix(p.prefix.as_str()).unwrap_or(s);
    s = s.strip_suffix(p.suffix.as_str()).unwrap_or(s);
    let percent = s.ends_with('%') || p.percent;
    let cleaned: String = s.chars().filter(|c| *c != ',' && *c != '%').collect();
    let mut v = cleaned
        .trim()
        .parse::<f64>()
        .map_err(|e| format!("'{}' does not match pattern '{}': {}", trimmed, pattern, e))?;
    if percent {
        v /= 100.0;
    }
    Ok(if negative { -v } else { v })
}

fn push_literal(out: &mut String, c: char) {
    if c == '%' {
        out.push_str("%%");
    } else {
        out.push(c);
    }
}

/// Translate a `yyyy-MM-dd HH:mm:ss` style pattern into chrono strftime.
pub fn date_pattern_to_strftime(pattern: &str) -> String {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '\'' {
            i += 1;
            while i < chars.len() && chars[i] != '\'' {
                push_literal(&mut out, chars[i]);
                i += 1;
            }
            i += 1;
            continue;
        }
        let mut run = 1;
        while i + run < chars.len() && chars[i + run] == c {
            run += 1;
        }
        let spec = match (c, run) {
            ('y', 2) => Some("%y"),
            ('y', _) => Some("%Y"),
            ('M', 1) => Some("%-m"),
            ('M', 2) => Some("%m"),
            ('M', 3) => Some("%b"),
            ('M', _) => Some("%B"),
            ('d', 1) => Some("%-d"),
            ('d', _) => Some("%d"),
            ('H', 1) => Some("%-H"),
            ('H', _) => Some("%H"),
            ('h', 1) => Some("%-I"),
            ('h', _) => Some("%I"),
            ('m', 1) => Some("%-M"),
            ('m', _) => Some("%M"),
            ('s', 1) => Some("%-S"),
            ('s', _) => Some("%S"),
            ('S', 1..=3) => Some("%3f"),
            ('S', 4..=6) => Some("%6f"),
            ('S', _) => Some("%9f"),
            ('a', _) => Some("%p"),
            ('E', 1..=3) => Some("%a"),
            ('E', _) => Some("%A"),
            _ => None,
        };
        match spec {
            Some(s) => out.push_str(s),
            None => {
                for _ in 0..run {
                    push_literal(&mut out, c);
                }
            }
        }
        i += run;
    }
    out
}

/// Translate a spreadsheet date/time number format (`yyyy-mm-dd h:mm AM/PM`)
/// into chrono strftime. `m` is a minute after `h` or before `s`.
pub fn excel_pattern_to_strftime(pattern: &str) -> String {
    let section = pattern.split(';').next().unwrap_or(pattern);
    let chars: Vec<char> = section.chars().collect();
    let twelve_hour = section.to_ascii_uppercase().contains("AM/PM");
    let mut out = String::new();
    let mut last_was_hour = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '"' => {
                i += 1;
                while i < chars.len() && chars[i] != '"' {
                    push_literal(&mut out, chars[i]);
                    i += 1;
                }
                i += 1;
                continue;
            }
            '\\' => {
                if let Some(next) = chars.get(i + 1) {
                    push_literal(&mut out, *next);
                }
                i += 2;
                continue;
            }
            '[' => {
                let close = chars[i..].iter().position(|ch| *ch == ']');
                let inner: String = match close {
                    Some(end) => chars[i + 1..i + end].iter().collect(),
                    None => String::new(),
                };
                match inner.to_ascii_lowercase().as_str() {
                    "h" | "hh" => {
                        out.push_str("%H");
                        last_was_hour = true;
                    }
                    "m" | "mm" => out.push_str("%M"),
                    "s" | "ss" => out.push_str("%S"),
                    _ => {}
                }
                i += close.map_or(chars.len(), |end| end + 1);
                continue;
            }
            _ => {}
        }

        if section[char_offset(&chars, i)..].to_ascii_uppercase().starts_with("AM/PM") {
            out.push_str("%p");
            i += 5;
            continue;
        }

        let lower = c.to_ascii_lowercase();
        let mut run = 1;
        while i + run < chars.len() && chars[i + run].to_ascii_lowercase() == lower {
            run += 1;
        }
        match lower {
            'y' => {
                out.push_str(if run <= 2 { "%y" } else { "%Y" });
                last_was_hour = false;
            }
            'd' => {
                out.push_str(match run {
                    1 => "%-d",
                    2 => "%d",
                    3 => "%a",
                    _ => "%A",
                });
                last_was_hour = false;
            }
            'h' => {
                out.push_str(match (twelve_hour, run) {
                    (true, 1) => "%-I",
                    (true, _) => "%I",
                    (false, 1) => "%-H",
                    (false, _) => "%H",
                });
                last_was_hour = true;
            }
            's' => {
                out.push_str(if run == 1 { "%-S" } else { "%S" });
                // ss.0 → tenths
                if chars.get(i + run) == Some(&'.') && chars.get(i + run + 1) == Some(&'0') {
                    let mut zeros = 0;
                    while chars.get(i + run + 1 + zeros) == Some(&'0') {
                        zeros += 1;
                    }
                    out.push('.');
                    out.push_str(match zeros {
                        1..=3 => "%3f",
                        _ => "%6f",
                    });
                    i += 1 + zeros;
                }
                last_was_hour = false;
            }
            'm' => {
                let before_seconds = chars[i + run..]
                    .iter()
                    .find(|ch| ch.is_ascii_alphabetic())
                    .is_some_and(|ch| ch.eq_ignore_ascii_case(&'s'));
                let minute = run <= 2 && (last_was_hour || before_seconds);
                out.push_str(match (minute, run) {
                    (true, 1) => "%-M",
                    (true, _) => "%M",
                    (false, 1) => "%-m",
                    (false, 2) => "%m",
                    (false, 3) => "%b",
                    (false, _) => "%B",
                });
                last_was_hour = false;
            }
            _ => {
                for _ in 0..run {
                    push_literal(&mut out, c);
                }
            }
        }
        i += run;
    }
    out
}

fn char_offset(chars: &[char], index: usize) -> usize {
    chars[..index].iter().map(|c| c.len_utf8()).sum()
}

pub fn format_date(dt: NaiveDateTime, pattern: Option<&str>) -> String {
    let fmt = date_pattern_to_strftime(pattern.unwrap_or(DEFAULT_DATE_PATTERN));
    dt.format(&fmt).to_string()
}

/// Parse date text. Without a pattern a handful of common layouts are tried.
pub fn parse_date(text: &str, pattern: Option<&str>) -> Result<NaiveDateTime, BoxError> {
    let text = text.trim();
    if let Some(p) = pattern {
        let fmt = date_pattern_to_strftime(p);
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, &fmt) {
            return Ok(dt);
        }
        if let Ok(d) = NaiveDate::parse_from_str(text, &fmt) {
            if let Some(dt) = d.and_hms_opt(0, 0, 0) {
                return Ok(dt);
            }
        }
        return Err(format!("'{}' does not match date pattern '{}'", text, p).into());
    }

    const DATETIME_LAYOUTS: &[&str] = &[
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y/%m/%d %H:%M:%S",
        "%Y-%m-%d %H:%M",
    ];
    const DATE_LAYOUTS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%Y%m%d"];

    for layout in DATETIME_LAYOUTS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, layout) {
            return Ok(dt);
        }
    }
    for layout in DATE_LAYOUTS {
        if let Ok(d) = NaiveDate::parse_from_str(text, layout) {
            if let Some(dt) = d.and_hms_opt(0, 0, 0) {
                return Ok(dt);
            }
        }
    }
    Err(format!("'{}' is not a recognised date", text).into())
}

/// Text for a numeric cell as its number format would show it.
pub fn format_cell_number(
    number: Number,
    data_format: Option<&DataFormat>,
    use_1904: bool,
    scientific: bool,
) -> String {
    let Some(df) = data_format else {
        return plain_number(number.value, scientific);
    };
    let code = if df.format.is_empty() {
        builtin_format(df.index).unwrap_or("General")
    } else {
        df.format.as_str()
    };
    if numeric::is_date_format(df.index, code) {
        if let Some(dt) = numeric::serial_to_datetime(number.value, use_1904) {
            return dt.format(&excel_pattern_to_strftime(code)).to_string();
        }
    }
    format_number(number.value, Some(code), scientific)
}
