//! Duration and byte size strings.
//!
//! Months and years have no fixed length; a month is the Gregorian
//! average of 30.44 days and a year is twelve of those.

use std::time::Duration;

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;
const WEEK: u64 = 7 * DAY;
const MONTH: u64 = DAY * 3044 / 100;
const YEAR: u64 = 12 * MONTH;

/// Units from the largest to the smallest: suffix, seconds, name.
const UNITS: [(&str, u64, &str); 7] = [
    ("y", YEAR, "year"),
    ("mo", MONTH, "month"),
    ("w", WEEK, "week"),
    ("d", DAY, "day"),
    ("h", HOUR, "hour"),
    ("m", MINUTE, "minute"),
    ("s", 1, "second"),
];

/// Parse a duration like `1w2d` or `30m`.
///
/// Each unit may appear at most once and units must be given from the
/// largest to the smallest.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    if s.is_empty() {
        return Err("empty duration".to_string());
    }

    let mut rest = s;
    let mut next_unit = 0;
    let mut seconds = 0u64;

    while !rest.is_empty() {
        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        if digits == 0 {
            return Err(format!("invalid duration '{}'", s));
        }
        let amount = rest[..digits]
            .parse::<u64>()
            .map_err(|err| format!("invalid duration '{}': {}", s, err))?;
        rest = &rest[digits..];

        // "mo" must be tried before "m".
        let (index, (suffix, unit, _)) = UNITS
            .iter()
            .enumerate()
            .skip(next_unit)
            .find(|(_, (suffix, _, _))| {
                rest.starts_with(suffix)
                    && !(*suffix == "m" && rest.starts_with("mo"))
            })
            .ok_or_else(|| format!("invalid or misplaced unit in duration '{}'", s))?;
        rest = &rest[suffix.len()..];
        next_unit = index + 1;

        seconds = amount
            .checked_mul(*unit)
            .and_then(|value| seconds.checked_add(value))
            .ok_or_else(|| format!("duration '{}' is too long", s))?;
    }

    Ok(Duration::from_secs(seconds))
}

/// Format a duration for humans, e.g. `1 day 2 hours`.
pub fn pretty_duration(duration: Duration) -> String {
    let mut seconds = duration.as_secs();
    let mut parts = vec![];

    for (_, unit, name) in UNITS.iter() {
        if *unit > seconds {
            continue;
        }
        let amount = seconds / unit;
        seconds %= unit;
        parts.push(format!(
            "{} {}{}",
            amount,
            name,
            if amount > 1 { "s" } else { "" }
        ));
    }

    if parts.is_empty() {
        "0 seconds".to_string()
    } else {
        parts.join(" ")
    }
}

/// Parse a byte size like `10MiB`, `512K` or `1024`.
///
/// `K`, `M`, `G`, `T` (optionally followed by `B`) are decimal, the
/// `iB` forms are binary; suffixes are case-insensitive.
pub fn parse_bytesize(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let digits = s.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 {
        return Err(format!("invalid byte size '{}'", s));
    }
    let amount = s[..digits]
        .parse::<u64>()
        .map_err(|err| format!("invalid byte size '{}': {}", s, err))?;

    let factor: u64 = match s[digits..].trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" => 1000,
        "kib" => 1 << 10,
        "m" | "mb" => 1000 * 1000,
        "mib" => 1 << 20,
        "g" | "gb" => 1000 * 1000 * 1000,
        "gib" => 1 << 30,
        "t" | "tb" => 1000 * 1000 * 1000 * 1000,
        "tib" => 1 << 40,
        unit => return Err(format!("unknown byte size unit '{}'", unit)),
    };

    amount
        .checked_mul(factor)
        .ok_or_else(|| format!("byte size '{}' is too large", s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s"), Ok(Duration::from_secs(30)));
        assert_eq!(parse_duration("30m"), Ok(Duration::from_secs(30 * 60)));
        assert_eq!(parse_duration("1h30m"), Ok(Duration::from_secs(90 * 60)));
        assert_eq!(
            parse_duration("1w2d"),
            Ok(Duration::from_secs(9 * 24 * 3600))
        );
        assert_eq!(
            parse_duration("1mo"),
            Ok(Duration::from_secs(2_630_016))
        );
        assert_eq!(
            parse_duration("1y1mo1m"),
            Ok(Duration::from_secs(13 * 2_630_016 + 60))
        );
    }

    #[test]
    fn test_parse_duration_invalid() {
        for s in ["", "h", "10", "5x", "1m1h", "1h1h", "-1s", "1 h"] {
            assert!(parse_duration(s).is_err(), "{:?} was accepted", s);
        }
        assert!(parse_duration("99999999999999999999y").is_err());
    }

    #[test]
    fn test_pretty_duration() {
        assert_eq!(pretty_duration(Duration::from_secs(0)), "0 seconds");
        assert_eq!(pretty_duration(Duration::from_secs(1)), "1 second");
        assert_eq!(pretty_duration(Duration::from_secs(24 * 3600)), "1 day");
        assert_eq!(
            pretty_duration(Duration::from_secs(2 * 24 * 3600 + 3 * 3600 + 1)),
            "2 days 3 hours 1 second"
        );
        let s = "1w2d3h";
        assert_eq!(
            parse_duration(s).map(pretty_duration),
            Ok("1 week 2 days 3 hours".to_string())
        );
    }

    #[test]
    fn test_parse_bytesize() {
        assert_eq!(parse_bytesize("1024"), Ok(1024));
        assert_eq!(parse_bytesize("1B"), Ok(1));
        assert_eq!(parse_bytesize("10k"), Ok(10_000));
        assert_eq!(parse_bytesize("10KiB"), Ok(10 * 1024));
        assert_eq!(parse_bytesize("10MiB"), Ok(10 * 1024 * 1024));
        assert_eq!(parse_bytesize("2GB"), Ok(2_000_000_000));
        assert_eq!(parse_bytesize("1tib"), Ok(1 << 40));
        assert!(parse_bytesize("MiB").is_err());
        assert!(parse_bytesize("10XB").is_err());
        assert!(parse_bytesize("99999999999TiB").is_err());
    }
}
