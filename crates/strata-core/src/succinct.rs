//! Human-readable rendering of byte counts and durations.

const BYTE_UNITS: [(&str, f64); 5] = [
    ("B", 1024.0),
    ("KB", 1024.0),
    ("MB", 1024.0),
    ("GB", 1024.0),
    ("TB", f64::INFINITY),
];

const NANO_UNITS: [(&str, f64); 7] = [
    ("ns", 1000.0),
    ("us", 1000.0),
    ("ms", 1000.0),
    ("s", 60.0),
    ("m", 60.0),
    ("h", 24.0),
    ("d", f64::INFINITY),
];

fn succinct_print(value: i64, units: &[(&str, f64)]) -> String {
    let sign = if value < 0 { "-" } else { "" };
    let magnitude = value.unsigned_abs();
    let (first_unit, first_scale) = units[0];
    if (magnitude as f64) < first_scale {
        return format!("{sign}{magnitude}{first_unit}");
    }
    let mut scaled = magnitude as f64;
    let mut idx = 0;
    while idx + 1 < units.len() && scaled >= units[idx].1 {
        scaled /= units[idx].1;
        idx += 1;
    }
    format!("{sign}{scaled:.2}{}", units[idx].0)
}

/// `2048` -> `2.00KB`, `100` -> `100B`.
pub fn succinct_bytes(bytes: i64) -> String {
    succinct_print(bytes, &BYTE_UNITS)
}

/// `1030` -> `1.03us`, `100` -> `100ns`.
pub fn succinct_nanos(nanos: i64) -> String {
    succinct_print(nanos, &NANO_UNITS)
}

pub fn succinct_millis(millis: i64) -> String {
    succinct_nanos(millis.saturating_mul(1_000_000))
}
