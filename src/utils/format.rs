//! Human-friendly formatting for log lines.

/// Formats milliseconds as `x.x <unit>` (e.g. `6.4 mins`, `2.0 secs`).
///
/// Negative or zero values render as `0 secs`.
pub fn friendly_ms(ms: f64) -> String {
    const SEC: f64 = 1000.0;
    const MIN: f64 = 60.0 * SEC;
    const HOUR: f64 = 60.0 * MIN;
    const DAY: f64 = 24.0 * HOUR;

    if ms.is_nan() {
        "? sec".to_string()
    } else if ms <= 0.0 {
        "0 secs".to_string()
    } else if ms > DAY {
        format!("{:.1} days", ms / DAY)
    } else if ms > HOUR {
        format!("{:.1} hrs", ms / HOUR)
    } else if ms > MIN {
        format!("{:.1} mins", ms / MIN)
    } else if ms > SEC {
        format!("{:.1} secs", ms / SEC)
    } else {
        format!("{:.0} ms", ms)
    }
}

/// Formats a byte count with binary units (e.g. `6.40 GiB`).
pub fn friendly_bytes(bytes: f64) -> String {
    const KIB: f64 = 1024.0;
    const MIB: f64 = KIB * 1024.0;
    const GIB: f64 = MIB * 1024.0;
    const TIB: f64 = GIB * 1024.0;

    if bytes.is_nan() {
        "? Bytes".to_string()
    } else if bytes <= 0.0 {
        "0 Bytes".to_string()
    } else if bytes >= TIB {
        format!("{:.2} TiB", bytes / TIB)
    } else if bytes >= GIB {
        format!("{:.2} GiB", bytes / GIB)
    } else if bytes >= MIB {
        format!("{:.2} MiB", bytes / MIB)
    } else if bytes >= KIB {
        format!("{:.2} KiB", bytes / KIB)
    } else {
        format!("{:.2} Bytes", bytes)
    }
}

/// Formats a large count with a decimal suffix (e.g. `1.23M`).
pub fn friendly_number(num: f64) -> String {
    const K: f64 = 1000.0;
    const M: f64 = K * 1000.0;
    const B: f64 = M * 1000.0;
    const T: f64 = B * 1000.0;

    if num.is_nan() {
        "?".to_string()
    } else if num <= 0.0 {
        "0".to_string()
    } else if num > T {
        format!("{:.2}T", num / T)
    } else if num > B {
        format!("{:.2}B", num / B)
    } else if num > M {
        format!("{:.2}M", num / M)
    } else if num > K {
        format!("{:.2}K", num / K)
    } else {
        format!("{:.0}", num)
    }
}
