/// Render a byte count with a binary-unit suffix.
pub fn humanize_bytes(bytes: u64) -> String {
    if bytes > 1 << 40 {
        format!("{:.2} TiB", bytes as f64 / (1u64 << 40) as f64)
    } else if bytes > 1 << 30 {
        format!("{:.2} GiB", bytes as f64 / (1u64 << 30) as f64)
    } else if bytes > 1 << 20 {
        format!("{:.2} MiB", bytes as f64 / (1u64 << 20) as f64)
    } else if bytes > 1 << 10 {
        format!("{:.2} KiB", bytes as f64 / (1u64 << 10) as f64)
    } else {
        format!("{bytes} B")
    }
}
