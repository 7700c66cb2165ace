use chrono::Local;

/// The per-line timestamp prefix used in text edge logs and
/// component stderr logs, e.g. `[2026-08-01 14:03:22]`.
pub fn line_stamp() -> String {
    Local::now().format("[%Y-%m-%d %H:%M:%S]").to_string()
}

/// The name of a per-run log directory, e.g. `20260801-140322`.
pub fn run_stamp() -> String {
    Local::now().format("%Y%m%d-%H%M%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_stamp_shape() {
        let stamp = line_stamp();
        // [YYYY-MM-DD HH:MM:SS]
        assert_eq!(stamp.len(), 21);
        assert!(stamp.starts_with('['));
        assert!(stamp.ends_with(']'));
        assert_eq!(&stamp[11..12], " ");
    }

    #[test]
    fn run_stamp_shape() {
        let stamp = run_stamp();
        assert_eq!(stamp.len(), 15);
        assert_eq!(&stamp[8..9], "-");
    }
}
