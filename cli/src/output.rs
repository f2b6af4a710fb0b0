//! Table and value formatting helpers for CLI output.

use comfy_table::{ContentArrangement, Table};

/// Create a borderless table with the given headers.
pub fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.load_preset(comfy_table::presets::NOTHING);
    table.set_header(headers);
    table
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];

    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

/// Format a timestamp relative to now ("3 days ago").
pub fn format_ago(dt: &chrono::DateTime<chrono::Utc>) -> String {
    let elapsed = chrono::Utc::now().signed_duration_since(*dt);
    if elapsed.num_seconds() < 0 {
        return "just now".to_string();
    }

    let days = elapsed.num_days();
    let (count, unit) = if elapsed.num_seconds() < 60 {
        (elapsed.num_seconds(), "second")
    } else if elapsed.num_minutes() < 60 {
        (elapsed.num_minutes(), "minute")
    } else if elapsed.num_hours() < 24 {
        (elapsed.num_hours(), "hour")
    } else if days < 30 {
        (days, "day")
    } else if days < 365 {
        (days / 30, "month")
    } else {
        (days / 365, "year")
    };

    if count == 1 {
        format!("1 {unit} ago")
    } else {
        format!("{count} {unit}s ago")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes_small() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
    }

    #[test]
    fn test_format_bytes_units() {
        assert_eq!(format_bytes(1024), "1.0 KB");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(1048576 + 524288), "1.5 MB");
        assert_eq!(format_bytes(10 * 1073741824), "10.0 GB");
        assert_eq!(format_bytes(2 * 1024 * 1073741824), "2.0 TB");
    }

    #[test]
    fn test_new_table_with_rows() {
        let mut table = new_table(&["REPOSITORY", "TAG"]);
        table.add_row(["foobar-save-load-test", "latest"]);
        let output = table.to_string();
        assert!(output.contains("REPOSITORY"));
        assert!(output.contains("foobar-save-load-test"));
        assert!(output.contains("latest"));
    }

    #[test]
    fn test_format_ago() {
        let now = chrono::Utc::now();
        assert_eq!(format_ago(&(now - chrono::Duration::seconds(30))), "30 seconds ago");
        assert_eq!(format_ago(&(now - chrono::Duration::minutes(1))), "1 minute ago");
        assert_eq!(format_ago(&(now - chrono::Duration::hours(5))), "5 hours ago");
        assert_eq!(format_ago(&(now - chrono::Duration::days(3))), "3 days ago");
        assert_eq!(format_ago(&(now - chrono::Duration::days(60))), "2 months ago");
        assert_eq!(format_ago(&(now - chrono::Duration::days(730))), "2 years ago");
    }

    #[test]
    fn test_format_ago_future() {
        let future = chrono::Utc::now() + chrono::Duration::hours(1);
        assert_eq!(format_ago(&future), "just now");
    }
}
