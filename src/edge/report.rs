//! Daily archive report
//!
//! Folds one local day of archived journey lines into a Markdown report
//! (overview counters plus hourly session listings) or, for NDJSON archives,
//! a plain JSON-lines file.

use chrono::{NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::beat::token::{VALUE, VALUE_SEPARATOR};
use crate::error::ScoreError;

const HOUR_MS: i64 = 3_600_000;

/// One archived log line with the time it was written
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Unix milliseconds
    pub timestamp: i64,
    pub message: String,
}

impl LogEntry {
    pub fn new(timestamp: i64, message: &str) -> Self {
        Self {
            timestamp,
            message: message.to_string(),
        }
    }
}

/// UTC milliseconds at which local `date` (`YYYY-MM-DD`) starts
pub fn day_start_ms(date: &str, gmt_offset_hours: i32) -> Result<i64, ScoreError> {
    let day = NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map_err(|e| ScoreError::DateParseError(format!("'{date}': {e}")))?;
    let midnight = day
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| ScoreError::DateParseError(format!("'{date}' has no midnight")))?;
    Ok(Utc.from_utc_datetime(&midnight).timestamp_millis() - i64::from(gmt_offset_hours) * HOUR_MS)
}

/// Overview fields of one archived BEAT line
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordFields {
    pub device: String,
    pub referrer: String,
    pub scroll: f64,
    pub click: f64,
    pub duration: f64,
}

/// Read the `_key:value` fields up to `duration` in a single forward pass
pub fn extract_fields(record: &str) -> RecordFields {
    let mut fields = RecordFields::default();
    let mut key = "";
    let (mut key_start, mut value_start) = (0, 0);
    for (i, c) in record.char_indices() {
        if c == VALUE {
            let value = record.get(value_start..i).unwrap_or("");
            key_start = i + 1;
            let number = || value.parse::<f64>().unwrap_or(0.0);
            match key {
                "device" => fields.device = value.to_string(),
                "referrer" => fields.referrer = value.to_string(),
                "scroll" => fields.scroll = number(),
                "click" => fields.click = number(),
                "duration" => {
                    fields.duration = number();
                    break;
                }
                _ => {}
            }
        } else if c == VALUE_SEPARATOR {
            key = record.get(key_start..i).unwrap_or("");
            value_start = i + 1;
        }
    }
    fields
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Session {
    record: String,
    analysis: String,
}

/// Counters and hourly listings of one day
#[derive(Debug, Clone, PartialEq)]
pub struct DailyReport {
    pub date: String,
    pub total: u32,
    pub hours: [u32; 24],
    /// desktop, mobile, tablet
    pub devices: [u32; 3],
    /// direct, internal, unknown, specific
    pub referrers: [u32; 4],
    scrolls: f64,
    clicks: f64,
    duration: f64,
    sessions: Vec<Vec<Session>>,
}

fn round_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

impl DailyReport {
    pub fn new(date: &str) -> Self {
        Self {
            date: date.to_string(),
            total: 0,
            hours: [0; 24],
            devices: [0; 3],
            referrers: [0; 4],
            scrolls: 0.0,
            clicks: 0.0,
            duration: 0.0,
            sessions: vec![Vec::new(); 24],
        }
    }

    /// Build from the day's log entries; `start_ms` is the UTC start of the day
    pub fn build(date: &str, start_ms: i64, entries: &[LogEntry]) -> Self {
        let mut report = Self::new(date);
        for entry in entries {
            report.add(start_ms, entry);
        }
        report
    }

    /// Add one entry. Lines that are not BEAT records or fall outside the day
    /// are ignored.
    pub fn add(&mut self, start_ms: i64, entry: &LogEntry) -> bool {
        if !entry.message.starts_with(VALUE) {
            return false;
        }
        let hour = (entry.timestamp - start_ms).div_euclid(HOUR_MS);
        if !(0..24).contains(&hour) {
            debug!(timestamp = entry.timestamp, "log entry outside report day");
            return false;
        }
        let (record, analysis) = match entry.message.split_once('\n') {
            Some((record, rest)) => (record, collapse_blank_lines(rest.trim())),
            None => (entry.message.as_str(), String::new()),
        };

        let fields = extract_fields(record);
        let hour = hour as usize;
        self.total += 1;
        self.hours[hour] += 1;
        match fields.device.as_str() {
            "desktop" => self.devices[0] += 1,
            "mobile" => self.devices[1] += 1,
            "tablet" => self.devices[2] += 1,
            _ => {}
        }
        match fields.referrer.as_str() {
            "direct" => self.referrers[0] += 1,
            "internal" => self.referrers[1] += 1,
            "unknown" => self.referrers[2] += 1,
            "specific" => self.referrers[3] += 1,
            _ => {}
        }
        self.scrolls += fields.scroll;
        self.clicks += fields.click;
        self.duration += fields.duration;
        self.sessions[hour].push(Session {
            record: record.to_string(),
            analysis,
        });
        true
    }

    /// Average scroll, click and duration per session, one decimal
    pub fn averages(&self) -> (f64, f64, f64) {
        if self.total == 0 {
            return (0.0, 0.0, 0.0);
        }
        let n = f64::from(self.total);
        (
            round_tenth(self.scrolls / n),
            round_tenth(self.clicks / n),
            round_tenth(self.duration / n),
        )
    }

    pub fn to_markdown(&self) -> String {
        let (scroll, click, duration) = self.averages();
        let hours = self
            .hours
            .iter()
            .enumerate()
            .map(|(h, count)| format!("{h:02}:00 = {count}"))
            .collect::<Vec<_>>()
            .join(" | ");

        let mut out = String::new();
        out.push_str(&format!("---\n# {}\n", self.date));
        out.push_str("## Overview\n");
        out.push_str(&format!("[COUNT] total = {} | {hours}  \n", self.total));
        out.push_str(&format!(
            "[DEVICE] desktop = {} | mobile = {} | tablet = {}  \n",
            self.devices[0], self.devices[1], self.devices[2]
        ));
        out.push_str(&format!(
            "[REFERRER] direct = {} | internal = {} | unknown = {} | specific = {}  \n",
            self.referrers[0], self.referrers[1], self.referrers[2], self.referrers[3]
        ));
        out.push_str(&format!(
            "[AVERAGE] scroll = {scroll} | click = {click} | duration = {duration}\n\n"
        ));
        out.push_str("## Sessions\n");
        for (h, sessions) in self.sessions.iter().enumerate() {
            out.push_str(&format!("### {h:02}:00\n\n"));
            for session in sessions {
                out.push_str(&format!("[DATA] `{}`  \n", session.record));
                if !session.analysis.is_empty() {
                    out.push_str(&session.analysis);
                    out.push_str("\n\n");
                }
            }
        }
        out
    }
}

fn collapse_blank_lines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut newlines = 0;
    for c in text.chars() {
        if c == '\n' {
            newlines += 1;
            continue;
        }
        if newlines > 0 {
            out.push('\n');
            newlines = 0;
        }
        out.push(c);
    }
    out
}

/// First line of every JSON entry, joined; returns the content and line count
pub fn ndjson_report(entries: &[LogEntry]) -> (String, usize) {
    let lines: Vec<&str> = entries
        .iter()
        .filter(|e| e.message.starts_with('{'))
        .map(|e| e.message.split('\n').next().unwrap_or(""))
        .collect();
    (lines.join("\n"), lines.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const DAY: &str = "2025-01-01";

    fn start() -> i64 {
        day_start_ms(DAY, 0).unwrap()
    }

    #[test]
    fn test_day_start() {
        assert_eq!(day_start_ms(DAY, 0).unwrap(), 1_735_689_600_000);
        assert_eq!(day_start_ms(DAY, 9).unwrap(), 1_735_689_600_000 - 9 * HOUR_MS);
        assert!(matches!(
            day_start_ms("2025-13-01", 0),
            Err(ScoreError::DateParseError(_))
        ));
    }

    #[test]
    fn test_extract_fields() {
        let fields = extract_fields(
            "_time:17356800000_device:mobile_referrer:specific_scroll:4_click:3_duration:12.5_beat:!home~1.0*buy_size:xl",
        );
        assert_eq!(
            fields,
            RecordFields {
                device: "mobile".to_string(),
                referrer: "specific".to_string(),
                scroll: 4.0,
                click: 3.0,
                duration: 12.5,
            }
        );
    }

    #[test]
    fn test_markdown_report() {
        let entries = vec![
            LogEntry::new(
                start() + 30 * 60_000,
                "_device:desktop_referrer:direct_scroll:2_click:3_duration:12_beat:!home~1.0*buy",
            ),
            LogEntry::new(
                start() + 13 * HOUR_MS + 5,
                "_device:mobile_referrer:specific_scroll:1_click:2_duration:7.5_beat:!p1~7.5*add\n\nExplorer. Browsed then left.\n\n\nCame back later.\n",
            ),
            LogEntry::new(start() + HOUR_MS, "bot: Burst:12 (level 1)"),
            LogEntry::new(start() - 1, "_device:desktop_referrer:direct_scroll:0_click:1_duration:1_beat:!x"),
        ];
        let report = DailyReport::build(DAY, start(), &entries);
        assert_eq!(report.total, 2);
        assert_eq!(report.averages(), (1.5, 2.5, 9.8));

        let markdown = report.to_markdown();
        let mut expected = String::from("---\n# 2025-01-01\n## Overview\n[COUNT] total = 2 | ");
        let hours: Vec<String> = (0..24)
            .map(|h| format!("{h:02}:00 = {}", u32::from(h == 0 || h == 13)))
            .collect();
        expected.push_str(&hours.join(" | "));
        expected.push_str("  \n[DEVICE] desktop = 1 | mobile = 1 | tablet = 0  \n");
        expected.push_str("[REFERRER] direct = 1 | internal = 0 | unknown = 0 | specific = 1  \n");
        expected.push_str("[AVERAGE] scroll = 1.5 | click = 2.5 | duration = 9.8\n\n## Sessions\n");
        for h in 0..24 {
            expected.push_str(&format!("### {h:02}:00\n\n"));
            if h == 0 {
                expected.push_str("[DATA] `_device:desktop_referrer:direct_scroll:2_click:3_duration:12_beat:!home~1.0*buy`  \n");
            }
            if h == 13 {
                expected.push_str("[DATA] `_device:mobile_referrer:specific_scroll:1_click:2_duration:7.5_beat:!p1~7.5*add`  \n");
                expected.push_str("Explorer. Browsed then left.\nCame back later.\n\n");
            }
        }
        assert_eq!(markdown, expected);
    }

    #[test]
    fn test_empty_report_keeps_zero_overview() {
        let markdown = DailyReport::new(DAY).to_markdown();
        assert!(markdown.contains("[COUNT] total = 0 | 00:00 = 0"));
        assert!(markdown.contains("[AVERAGE] scroll = 0 | click = 0 | duration = 0\n\n"));
        assert!(markdown.ends_with("### 23:00\n\n"));
    }

    #[test]
    fn test_ndjson_report() {
        let entries = vec![
            LogEntry::new(1, "{\"device\":0,\"beat\":\"!home\"}\ntrailing"),
            LogEntry::new(2, "_device:desktop"),
            LogEntry::new(3, "{\"device\":1,\"beat\":\"!p1\"}"),
        ];
        let (content, total) = ndjson_report(&entries);
        assert_eq!(total, 2);
        assert_eq!(content, "{\"device\":0,\"beat\":\"!home\"}\n{\"device\":1,\"beat\":\"!p1\"}");
    }
}
