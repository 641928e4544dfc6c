//! Archive reassembly
//!
//! A flushed batch carries one record per tab slot. The tabs of a browsing
//! context hand the stream to each other through `@---N` markers, so the
//! journey is rebuilt by walking the fragments from the lowest slot and
//! jumping at every marker.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::beat::token::{ACTION, FLOW, POSITION, SPACE, TAB_SWITCH, TIME, VALUE};
use crate::beat::split_tab_switches;
use crate::config::{ArchivingConfig, EdgeConfig};
use crate::error::ScoreError;
use crate::record::{parse_slot_name, DeviceClass, ReferrerClass, SessionRecord};

/// One reassembled journey, ready to archive.
///
/// Field order matches the NDJSON archive line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedJourney {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// Device code of the leading fragment
    pub device: u8,
    /// Referrer code of the leading fragment
    pub referrer: u8,
    pub scrolls: u64,
    pub clicks: u64,
    /// Longest fragment duration in seconds, one decimal
    pub duration: f64,
    pub beat: String,
}

impl ArchivedJourney {
    pub fn device_label(&self) -> &'static str {
        DeviceClass::from_code(self.device)
            .unwrap_or(DeviceClass::Desktop)
            .as_str()
    }

    pub fn referrer_label(&self) -> &'static str {
        ReferrerClass(self.referrer).as_str()
    }

    /// `_key:value` archive line
    pub fn to_beat_line(&self) -> String {
        let mut line = String::new();
        if let Some(time) = &self.time {
            line.push_str(&format!("_time:{time}"));
        }
        if let Some(hash) = &self.hash {
            line.push_str(&format!("_hash:{hash}"));
        }
        line.push_str(&format!(
            "_device:{}_referrer:{}_scroll:{}_click:{}_duration:{}_beat:{}",
            self.device_label(),
            self.referrer_label(),
            self.scrolls,
            self.clicks,
            self.duration,
            self.beat
        ));
        line
    }

    pub fn to_ndjson(&self) -> Result<String, ScoreError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Archive line in the configured format
    pub fn render(&self, archiving: &ArchivingConfig) -> Result<String, ScoreError> {
        if archiving.ndjson {
            self.to_ndjson()
        } else {
            Ok(self.to_beat_line())
        }
    }
}

/// Split a batch body (`rhythm_1=...rhythm_2=...`) into records by slot.
///
/// Records that fail to parse are dropped; a repeated slot keeps the last one.
pub fn parse_batch(body: &str) -> BTreeMap<u32, SessionRecord> {
    let mut starts = Vec::new();
    let mut search = 0;
    while let Some(found) = body[search..].find("rhythm_") {
        let at = search + found;
        let digits = body[at + 7..]
            .bytes()
            .take_while(|b| b.is_ascii_digit())
            .count();
        if digits > 0 && body[at + 7 + digits..].starts_with('=') {
            starts.push(at);
        }
        search = at + 7;
    }

    let mut records = BTreeMap::new();
    for (i, start) in starts.iter().enumerate() {
        let end = starts.get(i + 1).copied().unwrap_or(body.len());
        let Some((name, value)) = body[*start..end].split_once('=') else {
            continue;
        };
        let Some(slot) = parse_slot_name(name) else {
            continue;
        };
        match value.parse::<SessionRecord>() {
            Ok(record) => {
                records.insert(slot, record);
            }
            Err(err) => debug!(slot, error = %err, "dropping malformed batch record"),
        }
    }
    records
}

/// Walk the fragments from the lowest slot, following tab-switch markers.
///
/// Stops when the current fragment is exhausted or a marker points at a
/// missing slot, so a partial journey is still returned.
pub fn stitch(streams: &BTreeMap<u32, &str>) -> String {
    let fragments: BTreeMap<u32, Vec<&str>> = streams
        .iter()
        .map(|(slot, stream)| (*slot, split_tab_switches(stream)))
        .collect();
    let Some(mut current) = fragments.keys().next().copied() else {
        return String::new();
    };

    let mut cursor: BTreeMap<u32, usize> = BTreeMap::new();
    let mut flow = String::new();
    while let Some(pieces) = fragments.get(&current) {
        let index = cursor.entry(current).or_insert(0);
        let Some(piece) = pieces.get(*index) else {
            break;
        };
        *index += 1;
        flow.push_str(piece);
        if let Some(next) = piece.strip_prefix(TAB_SWITCH) {
            match next.parse() {
                Ok(slot) => current = slot,
                Err(_) => break,
            }
        }
    }
    flow
}

/// Rewrite Time and Flow tick counts as seconds with one decimal
pub fn ticks_to_seconds(beat: &str, resolution_ms: u64) -> String {
    let bytes = beat.as_bytes();
    let mut out = String::with_capacity(beat.len() + beat.len() / 4);
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c == TIME || c == FLOW {
            let digits = bytes[i + 1..]
                .iter()
                .take_while(|b| b.is_ascii_digit())
                .count();
            let end = i + 1 + digits;
            let bounded = bytes.get(end).map_or(true, |b| {
                matches!(*b as char, SPACE | POSITION | ACTION | FLOW | VALUE | '@')
            });
            if digits > 0 && bounded {
                if let Ok(ticks) = beat[i + 1..end].parse::<u64>() {
                    out.push(c);
                    out.push_str(&format!("{:.1}", ticks as f64 * resolution_ms as f64 / 1000.0));
                    i = end;
                    continue;
                }
            }
        }
        let len = beat[i..].chars().next().map_or(1, char::len_utf8);
        out.push_str(&beat[i..i + len]);
        i += len;
    }
    out
}

/// Readability blanks before spaces, times, actions and tab switches
pub fn add_blanks(beat: &str) -> String {
    let mut out = String::with_capacity(beat.len() * 2);
    let mut rest = beat;
    while let Some(c) = rest.chars().next() {
        if c == SPACE || c == TIME || c == ACTION {
            out.push(' ');
        } else if rest.starts_with(TAB_SWITCH)
            && rest[TAB_SWITCH.len()..]
                .bytes()
                .next()
                .is_some_and(|b| b.is_ascii_digit())
        {
            out.push(' ');
        }
        out.push(c);
        rest = &rest[c.len_utf8()..];
    }
    out.trim_start().to_string()
}

fn round_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Rebuild the journey carried by a flushed batch body.
///
/// Returns `None` for an empty batch or a journey the archiving filters skip.
pub fn reassemble(body: &str, config: &EdgeConfig) -> Option<ArchivedJourney> {
    let records = parse_batch(body);
    let (_, leader) = records.iter().next()?;
    let archiving = &config.archiving;

    let scrolls = records.values().map(|r| u64::from(r.scrolls)).sum();
    let clicks: u64 = records.values().map(|r| u64::from(r.clicks)).sum();
    let longest = records.values().map(|r| r.duration).max().unwrap_or(0).max(0);
    let duration = round_tenth(longest as f64 * config.resolution_ms as f64 / 1000.0);

    if duration > archiving.max_seconds || clicks < u64::from(archiving.min_clicks) {
        debug!(duration, clicks, "journey skipped by archiving filters");
        return None;
    }

    let streams: BTreeMap<u32, &str> = records
        .iter()
        .map(|(slot, record)| (*slot, record.stream.as_str()))
        .collect();
    let mut beat = ticks_to_seconds(&stitch(&streams), config.resolution_ms);
    if archiving.blank {
        beat = add_blanks(&beat);
    }

    Some(ArchivedJourney {
        time: archiving.time.then(|| leader.time_bucket.to_string()),
        hash: (archiving.hash && !leader.key.is_empty()).then(|| leader.key.clone()),
        device: leader.device.code(),
        referrer: leader.referrer.0,
        scrolls,
        clicks,
        duration,
        beat,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const TAB_ONE: &str = "rhythm_1=1_17356800000_k3y9a0b1_1_3_2_1_120_!home~10*buy@---2~110*buy";
    const TAB_TWO: &str = "rhythm_2=1_17356800000_k3y9a0b1_0_0_1_1_70_!724~40*5a2@---1";

    #[test]
    fn test_parse_batch_splits_on_slot_names() {
        let body = format!("{TAB_TWO}{TAB_ONE}");
        let records = parse_batch(&body);

        assert_eq!(records.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(records[&1].stream, "!home~10*buy@---2~110*buy");
        assert_eq!(records[&2].stream, "!724~40*5a2@---1");
    }

    #[test]
    fn test_parse_batch_drops_malformed() {
        let body = format!("rhythm_3=garbage{TAB_ONE}rhythm_=1_2");
        let records = parse_batch(&body);
        assert_eq!(records.len(), 1);
        assert!(records.contains_key(&1));
    }

    #[test]
    fn test_stitch_follows_markers() {
        let streams = BTreeMap::from([
            (1, "!home~10*buy@---2~110*buy"),
            (2, "!724~40*5a2@---1"),
        ]);
        assert_eq!(stitch(&streams), "!home~10*buy@---2!724~40*5a2@---1~110*buy");
    }

    #[test]
    fn test_stitch_keeps_partial_journey() {
        let streams = BTreeMap::from([(2, "!home~10*buy@---5~3*more")]);
        assert_eq!(stitch(&streams), "!home~10*buy@---5");

        let streams = BTreeMap::from([(1, "!home~4*a@---2~3*b"), (2, "!x~5*c")]);
        assert_eq!(stitch(&streams), "!home~4*a@---2!x~5*c");
    }

    #[test]
    fn test_ticks_to_seconds() {
        assert_eq!(ticks_to_seconds("!home~23*nav~375/123*help", 100), "!home~2.3*nav~37.5/12.3*help");
        assert_eq!(ticks_to_seconds("~7@---2~110", 100), "~0.7@---2~11.0");
        // Digits not followed by a token boundary stay as they are
        assert_eq!(ticks_to_seconds("*a~3b", 100), "*a~3b");
        assert_eq!(ticks_to_seconds("~16", 50), "~0.8");
    }

    #[test]
    fn test_add_blanks() {
        assert_eq!(
            add_blanks("!home~2.3*nav/1.0*buy@---2!p1~4.0"),
            "!home ~2.3 *nav/1.0 *buy @---2 !p1 ~4.0"
        );
    }

    #[test]
    fn test_reassemble_merges_fragments() {
        let body = format!("{TAB_ONE}{TAB_TWO}");
        let journey = reassemble(&body, &EdgeConfig::default()).unwrap();

        assert_eq!(
            journey,
            ArchivedJourney {
                time: None,
                hash: None,
                device: 1,
                referrer: 3,
                scrolls: 3,
                clicks: 2,
                duration: 12.0,
                beat: "!home~1.0*buy@---2!724~4.0*5a2@---1~11.0*buy".to_string(),
            }
        );
        assert_eq!(
            journey.to_beat_line(),
            "_device:mobile_referrer:specific_scroll:3_click:2_duration:12_beat:!home~1.0*buy@---2!724~4.0*5a2@---1~11.0*buy"
        );
    }

    #[test]
    fn test_reassemble_optional_fields_and_ndjson() {
        let mut config = EdgeConfig::default();
        config.archiving.time = true;
        config.archiving.hash = true;
        config.archiving.ndjson = true;
        let journey = reassemble(TAB_TWO, &config).unwrap();

        assert_eq!(journey.time.as_deref(), Some("17356800000"));
        assert_eq!(journey.hash.as_deref(), Some("k3y9a0b1"));
        assert_eq!(
            journey.render(&config.archiving).unwrap(),
            r#"{"time":"17356800000","hash":"k3y9a0b1","device":0,"referrer":0,"scrolls":1,"clicks":1,"duration":7.0,"beat":"!724~4.0*5a2@---1"}"#
        );
        assert_eq!(
            journey.to_beat_line(),
            "_time:17356800000_hash:k3y9a0b1_device:desktop_referrer:direct_scroll:1_click:1_duration:7_beat:!724~4.0*5a2@---1"
        );
    }

    #[test]
    fn test_reassemble_skip_filters() {
        let config = EdgeConfig::default();
        let idle = "rhythm_1=1_17356800000_k3y9a0b1_0_0_4_0_300_!home~300";
        assert_eq!(reassemble(idle, &config), None);

        let marathon = "rhythm_1=1_17356800000_k3y9a0b1_0_0_4_2_72001_!home~10*a~10*b";
        assert_eq!(reassemble(marathon, &config), None);

        assert_eq!(reassemble("", &config), None);
    }

    #[test]
    fn test_reassemble_with_blanks() {
        let mut config = EdgeConfig::default();
        config.archiving.blank = true;
        let body = format!("{TAB_ONE}{TAB_TWO}");
        let journey = reassemble(&body, &config).unwrap();
        assert_eq!(journey.beat, "!home ~1.0 *buy @---2 !724 ~4.0 *5a2 @---1 ~11.0 *buy");
    }
}
