//! Live ping scanning
//!
//! Every ping carries the whole cookie header. The scanner reads the Movement
//! record and classifies the tab streams until one of them produces a signal,
//! then answers with the updated Movement field when it changed.

use tracing::info;

use crate::beat::TimingProfile;
use crate::config::{EdgeConfig, StreamingConfig};
use crate::edge::classifier::{classify_bot, classify_human, Classification};
use crate::edge::router::EdgeResponse;
use crate::record::{parse_slot_name, MovementRecord, SessionRecord};
use crate::rhythm::MOVEMENT_COOKIE;

/// Result of scanning one cookie header
#[derive(Debug, Clone, PartialEq)]
pub struct PingScan {
    pub movement: MovementRecord,
    pub classification: Classification,
}

/// `name=value` pairs of a cookie header, in order
pub fn cookie_pairs(header: &str) -> impl Iterator<Item = (&str, &str)> {
    header
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
}

/// Classify the streams of a cookie header.
///
/// Fails closed: an oversized header or a missing or malformed Movement record
/// yields `None`.
pub fn scan(header: &str, config: &EdgeConfig) -> Option<PingScan> {
    if header.is_empty() || header.len() >= config.header_limit {
        return None;
    }
    let movement = cookie_pairs(header)
        .find(|(name, _)| *name == MOVEMENT_COOKIE)
        .and_then(|(_, value)| value.parse::<MovementRecord>().ok())?;

    let classifier = &config.classifier;
    let mut classification = Classification::default();
    for (name, value) in cookie_pairs(header) {
        if parse_slot_name(name).is_none() {
            continue;
        }
        let Ok(record) = value.parse::<SessionRecord>() else {
            continue;
        };
        if record.stream.is_empty() {
            continue;
        }
        let profile = TimingProfile::from_stream(&record.stream, config.resolution_ms);
        classification = Classification {
            bot: config
                .streaming
                .bot
                .then(|| classify_bot(&profile, classifier))
                .flatten(),
            human: config
                .streaming
                .human
                .then(|| classify_human(&profile, classifier))
                .flatten(),
        };
        if classification.is_signal() {
            break;
        }
    }

    Some(PingScan {
        movement,
        classification,
    })
}

/// Answer a live ping.
///
/// A bot raises the security level by one (capped); a human sets its
/// personalization bit if that bit is still armed. The Movement record is only
/// sent back when its field changed.
pub fn respond_to_ping(header: &str, config: &EdgeConfig) -> EdgeResponse {
    let Some(PingScan {
        mut movement,
        classification,
    }) = scan(header, config)
    else {
        return EdgeResponse::NoContent;
    };

    let mut changed = false;
    if let Some(bot) = &classification.bot {
        changed |= movement.field.raise_level();
        info!(
            signature = %bot,
            security_level = movement.field.security_level(),
            "bot: {bot} (level {})",
            movement.field.security_level()
        );
    }
    if let Some(bit) = classification.human {
        if movement.field.set_bit(bit) {
            changed = true;
            info!(bit, movement = %movement.field, "human: {} (case {bit})", movement.field);
        }
    }

    if changed {
        EdgeResponse::NoContentWithState {
            set_cookie: format!("{MOVEMENT_COOKIE}={movement}; Path=/; SameSite=Lax; Secure"),
        }
    } else {
        EdgeResponse::NoContent
    }
}

/// Cookie header with time buckets and keys blanked unless kept by config
pub fn redact_cookies(header: &str, streaming: &StreamingConfig) -> String {
    header
        .split("; ")
        .map(|pair| {
            let Some((name, value)) = pair.split_once('=') else {
                return pair.to_string();
            };
            if name != MOVEMENT_COOKIE && parse_slot_name(name).is_none() {
                return pair.to_string();
            }
            let mut parts = value.splitn(4, '_');
            let (Some(field), Some(time), Some(key), Some(rest)) =
                (parts.next(), parts.next(), parts.next(), parts.next())
            else {
                return pair.to_string();
            };
            if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
                return pair.to_string();
            }
            let time = if streaming.time { time } else { "" };
            let key = if streaming.hash { key } else { "" };
            format!("{name}={field}_{time}_{key}_{rest}")
        })
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HumanRule, RepeatRule};
    use pretty_assertions::assert_eq;

    const MOVEMENT: &str = "movement=0000000000_17356800000_k3y9a0b1___1";

    fn header(stream: &str) -> String {
        format!("{MOVEMENT}; rhythm_1=0_17356800000_k3y9a0b1_0_0_0_3_40_{stream}")
    }

    fn bursty() -> String {
        format!("!home{}*go", "~1".repeat(12))
    }

    fn demo_config() -> EdgeConfig {
        let mut config = EdgeConfig::default();
        config.classifier.human_rules.push(HumanRule {
            rule: RepeatRule {
                action: "demo".to_string(),
                min_ticks: 5,
                max_ticks: u64::MAX,
                min_count: 2,
            },
            bit: 1,
        });
        config
    }

    #[test]
    fn test_bot_raises_security_level() {
        let response = respond_to_ping(&header(&bursty()), &EdgeConfig::default());
        assert_eq!(
            response,
            EdgeResponse::NoContentWithState {
                set_cookie: "movement=1000000000_17356800000_k3y9a0b1___1; Path=/; SameSite=Lax; Secure"
                    .to_string()
            }
        );
        assert_eq!(response.status(), Some(204));
    }

    #[test]
    fn test_level_capped_at_two() {
        let capped = header(&bursty()).replace("movement=0", "movement=2");
        assert_eq!(respond_to_ping(&capped, &EdgeConfig::default()), EdgeResponse::NoContent);
    }

    #[test]
    fn test_human_sets_armed_bit_once() {
        let config = demo_config();
        let stream = "!home~40*demo~15/12/14*demo";
        assert_eq!(
            respond_to_ping(&header(stream), &config),
            EdgeResponse::NoContentWithState {
                set_cookie: "movement=0100000000_17356800000_k3y9a0b1___1; Path=/; SameSite=Lax; Secure"
                    .to_string()
            }
        );

        let already = header(stream).replace("movement=0000000000", "movement=0100000000");
        assert_eq!(respond_to_ping(&already, &config), EdgeResponse::NoContent);

        // A client-held digit is never overwritten
        let held = header(stream).replace("movement=0000000000", "movement=0200000000");
        assert_eq!(respond_to_ping(&held, &config), EdgeResponse::NoContent);
    }

    #[test]
    fn test_fails_closed() {
        let config = EdgeConfig::default();
        let stream = bursty();

        let no_movement = format!("rhythm_1=0_17356800000_k3y9a0b1_0_0_0_3_40_{stream}");
        assert_eq!(scan(&no_movement, &config), None);

        let broken = header(&stream).replace("movement=0000000000", "movement=abc");
        assert_eq!(scan(&broken, &config), None);

        let mut small = EdgeConfig::default();
        small.header_limit = header(&stream).len();
        assert_eq!(scan(&header(&stream), &small), None);
        assert_eq!(respond_to_ping(&header(&stream), &small), EdgeResponse::NoContent);
    }

    #[test]
    fn test_first_signalling_record_wins() {
        let config = EdgeConfig::default();
        let cookie = format!(
            "{MOVEMENT}; rhythm_1=0_17356800000_k3y9a0b1_0_0_0_1_40_!home~23*nav; rhythm_2=0_17356800000_k3y9a0b1_0_0_0_3_40_{}",
            bursty()
        );
        let result = scan(&cookie, &config).unwrap();
        assert_eq!(
            result.classification.bot.map(|b| b.to_string()),
            Some("Burst:12".to_string())
        );
    }

    #[test]
    fn test_huge_ticks_stay_silent() {
        let stream = "!home~90000000000000000~180000000000000000~1~2";
        assert_eq!(respond_to_ping(&header(stream), &EdgeConfig::default()), EdgeResponse::NoContent);
    }

    #[test]
    fn test_streaming_switches() {
        let mut config = EdgeConfig::default();
        config.streaming.bot = false;
        assert_eq!(respond_to_ping(&header(&bursty()), &config), EdgeResponse::NoContent);
    }

    #[test]
    fn test_redact_cookies() {
        let cookie = "movement=0000000000_17356800000_k3y9a0b1___1; rhythm_1=0_17356800000_k3y9a0b1_0_0_0_3_40_!home; theme=dark";
        assert_eq!(
            redact_cookies(cookie, &StreamingConfig::default()),
            "movement=0000000000_____1; rhythm_1=0___0_0_0_3_40_!home; theme=dark"
        );

        let keep = StreamingConfig {
            time: true,
            hash: true,
            ..StreamingConfig::default()
        };
        assert_eq!(redact_cookies(cookie, &keep), cookie);
    }
}
