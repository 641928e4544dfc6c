//! BEAT decoding
//!
//! [`decode`] turns a stream back into discrete events, expanding fold chains
//! so that `~12/3/3*buy` yields three `buy` actions. [`TimingProfile`] is the
//! view the classifier works on.

use serde::{Deserialize, Serialize};

use crate::beat::token::{scan, RawToken, Tag};

/// One decoded interaction. `gap` is the number of ticks before it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    Space { id: String, gap: u64 },
    Action { id: String, gap: u64 },
    Position { offset: u64, gap: u64 },
    Value { key: String, value: String, gap: u64 },
    TabSwitch { slot: u32, gap: u64 },
}

impl Event {
    pub fn gap(&self) -> u64 {
        match self {
            Event::Space { gap, .. }
            | Event::Action { gap, .. }
            | Event::Position { gap, .. }
            | Event::Value { gap, .. }
            | Event::TabSwitch { gap, .. } => *gap,
        }
    }
}

/// Decode a stream into events. Malformed tokens are skipped.
pub fn decode(stream: &str) -> Vec<Event> {
    let mut events = Vec::new();
    // Ticks of the current time token and any flow entries after it
    let mut chain: Vec<u64> = Vec::new();

    for token in scan(stream) {
        match token.tag {
            Tag::Time => {
                let Some(ticks) = token.number() else { continue };
                match chain.last_mut() {
                    Some(last) => *last = last.saturating_add(ticks),
                    None => chain.push(ticks),
                }
            }
            Tag::Flow => {
                if let Some(ticks) = token.number() {
                    chain.push(ticks);
                }
            }
            Tag::Action => {
                if token.body.is_empty() {
                    continue;
                }
                if chain.is_empty() {
                    chain.push(0);
                }
                for gap in chain.drain(..) {
                    events.push(Event::Action {
                        id: token.body.to_string(),
                        gap,
                    });
                }
            }
            _ => {
                let gap = chain.iter().fold(0u64, |sum, ticks| sum.saturating_add(*ticks));
                let Some(event) = single_event(&token, gap) else {
                    continue;
                };
                chain.clear();
                events.push(event);
            }
        }
    }
    events
}

fn single_event(token: &RawToken<'_>, gap: u64) -> Option<Event> {
    match token.tag {
        Tag::Space if !token.body.is_empty() => Some(Event::Space {
            id: token.body.to_string(),
            gap,
        }),
        Tag::Position => Some(Event::Position {
            offset: token.number()?,
            gap,
        }),
        Tag::Value => {
            let (key, value) = token.pair()?;
            Some(Event::Value {
                key: key.to_string(),
                value: value.to_string(),
                gap,
            })
        }
        Tag::TabSwitch => Some(Event::TabSwitch {
            slot: u32::try_from(token.number()?).ok()?,
            gap,
        }),
        _ => None,
    }
}

/// Depth of an auto-derived action id such as `10div1`, `None` for mapped ids
pub fn auto_action_depth(id: &str) -> Option<u32> {
    let digits = id.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 || !id[digits..].starts_with(|c: char| c.is_ascii_alphabetic()) {
        return None;
    }
    id[..digits].parse().ok()
}

/// The last action of a stream with the intervals chained directly before it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tail {
    pub action: String,
    /// Ticks in stream order, the last one immediately precedes the action
    pub ticks: Vec<u64>,
}

/// Timing and structure extracted from one stream
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimingProfile {
    /// Every time and flow value, in milliseconds
    pub intervals_ms: Vec<u64>,
    /// Runs of directly adjacent space tokens
    pub space_runs: Vec<Vec<String>>,
    /// Action ids with fold chains expanded
    pub actions: Vec<String>,
    pub tail: Option<Tail>,
}

impl TimingProfile {
    pub fn from_stream(stream: &str, resolution_ms: u64) -> Self {
        let mut profile = Self::default();
        let mut run: Vec<String> = Vec::new();
        let mut ticks: Vec<u64> = Vec::new();
        // Set once the tail can no longer change
        let mut tail_closed = false;

        for token in scan(stream) {
            if token.tag == Tag::Space && !token.body.is_empty() {
                run.push(token.body.to_string());
            } else if !run.is_empty() {
                profile.space_runs.push(std::mem::take(&mut run));
            }

            match token.tag {
                Tag::Time | Tag::Flow => {
                    let Some(value) = token.number() else { continue };
                    profile.intervals_ms.push(value.saturating_mul(resolution_ms));
                    ticks.push(value);
                    if token.tag == Tag::Flow && profile.tail.is_some() {
                        tail_closed = true;
                    }
                }
                Tag::Action if !token.body.is_empty() => {
                    let count = ticks.len().max(1);
                    profile
                        .actions
                        .extend(std::iter::repeat(token.body.to_string()).take(count));
                    profile.tail = Some(Tail {
                        action: token.body.to_string(),
                        ticks: std::mem::take(&mut ticks),
                    });
                    tail_closed = false;
                }
                _ => {
                    ticks.clear();
                    if profile.tail.is_some() {
                        tail_closed = true;
                    }
                }
            }
        }
        if !run.is_empty() {
            profile.space_runs.push(run);
        }
        if tail_closed {
            profile.tail = None;
        }
        profile
    }

    pub fn is_empty(&self) -> bool {
        self.intervals_ms.is_empty() && self.actions.is_empty() && self.space_runs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn action(id: &str, gap: u64) -> Event {
        Event::Action {
            id: id.to_string(),
            gap,
        }
    }

    #[test]
    fn test_decode_empty() {
        assert!(decode("").is_empty());
        assert!(TimingProfile::from_stream("", 100).is_empty());
    }

    #[test]
    fn test_decode_expands_fold_chain() {
        let events = decode("!home~12/3/3*buy");
        assert_eq!(
            events,
            vec![
                Event::Space {
                    id: "home".to_string(),
                    gap: 0
                },
                action("buy", 12),
                action("buy", 3),
                action("buy", 3),
            ]
        );
    }

    #[test]
    fn test_decode_mixed_tokens() {
        let events = decode("!home~4^320~2_ref:mail*3a1@---2");
        assert_eq!(
            events,
            vec![
                Event::Space {
                    id: "home".to_string(),
                    gap: 0
                },
                Event::Position {
                    offset: 320,
                    gap: 4
                },
                Event::Value {
                    key: "ref".to_string(),
                    value: "mail".to_string(),
                    gap: 2
                },
                action("3a1", 0),
                Event::TabSwitch { slot: 2, gap: 0 },
            ]
        );
    }

    #[test]
    fn test_decode_skips_malformed() {
        let events = decode("~x!*~3^abc_novalue*ok");
        assert_eq!(events, vec![action("ok", 3)]);
    }

    #[test]
    fn test_decode_saturates_huge_gaps() {
        let events = decode("~18000000000000000000~18000000000000000000*a");
        assert_eq!(events, vec![action("a", u64::MAX)]);

        let events = decode("~18000000000000000000/18000000000000000000!x");
        assert_eq!(
            events,
            vec![Event::Space {
                id: "x".to_string(),
                gap: u64::MAX
            }]
        );
    }

    #[test]
    fn test_profile_intervals_in_ms() {
        let profile = TimingProfile::from_stream("!home~12/3/3*buy~7!724", 100);
        assert_eq!(profile.intervals_ms, vec![1200, 300, 300, 700]);
        assert_eq!(profile.actions, vec!["buy", "buy", "buy"]);
        assert_eq!(
            profile.space_runs,
            vec![vec!["home".to_string()], vec!["724".to_string()]]
        );
        // A space after the last action ends the tail
        assert_eq!(profile.tail, None);
    }

    #[test]
    fn test_profile_tail_survives_trailing_time() {
        let profile = TimingProfile::from_stream("!home~30*demo~2/1/3*demo~9", 100);
        assert_eq!(
            profile.tail,
            Some(Tail {
                action: "demo".to_string(),
                ticks: vec![2, 1, 3],
            })
        );
    }

    #[test]
    fn test_profile_adjacent_space_run() {
        let profile = TimingProfile::from_stream("!a!b!a!b~3!a", 100);
        assert_eq!(
            profile.space_runs,
            vec![
                vec!["a", "b", "a", "b"]
                    .into_iter()
                    .map(String::from)
                    .collect::<Vec<_>>(),
                vec!["a".to_string()],
            ]
        );
    }

    #[test]
    fn test_auto_action_depth() {
        assert_eq!(auto_action_depth("10div1"), Some(10));
        assert_eq!(auto_action_depth("2a3"), Some(2));
        assert_eq!(auto_action_depth("buy"), None);
        assert_eq!(auto_action_depth("42"), None);
    }
}
