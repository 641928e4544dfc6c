//! Incremental BEAT encoder
//!
//! Appends semantic tokens to a note list as interactions happen. Time is
//! delta-encoded in ticks, unmapped spaces are hashed to short codes and
//! consecutive repeats of one action are folded into a flow chain.

use std::collections::HashMap;
use std::rc::Rc;

use crate::beat::token::{ACTION, FLOW, POSITION, SPACE, TIME, VALUE, VALUE_SEPARATOR};
use crate::clock::Clock;
use crate::config::BeatConfig;

const CODE_ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Marker prepended to a space code until it no longer collides
const COLLISION_MARKER: char = '-';

/// The interacted element, as described by the host.
///
/// `depth` counts the steps from the element up to the document body,
/// `sibling_index` is 1-based among previous siblings with the same tag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionTarget {
    pub id: Option<String>,
    pub class_name: Option<String>,
    pub href: Option<String>,
    pub tag: String,
    pub depth: u32,
    pub sibling_index: u32,
}

impl ActionTarget {
    pub fn new(tag: &str, depth: u32, sibling_index: u32) -> Self {
        Self {
            tag: tag.to_string(),
            depth,
            sibling_index,
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn with_class(mut self, class_name: &str) -> Self {
        self.class_name = Some(class_name.to_string());
        self
    }

    pub fn with_href(mut self, href: &str) -> Self {
        self.href = Some(href.to_string());
        self
    }

    /// Structural key, e.g. `10div1`
    pub fn auto_key(&self) -> String {
        format!(
            "{}{}{}",
            self.depth,
            self.tag.to_ascii_lowercase(),
            self.sibling_index
        )
    }
}

/// Deterministic 3-5 character code for an unmapped space identifier.
///
/// djb2 over UTF-16 code units with 32-bit shift wrapping, so codes match
/// the browser producer exactly.
pub fn space_code(id: &str) -> String {
    let mut hash: i64 = 5381;
    let mut units = 0usize;
    for unit in id.encode_utf16() {
        hash = (hash as i32).wrapping_shl(5) as i64 + hash + unit as i64;
        units += 1;
    }

    let limit = match units {
        0..=7 => 3,
        8..=14 => 4,
        _ => 5,
    };

    let mut n = hash.unsigned_abs();
    let mut code = String::with_capacity(limit);
    for _ in 0..limit {
        code.push(CODE_ALPHABET[(n % 36) as usize] as char);
        n /= 36;
    }
    code
}

/// BEAT encoder for one page lifetime
pub struct Beat {
    notes: Vec<String>,
    /// Emitted space code → identifier that owns it
    table: HashMap<String, String>,
    spaces: HashMap<String, String>,
    actions: HashMap<String, String>,
    resolution_ms: i64,
    instant: i64,
    clock: Rc<dyn Clock>,
}

impl std::fmt::Debug for Beat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Beat")
            .field("notes", &self.notes)
            .field("resolution_ms", &self.resolution_ms)
            .field("instant", &self.instant)
            .finish()
    }
}

impl Beat {
    pub fn new(config: &BeatConfig, clock: Rc<dyn Clock>) -> Self {
        let instant = clock.now_millis();
        Self {
            notes: Vec::new(),
            table: HashMap::new(),
            spaces: config.spaces.clone(),
            actions: config.actions.clone(),
            resolution_ms: config.resolution_ms.max(1) as i64,
            instant,
            clock,
        }
    }

    /// Append a space (page) token
    pub fn space(&mut self, id: &str) {
        self.time();
        if let Some(mapped) = self.spaces.get(id).filter(|m| !m.is_empty()) {
            self.notes.push(format!("{SPACE}{mapped}"));
            return;
        }

        let code = space_code(id);
        let mut token = code.clone();
        let mut marker = String::new();
        while let Some(owner) = self.table.get(&token) {
            if owner == id {
                break;
            }
            marker.push(COLLISION_MARKER);
            token = format!("{marker}{code}");
        }
        self.table.insert(token.clone(), id.to_string());
        self.notes.push(format!("{SPACE}{token}"));
    }

    /// Append the ticks elapsed since the last time token, if any
    pub fn time(&mut self) {
        let now = self.clock.now_millis();
        let elapsed = (now - self.instant) / self.resolution_ms;
        if elapsed > 0 {
            self.notes.push(format!("{TIME}{elapsed}"));
            self.instant = now;
        }
    }

    /// Append a position (scroll offset) token
    pub fn position(&mut self, offset: u64) {
        self.time();
        self.notes.push(format!("{POSITION}{offset}"));
    }

    /// Append an action token for the interacted element
    pub fn action(&mut self, target: &ActionTarget) {
        self.time();

        let key = target
            .id
            .as_deref()
            .filter(|id| !id.is_empty())
            .map(|id| format!("#{id}"))
            .filter(|k| self.actions.contains_key(k))
            .or_else(|| {
                target.class_name.as_deref().and_then(|classes| {
                    classes
                        .split_whitespace()
                        .map(|c| format!(".{c}"))
                        .find(|k| self.actions.contains_key(k))
                })
            })
            .or_else(|| {
                target
                    .href
                    .as_deref()
                    .filter(|_| target.tag.eq_ignore_ascii_case("a"))
                    .filter(|href| self.actions.contains_key(*href))
                    .map(str::to_string)
            });

        let name = match key.and_then(|k| self.actions.get(&k)) {
            Some(mapped) => mapped.clone(),
            None => {
                let auto = target.auto_key();
                self.actions
                    .get(&format!("{ACTION}{auto}"))
                    .cloned()
                    .unwrap_or(auto)
            }
        };
        self.fold(format!("{ACTION}{name}"));
    }

    /// Append a causal value token
    pub fn value(&mut self, key: &str, value: &str) {
        self.notes.push(format!("{VALUE}{key}{VALUE_SEPARATOR}{value}"));
    }

    /// Append `token`, folding it into the previous entry when it repeats the
    /// action that entry ends with and only a time token sits between them.
    pub fn fold(&mut self, token: String) {
        let len = self.notes.len();
        if len > 1 && self.notes[len - 1].starts_with(TIME) && self.notes[len - 2].ends_with(&token)
        {
            if let Some(time) = self.notes.pop() {
                let prev = &mut self.notes[len - 2];
                prev.truncate(prev.len() - token.len());
                prev.push(FLOW);
                prev.push_str(&time[TIME.len_utf8()..]);
                prev.push_str(&token);
                return;
            }
        }
        self.notes.push(token);
    }

    /// The full stream in emission order
    pub fn serialize(&self) -> String {
        self.notes.concat()
    }

    /// Replace the note list with one stored stream
    pub fn replace(&mut self, stream: String) {
        self.notes.clear();
        if !stream.is_empty() {
            self.notes.push(stream);
        }
    }

    /// Continue from a stored stream, not counting time spent away
    pub fn restore(&mut self, stream: String) {
        self.replace(stream);
        self.reset_clock();
    }

    pub fn reset_clock(&mut self) {
        self.instant = self.clock.now_millis();
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    /// Serialized length in bytes
    pub fn len(&self) -> usize {
        self.notes.iter().map(String::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beat::decoder::{decode, Event};
    use crate::clock::ManualClock;
    use pretty_assertions::assert_eq;

    fn beat_with(config: BeatConfig) -> (Beat, ManualClock) {
        let clock = ManualClock::new(1_000_000);
        let beat = Beat::new(&config, Rc::new(clock.clone()));
        (beat, clock)
    }

    fn beat() -> (Beat, ManualClock) {
        beat_with(BeatConfig::default())
    }

    fn button() -> ActionTarget {
        ActionTarget::new("BUTTON", 4, 2)
    }

    #[test]
    fn test_empty_stream() {
        let (beat, _) = beat();
        assert_eq!(beat.serialize(), "");
        assert!(beat.is_empty());
    }

    #[test]
    fn test_space_code_lengths() {
        assert_eq!(space_code("/"), "w1t");
        assert_eq!(space_code("/about"), "724");
        assert_eq!(space_code("/product/001"), "tqpj");
        assert_eq!(space_code("/blog/posts/2024/hello-world"), "3bg83");
    }

    #[test]
    fn test_mapped_space() {
        let (mut beat, _) = beat();
        beat.space("/");
        assert_eq!(beat.serialize(), "!home");
    }

    #[test]
    fn test_space_hash_is_stable_within_encoder() {
        let (mut beat, clock) = beat();
        beat.space("/about");
        clock.advance(300);
        beat.space("/about");
        assert_eq!(beat.serialize(), "!724~3!724");
    }

    #[test]
    fn test_space_collision_gets_distinct_code() {
        let (mut beat, _) = beat();
        assert_eq!(space_code("/p19"), space_code("/p1450"));

        beat.space("/p19");
        beat.space("/p1450");
        beat.space("/p19");
        beat.space("/p1450");
        assert_eq!(beat.serialize(), "!e08!-e08!e08!-e08");
    }

    #[test]
    fn test_time_truncates_to_ticks() {
        let (mut beat, clock) = beat();
        clock.advance(99);
        beat.time();
        assert_eq!(beat.serialize(), "");

        // The 99ms carry over because the instant was not reset
        clock.advance(160);
        beat.time();
        assert_eq!(beat.serialize(), "~2");
    }

    #[test]
    fn test_action_resolution_order() {
        let mut config = BeatConfig::default();
        config.actions.insert("#close".to_string(), "close".to_string());
        config.actions.insert(".open-modal".to_string(), "m".to_string());
        config.actions.insert("/english/".to_string(), "en".to_string());
        config.actions.insert("*10div1".to_string(), "auto".to_string());
        let (mut beat, _) = beat_with(config);

        beat.action(&ActionTarget::new("button", 3, 1).with_id("close").with_class("open-modal"));
        beat.action(&ActionTarget::new("div", 5, 2).with_class("card open-modal"));
        beat.action(&ActionTarget::new("A", 6, 1).with_href("/english/"));
        beat.action(&ActionTarget::new("span", 6, 1).with_href("/english/"));
        beat.action(&ActionTarget::new("DIV", 10, 1));
        beat.action(&ActionTarget::new("li", 7, 3).with_id("unmapped"));

        assert_eq!(beat.serialize(), "*close*m*en*6span1*auto*7li3");
    }

    #[test]
    fn test_fold_repeated_action() {
        let (mut beat, clock) = beat();
        beat.space("/");
        clock.advance(1_200);
        beat.action(&button());
        clock.advance(300);
        beat.action(&button());
        clock.advance(300);
        beat.action(&button());

        assert_eq!(beat.serialize(), "!home~12/3/3*4button2");
    }

    #[test]
    fn test_encoded_journey_decodes_in_order() {
        let (mut beat, clock) = beat();
        beat.space("/");
        clock.advance(1_200);
        beat.action(&button());
        clock.advance(300);
        beat.action(&button());
        clock.advance(300);
        beat.action(&button());
        clock.advance(250);
        beat.position(1240);
        clock.advance(700);
        beat.space("/about");

        let stream = beat.serialize();
        assert_eq!(stream, "!home~12/3/3*4button2~2^1240~7!724");

        let click = |gap| Event::Action {
            id: "4button2".to_string(),
            gap,
        };
        assert_eq!(
            decode(&stream),
            vec![
                Event::Space {
                    id: "home".to_string(),
                    gap: 0
                },
                click(12),
                click(3),
                click(3),
                Event::Position {
                    offset: 1240,
                    gap: 2
                },
                Event::Space {
                    id: "724".to_string(),
                    gap: 7
                },
            ]
        );
    }

    #[test]
    fn test_no_fold_without_time_between() {
        let (mut beat, _) = beat();
        beat.action(&button());
        beat.action(&button());
        assert_eq!(beat.serialize(), "*4button2*4button2");
    }

    #[test]
    fn test_no_fold_for_different_action() {
        let (mut beat, clock) = beat();
        beat.action(&button());
        clock.advance(500);
        beat.action(&ActionTarget::new("a", 4, 2));
        assert_eq!(beat.serialize(), "*4button2~5*4a2");
    }

    #[test]
    fn test_fold_after_restore() {
        let (mut beat, clock) = beat();
        beat.restore("!home~4*buy".to_string());
        clock.advance(700);
        let mut config = BeatConfig::default();
        config.actions.insert("#buy".to_string(), "buy".to_string());
        beat.actions = config.actions;
        beat.action(&ActionTarget::new("button", 2, 1).with_id("buy"));

        assert_eq!(beat.serialize(), "!home~4/7*buy");
    }

    #[test]
    fn test_position_and_value() {
        let (mut beat, clock) = beat();
        beat.value("device", "mobile");
        clock.advance(250);
        beat.position(1240);
        assert_eq!(beat.serialize(), "_device:mobile~2^1240");
        assert_eq!(beat.len(), 21);
    }

    #[test]
    fn test_restore_resets_clock() {
        let (mut beat, clock) = beat();
        clock.advance(60_000);
        beat.restore("!home".to_string());
        clock.advance(200);
        beat.space("/about");
        assert_eq!(beat.serialize(), "!home~2!724");
    }
}
