//! BEAT token grammar and the forward scanner
//!
//! ```text
//! stream   := token*
//! space    := '!' identifier
//! time     := '~' digits
//! position := '^' digits
//! action   := '*' identifier
//! flow     := '/' digits
//! value    := '_' key ':' value
//! tabmark  := '@---' digits
//! ```
//!
//! Scanning is a single left-to-right pass. A token ends where the next tag
//! begins, so scan time is linear in the input regardless of its content.

use serde::{Deserialize, Serialize};

/// Contextual space (who)
pub const SPACE: char = '!';
/// Time (when)
pub const TIME: char = '~';
/// Position (where)
pub const POSITION: char = '^';
/// Action (what)
pub const ACTION: char = '*';
/// Flow (how)
pub const FLOW: char = '/';
/// Causal value key (why)
pub const VALUE: char = '_';
/// Separates a value key from its value
pub const VALUE_SEPARATOR: char = ':';
/// Cross-tab jump marker
pub const TAB_SWITCH: &str = "@---";

/// Token kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tag {
    Space,
    Time,
    Position,
    Action,
    Flow,
    Value,
    TabSwitch,
}

impl Tag {
    /// Literal prefix of this tag in a stream
    pub fn prefix(&self) -> &'static str {
        match self {
            Tag::Space => "!",
            Tag::Time => "~",
            Tag::Position => "^",
            Tag::Action => "*",
            Tag::Flow => "/",
            Tag::Value => "_",
            Tag::TabSwitch => TAB_SWITCH,
        }
    }

    /// Tags whose body is a tick count
    pub fn is_interval(&self) -> bool {
        matches!(self, Tag::Time | Tag::Flow)
    }
}

/// One token as it appears in the stream, body without its tag prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawToken<'a> {
    pub tag: Tag,
    pub body: &'a str,
}

impl<'a> RawToken<'a> {
    /// Body as an unsigned number, `None` unless it is all ASCII digits
    pub fn number(&self) -> Option<u64> {
        if self.body.is_empty() || !self.body.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        self.body.parse().ok()
    }

    /// Key and value of a value token
    pub fn pair(&self) -> Option<(&'a str, &'a str)> {
        if self.tag != Tag::Value {
            return None;
        }
        self.body.split_once(VALUE_SEPARATOR)
    }
}

/// Tag starting at byte `i`, with the length of its prefix
fn tag_at(bytes: &[u8], i: usize) -> Option<(Tag, usize)> {
    let tag = match bytes[i] {
        b'!' => Tag::Space,
        b'~' => Tag::Time,
        b'^' => Tag::Position,
        b'*' => Tag::Action,
        b'/' => Tag::Flow,
        b'_' => Tag::Value,
        b'@' if bytes[i + 1..].starts_with(b"---") => return Some((Tag::TabSwitch, 4)),
        _ => return None,
    };
    Some((tag, 1))
}

/// Lazy forward scanner over a stream
#[derive(Debug, Clone)]
pub struct Scanner<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Iterator for Scanner<'a> {
    type Item = RawToken<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let bytes = self.src.as_bytes();
        // Text before the first tag carries no meaning
        while self.pos < bytes.len() && tag_at(bytes, self.pos).is_none() {
            self.pos += 1;
        }
        if self.pos >= bytes.len() {
            return None;
        }

        let (tag, prefix) = tag_at(bytes, self.pos)?;
        let start = self.pos + prefix;
        let mut end = start;
        while end < bytes.len() && tag_at(bytes, end).is_none() {
            end += 1;
        }
        self.pos = end;

        // Tags are ASCII, so both bounds sit on char boundaries
        Some(RawToken {
            tag,
            body: &self.src[start..end],
        })
    }
}

/// Scan a stream into raw tokens
pub fn scan(stream: &str) -> Scanner<'_> {
    Scanner {
        src: stream,
        pos: 0,
    }
}

/// Slot of a tab-switch marker that terminates the stream, if any
pub fn trailing_tab_switch(stream: &str) -> Option<u32> {
    let at = stream.rfind(TAB_SWITCH)?;
    let digits = &stream[at + TAB_SWITCH.len()..];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Split a stream around its tab-switch markers, keeping the markers as pieces
pub fn split_tab_switches(stream: &str) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut search = 0;
    while let Some(found) = stream[search..].find(TAB_SWITCH) {
        let at = search + found;
        let digits_start = at + TAB_SWITCH.len();
        let digits = stream[digits_start..]
            .bytes()
            .take_while(|b| b.is_ascii_digit())
            .count();
        if digits == 0 {
            search = digits_start;
            continue;
        }
        if at > start {
            pieces.push(&stream[start..at]);
        }
        let end = digits_start + digits;
        pieces.push(&stream[at..end]);
        start = end;
        search = end;
    }
    if start < stream.len() {
        pieces.push(&stream[start..]);
    }
    pieces
}
