//! Session and movement records
//!
//! Both records travel as underscore-joined cookie values. The structs here
//! are the typed form; the wire form lives only in their `Display` and
//! `FromStr` impls.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ReferrerMapping;
use crate::error::ScoreError;

const KEY_ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Length of the shared movement key
pub const KEY_LENGTH: usize = 8;

/// Highest security level written to the movement field
pub const MAX_SECURITY_LEVEL: u8 = 2;

/// Number of personalization bits in the movement field
pub const PERSONALIZATION_BITS: usize = 9;

/// Flush lifecycle of a session record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EchoState {
    /// Tab is live
    Active,
    /// Tab is hidden, torn down or rotated out
    Closing,
    /// Flushed, awaiting removal
    Sent,
}

impl EchoState {
    pub fn digit(&self) -> char {
        match self {
            EchoState::Active => '0',
            EchoState::Closing => '1',
            EchoState::Sent => '2',
        }
    }

    pub fn from_digit(c: char) -> Option<Self> {
        match c {
            '0' => Some(EchoState::Active),
            '1' => Some(EchoState::Closing),
            '2' => Some(EchoState::Sent),
            _ => None,
        }
    }
}

/// Device class derived from the user agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Desktop,
    Mobile,
    Tablet,
}

impl DeviceClass {
    pub fn from_user_agent(user_agent: &str) -> Self {
        let ua = user_agent.to_ascii_lowercase();
        let has = |needle: &str| ua.contains(needle);
        if has("ipad") || has("tablet") || has("silk") || (has("android") && !has("mobi")) {
            DeviceClass::Tablet
        } else if has("mobi") || has("iphone") {
            DeviceClass::Mobile
        } else {
            DeviceClass::Desktop
        }
    }

    /// Coarse "is this a handheld" check used for echo marking on hide
    pub fn is_handheld_agent(user_agent: &str) -> bool {
        let ua = user_agent.to_ascii_lowercase();
        ["mobi", "android", "tablet", "ipad", "iphone"]
            .iter()
            .any(|needle| ua.contains(needle))
    }

    pub fn code(&self) -> u8 {
        match self {
            DeviceClass::Desktop => 0,
            DeviceClass::Mobile => 1,
            DeviceClass::Tablet => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(DeviceClass::Desktop),
            1 => Some(DeviceClass::Mobile),
            2 => Some(DeviceClass::Tablet),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceClass::Desktop => "desktop",
            DeviceClass::Mobile => "mobile",
            DeviceClass::Tablet => "tablet",
        }
    }
}

/// Traffic source: 0 direct, 1 internal, 2 unknown, 3+ a mapped domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReferrerClass(pub u8);

impl ReferrerClass {
    pub const DIRECT: ReferrerClass = ReferrerClass(0);
    pub const INTERNAL: ReferrerClass = ReferrerClass(1);
    pub const UNKNOWN: ReferrerClass = ReferrerClass(2);

    /// Classify a referrer URL relative to the current host
    pub fn classify(referrer: &str, hostname: &str, mappings: &[ReferrerMapping]) -> Self {
        if referrer.is_empty() {
            return Self::DIRECT;
        }
        let domain = referrer_host(referrer).unwrap_or("");
        if domain == hostname {
            return Self::INTERNAL;
        }
        if domain.is_empty() {
            return Self::UNKNOWN;
        }
        mappings
            .iter()
            .find(|m| {
                domain == m.domain
                    || domain
                        .strip_suffix(m.domain.as_str())
                        .is_some_and(|rest| rest.ends_with('.'))
            })
            .map(|m| ReferrerClass(m.class))
            .unwrap_or(Self::UNKNOWN)
    }

    pub fn as_str(&self) -> &'static str {
        match self.0 {
            0 => "direct",
            1 => "internal",
            2 => "unknown",
            _ => "specific",
        }
    }
}

/// Host part of an http(s) URL
fn referrer_host(url: &str) -> Option<&str> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))?;
    let host = rest.split('/').next().unwrap_or("");
    (!host.is_empty()).then_some(host)
}

/// Random base-36 key shared by every record of one browsing context
pub fn new_key() -> String {
    Uuid::new_v4()
        .as_bytes()
        .iter()
        .take(KEY_LENGTH)
        .map(|b| KEY_ALPHABET[(*b % 36) as usize] as char)
        .collect()
}

/// Security level plus nine personalization digits, written as 10 digits.
///
/// A personalization digit is `0` (armed), `1` (set by the edge) or any other
/// digit the client uses for its own bookkeeping, which is preserved as is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MovementField {
    level: u8,
    bits: [u8; PERSONALIZATION_BITS],
}

impl MovementField {
    pub fn security_level(&self) -> u8 {
        self.level
    }

    /// Raise the security level by one, capped. Returns true if it changed.
    pub fn raise_level(&mut self) -> bool {
        let next = (self.level + 1).min(MAX_SECURITY_LEVEL).max(self.level);
        let changed = next != self.level;
        self.level = next;
        changed
    }

    /// Whether personalization bit `bit` (1..=9) is set
    pub fn bit(&self, bit: u8) -> bool {
        bit_index(bit).is_some_and(|i| self.bits[i] == 1)
    }

    /// Set bit `bit` (1..=9) if it is armed. Returns true if it changed.
    pub fn set_bit(&mut self, bit: u8) -> bool {
        match bit_index(bit) {
            Some(i) if self.bits[i] == 0 => {
                self.bits[i] = 1;
                true
            }
            _ => false,
        }
    }

    /// Bits currently set, ascending
    pub fn set_bits(&self) -> impl Iterator<Item = u8> + '_ {
        self.bits
            .iter()
            .enumerate()
            .filter(|(_, digit)| **digit == 1)
            .map(|(i, _)| i as u8 + 1)
    }
}

fn bit_index(bit: u8) -> Option<usize> {
    (1..=PERSONALIZATION_BITS as u8)
        .contains(&bit)
        .then(|| bit as usize - 1)
}

impl fmt::Display for MovementField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.level)?;
        for digit in self.bits {
            write!(f, "{digit}")?;
        }
        Ok(())
    }
}

impl FromStr for MovementField {
    type Err = ScoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() != PERSONALIZATION_BITS + 1 || !bytes.iter().all(u8::is_ascii_digit) {
            return Err(ScoreError::MalformedMovement(format!(
                "field '{s}' must be {} digits",
                PERSONALIZATION_BITS + 1
            )));
        }
        let mut bits = [0; PERSONALIZATION_BITS];
        for (slot, b) in bits.iter_mut().zip(&bytes[1..]) {
            *slot = b - b'0';
        }
        Ok(Self {
            level: bytes[0] - b'0',
            bits,
        })
    }
}

/// Browsing-context record shared by all tabs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MovementRecord {
    pub field: MovementField,
    pub time_bucket: i64,
    pub key: String,
    /// Slots in the order tabs last became active
    pub tabs: Vec<u32>,
}

impl MovementRecord {
    /// A fresh record with a cleared field and a new random key
    pub fn fresh(time_bucket: i64) -> Self {
        Self {
            field: MovementField::default(),
            time_bucket,
            key: new_key(),
            tabs: Vec::new(),
        }
    }

    /// Wire form without the tab list, as sent back by the edge
    pub fn head(&self) -> String {
        format!("{}_{}_{}", self.field, self.time_bucket, self.key)
    }
}

impl fmt::Display for MovementRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}___", self.head())?;
        for (i, tab) in self.tabs.iter().enumerate() {
            if i > 0 {
                f.write_str("~")?;
            }
            write!(f, "{tab}")?;
        }
        Ok(())
    }
}

impl FromStr for MovementRecord {
    type Err = ScoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (head, tabs) = s.split_once("___").unwrap_or((s, ""));
        let mut parts = head.split('_');
        let (Some(field), Some(time), Some(key)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(ScoreError::MalformedMovement(format!(
                "'{s}' needs field, time and key"
            )));
        };
        let time_bucket = time
            .parse()
            .map_err(|_| ScoreError::MalformedMovement(format!("bad time bucket '{time}'")))?;
        let tabs = tabs
            .split('~')
            .filter(|t| !t.is_empty())
            .map(|t| {
                t.parse()
                    .map_err(|_| ScoreError::MalformedMovement(format!("bad tab slot '{t}'")))
            })
            .collect::<Result<Vec<u32>, _>>()?;

        Ok(Self {
            field: field.parse()?,
            time_bucket,
            key: key.to_string(),
            tabs,
        })
    }
}

/// Per-tab session record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub echo: EchoState,
    pub time_bucket: i64,
    pub key: String,
    pub device: DeviceClass,
    pub referrer: ReferrerClass,
    pub scrolls: u32,
    pub clicks: u32,
    /// Ticks since the time bucket
    pub duration: i64,
    pub stream: String,
}

impl SessionRecord {
    /// Same record in another echo state
    pub fn with_echo(&self, echo: EchoState) -> Self {
        Self {
            echo,
            ..self.clone()
        }
    }
}

impl fmt::Display for SessionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}_{}_{}_{}_{}_{}_{}",
            self.echo.digit(),
            self.time_bucket,
            self.key,
            self.device.code(),
            self.referrer.0,
            self.scrolls,
            self.clicks,
            self.duration,
            self.stream
        )
    }
}

impl FromStr for SessionRecord {
    type Err = ScoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.splitn(9, '_').collect();
        if fields.len() < 8 {
            return Err(ScoreError::MalformedRecord(format!(
                "expected at least 8 fields, got {}",
                fields.len()
            )));
        }

        fn number<T: FromStr>(name: &str, value: &str) -> Result<T, ScoreError> {
            value
                .parse()
                .map_err(|_| ScoreError::MalformedRecord(format!("bad {name} '{value}'")))
        }

        let echo = fields[0]
            .chars()
            .next()
            .filter(|_| fields[0].len() == 1)
            .and_then(EchoState::from_digit)
            .ok_or_else(|| ScoreError::MalformedRecord(format!("bad echo '{}'", fields[0])))?;
        let device_code: u8 = number("device", fields[3])?;
        let device = DeviceClass::from_code(device_code)
            .ok_or_else(|| ScoreError::MalformedRecord(format!("bad device '{device_code}'")))?;

        Ok(Self {
            echo,
            time_bucket: number("time bucket", fields[1])?,
            key: fields[2].to_string(),
            device,
            referrer: ReferrerClass(number("referrer", fields[4])?),
            scrolls: number("scrolls", fields[5])?,
            clicks: number("clicks", fields[6])?,
            duration: number("duration", fields[7])?,
            stream: fields.get(8).copied().unwrap_or("").to_string(),
        })
    }
}

/// Cookie name of slot `slot`
pub fn slot_name(slot: u32) -> String {
    format!("rhythm_{slot}")
}

/// Slot number of a `rhythm_N` cookie name
pub fn parse_slot_name(name: &str) -> Option<u32> {
    let digits = name.strip_prefix("rhythm_")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}
