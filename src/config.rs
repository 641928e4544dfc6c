//! Configuration for the codec, the session engine and the edge interpreter
//!
//! Every section deserializes with defaults, so a partial JSON document such
//! as `{"rhythm": {"max_slots": 3}}` is a valid configuration.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::ScoreError;

/// Default tick size in milliseconds
pub const DEFAULT_RESOLUTION_MS: u64 = 100;

/// Default number of concurrent tab slots
pub const DEFAULT_MAX_SLOTS: u32 = 7;

/// Default maximum serialized session size in bytes before rotation
pub const DEFAULT_CAPACITY_BYTES: usize = 3500;

/// Default refresh cycle in clicks
pub const DEFAULT_TAP: u32 = 3;

/// Default session retention (3 days)
pub const DEFAULT_MAX_AGE_SECS: u64 = 259_200;

/// Default edge header size limit in bytes
pub const DEFAULT_HEADER_LIMIT: usize = 30_000;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FullScoreConfig {
    pub beat: BeatConfig,
    pub rhythm: RhythmConfig,
    pub edge: EdgeConfig,
}

impl FullScoreConfig {
    /// Load configuration from JSON
    pub fn from_json(json: &str) -> Result<Self, ScoreError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to JSON
    pub fn to_json(&self) -> Result<String, ScoreError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ScoreError> {
        if self.beat.resolution_ms == 0
            || self.rhythm.resolution_ms == 0
            || self.edge.resolution_ms == 0
        {
            return Err(ScoreError::InvalidConfig(
                "resolution_ms must be positive".to_string(),
            ));
        }
        if self.rhythm.max_slots == 0 {
            return Err(ScoreError::InvalidConfig(
                "max_slots must be at least 1".to_string(),
            ));
        }
        if self.rhythm.tap == 0 {
            return Err(ScoreError::InvalidConfig("tap must be at least 1".to_string()));
        }
        if let Some(rule) = self
            .edge
            .classifier
            .human_rules
            .iter()
            .find(|r| !(1..=9).contains(&r.bit))
        {
            return Err(ScoreError::InvalidConfig(format!(
                "human rule for '{}' uses bit {}, expected 1-9",
                rule.rule.action, rule.bit
            )));
        }
        Ok(())
    }
}

/// Token codec settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BeatConfig {
    /// Tick size in milliseconds
    pub resolution_ms: u64,
    /// Manual space map (path → short name)
    pub spaces: HashMap<String, String>,
    /// Manual action map (`#id`, `.class`, href or `*auto` → short name)
    pub actions: HashMap<String, String>,
}

impl Default for BeatConfig {
    fn default() -> Self {
        let mut spaces = HashMap::new();
        spaces.insert("/".to_string(), "home".to_string());
        Self {
            resolution_ms: DEFAULT_RESOLUTION_MS,
            spaces,
            actions: HashMap::new(),
        }
    }
}

/// Maps a referrer domain (and its subdomains) to a referrer class >= 3
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferrerMapping {
    pub domain: String,
    pub class: u8,
}

impl ReferrerMapping {
    pub fn new(domain: &str, class: u8) -> Self {
        Self {
            domain: domain.to_string(),
            class,
        }
    }
}

/// Optional session engine features
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct Addons {
    /// Cross-tab stitching
    pub tab: bool,
    /// Record the final scroll position of each gesture
    pub scroll: bool,
    /// Record route changes of single page applications
    pub spa: bool,
    /// Flush immediately on every visibility change (disables stitching)
    pub power: bool,
}

impl Default for Addons {
    fn default() -> Self {
        Self {
            tab: true,
            scroll: false,
            spa: false,
            power: false,
        }
    }
}

/// Session engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RhythmConfig {
    /// Path pinged for live classification
    pub hit: String,
    /// Endpoints receiving flushed batches (relative to origin or absolute)
    pub echo_endpoints: Vec<String>,
    /// Tick size in milliseconds, used for time buckets and durations
    pub resolution_ms: u64,
    /// Refresh ping cycle in clicks
    pub tap: u32,
    /// Abort deadline for non-forced refresh pings
    pub throttle_ms: u64,
    /// Session record retention; `None` keeps records for the browser session
    pub max_age_secs: Option<u64>,
    /// Size of the slot pool
    pub max_slots: u32,
    /// Serialized record size that triggers rotation
    pub capacity_bytes: usize,
    /// Records with fewer clicks are deleted instead of flushed
    pub delete_below_clicks: u32,
    /// Ordered referrer domain mappings
    pub referrers: Vec<ReferrerMapping>,
    pub addons: Addons,
}

impl Default for RhythmConfig {
    fn default() -> Self {
        Self {
            hit: "/rhythm".to_string(),
            echo_endpoints: vec!["/rhythm/echo".to_string()],
            resolution_ms: DEFAULT_RESOLUTION_MS,
            tap: DEFAULT_TAP,
            throttle_ms: 1,
            max_age_secs: Some(DEFAULT_MAX_AGE_SECS),
            max_slots: DEFAULT_MAX_SLOTS,
            capacity_bytes: DEFAULT_CAPACITY_BYTES,
            delete_below_clicks: 1,
            referrers: vec![
                ReferrerMapping::new("google.com", 3),
                ReferrerMapping::new("youtube.com", 4),
                ReferrerMapping::new("cloudflare.com", 5),
                ReferrerMapping::new("claude.ai", 6),
                ReferrerMapping::new("chatgpt.com", 7),
                ReferrerMapping::new("meta.com", 8),
            ],
            addons: Addons::default(),
        }
    }
}

/// A repeated-action rule matched against the tail of a stream.
///
/// Matches when the last action is `action` and at least `min_count` of the
/// intervals chained directly before it lie within `[min_ticks, max_ticks]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepeatRule {
    pub action: String,
    #[serde(default)]
    pub min_ticks: u64,
    #[serde(default = "unbounded_ticks")]
    pub max_ticks: u64,
    pub min_count: usize,
}

fn unbounded_ticks() -> u64 {
    u64::MAX
}

/// A human-confidence rule; on match the personalization `bit` is set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HumanRule {
    #[serde(flatten)]
    pub rule: RepeatRule,
    pub bit: u8,
}

/// Signature thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub burst_max_interval_ms: u64,
    pub burst_min_run: usize,
    pub metronome_min_repeats: usize,
    pub low_variance_min_samples: usize,
    pub low_variance_max_std_ms: f64,
    pub low_variance_min_mean_ms: f64,
    pub progression_min_samples: usize,
    pub geometric_tolerance: f64,
    pub ping_pong_min_visits: usize,
    pub shallow_min_actions: usize,
    pub shallow_max_depth: u32,
    pub shallow_min_ratio: f64,
    pub diversity_min_actions: usize,
    pub diversity_max_ratio: f64,
    pub bot_rules: Vec<RepeatRule>,
    pub human_rules: Vec<HumanRule>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            burst_max_interval_ms: 200,
            burst_min_run: 10,
            metronome_min_repeats: 8,
            low_variance_min_samples: 4,
            low_variance_max_std_ms: 20.0,
            low_variance_min_mean_ms: 1000.0,
            progression_min_samples: 4,
            geometric_tolerance: 0.01,
            ping_pong_min_visits: 6,
            shallow_min_actions: 10,
            shallow_max_depth: 2,
            shallow_min_ratio: 0.9,
            diversity_min_actions: 20,
            diversity_max_ratio: 0.15,
            bot_rules: Vec::new(),
            human_rules: Vec::new(),
        }
    }
}

/// Live ping handling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Log redacted cookie headers of every ping
    pub log: bool,
    /// Keep time buckets in ping logs
    pub time: bool,
    /// Keep keys in ping logs
    pub hash: bool,
    /// Listen for bot signatures
    pub bot: bool,
    /// Listen for human signatures
    pub human: bool,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            log: false,
            time: false,
            hash: false,
            bot: true,
            human: true,
        }
    }
}

/// Journey archiving
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchivingConfig {
    pub log: bool,
    /// Include the time bucket in archived journeys
    pub time: bool,
    /// Include the key in archived journeys (needed to join POW fragments)
    pub hash: bool,
    /// Add readability blanks to the beat
    pub blank: bool,
    /// Emit NDJSON instead of BEAT lines
    pub ndjson: bool,
    /// Skip journeys longer than this many seconds
    pub max_seconds: f64,
    /// Skip journeys with fewer clicks
    pub min_clicks: u32,
}

impl Default for ArchivingConfig {
    fn default() -> Self {
        Self {
            log: true,
            time: false,
            hash: false,
            blank: false,
            ndjson: false,
            max_seconds: 7200.0,
            min_clicks: 1,
        }
    }
}

/// Edge interpreter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeConfig {
    pub resolution_ms: u64,
    /// Cookie headers at or above this size are ignored
    pub header_limit: usize,
    /// Path of the live ping
    pub ping_path: String,
    /// Path receiving flushed batches
    pub echo_path: String,
    pub streaming: StreamingConfig,
    pub archiving: ArchivingConfig,
    pub classifier: ClassifierConfig,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            resolution_ms: DEFAULT_RESOLUTION_MS,
            header_limit: DEFAULT_HEADER_LIMIT,
            ping_path: "/rhythm/".to_string(),
            echo_path: "/rhythm/echo".to_string(),
            streaming: StreamingConfig::default(),
            archiving: ArchivingConfig::default(),
            classifier: ClassifierConfig::default(),
        }
    }
}
