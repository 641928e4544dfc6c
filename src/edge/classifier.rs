//! Bot and human signatures over decoded timing
//!
//! Every signature is a pure function over a [`TimingProfile`] (or a slice of
//! it) so it can be exercised on synthetic input. [`classify_bot`] runs them
//! in a fixed order and reports the first match.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::beat::{auto_action_depth, Tail, TimingProfile};
use crate::config::{ClassifierConfig, RepeatRule};

/// A matched bot signature with the evidence that triggered it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signature", rename_all = "snake_case")]
pub enum BotSignature {
    /// Run of consecutive near-instant intervals
    Burst { run: usize },
    /// One interval repeated back to back
    Metronome { interval_ms: u64, repeats: usize },
    /// Slow but unnaturally steady timing
    LowVariance { std_ms: f64 },
    /// Intervals growing or shrinking by a constant step
    Arithmetic { delta_ms: i64 },
    /// Intervals scaled by a constant ratio
    Geometric { ratio: f64 },
    /// Bouncing between two pages
    PingPong { first: String, second: String },
    /// Nearly every structural action sits right under the page body
    ShallowOnly { shallow: usize, total: usize },
    /// Very few distinct actions
    LowDiversity { unique: usize, total: usize },
    /// A configured repeat rule matched the end of the stream
    Repeat { action: String, count: usize },
}

impl fmt::Display for BotSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BotSignature::Burst { run } => write!(f, "Burst:{run}"),
            BotSignature::Metronome { interval_ms, .. } => write!(f, "Metronome:{interval_ms}"),
            BotSignature::LowVariance { std_ms } => write!(f, "LowVariance:{std_ms:.1}"),
            BotSignature::Arithmetic { delta_ms } => write!(f, "Arithmetic:{delta_ms:+}"),
            BotSignature::Geometric { ratio } => write!(f, "Geometric:x{ratio:.1}"),
            BotSignature::PingPong { first, second } => write!(f, "PingPong:{first}-{second}"),
            BotSignature::ShallowOnly { shallow, total } => {
                write!(f, "ShallowOnly:{shallow}/{total}")
            }
            BotSignature::LowDiversity { unique, .. } => write!(f, "LowDiversity:{unique}t"),
            BotSignature::Repeat { action, count } => write!(f, "Repeat:{action}:{count}"),
        }
    }
}

/// Outcome of classifying one stream
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub bot: Option<BotSignature>,
    /// Personalization bit to set
    pub human: Option<u8>,
}

impl Classification {
    pub fn is_signal(&self) -> bool {
        self.bot.is_some() || self.human.is_some()
    }
}

/// Classify a raw stream
pub fn classify_stream(
    stream: &str,
    resolution_ms: u64,
    config: &ClassifierConfig,
) -> Classification {
    let profile = TimingProfile::from_stream(stream, resolution_ms);
    Classification {
        bot: classify_bot(&profile, config),
        human: classify_human(&profile, config),
    }
}

/// First matching bot signature, in order of cost and confidence
pub fn classify_bot(profile: &TimingProfile, config: &ClassifierConfig) -> Option<BotSignature> {
    let intervals = &profile.intervals_ms;
    burst(intervals, config)
        .or_else(|| metronome(intervals, config))
        .or_else(|| low_variance(intervals, config))
        .or_else(|| arithmetic(intervals, config))
        .or_else(|| geometric(intervals, config))
        .or_else(|| ping_pong(&profile.space_runs, config))
        .or_else(|| shallow_only(&profile.actions, config))
        .or_else(|| low_diversity(&profile.actions, config))
        .or_else(|| {
            let tail = profile.tail.as_ref()?;
            config.bot_rules.iter().find_map(|rule| {
                repeat_rule(tail, rule).map(|count| BotSignature::Repeat {
                    action: rule.action.clone(),
                    count,
                })
            })
        })
}

/// Personalization bit of the first matching human rule
pub fn classify_human(profile: &TimingProfile, config: &ClassifierConfig) -> Option<u8> {
    let tail = profile.tail.as_ref()?;
    config
        .human_rules
        .iter()
        .find(|human| repeat_rule(tail, &human.rule).is_some())
        .map(|human| human.bit)
}

/// Longest run of intervals at or under the burst limit
pub fn burst(intervals_ms: &[u64], config: &ClassifierConfig) -> Option<BotSignature> {
    let mut run = 0;
    let mut longest = 0;
    for &interval in intervals_ms {
        run = if interval <= config.burst_max_interval_ms {
            run + 1
        } else {
            0
        };
        longest = longest.max(run);
    }
    (longest >= config.burst_min_run && longest > 0).then_some(BotSignature::Burst { run: longest })
}

/// First interval value repeated back to back often enough
pub fn metronome(intervals_ms: &[u64], config: &ClassifierConfig) -> Option<BotSignature> {
    let min = config.metronome_min_repeats.max(1);
    let mut i = 0;
    while i < intervals_ms.len() {
        let value = intervals_ms[i];
        let repeats = intervals_ms[i..].iter().take_while(|v| **v == value).count();
        if repeats >= min {
            return Some(BotSignature::Metronome {
                interval_ms: value,
                repeats,
            });
        }
        i += repeats;
    }
    None
}

/// Population standard deviation and mean
fn spread(values: &[u64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().map(|v| *v as f64).sum::<f64>() / n;
    let variance = values
        .iter()
        .map(|v| (*v as f64 - mean).powi(2))
        .sum::<f64>()
        / n;
    (variance.sqrt(), mean)
}

pub fn low_variance(intervals_ms: &[u64], config: &ClassifierConfig) -> Option<BotSignature> {
    if intervals_ms.len() < config.low_variance_min_samples.max(1) {
        return None;
    }
    let (std_ms, mean) = spread(intervals_ms);
    (std_ms < config.low_variance_max_std_ms && mean > config.low_variance_min_mean_ms)
        .then_some(BotSignature::LowVariance { std_ms })
}

pub fn arithmetic(intervals_ms: &[u64], config: &ClassifierConfig) -> Option<BotSignature> {
    if intervals_ms.len() < config.progression_min_samples.max(2) {
        return None;
    }
    let values: Vec<i128> = intervals_ms.iter().map(|v| i128::from(*v)).collect();
    let delta = values[1] - values[0];
    if delta == 0 || !values.windows(2).all(|w| w[1] - w[0] == delta) {
        return None;
    }
    // Steps beyond i64 are not a plausible progression
    let delta_ms = i64::try_from(delta).ok()?;
    Some(BotSignature::Arithmetic { delta_ms })
}

pub fn geometric(intervals_ms: &[u64], config: &ClassifierConfig) -> Option<BotSignature> {
    if intervals_ms.len() < config.progression_min_samples.max(2) {
        return None;
    }
    if intervals_ms[0] == 0 || intervals_ms[1] == 0 {
        return None;
    }
    let ratio = intervals_ms[1] as f64 / intervals_ms[0] as f64;
    if ratio == 1.0 {
        return None;
    }
    intervals_ms
        .windows(2)
        .all(|w| w[0] > 0 && (w[1] as f64 / w[0] as f64 - ratio).abs() < config.geometric_tolerance)
        .then_some(BotSignature::Geometric { ratio })
}

/// Two pages alternating for enough full A-B cycles inside one run of
/// adjacent space tokens
pub fn ping_pong(space_runs: &[Vec<String>], config: &ClassifierConfig) -> Option<BotSignature> {
    let min = config.ping_pong_min_visits.max(4);
    for run in space_runs {
        for start in 0..run.len().saturating_sub(1) {
            let (a, b) = (&run[start], &run[start + 1]);
            if a == b {
                continue;
            }
            let length = run[start..]
                .iter()
                .enumerate()
                .take_while(|(i, id)| *id == if i % 2 == 0 { a } else { b })
                .count();
            // Only complete A-B pairs count
            if length - length % 2 >= min {
                return Some(BotSignature::PingPong {
                    first: a.clone(),
                    second: b.clone(),
                });
            }
        }
    }
    None
}

pub fn shallow_only(actions: &[String], config: &ClassifierConfig) -> Option<BotSignature> {
    let depths: Vec<u32> = actions.iter().filter_map(|a| auto_action_depth(a)).collect();
    if depths.len() < config.shallow_min_actions.max(1) {
        return None;
    }
    let shallow = depths
        .iter()
        .filter(|d| **d <= config.shallow_max_depth)
        .count();
    (shallow as f64 / depths.len() as f64 > config.shallow_min_ratio).then_some(
        BotSignature::ShallowOnly {
            shallow,
            total: depths.len(),
        },
    )
}

pub fn low_diversity(actions: &[String], config: &ClassifierConfig) -> Option<BotSignature> {
    if actions.len() < config.diversity_min_actions.max(1) {
        return None;
    }
    let unique = actions.iter().collect::<HashSet<_>>().len();
    (unique as f64 / (actions.len() as f64) < config.diversity_max_ratio).then_some(
        BotSignature::LowDiversity {
            unique,
            total: actions.len(),
        },
    )
}

/// Number of in-range intervals (in ticks) chained directly before the
/// final action, if the rule matches
pub fn repeat_rule(tail: &Tail, rule: &RepeatRule) -> Option<usize> {
    if tail.action != rule.action {
        return None;
    }
    let count = tail
        .ticks
        .iter()
        .rev()
        .take_while(|t| (rule.min_ticks..=rule.max_ticks).contains(*t))
        .count();
    (count >= rule.min_count.max(1)).then_some(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HumanRule;
    use pretty_assertions::assert_eq;

    fn config() -> ClassifierConfig {
        ClassifierConfig::default()
    }

    /// Distinct, irregular intervals that trip no timing signature
    fn human_like(n: usize) -> Vec<u64> {
        [2300, 700, 5100, 1200, 3900, 800, 12500, 450, 2600, 1750]
            .iter()
            .cycle()
            .take(n)
            .copied()
            .collect()
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_burst_boundary() {
        let mut intervals = human_like(3);
        intervals.extend([100; 10]);
        assert_eq!(burst(&intervals, &config()), Some(BotSignature::Burst { run: 10 }));

        let mut intervals = human_like(3);
        intervals.extend([100; 9]);
        intervals.push(900);
        intervals.extend([200; 9]);
        assert_eq!(burst(&intervals, &config()), None);
    }

    #[test]
    fn test_metronome_boundary() {
        let mut intervals = vec![1200, 300];
        intervals.extend([500; 8]);
        assert_eq!(
            metronome(&intervals, &config()),
            Some(BotSignature::Metronome {
                interval_ms: 500,
                repeats: 8
            })
        );

        let mut intervals = vec![1200];
        intervals.extend([500; 7]);
        intervals.push(600);
        intervals.extend([500; 7]);
        assert_eq!(metronome(&intervals, &config()), None);
    }

    #[test]
    fn test_low_variance() {
        assert!(matches!(
            low_variance(&[3000, 3010, 2990, 3000], &config()),
            Some(BotSignature::LowVariance { .. })
        ));
        // Fast steady clicking is left to the burst signature
        assert_eq!(low_variance(&[500, 510, 490, 500], &config()), None);
        assert_eq!(low_variance(&[3000, 3010, 2990], &config()), None);
        assert_eq!(low_variance(&[3000, 3100, 2900, 3000], &config()), None);
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(
            arithmetic(&[1000, 1200, 1400, 1600], &config()),
            Some(BotSignature::Arithmetic { delta_ms: 200 })
        );
        assert_eq!(
            arithmetic(&[1600, 1500, 1400, 1300, 1200], &config()),
            Some(BotSignature::Arithmetic { delta_ms: -100 })
        );
        assert_eq!(arithmetic(&[1000, 1200, 1400], &config()), None);
        assert_eq!(arithmetic(&[1000, 1200, 1400, 1700], &config()), None);
        assert_eq!(arithmetic(&[1000, 1000, 1000, 1000], &config()), None);
    }

    #[test]
    fn test_geometric() {
        assert_eq!(
            geometric(&[100, 200, 400, 800], &config()),
            Some(BotSignature::Geometric { ratio: 2.0 })
        );
        assert_eq!(geometric(&[100, 200, 400, 900], &config()), None);
        assert_eq!(geometric(&[0, 200, 400, 800], &config()), None);
        assert_eq!(geometric(&[300, 300, 300, 300], &config()), None);
        assert_eq!(
            BotSignature::Geometric { ratio: 1.5 }.to_string(),
            "Geometric:x1.5"
        );
    }

    #[test]
    fn test_ping_pong() {
        let runs = vec![ids(&["home", "a", "b", "a", "b", "a", "b"])];
        assert_eq!(
            ping_pong(&runs, &config()),
            Some(BotSignature::PingPong {
                first: "a".to_string(),
                second: "b".to_string()
            })
        );

        // Five visits are not three full cycles
        let runs = vec![ids(&["a", "b", "a", "b", "a"])];
        assert_eq!(ping_pong(&runs, &config()), None);

        // Bounces split by time tokens are separate runs
        let runs = vec![ids(&["a", "b", "a"]), ids(&["b", "a", "b"])];
        assert_eq!(ping_pong(&runs, &config()), None);
    }

    #[test]
    fn test_shallow_only() {
        let mut actions = vec!["1div1".to_string(); 10];
        assert_eq!(
            shallow_only(&actions, &config()),
            Some(BotSignature::ShallowOnly {
                shallow: 10,
                total: 10
            })
        );

        // Mapped actions are not structural and do not count
        actions[0] = "buy".to_string();
        assert_eq!(shallow_only(&actions, &config()), None);

        let mut actions = vec!["2a1".to_string(); 9];
        actions.push("8li3".to_string());
        assert_eq!(shallow_only(&actions, &config()), None);
    }

    #[test]
    fn test_low_diversity() {
        let mut actions = vec!["next".to_string(); 19];
        actions.push("prev".to_string());
        assert_eq!(
            low_diversity(&actions, &config()),
            Some(BotSignature::LowDiversity {
                unique: 2,
                total: 20
            })
        );
        assert_eq!(
            BotSignature::LowDiversity {
                unique: 2,
                total: 20
            }
            .to_string(),
            "LowDiversity:2t"
        );
        assert_eq!(low_diversity(&actions[..19], &config()), None);
    }

    #[test]
    fn test_repeat_rule_counts_contiguous_tail() {
        let rule = RepeatRule {
            action: "demo".to_string(),
            min_ticks: 0,
            max_ticks: 4,
            min_count: 2,
        };
        let tail = Tail {
            action: "demo".to_string(),
            ticks: vec![30, 3, 1, 2],
        };
        assert_eq!(repeat_rule(&tail, &rule), Some(3));

        let tail = Tail {
            action: "demo".to_string(),
            ticks: vec![3, 12],
        };
        assert_eq!(repeat_rule(&tail, &rule), None);

        let tail = Tail {
            action: "other".to_string(),
            ticks: vec![1, 1, 1],
        };
        assert_eq!(repeat_rule(&tail, &rule), None);
    }

    #[test]
    fn test_classify_bot_order() {
        // A burst of identical intervals is reported as a burst first
        let stream = format!("!home{}*go", "~1".repeat(12));
        let result = classify_stream(&stream, 100, &config());
        assert_eq!(result.bot, Some(BotSignature::Burst { run: 12 }));
        assert_eq!(result.bot.map(|b| b.to_string()).as_deref(), Some("Burst:12"));
    }

    #[test]
    fn test_classify_human_like_stream() {
        let stream = "!home~23*nav~19*3div2~37/12*help~112*more!724~103*buy~5*3a1";
        let result = classify_stream(stream, 100, &config());
        assert_eq!(result, Classification::default());
        assert!(!result.is_signal());
    }

    #[test]
    fn test_huge_ticks_give_no_signal() {
        let result = classify_stream("!home~90000000000000000~180000000000000000~1~2", 100, &config());
        assert_eq!(result, Classification::default());

        let config = ClassifierConfig {
            progression_min_samples: 3,
            ..config()
        };
        assert_eq!(arithmetic(&[u64::MAX, 0, 10], &config), None);
        assert_eq!(arithmetic(&[0, u64::MAX - 1, u64::MAX], &config), None);
    }

    #[test]
    fn test_configured_rules() {
        let mut config = config();
        config.bot_rules.push(RepeatRule {
            action: "demo".to_string(),
            min_ticks: 0,
            max_ticks: 4,
            min_count: 2,
        });
        config.human_rules.push(HumanRule {
            rule: RepeatRule {
                action: "demo".to_string(),
                min_ticks: 5,
                max_ticks: u64::MAX,
                min_count: 2,
            },
            bit: 1,
        });

        let fast = classify_stream("!home~40*demo~3/1/2*demo", 100, &config);
        assert_eq!(
            fast.bot,
            Some(BotSignature::Repeat {
                action: "demo".to_string(),
                count: 3
            })
        );
        assert_eq!(fast.human, None);

        let slow = classify_stream("!home~40*demo~15/12/14*demo~3", 100, &config);
        assert_eq!(slow.bot, None);
        assert_eq!(slow.human, Some(1));
    }
}
