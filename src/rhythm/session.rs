//! Per-tab session engine
//!
//! Each tab owns one session record in a bounded pool of `rhythm_N` slots.
//! All tabs of a browsing context share the movement record, which carries
//! the time bucket every tab follows, the shared key and the order in which
//! tabs became active. Store failures never interrupt tracking; they are
//! logged and the engine continues from memory.

use std::rc::Rc;

use tracing::debug;

use crate::beat::{trailing_tab_switch, ActionTarget, Beat};
use crate::clock::Clock;
use crate::config::{BeatConfig, FullScoreConfig, RhythmConfig};
use crate::record::{
    parse_slot_name, slot_name, DeviceClass, EchoState, MovementRecord, ReferrerClass,
    SessionRecord,
};
use crate::rhythm::host::{Host, RouteObserver, Transport};
use crate::rhythm::storage::{CookieAttributes, CookieStore};

/// Cookie holding the movement record
pub const MOVEMENT_COOKIE: &str = "movement";

/// Cookie holding the last security level the page reloaded for
pub const WAF_COOKIE: &str = "waf";

/// How long a window blur counts as part of a browser close
pub const BLUR_WINDOW_MS: i64 = 17;

/// Lifecycle of the tab as seen by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabState {
    Uninitialized,
    Active,
    /// Record overflowed and is being replaced by a new slot
    Rotating,
    /// Hidden or torn down, record marked closing
    Closing,
    Flushed,
}

/// Page visibility reported by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Hidden,
    Visible,
}

/// A deferred check the host runs after its teardown window (about 1 ms)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleCheck {
    /// Flush if no tab is active and the window was just blurred
    AfterHidden,
    /// Flush if no tab is active
    AfterPageHide,
}

/// Collaborators supplied by the embedding environment
#[derive(Clone)]
pub struct Environment {
    pub store: Rc<dyn CookieStore>,
    pub host: Rc<dyn Host>,
    pub transport: Rc<dyn Transport>,
    pub clock: Rc<dyn Clock>,
}

type PersonalizationHook = Box<dyn FnMut(u8)>;

#[derive(Debug, Clone)]
struct TabSession {
    slot: u32,
    time_bucket: i64,
    key: String,
    device: DeviceClass,
    referrer: ReferrerClass,
    scrolls: u32,
    clicks: u32,
}

/// Session engine for one tab
pub struct Rhythm {
    config: RhythmConfig,
    beat_config: BeatConfig,
    env: Environment,
    /// Movement as last seen by this tab
    movement: Option<MovementRecord>,
    tab: Option<TabSession>,
    beat: Option<Beat>,
    state: TabState,
    /// Refresh pings left to send without an abort deadline
    forced_refreshes: u32,
    scrolling: bool,
    hidden: bool,
    blur_until: Option<i64>,
    hooks: Vec<(u8, PersonalizationHook)>,
}

impl std::fmt::Debug for Rhythm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rhythm")
            .field("state", &self.state)
            .field("tab", &self.tab)
            .field("movement", &self.movement)
            .field("beat", &self.beat)
            .finish()
    }
}

impl Rhythm {
    /// Start tracking the current page.
    ///
    /// Without a movement record this is the first page of a browsing
    /// context: leftovers of the previous one are flushed and a new movement
    /// is written before the tab claims or restores its slot.
    pub fn start(config: &FullScoreConfig, env: Environment) -> Self {
        let mut rhythm = Self {
            config: config.rhythm.clone(),
            beat_config: config.beat.clone(),
            env,
            movement: None,
            tab: None,
            beat: None,
            state: TabState::Uninitialized,
            forced_refreshes: 0,
            scrolling: false,
            hidden: false,
            blur_until: None,
            hooks: Vec::new(),
        };

        if rhythm.read(MOVEMENT_COOKIE).is_none() {
            rhythm.clean();
            rhythm.batch(false);
            rhythm.new_movement();
        }
        rhythm.session(false);
        rhythm
    }

    /// Register a callback run on every click while personalization `bit` is set
    pub fn on_personalization(&mut self, bit: u8, hook: impl FnMut(u8) + 'static) {
        self.hooks.push((bit, Box::new(hook)));
    }

    pub fn state(&self) -> TabState {
        self.state
    }

    /// Slot this tab currently writes to
    pub fn slot(&self) -> Option<u32> {
        self.tab.as_ref().map(|t| t.slot)
    }

    pub fn clicks(&self) -> u32 {
        self.tab.as_ref().map_or(0, |t| t.clicks)
    }

    pub fn scrolls(&self) -> u32 {
        self.tab.as_ref().map_or(0, |t| t.scrolls)
    }

    /// In-memory stream of this tab
    pub fn stream(&self) -> String {
        self.beat.as_ref().map(Beat::serialize).unwrap_or_default()
    }

    pub fn movement(&self) -> Option<&MovementRecord> {
        self.movement.as_ref()
    }

    /// A click forwarded by the host (or its tap gate)
    pub fn click(&mut self, target: &ActionTarget) {
        self.ensure_session();
        if let Some(tab) = self.tab.as_mut() {
            tab.clicks += 1;
        }
        if let Some(beat) = self.beat.as_mut() {
            beat.action(target);
        }
        self.save(false);

        if let Some(current) = self.read_movement() {
            let cached_field = self.movement.as_ref().map(|m| m.field);
            if cached_field != Some(current.field) {
                self.forced_refreshes = self.config.tap;
                self.movement = Some(current.clone());
            }

            let level = current.field.security_level();
            let waf = self
                .read(WAF_COOKIE)
                .and_then(|w| w.parse::<u8>().ok())
                .unwrap_or(0);
            if level <= crate::record::MAX_SECURITY_LEVEL && level > waf {
                debug!(security_level = level, "security level raised, reloading");
                self.write(WAF_COOKIE, &level.to_string(), CookieAttributes::default());
                self.env.host.reload();
            }

            for bit in current.field.set_bits() {
                for (_, hook) in self.hooks.iter_mut().filter(|(b, _)| *b == bit) {
                    hook(bit);
                }
            }
        }

        let clicks = self.clicks();
        let tap = self.config.tap.max(1);
        if clicks % tap == 0 || self.forced_refreshes > 0 {
            let hit = if self.config.hit == "/" {
                ""
            } else {
                self.config.hit.as_str()
            };
            let url = format!("{}{hit}/?livestreaming", self.env.host.origin());
            let abort = (clicks > tap && self.forced_refreshes == 0)
                .then_some(self.config.throttle_ms);
            self.env.transport.refresh(&url, abort);
            self.forced_refreshes = self.forced_refreshes.saturating_sub(1);
        }
    }

    /// A scroll event. Counted once per gesture.
    pub fn scroll(&mut self) {
        self.ensure_session();
        if !self.scrolling {
            self.scrolling = true;
            if let Some(tab) = self.tab.as_mut() {
                tab.scrolls += 1;
            }
            self.save(false);
        }
    }

    /// The scroll gesture settled (no scroll for about 150 ms)
    pub fn scroll_settled(&mut self, scroll_y: f64) {
        if self.config.addons.scroll {
            if let Some(beat) = self.beat.as_mut() {
                beat.position(scroll_y.round().max(0.0) as u64);
            }
        }
        self.scrolling = false;
    }

    pub fn visibility_changed(&mut self, visibility: Visibility) -> Option<SettleCheck> {
        let handheld = DeviceClass::is_handheld_agent(&self.env.host.user_agent());
        match visibility {
            Visibility::Hidden => {
                self.hidden = true;
                if self.config.addons.power && !self.slot_records().is_empty() {
                    self.batch(false);
                    return None;
                }
                if handheld {
                    self.mark_own(EchoState::Active, EchoState::Closing);
                }
                if self.tab.is_some() {
                    self.state = TabState::Closing;
                }
                Some(SettleCheck::AfterHidden)
            }
            Visibility::Visible => {
                self.hidden = false;
                if handheld {
                    self.mark_own(EchoState::Closing, EchoState::Active);
                }
                if self.read(MOVEMENT_COOKIE).is_none() {
                    self.new_movement();
                    self.session(true);
                }
                if let Some(beat) = self.beat.as_mut() {
                    beat.reset_clock();
                }
                if self.tab.is_some() {
                    self.state = TabState::Active;
                }
                None
            }
        }
    }

    /// The window lost focus. While hidden this hints at a browser close.
    pub fn blur(&mut self) {
        if !self.hidden {
            return;
        }
        self.mark_own(EchoState::Active, EchoState::Closing);
        self.blur_until = Some(self.env.clock.now_millis() + BLUR_WINDOW_MS);
    }

    /// Page teardown. `persisted` pages go to the back/forward cache and stay.
    pub fn page_hide(&mut self, persisted: bool) -> Option<SettleCheck> {
        if persisted {
            return None;
        }
        if self.config.addons.power {
            self.batch(true);
            return None;
        }
        self.mark_own(EchoState::Active, EchoState::Closing);
        if self.tab.is_some() {
            self.state = TabState::Closing;
        }
        Some(SettleCheck::AfterPageHide)
    }

    /// Run a deferred check returned by [`visibility_changed`] or [`page_hide`].
    ///
    /// [`visibility_changed`]: Rhythm::visibility_changed
    /// [`page_hide`]: Rhythm::page_hide
    pub fn settle(&mut self, check: SettleCheck) {
        if self.any_active() {
            return;
        }
        let blurred = self
            .blur_until
            .is_some_and(|until| self.env.clock.now_millis() < until);
        match check {
            SettleCheck::AfterHidden if blurred => self.batch(true),
            SettleCheck::AfterPageHide => self.batch(true),
            SettleCheck::AfterHidden => {}
        }
    }

    /// Flush every stored session to the echo endpoints.
    ///
    /// Records below the click threshold are deleted instead. `force` also
    /// deletes the movement, ending the browsing context.
    pub fn batch(&mut self, force: bool) {
        if force {
            self.erase(MOVEMENT_COOKIE);
        }
        let records = self.slot_records();
        if records.is_empty() {
            return;
        }

        let attributes = self.session_attributes();
        let mut updates = Vec::new();
        for (slot, value) in records {
            let name = slot_name(slot);
            let clicks = value
                .split('_')
                .nth(6)
                .and_then(|c| c.parse::<u32>().ok())
                .unwrap_or(0);
            if clicks < self.config.delete_below_clicks {
                self.erase(&name);
                continue;
            }
            let rest = value.char_indices().nth(1).map(|(i, _)| i);
            let sent = match rest {
                Some(i) => format!("{}{}", EchoState::Sent.digit(), &value[i..]),
                None if !value.is_empty() => EchoState::Sent.digit().to_string(),
                None => value,
            };
            self.write(&name, &sent, attributes);
            updates.push(format!("{name}={sent}"));
        }

        if !updates.is_empty() {
            let body = updates.concat();
            let origin = self.env.host.origin();
            for endpoint in &self.config.echo_endpoints {
                let url = if endpoint.starts_with('h') {
                    endpoint.clone()
                } else {
                    format!("{origin}{endpoint}")
                };
                self.env.transport.send_beacon(&url, &body);
            }
            debug!(sessions = updates.len(), force, "flushed sessions");
        }
        self.clean();
    }

    /// Remove sent records and forget this tab's session
    fn clean(&mut self) {
        for slot in 1..=self.config.max_slots {
            let name = slot_name(slot);
            if self
                .read(&name)
                .is_some_and(|v| v.starts_with(EchoState::Sent.digit()))
            {
                self.erase(&name);
            }
        }
        if self.tab.is_some() {
            self.state = TabState::Flushed;
        }
        self.tab = None;
        self.beat = None;
        self.env.host.set_window_name("");
    }

    fn ensure_session(&mut self) {
        if self.tab.is_none() {
            self.session(false);
        }
    }

    /// Restore this tab's session or claim a slot for a new one
    fn session(&mut self, force: bool) {
        let movement = match self.read_movement().or_else(|| self.movement.clone()) {
            Some(movement) => movement,
            None => self.new_movement(),
        };
        self.movement = Some(movement.clone());

        if !force {
            let name = self.env.host.window_name();
            if let Some(slot) = parse_slot_name(&name) {
                if let Some(record) = self.read_record(&name) {
                    self.restore(slot, record);
                    return;
                }
            }
            self.env.host.set_window_name("");
        }

        let free = (1..=self.config.max_slots).find(|slot| self.read(&slot_name(*slot)).is_none());
        let (slot, movement) = match free {
            Some(slot) => (slot, movement),
            None => {
                debug!(max_slots = self.config.max_slots, "slot pool exhausted");
                self.batch(false);
                let fresh = MovementRecord {
                    field: movement.field,
                    time_bucket: self.now_bucket(),
                    key: movement.key,
                    tabs: Vec::new(),
                };
                self.write_movement(&fresh);
                self.movement = Some(fresh.clone());
                (1, fresh)
            }
        };

        self.env.host.set_window_name(&slot_name(slot));
        let host = &self.env.host;
        self.tab = Some(TabSession {
            slot,
            time_bucket: movement.time_bucket,
            key: movement.key,
            device: DeviceClass::from_user_agent(&host.user_agent()),
            referrer: ReferrerClass::classify(
                &host.referrer(),
                &host.hostname(),
                &self.config.referrers,
            ),
            scrolls: 0,
            clicks: 0,
        });
        let mut beat = Beat::new(&self.beat_config, self.env.clock.clone());
        beat.space(&self.env.host.pathname());
        self.beat = Some(beat);
        self.state = TabState::Active;
        self.save(true);
    }

    fn restore(&mut self, slot: u32, record: SessionRecord) {
        debug!(slot, "restoring session");
        let mut beat = Beat::new(&self.beat_config, self.env.clock.clone());
        if !record.stream.is_empty() {
            beat.restore(record.stream);
        }
        beat.space(&self.env.host.pathname());
        self.tab = Some(TabSession {
            slot,
            time_bucket: record.time_bucket,
            key: record.key,
            device: record.device,
            referrer: record.referrer,
            scrolls: record.scrolls,
            clicks: record.clicks,
        });
        self.beat = Some(beat);
        self.state = TabState::Active;
        self.save(false);
    }

    /// Persist this tab's record.
    ///
    /// Follows a newer movement if another tab started one, keeps the tab
    /// order and switch markers current, and rotates to a new slot when the
    /// record outgrows its capacity.
    fn save(&mut self, force: bool) {
        let Some(cached) = self.movement.clone() else {
            return;
        };
        let current = self.read_movement().unwrap_or_else(|| cached.clone());
        if !force && current.time_bucket != cached.time_bucket {
            debug!(
                from = cached.time_bucket,
                to = current.time_bucket,
                "following newer movement"
            );
            self.movement = Some(current);
            self.tab = None;
            self.session(true);
            return;
        }

        let Some(slot) = self.slot() else {
            return;
        };
        if self.config.addons.tab && !self.config.addons.power {
            self.stitch(slot, current);
        }

        let Some(record) = self.current_record() else {
            return;
        };
        let name = slot_name(slot);
        let wire = record.to_string();
        let attributes = self.session_attributes();
        self.write(&name, &wire, attributes);

        if !force && wire.len() > self.config.capacity_bytes {
            debug!(slot, bytes = wire.len(), "session over capacity, rotating");
            let closing = record.with_echo(EchoState::Closing).to_string();
            self.write(&name, &closing, attributes);
            self.state = TabState::Rotating;
            self.session(true);
        }
    }

    /// Record tab order, mark the previous tab's stream and merge our own
    /// stream when another tab marked it.
    fn stitch(&mut self, slot: u32, current: MovementRecord) {
        let attributes = self.session_attributes();
        if current.tabs.last() != Some(&slot) {
            let before = current.tabs.last().copied();
            let mut updated = current;
            updated.tabs.push(slot);
            self.write_movement(&updated);

            if let Some(before) = before {
                let name = slot_name(before);
                if let Some(value) = self.read(&name) {
                    self.write(&name, &format!("{value}@---{slot}"), attributes);
                }
            }
        }

        let Some(stored) = self.read_record(&slot_name(slot)) else {
            return;
        };
        if trailing_tab_switch(&stored.stream).is_none() {
            return;
        }
        if let Some(beat) = self.beat.as_mut() {
            let memory = beat.serialize();
            let merged = merge_streams(&stored.stream, &memory);
            beat.replace(merged);
        }
    }

    fn current_record(&self) -> Option<SessionRecord> {
        let tab = self.tab.as_ref()?;
        Some(SessionRecord {
            echo: EchoState::Active,
            time_bucket: tab.time_bucket,
            key: tab.key.clone(),
            device: tab.device,
            referrer: tab.referrer,
            scrolls: tab.scrolls,
            clicks: tab.clicks,
            duration: self.now_bucket() - tab.time_bucket,
            stream: self.stream(),
        })
    }

    /// Rewrite this tab's stored echo digit from `from` to `to`
    fn mark_own(&mut self, from: EchoState, to: EchoState) {
        let name = self.env.host.window_name();
        if parse_slot_name(&name).is_none() {
            return;
        }
        let Some(value) = self.read(&name) else {
            return;
        };
        if let Some(rest) = value.strip_prefix(from.digit()) {
            let attributes = self.session_attributes();
            self.write(&name, &format!("{}{rest}", to.digit()), attributes);
        }
    }

    fn any_active(&self) -> bool {
        self.slot_records()
            .iter()
            .any(|(_, value)| value.starts_with(EchoState::Active.digit()))
    }

    fn new_movement(&mut self) -> MovementRecord {
        let movement = MovementRecord::fresh(self.now_bucket());
        self.write_movement(&movement);
        self.movement = Some(movement.clone());
        movement
    }

    fn now_bucket(&self) -> i64 {
        self.env.clock.now_millis() / self.config.resolution_ms.max(1) as i64
    }

    fn session_attributes(&self) -> CookieAttributes {
        CookieAttributes::persistent(self.config.max_age_secs, self.env.host.is_https())
    }

    fn read(&self, name: &str) -> Option<String> {
        match self.env.store.get(name) {
            Ok(value) => value,
            Err(err) => {
                debug!(cookie = name, error = %err, "cookie read failed");
                None
            }
        }
    }

    fn read_movement(&self) -> Option<MovementRecord> {
        let raw = self.read(MOVEMENT_COOKIE)?;
        match raw.parse() {
            Ok(movement) => Some(movement),
            Err(err) => {
                debug!(error = %err, "ignoring unreadable movement");
                None
            }
        }
    }

    fn read_record(&self, name: &str) -> Option<SessionRecord> {
        let raw = self.read(name)?;
        match raw.parse() {
            Ok(record) => Some(record),
            Err(err) => {
                debug!(cookie = name, error = %err, "ignoring unreadable session");
                None
            }
        }
    }

    fn slot_records(&self) -> Vec<(u32, String)> {
        match self.env.store.entries() {
            Ok(entries) => entries
                .into_iter()
                .filter_map(|(name, value)| parse_slot_name(&name).map(|slot| (slot, value)))
                .collect(),
            Err(err) => {
                debug!(error = %err, "cookie listing failed");
                Vec::new()
            }
        }
    }

    fn write(&self, name: &str, value: &str, attributes: CookieAttributes) {
        if let Err(err) = self.env.store.set(name, value, attributes) {
            debug!(cookie = name, error = %err, "cookie write failed");
        }
    }

    fn write_movement(&self, movement: &MovementRecord) {
        let attributes = CookieAttributes::session(self.env.host.is_https());
        self.write(MOVEMENT_COOKIE, &movement.to_string(), attributes);
    }

    fn erase(&self, name: &str) {
        if let Err(err) = self.env.store.remove(name) {
            debug!(cookie = name, error = %err, "cookie removal failed");
        }
    }
}

impl RouteObserver for Rhythm {
    fn route_changed(&mut self, path: &str) {
        if !self.config.addons.spa {
            return;
        }
        self.ensure_session();
        if let Some(beat) = self.beat.as_mut() {
            beat.space(path);
        }
        self.save(false);
    }
}

/// Append the part of `memory` that `stored` lacks after its switch marker.
///
/// A suffix that starts inside a fold chain (`/`) becomes a plain time token,
/// since the action it folded into now sits before the marker.
fn merge_streams(stored: &str, memory: &str) -> String {
    let common = memory
        .char_indices()
        .zip(stored.chars())
        .find(|((_, a), b)| a != b)
        .map(|((i, _), _)| i)
        .unwrap_or_else(|| memory.len().min(stored.len()));
    let suffix = &memory[common..];
    let trimmed = suffix.trim_start_matches('/');
    if trimmed.len() == suffix.len() {
        format!("{stored}{suffix}")
    } else {
        format!("{stored}~{trimmed}")
    }
}
