//! Tap gate
//!
//! Collapses the several native events a single tap produces into one
//! forwarded click. Desktop forwards the first click of each pointer or key
//! gesture. Touch forwards on touch end unless the finger moved, then swallows
//! the native click the browser synthesizes afterwards.

/// Input environment of the page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    Pointer,
    Touch,
}

/// Raw input events the host relays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GestureEvent<'a> {
    MouseDown,
    KeyDown { key: &'a str, repeat: bool },
    Click { trusted: bool },
    TouchStart,
    TouchMove,
    TouchCancel,
    /// `has_point` is false when the event carries no changed touch
    TouchEnd { has_point: bool },
}

/// What the host should do with an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapDecision {
    /// Let the event through untouched
    Ignore,
    /// Hand the target to the session engine
    Forward,
    /// Cancel the native click, it was already forwarded on touch end
    BlockNative,
}

/// Per-page gate with an init-once guard
#[derive(Debug, Clone)]
pub struct TapGate {
    mode: InputMode,
    attached: bool,
    used: bool,
    moved: bool,
    block_pending: bool,
}

impl TapGate {
    pub fn new(mode: InputMode) -> Self {
        Self {
            mode,
            attached: false,
            used: false,
            moved: false,
            block_pending: false,
        }
    }

    /// Arm the gate. Returns false if it was already armed.
    pub fn attach(&mut self) -> bool {
        if self.attached {
            return false;
        }
        self.attached = true;
        true
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn mode(&self) -> InputMode {
        self.mode
    }

    pub fn handle(&mut self, event: GestureEvent<'_>) -> TapDecision {
        if !self.attached {
            return TapDecision::Ignore;
        }
        match self.mode {
            InputMode::Pointer => self.handle_pointer(event),
            InputMode::Touch => self.handle_touch(event),
        }
    }

    fn handle_pointer(&mut self, event: GestureEvent<'_>) -> TapDecision {
        match event {
            GestureEvent::MouseDown => self.used = false,
            GestureEvent::KeyDown { key, repeat } => {
                if !repeat && (key == "Enter" || key == " ") {
                    self.used = false;
                }
            }
            GestureEvent::Click { .. } if !self.used => {
                self.used = true;
                return TapDecision::Forward;
            }
            _ => {}
        }
        TapDecision::Ignore
    }

    fn handle_touch(&mut self, event: GestureEvent<'_>) -> TapDecision {
        match event {
            GestureEvent::TouchStart => {
                self.moved = false;
                self.block_pending = false;
            }
            GestureEvent::TouchMove | GestureEvent::TouchCancel => self.moved = true,
            GestureEvent::TouchEnd { has_point } if has_point && !self.moved => {
                self.block_pending = true;
                return TapDecision::Forward;
            }
            GestureEvent::Click { trusted: true } if self.block_pending => {
                self.block_pending = false;
                return TapDecision::BlockNative;
            }
            _ => {}
        }
        TapDecision::Ignore
    }
}
