//! RHYTHM session store
//!
//! Multiplexes the tabs of one browsing context into a single ordered stream
//! kept in cookies: slot allocation, capacity rotation, cross-tab stitching
//! and the flush policy that hands finished sessions to the edge.

pub mod host;
pub mod session;
pub mod storage;
pub mod tempo;

pub use host::{Host, MemoryHost, RecordingTransport, RouteObserver, SentRequest, Transport};
pub use session::{
    Environment, Rhythm, SettleCheck, TabState, Visibility, BLUR_WINDOW_MS, MOVEMENT_COOKIE,
    WAF_COOKIE,
};
pub use storage::{CookieAttributes, CookieStore, MemoryCookieJar};
pub use tempo::{GestureEvent, InputMode, TapDecision, TapGate};
