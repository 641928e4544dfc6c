//! Full Score - BEAT token streams, cross-tab sessions and the edge interpreter
//!
//! Full Score records a browsing session as a compact BEAT stream, keeps the
//! streams of every open tab in a handful of cookies, and interprets them at
//! the edge: live bot/human classification on pings and journey reassembly on
//! flush.
//!
//! ## Modules
//!
//! - **beat**: Token grammar, incremental encoder and decoder
//! - **rhythm**: Per-tab session engine over a shared cookie store
//! - **edge**: Classifier, ping scanner, batch reassembler and daily report

pub mod beat;
pub mod clock;
pub mod config;
pub mod edge;
pub mod error;
pub mod record;
pub mod rhythm;

// FFI bindings for C interop (always available for cdylib/staticlib builds)
pub mod ffi;

pub use beat::{decode, ActionTarget, Beat, Event};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::FullScoreConfig;
pub use edge::{classify_stream, handle, reassemble, respond_to_ping, ArchivedJourney, EdgeResponse};
pub use error::ScoreError;
pub use record::{MovementRecord, SessionRecord};
pub use rhythm::{Environment, Rhythm};

/// Library version
pub const FULLSCORE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Producer name reported by the CLI
pub const PRODUCER_NAME: &str = "fullscore";
