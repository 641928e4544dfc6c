//! BEAT token codec
//!
//! A flat, left-to-right stream of single-character tagged tokens describing
//! who/when/where/what/how/why of a browsing session. Encoding is incremental
//! and append-only; decoding is a single forward scan.

pub mod decoder;
pub mod encoder;
pub mod token;

pub use decoder::{auto_action_depth, decode, Event, Tail, TimingProfile};
pub use encoder::{space_code, ActionTarget, Beat};
pub use token::{scan, split_tab_switches, trailing_tab_switch, RawToken, Scanner, Tag};
