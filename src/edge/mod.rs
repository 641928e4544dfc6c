//! Edge interpreter
//!
//! Stateless functions run next to the site: live ping classification,
//! batch reassembly for the archive, and the daily archive report.

pub mod classifier;
pub mod reassembler;
pub mod report;
pub mod router;
pub mod scan;

pub use classifier::{classify_bot, classify_human, classify_stream, BotSignature, Classification};
pub use reassembler::{reassemble, ArchivedJourney};
pub use report::{day_start_ms, ndjson_report, DailyReport, LogEntry};
pub use router::{handle, EdgeRequest, EdgeResponse, ARCHIVE_TARGET};
pub use scan::{redact_cookies, respond_to_ping, scan, PingScan};
