//! Edge request routing
//!
//! Live pings (`HEAD /rhythm/?livestreaming`) are answered at the edge,
//! flushed batches (`POST /rhythm/echo`) are reassembled and archived, and
//! everything else goes to the origin.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::EdgeConfig;
use crate::edge::reassembler::reassemble;
use crate::edge::scan::{redact_cookies, respond_to_ping};
use crate::error::ScoreError;

/// Tracing target of archived journey lines, the input of the daily report
pub const ARCHIVE_TARGET: &str = "fullscore::archive";

/// The parts of an HTTP request the edge looks at
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeRequest {
    pub method: String,
    pub path: String,
    /// Raw query string without the leading `?`
    #[serde(default)]
    pub query: String,
    /// Raw `Cookie` header
    #[serde(default)]
    pub cookie: String,
    #[serde(default)]
    pub body: String,
}

impl EdgeRequest {
    pub fn new(method: &str, path: &str) -> Self {
        Self {
            method: method.to_string(),
            path: path.to_string(),
            ..Self::default()
        }
    }

    pub fn with_query(mut self, query: &str) -> Self {
        self.query = query.trim_start_matches('?').to_string();
        self
    }

    pub fn with_cookie(mut self, cookie: &str) -> Self {
        self.cookie = cookie.to_string();
        self
    }

    pub fn with_body(mut self, body: &str) -> Self {
        self.body = body.to_string();
        self
    }

    pub fn has_param(&self, name: &str) -> bool {
        self.query
            .split('&')
            .any(|pair| pair.split('=').next() == Some(name))
    }
}

/// What the edge answers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "response", rename_all = "snake_case")]
pub enum EdgeResponse {
    /// 204, nothing to change
    NoContent,
    /// 204 with a `Set-Cookie` header carrying the updated Movement record
    NoContentWithState { set_cookie: String },
    /// 200 for a batch; `archived` holds the line written to the archive log
    Accepted { archived: Option<String> },
    /// Not handled at the edge, forward to the origin
    PassThrough,
}

impl EdgeResponse {
    /// HTTP status, `None` when the origin answers
    pub fn status(&self) -> Option<u16> {
        match self {
            EdgeResponse::NoContent | EdgeResponse::NoContentWithState { .. } => Some(204),
            EdgeResponse::Accepted { .. } => Some(200),
            EdgeResponse::PassThrough => None,
        }
    }
}

/// Route one request
pub fn handle(request: &EdgeRequest, config: &EdgeConfig) -> Result<EdgeResponse, ScoreError> {
    if request.path == config.ping_path
        && request.method.eq_ignore_ascii_case("HEAD")
        && request.has_param("livestreaming")
    {
        if config.streaming.log {
            info!(cookies = %redact_cookies(&request.cookie, &config.streaming), "ping");
        }
        return Ok(respond_to_ping(&request.cookie, config));
    }

    if request.path == config.echo_path && request.method.eq_ignore_ascii_case("POST") {
        if !config.archiving.log {
            return Ok(EdgeResponse::Accepted { archived: None });
        }
        let archived = match reassemble(&request.body, config) {
            Some(journey) => {
                let line = journey.render(&config.archiving)?;
                info!(target: ARCHIVE_TARGET, "{line}");
                Some(line)
            }
            None => None,
        };
        return Ok(EdgeResponse::Accepted { archived });
    }

    Ok(EdgeResponse::PassThrough)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const BATCH: &str = "rhythm_1=2_17356800000_k3y9a0b1_0_0_1_2_95_!home~40*buy~55*buy";

    #[test]
    fn test_routes_ping() {
        let config = EdgeConfig::default();
        let cookie = format!(
            "movement=0000000000_17356800000_k3y9a0b1___1; rhythm_1=0_17356800000_k3y9a0b1_0_0_0_3_40_!home{}*go",
            "~1".repeat(12)
        );
        let request = EdgeRequest::new("HEAD", "/rhythm/")
            .with_query("?livestreaming")
            .with_cookie(&cookie);

        let response = handle(&request, &config).unwrap();
        assert!(matches!(response, EdgeResponse::NoContentWithState { .. }));

        // Same path without the marker parameter is not a ping
        let plain = EdgeRequest::new("HEAD", "/rhythm/").with_cookie(&cookie);
        assert_eq!(handle(&plain, &config).unwrap(), EdgeResponse::PassThrough);
    }

    #[test]
    fn test_routes_batch() {
        let config = EdgeConfig::default();
        let request = EdgeRequest::new("POST", "/rhythm/echo").with_body(BATCH);

        let response = handle(&request, &config).unwrap();
        assert_eq!(
            response,
            EdgeResponse::Accepted {
                archived: Some(
                    "_device:desktop_referrer:direct_scroll:1_click:2_duration:9.5_beat:!home~4.0*buy~5.5*buy"
                        .to_string()
                )
            }
        );
        assert_eq!(response.status(), Some(200));
    }

    #[test]
    fn test_archiving_disabled() {
        let mut config = EdgeConfig::default();
        config.archiving.log = false;
        let request = EdgeRequest::new("POST", "/rhythm/echo").with_body(BATCH);
        assert_eq!(
            handle(&request, &config).unwrap(),
            EdgeResponse::Accepted { archived: None }
        );
    }

    #[test]
    fn test_everything_else_passes_through() {
        let config = EdgeConfig::default();
        let request = EdgeRequest::new("GET", "/products");
        let response = handle(&request, &config).unwrap();
        assert_eq!(response, EdgeResponse::PassThrough);
        assert_eq!(response.status(), None);
    }

    #[test]
    fn test_has_param() {
        let request = EdgeRequest::new("HEAD", "/").with_query("a=1&livestreaming&b");
        assert!(request.has_param("livestreaming"));
        assert!(request.has_param("a"));
        assert!(!request.has_param("live"));
    }
}
