//! Host environment seams
//!
//! The session engine never touches a browser directly. Page facts, the
//! window-name slot memory and reloads come from [`Host`]; outgoing requests
//! go through [`Transport`]. In-memory implementations back the tests and
//! the demo.

use std::cell::RefCell;
use std::rc::Rc;

/// Page and window facts supplied by the embedding environment
pub trait Host {
    fn pathname(&self) -> String;
    fn hostname(&self) -> String;
    /// Scheme, host and port, e.g. `https://shop.example`
    fn origin(&self) -> String;
    fn referrer(&self) -> String;
    fn user_agent(&self) -> String;
    fn is_https(&self) -> bool;
    /// Per-tab name that survives reloads and navigations
    fn window_name(&self) -> String;
    fn set_window_name(&self, name: &str);
    /// Reload the page so upstream filters see a raised security level
    fn reload(&self);
}

/// Outgoing requests
pub trait Transport {
    /// Fire-and-forget POST of a flushed batch
    fn send_beacon(&self, url: &str, body: &str);
    /// HEAD ping the edge inspects; aborted after `abort_after_ms` when set
    fn refresh(&self, url: &str, abort_after_ms: Option<u64>);
}

/// Receives client-side route changes of single page applications
pub trait RouteObserver {
    fn route_changed(&mut self, path: &str);
}

#[derive(Debug, Clone, Default)]
struct PageState {
    pathname: String,
    hostname: String,
    referrer: String,
    user_agent: String,
    https: bool,
    window_name: String,
    reloads: u32,
}

/// In-memory [`Host`]. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryHost {
    state: Rc<RefCell<PageState>>,
}

impl MemoryHost {
    pub fn new(hostname: &str, pathname: &str) -> Self {
        let host = Self::default();
        {
            let mut state = host.state.borrow_mut();
            state.hostname = hostname.to_string();
            state.pathname = pathname.to_string();
            state.https = true;
            state.user_agent =
                "Mozilla/5.0 (X11; Linux x86_64) Gecko/20100101 Firefox/130.0".to_string();
        }
        host
    }

    pub fn with_user_agent(self, user_agent: &str) -> Self {
        self.state.borrow_mut().user_agent = user_agent.to_string();
        self
    }

    pub fn with_referrer(self, referrer: &str) -> Self {
        self.state.borrow_mut().referrer = referrer.to_string();
        self
    }

    /// Navigate within the tab; the window name is kept
    pub fn navigate(&self, pathname: &str) {
        self.state.borrow_mut().pathname = pathname.to_string();
    }

    /// A new tab of the same site: fresh window name, same page facts
    pub fn open_tab(&self, pathname: &str) -> Self {
        let mut state = self.state.borrow().clone();
        state.pathname = pathname.to_string();
        state.window_name = String::new();
        state.reloads = 0;
        Self {
            state: Rc::new(RefCell::new(state)),
        }
    }

    pub fn reloads(&self) -> u32 {
        self.state.borrow().reloads
    }
}

impl Host for MemoryHost {
    fn pathname(&self) -> String {
        self.state.borrow().pathname.clone()
    }

    fn hostname(&self) -> String {
        self.state.borrow().hostname.clone()
    }

    fn origin(&self) -> String {
        let state = self.state.borrow();
        let scheme = if state.https { "https" } else { "http" };
        format!("{scheme}://{}", state.hostname)
    }

    fn referrer(&self) -> String {
        self.state.borrow().referrer.clone()
    }

    fn user_agent(&self) -> String {
        self.state.borrow().user_agent.clone()
    }

    fn is_https(&self) -> bool {
        self.state.borrow().https
    }

    fn window_name(&self) -> String {
        self.state.borrow().window_name.clone()
    }

    fn set_window_name(&self, name: &str) {
        self.state.borrow_mut().window_name = name.to_string();
    }

    fn reload(&self) {
        self.state.borrow_mut().reloads += 1;
    }
}

/// A request issued through [`RecordingTransport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentRequest {
    Beacon { url: String, body: String },
    Refresh { url: String, abort_after_ms: Option<u64> },
}

/// [`Transport`] that records requests instead of sending them. Clones share
/// the log.
#[derive(Debug, Clone, Default)]
pub struct RecordingTransport {
    sent: Rc<RefCell<Vec<SentRequest>>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<SentRequest> {
        self.sent.borrow().clone()
    }

    pub fn beacons(&self) -> Vec<(String, String)> {
        self.sent
            .borrow()
            .iter()
            .filter_map(|r| match r {
                SentRequest::Beacon { url, body } => Some((url.clone(), body.clone())),
                SentRequest::Refresh { .. } => None,
            })
            .collect()
    }

    pub fn refreshes(&self) -> Vec<Option<u64>> {
        self.sent
            .borrow()
            .iter()
            .filter_map(|r| match r {
                SentRequest::Refresh { abort_after_ms, .. } => Some(*abort_after_ms),
                SentRequest::Beacon { .. } => None,
            })
            .collect()
    }
}

impl Transport for RecordingTransport {
    fn send_beacon(&self, url: &str, body: &str) {
        self.sent.borrow_mut().push(SentRequest::Beacon {
            url: url.to_string(),
            body: body.to_string(),
        });
    }

    fn refresh(&self, url: &str, abort_after_ms: Option<u64>) {
        self.sent.borrow_mut().push(SentRequest::Refresh {
            url: url.to_string(),
            abort_after_ms,
        });
    }
}
