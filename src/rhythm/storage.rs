//! Cookie store seam
//!
//! The session engine persists through [`CookieStore`], which the host backs
//! with `document.cookie` or anything equivalent. [`MemoryCookieJar`] is the
//! in-process implementation; clones share one jar, so several engines built
//! on clones of the same jar behave like tabs of one browser.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::ScoreError;

/// Attributes of a written cookie
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CookieAttributes {
    /// `None` makes a session cookie
    pub max_age_secs: Option<u64>,
    pub secure: bool,
}

impl CookieAttributes {
    pub fn session(secure: bool) -> Self {
        Self {
            max_age_secs: None,
            secure,
        }
    }

    pub fn persistent(max_age_secs: Option<u64>, secure: bool) -> Self {
        Self {
            max_age_secs,
            secure,
        }
    }

    /// `Set-Cookie` style suffix, e.g. `; Path=/; Max-Age=259200; SameSite=Lax`
    pub fn suffix(&self) -> String {
        let mut out = String::from("; Path=/");
        if let Some(age) = self.max_age_secs {
            out.push_str(&format!("; Max-Age={age}"));
        }
        out.push_str("; SameSite=Lax");
        if self.secure {
            out.push_str("; Secure");
        }
        out
    }
}

/// Name/value storage shared by every tab of a browsing context
pub trait CookieStore {
    fn get(&self, name: &str) -> Result<Option<String>, ScoreError>;

    fn set(&self, name: &str, value: &str, attributes: CookieAttributes)
        -> Result<(), ScoreError>;

    fn remove(&self, name: &str) -> Result<(), ScoreError>;

    /// All cookies in creation order
    fn entries(&self) -> Result<Vec<(String, String)>, ScoreError>;
}

#[derive(Debug, Default)]
struct JarState {
    cookies: Vec<(String, String, CookieAttributes)>,
    disabled: bool,
    /// Largest accepted `name=value` size in bytes
    quota: Option<usize>,
}

/// In-memory cookie jar
#[derive(Debug, Clone, Default)]
pub struct MemoryCookieJar {
    state: Rc<RefCell<JarState>>,
}

impl MemoryCookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every read and write, like a browser with cookies blocked
    pub fn disable(&self) {
        self.state.borrow_mut().disabled = true;
    }

    /// Reject writes whose `name=value` exceeds `bytes`
    pub fn set_quota(&self, bytes: usize) {
        self.state.borrow_mut().quota = Some(bytes);
    }

    pub fn attributes(&self, name: &str) -> Option<CookieAttributes> {
        self.state
            .borrow()
            .cookies
            .iter()
            .find(|(n, _, _)| n == name)
            .map(|(_, _, attributes)| *attributes)
    }

    /// The jar as a request `Cookie` header
    pub fn header(&self) -> String {
        self.state
            .borrow()
            .cookies
            .iter()
            .map(|(name, value, _)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ")
    }

    fn check(&self) -> Result<(), ScoreError> {
        if self.state.borrow().disabled {
            return Err(ScoreError::Storage("cookies are disabled".to_string()));
        }
        Ok(())
    }
}

impl CookieStore for MemoryCookieJar {
    fn get(&self, name: &str) -> Result<Option<String>, ScoreError> {
        self.check()?;
        Ok(self
            .state
            .borrow()
            .cookies
            .iter()
            .find(|(n, _, _)| n == name)
            .map(|(_, value, _)| value.clone()))
    }

    fn set(
        &self,
        name: &str,
        value: &str,
        attributes: CookieAttributes,
    ) -> Result<(), ScoreError> {
        self.check()?;
        let mut state = self.state.borrow_mut();
        if let Some(quota) = state.quota {
            let size = name.len() + 1 + value.len();
            if size > quota {
                return Err(ScoreError::Storage(format!(
                    "cookie '{name}' is {size} bytes, quota is {quota}"
                )));
            }
        }
        match state.cookies.iter_mut().find(|(n, _, _)| n == name) {
            Some(entry) => {
                entry.1 = value.to_string();
                entry.2 = attributes;
            }
            None => state
                .cookies
                .push((name.to_string(), value.to_string(), attributes)),
        }
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<(), ScoreError> {
        self.check()?;
        self.state.borrow_mut().cookies.retain(|(n, _, _)| n != name);
        Ok(())
    }

    fn entries(&self) -> Result<Vec<(String, String)>, ScoreError> {
        self.check()?;
        Ok(self
            .state
            .borrow()
            .cookies
            .iter()
            .map(|(name, value, _)| (name.clone(), value.clone()))
            .collect())
    }
}
