//! FFI bindings for Full Score
//!
//! This module provides C-compatible functions for running the edge
//! interpreter from other languages. All functions use C strings
//! (null-terminated), exchange JSON and return allocated memory that must be
//! freed by the caller using `fullscore_free_string`.

use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::ptr;

use crate::beat::decode;
use crate::config::{EdgeConfig, FullScoreConfig};
use crate::edge::{classify_stream, handle, reassemble, respond_to_ping, EdgeRequest};
use crate::error::ScoreError;

// Thread-local storage for the last error message
thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

fn set_last_error(msg: &str) {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = CString::new(msg).ok();
    });
}

fn clear_last_error() {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = None;
    });
}

/// Helper to convert C string to Rust string
unsafe fn cstr_to_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok().map(|s| s.to_string())
}

/// Helper to convert Rust string to C string (caller must free)
fn string_to_cstr(s: &str) -> *mut c_char {
    match CString::new(s) {
        Ok(cstr) => cstr.into_raw(),
        Err(_) => ptr::null_mut(),
    }
}

/// Hand a JSON result across the boundary, recording any error
fn json_result(result: Result<String, ScoreError>) -> *mut c_char {
    match result {
        Ok(json) => string_to_cstr(&json),
        Err(e) => {
            set_last_error(&e.to_string());
            ptr::null_mut()
        }
    }
}

// ============================================================================
// Stateless API (default configuration)
// ============================================================================

/// Decode a BEAT stream into a JSON array of events.
///
/// # Safety
/// - `stream` must be a valid null-terminated C string.
/// - Returns a newly allocated string that must be freed with `fullscore_free_string`.
/// - Returns NULL on error; call `fullscore_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn fullscore_decode(stream: *const c_char) -> *mut c_char {
    clear_last_error();

    let Some(stream) = cstr_to_string(stream) else {
        set_last_error("Invalid stream string pointer");
        return ptr::null_mut();
    };

    json_result(serde_json::to_string(&decode(&stream)).map_err(ScoreError::from))
}

/// Classify a BEAT stream, returning `{"bot": ..., "human": ...}`.
///
/// # Safety
/// - `stream` must be a valid null-terminated C string.
/// - Returns a newly allocated string that must be freed with `fullscore_free_string`.
/// - Returns NULL on error; call `fullscore_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn fullscore_classify(stream: *const c_char) -> *mut c_char {
    clear_last_error();

    let Some(stream) = cstr_to_string(stream) else {
        set_last_error("Invalid stream string pointer");
        return ptr::null_mut();
    };

    let config = EdgeConfig::default();
    let classification = classify_stream(&stream, config.resolution_ms, &config.classifier);
    json_result(serde_json::to_string(&classification).map_err(ScoreError::from))
}

/// Answer a live ping for a raw cookie header.
///
/// # Safety
/// - `cookie` must be a valid null-terminated C string.
/// - Returns a newly allocated string that must be freed with `fullscore_free_string`.
/// - Returns NULL on error; call `fullscore_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn fullscore_respond_to_ping(cookie: *const c_char) -> *mut c_char {
    clear_last_error();

    let Some(cookie) = cstr_to_string(cookie) else {
        set_last_error("Invalid cookie string pointer");
        return ptr::null_mut();
    };

    let response = respond_to_ping(&cookie, &EdgeConfig::default());
    json_result(serde_json::to_string(&response).map_err(ScoreError::from))
}

/// Reassemble a flushed batch body into an archived journey (`null` when skipped).
///
/// # Safety
/// - `body` must be a valid null-terminated C string.
/// - Returns a newly allocated string that must be freed with `fullscore_free_string`.
/// - Returns NULL on error; call `fullscore_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn fullscore_reassemble(body: *const c_char) -> *mut c_char {
    clear_last_error();

    let Some(body) = cstr_to_string(body) else {
        set_last_error("Invalid body string pointer");
        return ptr::null_mut();
    };

    let journey = reassemble(&body, &EdgeConfig::default());
    json_result(serde_json::to_string(&journey).map_err(ScoreError::from))
}

// ============================================================================
// Configured Edge API
// ============================================================================

/// Opaque handle to a configured edge interpreter
pub struct EdgeHandle {
    config: EdgeConfig,
}

/// Create an edge interpreter from a `FullScoreConfig` JSON document.
///
/// # Safety
/// - `config_json` must be a valid null-terminated C string, or NULL for defaults.
/// - Must be freed with `fullscore_edge_free`.
/// - Returns NULL on error; call `fullscore_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn fullscore_edge_new(config_json: *const c_char) -> *mut EdgeHandle {
    clear_last_error();

    let config = if config_json.is_null() {
        FullScoreConfig::default()
    } else {
        let Some(json) = cstr_to_string(config_json) else {
            set_last_error("Invalid config string pointer");
            return ptr::null_mut();
        };
        match FullScoreConfig::from_json(&json) {
            Ok(config) => config,
            Err(e) => {
                set_last_error(&e.to_string());
                return ptr::null_mut();
            }
        }
    };

    Box::into_raw(Box::new(EdgeHandle {
        config: config.edge,
    }))
}

/// Free an edge interpreter.
///
/// # Safety
/// - `edge` must be a valid pointer returned by `fullscore_edge_new`, or NULL.
/// - After calling this function, the pointer is invalid.
#[no_mangle]
pub unsafe extern "C" fn fullscore_edge_free(edge: *mut EdgeHandle) {
    if !edge.is_null() {
        drop(Box::from_raw(edge));
    }
}

/// Route one request (`EdgeRequest` JSON) and return the `EdgeResponse` JSON.
///
/// # Safety
/// - `edge` must be a valid pointer returned by `fullscore_edge_new`.
/// - `request_json` must be a valid null-terminated C string.
/// - Returns a newly allocated string that must be freed with `fullscore_free_string`.
/// - Returns NULL on error; call `fullscore_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn fullscore_edge_handle(
    edge: *const EdgeHandle,
    request_json: *const c_char,
) -> *mut c_char {
    clear_last_error();

    if edge.is_null() {
        set_last_error("Null edge pointer");
        return ptr::null_mut();
    }
    let edge = &*edge;

    let Some(json) = cstr_to_string(request_json) else {
        set_last_error("Invalid request string pointer");
        return ptr::null_mut();
    };

    json_result(handle_json(&json, &edge.config))
}

fn handle_json(json: &str, config: &EdgeConfig) -> Result<String, ScoreError> {
    let request: EdgeRequest = serde_json::from_str(json)?;
    let response = handle(&request, config)?;
    Ok(serde_json::to_string(&response)?)
}

// ============================================================================
// Memory Management
// ============================================================================

/// Free a string returned by Full Score functions.
///
/// # Safety
/// - `ptr` must be a valid pointer returned by a Full Score function, or NULL.
/// - After calling this function, the pointer is invalid.
#[no_mangle]
pub unsafe extern "C" fn fullscore_free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(CString::from_raw(ptr));
    }
}

// ============================================================================
// Error Handling
// ============================================================================

/// Get the last error message.
///
/// # Safety
/// - Returns a pointer to a thread-local error string.
/// - The returned pointer is valid until the next Full Score call on this thread.
/// - Do NOT free the returned pointer.
/// - Returns NULL if no error occurred.
#[no_mangle]
pub unsafe extern "C" fn fullscore_last_error() -> *const c_char {
    LAST_ERROR.with(|e| match &*e.borrow() {
        Some(cstr) => cstr.as_ptr(),
        None => ptr::null(),
    })
}

/// Get the library version.
///
/// # Safety
/// - Returns a pointer to a static string. Do NOT free.
#[no_mangle]
pub unsafe extern "C" fn fullscore_version() -> *const c_char {
    static VERSION: &[u8] = concat!(env!("CARGO_PKG_VERSION"), "\0").as_bytes();
    VERSION.as_ptr() as *const c_char
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    unsafe fn take(ptr: *mut c_char) -> String {
        assert!(!ptr.is_null());
        let s = CStr::from_ptr(ptr).to_str().unwrap().to_string();
        fullscore_free_string(ptr);
        s
    }

    #[test]
    fn test_ffi_decode() {
        let stream = CString::new("!home~12*buy").unwrap();
        unsafe {
            let json = take(fullscore_decode(stream.as_ptr()));
            let events: serde_json::Value = serde_json::from_str(&json).unwrap();
            assert_eq!(events.as_array().unwrap().len(), 2);
            assert!(json.contains("\"buy\""));
        }
    }

    #[test]
    fn test_ffi_classify() {
        let bursty = format!("!home{}*go", "~1".repeat(12));
        let stream = CString::new(bursty).unwrap();
        unsafe {
            let json = take(fullscore_classify(stream.as_ptr()));
            assert!(json.contains("\"signature\":\"burst\""));
            assert!(json.contains("\"human\":null"));
        }
    }

    #[test]
    fn test_ffi_ping_and_reassemble() {
        let cookie = CString::new(
            "movement=0000000000_17356800000_k3y9a0b1___1; rhythm_1=0_17356800000_k3y9a0b1_0_0_0_1_40_!home~40*buy",
        )
        .unwrap();
        let body =
            CString::new("rhythm_1=2_17356800000_k3y9a0b1_0_0_0_1_40_!home~40*buy").unwrap();
        unsafe {
            let response = take(fullscore_respond_to_ping(cookie.as_ptr()));
            assert_eq!(response, r#"{"response":"no_content"}"#);

            let journey = take(fullscore_reassemble(body.as_ptr()));
            assert!(journey.contains("\"beat\":\"!home~4.0*buy\""));
        }
    }

    #[test]
    fn test_ffi_edge_lifecycle() {
        let config = CString::new(r#"{"edge": {"archiving": {"ndjson": true}}}"#).unwrap();
        let request = CString::new(
            r#"{"method": "POST", "path": "/rhythm/echo", "body": "rhythm_1=2_17356800000_k3y9a0b1_0_0_0_1_40_!home~40*buy"}"#,
        )
        .unwrap();
        unsafe {
            let edge = fullscore_edge_new(config.as_ptr());
            assert!(!edge.is_null());

            let response = take(fullscore_edge_handle(edge, request.as_ptr()));
            assert!(response.starts_with(r#"{"response":"accepted","archived":"{"#));

            fullscore_edge_free(edge);

            let defaults = fullscore_edge_new(ptr::null());
            assert!(!defaults.is_null());
            fullscore_edge_free(defaults);
        }
    }

    #[test]
    fn test_ffi_error_handling() {
        let bad_config = CString::new(r#"{"beat": {"resolution_ms": 0}}"#).unwrap();
        let bad_request = CString::new("not json").unwrap();
        unsafe {
            assert!(fullscore_edge_new(bad_config.as_ptr()).is_null());
            let error = fullscore_last_error();
            assert!(!error.is_null());
            assert!(!CStr::from_ptr(error).to_str().unwrap().is_empty());

            let edge = fullscore_edge_new(ptr::null());
            assert!(fullscore_edge_handle(edge, bad_request.as_ptr()).is_null());
            assert!(!fullscore_last_error().is_null());
            fullscore_edge_free(edge);

            assert!(fullscore_decode(ptr::null()).is_null());
        }
    }

    #[test]
    fn test_ffi_version() {
        unsafe {
            let version = fullscore_version();
            assert!(!version.is_null());
            let version_str = CStr::from_ptr(version).to_str().unwrap();
            assert!(!version_str.is_empty());
        }
    }
}
