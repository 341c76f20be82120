//! C-ABI FFI exports for the qrauth shared library.
//!
//! Every function returns an `i32` status code (0 = success, negative = error,
//! see [`FfiErrorCode`]).  Output is returned as JSON via a `*mut *mut c_char`
//! parameter; the caller must free the string with [`qrauth_free_string`].
//! Detailed error messages are available via [`qrauth_last_error`].
//!
//! Each call opens its own store connection; nothing is shared between calls.
//!
//! # Safety
//! All functions that accept raw pointers are `unsafe`.  Callers must ensure
//! that string pointers are valid, null-terminated UTF-8.

#![allow(unsafe_code)]

use std::cell::RefCell;
use std::ffi::{c_char, c_int, CStr, CString};
use std::path::{Path, PathBuf};

use crate::api::{self, IssueRequest, VerifyRequest};
use crate::config::QrAuthConfig;
use crate::error::{FfiErrorCode, QrAuthError, Result, ResultExt as _};
use crate::keys::{PrivateKeySource, StoreKeyProvider};
use crate::legacy::{self, LegacyVerifyRequest};
use crate::risk::RiskEngine;
use crate::store::Store;
use crate::util;

// ---------------------------------------------------------------------------
// Thread-local last error
// ---------------------------------------------------------------------------

thread_local! {
    static LAST_ERROR: RefCell<CString> = RefCell::new(CString::default());
}

fn set_last_error(msg: &str) {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = CString::new(msg.replace('\0', " ")).unwrap_or_default();
    });
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

unsafe fn ptr_to_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(ptr) }.to_str().ok()
}

fn string_to_ptr(s: String) -> *mut c_char {
    CString::new(s.replace('\0', " "))
        .unwrap_or_default()
        .into_raw()
}

fn write_out(out: *mut *mut c_char, val: String) {
    if !out.is_null() {
        unsafe { *out = string_to_ptr(val) };
    }
}

/// Run `body`, catch panics, map errors to FFI codes.
fn ffi_run(
    out: *mut *mut c_char,
    body: impl FnOnce() -> Result<String> + std::panic::UnwindSafe,
) -> c_int {
    match std::panic::catch_unwind(body) {
        Ok(Ok(json)) => {
            write_out(out, json);
            FfiErrorCode::Ok as c_int
        }
        Ok(Err(e)) => {
            let code = FfiErrorCode::from(&e) as c_int;
            set_last_error(&e.to_string());
            code
        }
        Err(_) => {
            set_last_error("internal panic");
            FfiErrorCode::InternalError as c_int
        }
    }
}

fn required_arg<'a>(ptr: *const c_char, name: &str) -> Result<&'a str> {
    unsafe { ptr_to_str(ptr) }
        .ok_or_else(|| QrAuthError::MalformedInput(format!("{name} is null or not UTF-8")))
}

/// Config from the standard search order plus environment overrides.
fn load_config() -> Result<QrAuthConfig> {
    let mut cfg = QrAuthConfig::load(None)?;
    cfg.apply_env();
    Ok(cfg)
}

fn open_store(db: &str, cfg: &QrAuthConfig) -> Result<Store> {
    let path = Path::new(db);
    util::validate_path(path, "db")?;
    Store::open_existing(path, &cfg.store)
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| QrAuthError::Other(format!("serialize output: {e}")))
}

// ---------------------------------------------------------------------------
// Public FFI functions
// ---------------------------------------------------------------------------

/// Retrieve the last error message.  Returns the number of bytes written
/// (including the null terminator).  If `buf` is null or `buf_len` is 0,
/// returns the required buffer size.
#[no_mangle]
pub unsafe extern "C" fn qrauth_last_error(buf: *mut u8, buf_len: usize) -> c_int {
    LAST_ERROR.with(|e| {
        let msg = e.borrow();
        let bytes = msg.as_bytes_with_nul();
        if buf.is_null() || buf_len == 0 {
            return bytes.len() as c_int;
        }
        let copy_len = bytes.len().min(buf_len);
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), buf, copy_len) };
        if copy_len < bytes.len() {
            // Ensure null termination.
            unsafe { *buf.add(copy_len - 1) = 0 };
        }
        copy_len as c_int
    })
}

/// Free a string previously returned by a `qrauth_*` function.
#[no_mangle]
pub unsafe extern "C" fn qrauth_free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        unsafe {
            drop(CString::from_raw(ptr));
        }
    }
}

/// Return the library version as a JSON string.
#[no_mangle]
pub unsafe extern "C" fn qrauth_version(out_json: *mut *mut c_char) -> c_int {
    ffi_run(out_json, || {
        let info = serde_json::json!({
            "version": util::VERSION,
            "git_hash": util::GIT_HASH,
            "build_ts": util::BUILD_TS,
        });
        Ok(info.to_string())
    })
}

/// Create a new store database.
#[no_mangle]
pub unsafe extern "C" fn qrauth_init_store(
    db_path: *const c_char,
    out_json: *mut *mut c_char,
) -> c_int {
    ffi_run(out_json, || {
        let db = required_arg(db_path, "db_path")?;
        util::validate_path(Path::new(db), "db")?;
        let cfg = load_config()?;
        let store = Store::create_new(Path::new(db), &cfg.store)?;
        let info = serde_json::json!({
            "status": "ok",
            "schema_version": store.schema_version()?,
        });
        Ok(info.to_string())
    })
}

/// Issue a signed QR payload.
///
/// `request_json` is `{"productId": .., "batchNumber": ..}`.  The private
/// key is read from `private_key_pem_path`, or from `QRAUTH_RSA_PRIVATE_KEY`
/// when the path is null.
#[no_mangle]
pub unsafe extern "C" fn qrauth_issue(
    db_path: *const c_char,
    private_key_pem_path: *const c_char,
    request_json: *const c_char,
    out_json: *mut *mut c_char,
) -> c_int {
    ffi_run(out_json, || {
        let db = required_arg(db_path, "db_path")?;
        let req_text = required_arg(request_json, "request_json")?;
        let req: IssueRequest = serde_json::from_str(req_text).ctx_input("issue request")?;

        let mut cfg = load_config()?;
        let source = match unsafe { ptr_to_str(private_key_pem_path) } {
            Some(p) => {
                util::validate_path(Path::new(p), "private key")?;
                PrivateKeySource::PemFile(PathBuf::from(p))
            }
            None => cfg
                .keys
                .private_key_pem_inline
                .take()
                .map(PrivateKeySource::Pem)
                .ok_or_else(|| QrAuthError::Configuration("private key not configured".into()))?,
        };

        let store = open_store(db, &cfg)?;
        let keys = StoreKeyProvider::with_private_key(&store, source);
        to_json(&api::handle_issue(&store, &keys, &req)?)
    })
}

/// Verify a signed QR payload.  Business outcomes (including
/// `signature_invalid` and `error`) are returned as JSON with status 0;
/// a non-zero code means the call itself could not run.
#[no_mangle]
pub unsafe extern "C" fn qrauth_verify(
    db_path: *const c_char,
    request_json: *const c_char,
    out_json: *mut *mut c_char,
) -> c_int {
    ffi_run(out_json, || {
        let db = required_arg(db_path, "db_path")?;
        let req_text = required_arg(request_json, "request_json")?;
        let req: VerifyRequest = serde_json::from_str(req_text).ctx_input("verify request")?;

        let cfg = load_config()?;
        let store = open_store(db, &cfg)?;
        let keys = StoreKeyProvider::public_only(&store);
        to_json(&api::handle_verify(&store, &keys, &req))
    })
}

/// Legacy verification of a printed barcode / plain QR code.  Rate-limited
/// callers get [`FfiErrorCode::RateLimited`].
#[no_mangle]
pub unsafe extern "C" fn qrauth_verify_legacy(
    db_path: *const c_char,
    request_json: *const c_char,
    out_json: *mut *mut c_char,
) -> c_int {
    ffi_run(out_json, || {
        let db = required_arg(db_path, "db_path")?;
        let req_text = required_arg(request_json, "request_json")?;
        let req: LegacyVerifyRequest =
            serde_json::from_str(req_text).ctx_input("legacy verify request")?;

        let cfg = load_config()?;
        let engine = RiskEngine::new(&cfg.risk)?;
        let store = open_store(db, &cfg)?;
        to_json(&legacy::verify_legacy(&store, &engine, &req)?)
    })
}
