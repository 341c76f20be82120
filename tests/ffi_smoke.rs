mod common;

use std::ffi::CString;
use std::ptr;

use anyhow::Result;
use tempfile::tempdir;

use qrauth_core::ffi::{
    qrauth_free_string, qrauth_init_store, qrauth_issue, qrauth_last_error, qrauth_verify,
    qrauth_verify_legacy, qrauth_version,
};

unsafe fn take_string(ptr: *mut std::os::raw::c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    let s = unsafe { std::ffi::CStr::from_ptr(ptr) }
        .to_str()
        .unwrap_or_default()
        .to_string();
    unsafe { qrauth_free_string(ptr) };
    s
}

fn last_error() -> String {
    let len = unsafe { qrauth_last_error(ptr::null_mut(), 0) };
    let mut buf = vec![0u8; usize::try_from(len).unwrap_or(0)];
    unsafe { qrauth_last_error(buf.as_mut_ptr(), buf.len()) };
    String::from_utf8_lossy(&buf).trim_end_matches('\0').to_string()
}

#[test]
fn ffi_version_and_init() -> Result<()> {
    let mut out = ptr::null_mut();
    let code = unsafe { qrauth_version(&mut out) };
    assert_eq!(code, 0);
    let json = unsafe { take_string(out) };
    assert!(json.contains("version"));

    let dir = tempdir()?;
    let db_path = dir.path().join("ffi_smoke.db");
    let db_c = CString::new(db_path.to_string_lossy().to_string())?;
    let mut out2 = ptr::null_mut();
    let code = unsafe { qrauth_init_store(db_c.as_ptr(), &mut out2) };
    assert_eq!(code, 0);
    let json2: serde_json::Value = serde_json::from_str(&unsafe { take_string(out2) })?;
    assert_eq!(json2["status"], "ok");
    assert!(db_path.exists());
    Ok(())
}

#[test]
fn ffi_null_arguments_are_invalid() {
    let mut out = ptr::null_mut();
    let code = unsafe { qrauth_verify(ptr::null(), ptr::null(), &mut out) };
    assert_eq!(code, -1);
    assert!(out.is_null());
    assert!(last_error().contains("db_path"));
}

#[test]
fn ffi_issue_and_verify() -> Result<()> {
    let fx = common::fixture()?;
    let pem_path = fx.dir.path().join("signing_key.pem");
    {
        use secrecy::ExposeSecret as _;
        std::fs::write(&pem_path, fx.private_pem().expose_secret())?;
    }
    let db_c = CString::new(fx.db_path.to_string_lossy().to_string())?;
    let pem_c = CString::new(pem_path.to_string_lossy().to_string())?;

    let issue_req = CString::new(r#"{"productId":"demo-product-uuid","batchNumber":"B9"}"#)?;
    let mut out = ptr::null_mut();
    let code = unsafe { qrauth_issue(db_c.as_ptr(), pem_c.as_ptr(), issue_req.as_ptr(), &mut out) };
    assert_eq!(code, 0, "{}", last_error());
    let issued: serde_json::Value = serde_json::from_str(&unsafe { take_string(out) })?;
    assert_eq!(issued["qrData"]["batch"], "B9");

    let verify_req = serde_json::json!({
        "qrData": issued["qrData"],
        "signature": issued["signature"],
        "deviceId": "ffi-device",
    });
    let verify_c = CString::new(verify_req.to_string())?;
    for expected in ["first_use", "reused"] {
        let mut out = ptr::null_mut();
        let code = unsafe { qrauth_verify(db_c.as_ptr(), verify_c.as_ptr(), &mut out) };
        assert_eq!(code, 0);
        let resp: serde_json::Value = serde_json::from_str(&unsafe { take_string(out) })?;
        assert_eq!(resp["status"], expected);
    }

    // Business failures come back as JSON with status 0.
    let malformed = CString::new(r#"{"qrData":{"ts":1},"signature":"c2ln","deviceId":"d"}"#)?;
    let mut out = ptr::null_mut();
    let code = unsafe { qrauth_verify(db_c.as_ptr(), malformed.as_ptr(), &mut out) };
    assert_eq!(code, 0);
    let resp: serde_json::Value = serde_json::from_str(&unsafe { take_string(out) })?;
    assert_eq!(resp["status"], "error");
    Ok(())
}

#[test]
fn ffi_legacy_verify_and_error_codes() -> Result<()> {
    let fx = common::fixture()?;
    let db_c = CString::new(fx.db_path.to_string_lossy().to_string())?;

    let req = CString::new(
        serde_json::json!({
            "barcode": "FIN123456789",
            "captcha_token": "captcha-ok",
            "user_consents": {"basicVerification": true},
            "ip_address": "203.0.113.80"
        })
        .to_string(),
    )?;
    let mut out = ptr::null_mut();
    let code = unsafe { qrauth_verify_legacy(db_c.as_ptr(), req.as_ptr(), &mut out) };
    assert_eq!(code, 0, "{}", last_error());
    let resp: serde_json::Value = serde_json::from_str(&unsafe { take_string(out) })?;
    assert_eq!(resp["status"], "genuine");

    let no_captcha = CString::new(r#"{"barcode":"FIN123456789"}"#)?;
    let mut out = ptr::null_mut();
    let code = unsafe { qrauth_verify_legacy(db_c.as_ptr(), no_captcha.as_ptr(), &mut out) };
    assert_eq!(code, -1);
    assert!(last_error().contains("CAPTCHA"));

    let missing_db = CString::new(fx.dir.path().join("absent.db").to_string_lossy().to_string())?;
    let mut out = ptr::null_mut();
    let code = unsafe { qrauth_verify_legacy(missing_db.as_ptr(), req.as_ptr(), &mut out) };
    assert_eq!(code, -6);
    Ok(())
}
