mod common;

use std::path::PathBuf;

use anyhow::Result;

use qrauth_core::{
    api::{self, VerifyRequest, VerifyResponse},
    audit, catalog,
    config::StoreConfig,
    error::{ErrorKind, FfiErrorCode, QrAuthError},
    keys::{PrivateKeySource, StoreKeyProvider},
    payload::{self, QrData, SignedPayload},
    signing,
    store::Store,
    verify::{self, ScanContext},
};

fn unsigned_payload() -> SignedPayload {
    SignedPayload {
        data: QrData {
            id: "FIN123456789".into(),
            product_id: "demo-product-uuid".into(),
            batch: "B1".into(),
            name: "Finolex PVC Pipe 4 inch".into(),
            ts: 1_736_900_000,
            exp: "2026-01-15".into(),
        },
        signature: "c2lnbmF0dXJl".into(),
    }
}

fn ctx() -> ScanContext {
    ScanContext {
        device_id: "dev-1".into(),
        ..ScanContext::default()
    }
}

#[test]
fn verification_without_active_key_fails_closed() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Store::create_new(&dir.path().join("qrauth.db"), &StoreConfig::default())?;

    let err = verify::verify(&store, &StoreKeyProvider::public_only(&store), &unsigned_payload(), &ctx())
        .unwrap_err();
    assert!(matches!(err, QrAuthError::KeyNotFound(_)));
    assert_eq!(FfiErrorCode::from(&err), FfiErrorCode::KeyNotFound);
    assert!(!err.is_retryable());
    assert!(audit::list_scan_attempts(&store, "FIN123456789")?.is_empty());

    // Through the handler the fault is an error status, never a verdict.
    let req: VerifyRequest = serde_json::from_value(serde_json::json!({
        "qrData": unsigned_payload().data,
        "signature": "c2lnbmF0dXJl",
        "deviceId": "dev-1",
    }))?;
    let resp = api::handle_verify(&store, &StoreKeyProvider::public_only(&store), &req);
    assert_eq!(resp.status(), "error");
    Ok(())
}

#[test]
fn issuance_without_active_key_is_configuration_error() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Store::create_new(&dir.path().join("qrauth.db"), &StoreConfig::default())?;
    catalog::upsert_product(&store, &common::demo_product())?;
    let pem = common::test_key_pem()?;
    let keys = StoreKeyProvider::with_private_key(&store, PrivateKeySource::Pem(common::secret(&pem)));

    let err = signing::issue(&store, &keys, "demo-product-uuid", None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    Ok(())
}

#[test]
fn malformed_payloads_are_rejected_before_crypto() -> Result<()> {
    let fx = common::fixture()?;
    let store = fx.open()?;
    let verifier = StoreKeyProvider::public_only(&store);

    for text in [
        "",
        "not json",
        r#"{"data":{"id":"FIN123456789"},"sig":"c2ln"}"#,
        r#"{"data":{"id":"FIN123456789","productId":"p","batch":"b","name":"n","ts":1,"exp":"e"}}"#,
        r#"{"data":{"id":"","productId":"p","batch":"b","name":"n","ts":1,"exp":"e"},"sig":"c2ln"}"#,
        r#"{"data":{"id":"FIN123456789","productId":"p","batch":"b","name":"n","ts":"1","exp":"e"},"sig":"c2ln"}"#,
    ] {
        assert!(
            matches!(payload::parse_qr_payload(text), Err(QrAuthError::MalformedInput(_))),
            "{text:?}"
        );
    }

    for body in [
        serde_json::json!({"qrData": "FIN123456789", "signature": "c2ln", "deviceId": "d"}),
        serde_json::json!({"qrData": {"ts": 1}, "signature": "c2ln", "deviceId": "d"}),
        serde_json::json!({"qrData": unsigned_payload().data, "deviceId": "d"}),
        serde_json::json!({"qrData": unsigned_payload().data, "signature": "c2ln"}),
    ] {
        let req: VerifyRequest = serde_json::from_value(body)?;
        match api::handle_verify(&store, &verifier, &req) {
            VerifyResponse::Error { message } => assert!(message.starts_with("Verification failed: malformed input")),
            other => panic!("expected error, got {other:?}"),
        }
    }
    assert!(audit::list_scan_attempts(&store, "FIN123456789")?.is_empty());
    Ok(())
}

#[test]
fn oversized_context_field_is_rejected() -> Result<()> {
    let fx = common::fixture()?;
    let store = fx.open()?;
    let mut c = ctx();
    c.user_agent = Some("x".repeat(10_000));
    let err = verify::verify(&store, &StoreKeyProvider::public_only(&store), &unsigned_payload(), &c)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedInput);
    Ok(())
}

#[test]
fn corrupt_store_is_retryable_storage_error() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("qrauth.db");
    std::fs::write(&path, vec![0xA5u8; 8192])?;

    let err = Store::open_existing(&path, &StoreConfig::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Storage);
    assert!(err.is_retryable());
    assert_eq!(FfiErrorCode::from(&err), FfiErrorCode::StorageError);

    let missing = Store::open_existing(&dir.path().join("absent.db"), &StoreConfig::default()).unwrap_err();
    assert_eq!(missing.kind(), ErrorKind::Storage);
    Ok(())
}

#[test]
fn missing_private_key_file_is_configuration_error() -> Result<()> {
    let fx = common::fixture()?;
    let store = fx.open()?;
    let keys = StoreKeyProvider::with_private_key(
        &store,
        PrivateKeySource::PemFile(PathBuf::from("/nonexistent/signing_key.pem")),
    );
    let err = signing::issue(&store, &keys, "demo-product-uuid", None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(!err.to_string().contains("/nonexistent"));

    let public_only = StoreKeyProvider::public_only(&store);
    let err = signing::issue(&store, &public_only, "demo-product-uuid", None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    Ok(())
}

#[test]
fn unknown_product_cannot_be_issued() -> Result<()> {
    let fx = common::fixture()?;
    let store = fx.open()?;
    let keys = StoreKeyProvider::with_private_key(&store, PrivateKeySource::Pem(fx.private_pem()));
    let err = signing::issue(&store, &keys, "no-such-product", None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = signing::issue(&store, &keys, "bad id with spaces", None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedInput);
    Ok(())
}

#[test]
fn csv_without_required_headers_is_rejected() -> Result<()> {
    let fx = common::fixture()?;
    let store = fx.open()?;
    let csv = fx.dir.path().join("products.csv");
    std::fs::write(&csv, "id,barcode,product_name\np1,BC1,Pipe\n")?;
    let err = catalog::import_products_csv(&store, &csv).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedInput);
    assert!(err.to_string().contains("batch_number"));
    Ok(())
}
