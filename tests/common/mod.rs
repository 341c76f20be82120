#![allow(dead_code)]

use std::path::PathBuf;

use anyhow::Result;
use rsa::pkcs8::{EncodePrivateKey as _, LineEnding};
use secrecy::SecretString;
use tempfile::TempDir;

use qrauth_core::{
    catalog::{self, ProductRecord},
    config::StoreConfig,
    keys,
    store::Store,
};

pub struct Fixture {
    pub dir: TempDir,
    pub db_path: PathBuf,
    private_pem: String,
}

impl Fixture {
    pub fn private_pem(&self) -> SecretString {
        SecretString::new(self.private_pem.clone().into())
    }

    pub fn open(&self) -> Result<Store> {
        Ok(Store::open_existing(&self.db_path, &StoreConfig::default())?)
    }
}

pub fn demo_product() -> ProductRecord {
    ProductRecord {
        id: "demo-product-uuid".into(),
        barcode: Some("FIN123456789".into()),
        qr_code: None,
        batch_number: "B2024-001".into(),
        product_name: "Finolex PVC Pipe 4 inch".into(),
        manufacturing_date: Some("2024-01-15".into()),
        expiry_date: "2026-01-15".into(),
        distribution_locations: vec!["Mumbai".into(), "Pune".into()],
        issued: None,
    }
}

/// 1024-bit keys keep the suite fast; production keygen enforces 2048+.
pub fn test_key_pem() -> Result<String> {
    let key = rsa::RsaPrivateKey::new(&mut rand_core::OsRng, 1024)?;
    let pem = key.to_pkcs8_pem(LineEnding::LF)?;
    Ok(pem.as_str().to_owned())
}

pub fn secret(pem: &str) -> SecretString {
    SecretString::new(pem.to_owned().into())
}

/// File-backed store with the demo product and an active key.
pub fn fixture() -> Result<Fixture> {
    let dir = tempfile::tempdir()?;
    let db_path = dir.path().join("qrauth.db");
    let store = Store::create_new(&db_path, &StoreConfig::default())?;
    catalog::upsert_product(&store, &demo_product())?;
    let private_pem = test_key_pem()?;
    keys::provision_from_private_pem(&store, "primary_signing_key", &secret(&private_pem))?;
    Ok(Fixture {
        dir,
        db_path,
        private_pem,
    })
}
