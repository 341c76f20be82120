//! Shared fixtures for unit tests.

use rsa::pkcs8::{EncodePrivateKey as _, LineEnding};
use rsa::RsaPrivateKey;
use secrecy::SecretString;

use crate::catalog::{self, ProductRecord};
use crate::keys;
use crate::store::Store;

/// 1024-bit keys keep the unit tests fast.
pub(crate) fn small_key() -> RsaPrivateKey {
    RsaPrivateKey::new(&mut rand_core::OsRng, 1024).unwrap()
}

pub(crate) fn pem_secret(key: &RsaPrivateKey) -> SecretString {
    let pem = key.to_pkcs8_pem(LineEnding::LF).unwrap();
    SecretString::new(pem.as_str().to_owned().into())
}

pub(crate) fn demo_product() -> ProductRecord {
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

/// In-memory store with the demo product and a freshly provisioned key.
/// Returns the private key PEM for issuers.
pub(crate) fn keyed_store_with_demo_product() -> (Store, SecretString) {
    let store = Store::open_in_memory().unwrap();
    catalog::upsert_product(&store, &demo_product()).unwrap();
    let pem = pem_secret(&small_key());
    keys::provision_from_private_pem(&store, "primary_signing_key", &pem).unwrap();
    (store, pem)
}
