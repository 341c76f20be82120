//! Signing key records and the key provider.
//!
//! The store holds public keys only.  Each record carries a `private_key_ref`
//! (SHA-256 of the PKCS#8 DER) so an auditor can tell which private key a
//! record belongs to without the key ever touching the database.  A partial
//! unique index guarantees at most one active record.
//!
//! ## Lifecycle
//! 1. Operator generates a key pair: [`generate_rsa_keypair`]
//! 2. Operator registers it: [`provision_key`] (deactivates the previous key)
//! 3. Issuers load the private key from a PEM file or secret env value;
//!    verifiers only read the active public key.

use std::path::{Path, PathBuf};

use rsa::pkcs8::{DecodePrivateKey as _, DecodePublicKey as _, EncodePrivateKey as _, EncodePublicKey as _, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use rusqlite::{params, OptionalExtension as _, Row};
use secrecy::{ExposeSecret as _, SecretString};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{OptionExt as _, QrAuthError, Result, ResultExt as _};
use crate::store::Store;
use crate::util;

/// Smallest modulus accepted for newly generated keys.
pub const MIN_RSA_BITS: usize = 2048;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMaterial {
    pub id: i64,
    pub key_name: String,
    pub public_key_pem: String,
    pub private_key_ref: String,
    pub is_active: bool,
    pub created_at_utc: String,
}

#[derive(Debug, Clone)]
pub struct ActivePublicKey {
    pub record: KeyMaterial,
    pub key: RsaPublicKey,
}

pub struct ActiveKeyPair {
    pub public: ActivePublicKey,
    pub private: RsaPrivateKey,
}

impl std::fmt::Debug for ActiveKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveKeyPair")
            .field("key_name", &self.public.record.key_name)
            .field("private_key_ref", &self.public.record.private_key_ref)
            .finish_non_exhaustive()
    }
}

/// Where an issuer finds its private key.
#[derive(Debug)]
pub enum PrivateKeySource {
    PemFile(PathBuf),
    Pem(SecretString),
}

impl PrivateKeySource {
    fn load(&self) -> Result<RsaPrivateKey> {
        match self {
            Self::PemFile(path) => {
                let pem = std::fs::read_to_string(path)
                    // Avoid including key paths in error strings.
                    .map_err(|e| QrAuthError::Configuration(format!("read private key pem failed: {e}")))?;
                parse_private_key_pem(&pem)
            }
            Self::Pem(secret) => parse_private_key_pem(secret.expose_secret()),
        }
    }
}

// ---------------------------------------------------------------------------
// Key provider
// ---------------------------------------------------------------------------

/// Resolves the single active key.  Implementations must fail closed: no
/// active record means [`QrAuthError::KeyNotFound`], never a default key.
pub trait KeyProvider {
    fn active_public_key(&self) -> Result<ActivePublicKey>;
    fn active_key_pair(&self) -> Result<ActiveKeyPair>;
}

/// Key provider backed by the `signing_keys` table plus an operator-supplied
/// private key.
#[derive(Debug)]
pub struct StoreKeyProvider<'a> {
    store: &'a Store,
    private: Option<PrivateKeySource>,
}

impl<'a> StoreKeyProvider<'a> {
    /// Verification-only provider.
    pub fn public_only(store: &'a Store) -> Self {
        Self { store, private: None }
    }

    pub fn with_private_key(store: &'a Store, private: PrivateKeySource) -> Self {
        Self {
            store,
            private: Some(private),
        }
    }
}

impl KeyProvider for StoreKeyProvider<'_> {
    fn active_public_key(&self) -> Result<ActivePublicKey> {
        let record = active_key_record(self.store)?.ok_or_else(|| {
            QrAuthError::KeyNotFound("no active signing key; verification cannot proceed".into())
        })?;
        let key = RsaPublicKey::from_public_key_pem(&record.public_key_pem)
            .ctx_config("active public key is not a valid SPKI PEM")?;
        Ok(ActivePublicKey { record, key })
    }

    fn active_key_pair(&self) -> Result<ActiveKeyPair> {
        let public = self.active_public_key()?;
        let source = self.private.as_ref().required_config("private key not configured")?;
        let private = source.load()?;

        if private_key_fingerprint(&private)? != public.record.private_key_ref {
            return Err(QrAuthError::Configuration(format!(
                "configured private key does not match active key '{}'",
                public.record.key_name
            )));
        }
        if RsaPublicKey::from(&private) != public.key {
            return Err(QrAuthError::Configuration(format!(
                "configured private key does not match public key of '{}'",
                public.record.key_name
            )));
        }
        Ok(ActiveKeyPair { public, private })
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

const KEY_COLUMNS: &str = "id, key_name, public_key_pem, private_key_ref, is_active, created_at_utc";

fn key_from_row(row: &Row<'_>) -> rusqlite::Result<KeyMaterial> {
    Ok(KeyMaterial {
        id: row.get(0)?,
        key_name: row.get(1)?,
        public_key_pem: row.get(2)?,
        private_key_ref: row.get(3)?,
        is_active: row.get::<_, i64>(4)? == 1,
        created_at_utc: row.get(5)?,
    })
}

pub fn active_key_record(store: &Store) -> Result<Option<KeyMaterial>> {
    let sql = format!("SELECT {KEY_COLUMNS} FROM signing_keys WHERE is_active = 1");
    store
        .conn()
        .query_row(&sql, [], key_from_row)
        .optional()
        .ctx_storage("select active key")
}

pub fn list_keys(store: &Store) -> Result<Vec<KeyMaterial>> {
    let sql = format!("SELECT {KEY_COLUMNS} FROM signing_keys ORDER BY id ASC");
    let mut stmt = store.conn().prepare(&sql).ctx_storage("prepare select keys")?;
    let rows = stmt
        .query_map([], key_from_row)
        .ctx_storage("query keys")?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Register a public key as the single active key, deactivating the previous
/// one in the same transaction.
pub fn provision_key(
    store: &Store,
    key_name: &str,
    public_key_pem: &str,
    private_key_ref: &str,
) -> Result<KeyMaterial> {
    if key_name.trim().is_empty() {
        return Err(QrAuthError::MalformedInput("key_name must not be empty".into()));
    }
    RsaPublicKey::from_public_key_pem(public_key_pem).ctx_input("public key pem")?;
    if private_key_ref.len() != 64 || hex::decode(private_key_ref).is_err() {
        return Err(QrAuthError::MalformedInput(
            "private_key_ref must be a SHA-256 hex fingerprint".into(),
        ));
    }

    let created_at_utc = util::now_utc_rfc3339();
    let tx = store.immediate_tx()?;
    tx.execute("UPDATE signing_keys SET is_active = 0 WHERE is_active = 1", [])
        .ctx_storage("deactivate previous key")?;
    tx.execute(
        "INSERT INTO signing_keys(key_name, public_key_pem, private_key_ref, is_active, created_at_utc)
         VALUES (?1,?2,?3,1,?4)",
        params![key_name, public_key_pem, private_key_ref, created_at_utc],
    )
    .ctx_storage("insert key")?;
    let id = tx.last_insert_rowid();
    tx.commit().ctx_storage("commit key provisioning")?;

    info!(key_id = id, key_name, private_key_ref, "signing key provisioned");
    Ok(KeyMaterial {
        id,
        key_name: key_name.to_string(),
        public_key_pem: public_key_pem.to_string(),
        private_key_ref: private_key_ref.to_string(),
        is_active: true,
        created_at_utc,
    })
}

/// Provision the key pair held in `private_pem`.  Only the public half and
/// the fingerprint are stored.
pub fn provision_from_private_pem(
    store: &Store,
    key_name: &str,
    private_pem: &SecretString,
) -> Result<KeyMaterial> {
    let private = parse_private_key_pem(private_pem.expose_secret())?;
    let public_pem = RsaPublicKey::from(&private)
        .to_public_key_pem(LineEnding::LF)
        .ctx_config("encode public key pem")?;
    let private_ref = private_key_fingerprint(&private)?;
    provision_key(store, key_name, &public_pem, &private_ref)
}

// ---------------------------------------------------------------------------
// Key material helpers
// ---------------------------------------------------------------------------

pub fn parse_private_key_pem(pem: &str) -> Result<RsaPrivateKey> {
    RsaPrivateKey::from_pkcs8_pem(pem).ctx_config("parse RSA PKCS#8 private key")
}

/// SHA-256 hex of the PKCS#8 DER encoding.
pub fn private_key_fingerprint(key: &RsaPrivateKey) -> Result<String> {
    let der = key.to_pkcs8_der().ctx_config("encode pkcs8 der")?;
    Ok(util::sha256_hex(der.as_bytes()))
}

/// Generate an RSA key pair.
/// Writes `signing_key.pem` (PKCS#8) and `signing_pub.pem` (SPKI) to `out_dir`.
pub fn generate_rsa_keypair(out_dir: &Path, bits: usize) -> Result<()> {
    if bits < MIN_RSA_BITS {
        return Err(QrAuthError::MalformedInput(format!(
            "RSA modulus must be at least {MIN_RSA_BITS} bits"
        )));
    }
    std::fs::create_dir_all(out_dir)
        .map_err(|e| QrAuthError::Configuration(format!("create {}: {e}", out_dir.display())))?;

    let private = RsaPrivateKey::new(&mut rand_core::OsRng, bits).ctx_signing("generate RSA key")?;
    let private_pem = private
        .to_pkcs8_pem(LineEnding::LF)
        .ctx_config("encode pkcs8 pem")?;
    let public_pem = RsaPublicKey::from(&private)
        .to_public_key_pem(LineEnding::LF)
        .ctx_config("encode public key pem")?;

    let key_path = out_dir.join("signing_key.pem");
    std::fs::write(&key_path, private_pem.as_bytes())
        .map_err(|e| QrAuthError::Configuration(format!("write {}: {e}", key_path.display())))?;
    let pub_path = out_dir.join("signing_pub.pem");
    std::fs::write(&pub_path, public_pem.as_bytes())
        .map_err(|e| QrAuthError::Configuration(format!("write {}: {e}", pub_path.display())))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
