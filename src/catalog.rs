//! Product catalog: the records a QR code is issued for.
//!
//! Catalog contents are provisioned administratively (directly or from CSV).
//! The core only reads them, except for the issuance audit columns written by
//! the signing service.

use std::path::Path;

use rusqlite::{params, OptionalExtension as _, Row};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{QrAuthError, Result, ResultExt as _};
use crate::payload::QrData;
use crate::store::Store;
use crate::util;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub id: String,
    pub barcode: Option<String>,
    pub qr_code: Option<String>,
    pub batch_number: String,
    pub product_name: String,
    pub manufacturing_date: Option<String>,
    pub expiry_date: String,
    #[serde(default)]
    pub distribution_locations: Vec<String>,
    #[serde(default)]
    pub issued: Option<IssuedQr>,
}

/// The last payload issued for a product, kept for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssuedQr {
    pub data: QrData,
    pub signature_b64: String,
    pub generated_at_utc: String,
}

impl ProductRecord {
    /// The code embedded in issued payloads: the barcode, else the QR code.
    pub fn code(&self) -> Option<&str> {
        self.barcode
            .as_deref()
            .filter(|c| !c.is_empty())
            .or(self.qr_code.as_deref().filter(|c| !c.is_empty()))
    }

    fn validate(&self) -> Result<()> {
        util::validate_code(&self.id, "product id")?;
        let code = self
            .code()
            .ok_or_else(|| QrAuthError::MalformedInput(format!(
                "product {} has neither barcode nor qr_code",
                self.id
            )))?;
        util::validate_code(code, "product code")?;
        if self.product_name.trim().is_empty() {
            return Err(QrAuthError::MalformedInput("product_name must not be empty".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

const PRODUCT_COLUMNS: &str = "id, barcode, qr_code, batch_number, product_name, \
     manufacturing_date, expiry_date, distribution_locations, signed_qr_data, \
     qr_signature, qr_generated_at";

/// Raw column values; JSON columns are decoded in [`ProductRow::decode`].
struct ProductRow {
    product: ProductRecord,
    locations_json: String,
    signed_qr_data: Option<String>,
    qr_signature: Option<String>,
    qr_generated_at: Option<String>,
}

fn product_from_row(row: &Row<'_>) -> rusqlite::Result<ProductRow> {
    Ok(ProductRow {
        product: ProductRecord {
            id: row.get(0)?,
            barcode: row.get(1)?,
            qr_code: row.get(2)?,
            batch_number: row.get(3)?,
            product_name: row.get(4)?,
            manufacturing_date: row.get(5)?,
            expiry_date: row.get(6)?,
            distribution_locations: Vec::new(),
            issued: None,
        },
        locations_json: row.get(7)?,
        signed_qr_data: row.get(8)?,
        qr_signature: row.get(9)?,
        qr_generated_at: row.get(10)?,
    })
}

impl ProductRow {
    fn decode(self) -> Result<ProductRecord> {
        let mut product = self.product;
        product.distribution_locations = serde_json::from_str(&self.locations_json)
            .ctx_storage("decode distribution_locations")?;
        if let (Some(data), Some(signature_b64), Some(generated_at_utc)) =
            (self.signed_qr_data, self.qr_signature, self.qr_generated_at)
        {
            product.issued = Some(IssuedQr {
                data: serde_json::from_str(&data).ctx_storage("decode signed_qr_data")?,
                signature_b64,
                generated_at_utc,
            });
        }
        Ok(product)
    }
}

/// Insert or replace a product record (administrative).
pub fn upsert_product(store: &Store, product: &ProductRecord) -> Result<()> {
    product.validate()?;
    let locations =
        serde_json::to_string(&product.distribution_locations).ctx_storage("encode locations")?;
    store
        .conn()
        .execute(
            r#"
            INSERT INTO products(
              id, barcode, qr_code, batch_number, product_name,
              manufacturing_date, expiry_date, distribution_locations
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8)
            ON CONFLICT(id) DO UPDATE SET
              barcode = excluded.barcode,
              qr_code = excluded.qr_code,
              batch_number = excluded.batch_number,
              product_name = excluded.product_name,
              manufacturing_date = excluded.manufacturing_date,
              expiry_date = excluded.expiry_date,
              distribution_locations = excluded.distribution_locations
            "#,
            params![
                product.id,
                product.barcode,
                product.qr_code,
                product.batch_number,
                product.product_name,
                product.manufacturing_date,
                product.expiry_date,
                locations,
            ],
        )
        .ctx_storage("upsert product")?;
    Ok(())
}

pub fn get_product(store: &Store, id: &str) -> Result<Option<ProductRecord>> {
    let sql = format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE id = ?1");
    store
        .conn()
        .query_row(&sql, params![id], product_from_row)
        .optional()
        .ctx_storage("select product")?
        .map(ProductRow::decode)
        .transpose()
}

/// Look a product up by one of its printed codes.
pub fn find_by_code(store: &Store, code: ProductCode<'_>) -> Result<Option<ProductRecord>> {
    let (column, value) = match code {
        ProductCode::Barcode(v) => ("barcode", v),
        ProductCode::QrCode(v) => ("qr_code", v),
    };
    let sql = format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE {column} = ?1");
    store
        .conn()
        .query_row(&sql, params![value], product_from_row)
        .optional()
        .ctx_storage("select product by code")?
        .map(ProductRow::decode)
        .transpose()
}

#[derive(Debug, Clone, Copy)]
pub enum ProductCode<'a> {
    Barcode(&'a str),
    QrCode(&'a str),
}

/// Record the payload most recently issued for a product.
pub fn record_issued(store: &Store, product_id: &str, issued: &IssuedQr) -> Result<()> {
    let data_json = serde_json::to_string(&issued.data).ctx_storage("encode signed_qr_data")?;
    let updated = store
        .conn()
        .execute(
            "UPDATE products SET signed_qr_data=?1, qr_signature=?2, qr_generated_at=?3 WHERE id=?4",
            params![data_json, issued.signature_b64, issued.generated_at_utc, product_id],
        )
        .ctx_storage("update product issuance")?;
    if updated == 0 {
        return Err(QrAuthError::NotFound(format!("product {product_id}")));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// CSV import
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CsvProductRow {
    id: String,
    #[serde(default)]
    barcode: Option<String>,
    #[serde(default)]
    qr_code: Option<String>,
    batch_number: String,
    product_name: String,
    #[serde(default)]
    manufacturing_date: Option<String>,
    expiry_date: String,
    /// `;`-separated region names.
    #[serde(default)]
    distribution_locations: Option<String>,
}

impl From<CsvProductRow> for ProductRecord {
    fn from(row: CsvProductRow) -> Self {
        let non_empty = |v: Option<String>| v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        Self {
            id: row.id.trim().to_string(),
            barcode: non_empty(row.barcode),
            qr_code: non_empty(row.qr_code),
            batch_number: row.batch_number.trim().to_string(),
            product_name: row.product_name.trim().to_string(),
            manufacturing_date: non_empty(row.manufacturing_date),
            expiry_date: row.expiry_date.trim().to_string(),
            distribution_locations: row
                .distribution_locations
                .unwrap_or_default()
                .split(';')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            issued: None,
        }
    }
}

/// Import products from a CSV file.  Returns the number of rows upserted.
pub fn import_products_csv(store: &Store, csv_path: &Path) -> Result<usize> {
    let mut rdr = csv::Reader::from_path(csv_path)
        .map_err(|e| QrAuthError::MalformedInput(format!("open csv {}: {e}", csv_path.display())))?;
    let headers = rdr.headers().ctx_input("read csv headers")?.clone();
    for required in ["id", "batch_number", "product_name", "expiry_date"] {
        if !headers.iter().any(|h| h == required) {
            return Err(QrAuthError::MalformedInput(format!(
                "csv missing required header '{required}'"
            )));
        }
    }

    let tx = store.immediate_tx()?;
    let mut count = 0usize;
    for rec in rdr.deserialize::<CsvProductRow>() {
        count += 1;
        if count > util::MAX_CSV_ROWS {
            return Err(QrAuthError::MalformedInput(format!(
                "csv exceeds maximum row limit of {}",
                util::MAX_CSV_ROWS
            )));
        }
        let row = rec.ctx_input(&format!("parse csv row {count}"))?;
        upsert_product(store, &ProductRecord::from(row))?;
    }
    tx.commit().ctx_storage("commit product import")?;
    info!(rows = count, "products imported");
    Ok(count)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
