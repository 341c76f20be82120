use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use secrecy::SecretString;
use serde::Serialize;
use tracing::info;

use qrauth_core::{
    api::{self, IssueRequest, VerifyResponse},
    audit, catalog,
    config::{LoggingConfig, QrAuthConfig},
    keys::{self, PrivateKeySource, StoreKeyProvider},
    ledger,
    legacy::LegacyVerifyRequest,
    risk::RiskEngine,
    store::Store,
    util,
    verify::ScanContext,
};

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "qrauth",
    version = util::VERSION,
    about = "Signed product QR issuance and verification"
)]
struct Cli {
    /// Path to the store database (SQLite).
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Path to a TOML config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a new, empty store.
    InitStore,

    /// Generate an RSA signing key pair (PKCS#8 private, SPKI public).
    Keygen {
        #[arg(long)]
        out_dir: Option<PathBuf>,
        #[arg(long, default_value_t = 2048)]
        bits: usize,
    },

    /// Register a key pair as the single active signing key.
    ProvisionKey {
        /// PKCS#8 PEM private key.  Only its public half and fingerprint are stored.
        #[arg(long)]
        private_key_pem: PathBuf,
        #[arg(long)]
        key_name: Option<String>,
    },

    /// Upsert catalog products from a CSV file.
    ImportProducts {
        #[arg(long)]
        csv: PathBuf,
    },

    /// Issue a signed QR payload for a catalogued product.
    Issue {
        #[arg(long)]
        product_id: String,
        #[arg(long)]
        batch_number: Option<String>,
        #[arg(long)]
        private_key_pem: Option<PathBuf>,
    },

    /// Verify scanned QR text and record the scan.
    Verify {
        /// `{data, sig}` JSON as read from the QR symbol.
        #[arg(long, required_unless_present = "qr_payload_file", conflicts_with = "qr_payload_file")]
        qr_payload: Option<String>,
        #[arg(long)]
        qr_payload_file: Option<PathBuf>,
        #[arg(long)]
        device_id: String,
        #[arg(long)]
        location: Option<String>,
        #[arg(long)]
        user_agent: Option<String>,
        #[arg(long)]
        ip_address: Option<String>,
    },

    /// Verify a printed barcode / plain QR code from a JSON request file.
    VerifyLegacy {
        #[arg(long)]
        request: PathBuf,
    },

    /// Show the ledger entry and attempt history for a payload id.
    ScanHistory {
        #[arg(long)]
        qr_id: String,
    },

    /// Print version information.
    Version,
}

#[derive(Debug, Serialize)]
struct ScanHistory {
    entry: Option<ledger::ScanLedgerEntry>,
    attempts: Vec<audit::ScanAttempt>,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration.
    let mut cfg = QrAuthConfig::load(cli.config.as_deref()).context("load config")?;
    cfg.apply_env();

    init_logging(&cfg.logging)?;

    let db_path = cli.db.clone().unwrap_or(cfg.paths.db.clone());
    util::validate_path(&db_path, "db")?;

    match cli.cmd {
        Commands::InitStore => {
            let store = Store::create_new(&db_path, &cfg.store).context("create store")?;
            info!(
                db = %db_path.display(),
                schema_version = store.schema_version()?,
                "store initialized"
            );
        }

        Commands::Keygen { out_dir, bits } => {
            let out_dir = out_dir.unwrap_or(cfg.paths.keys_dir.clone());
            keys::generate_rsa_keypair(&out_dir, bits).context("keygen")?;
            info!(out_dir = %out_dir.display(), bits, "generated signing_key.pem and signing_pub.pem");
        }

        Commands::ProvisionKey {
            private_key_pem,
            key_name,
        } => {
            util::validate_path(&private_key_pem, "private key")?;
            let pem = std::fs::read_to_string(&private_key_pem)
                .map_err(|e| anyhow::anyhow!("read private key pem failed: {e}"))?;
            let key_name = key_name.unwrap_or(cfg.keys.key_name.clone());
            let store = open_store(&db_path, &cfg)?;
            let rec = keys::provision_from_private_pem(&store, &key_name, &SecretString::new(pem.into()))
                .context("provision key")?;
            print_json(&rec)?;
        }

        Commands::ImportProducts { csv } => {
            util::validate_path(&csv, "csv")?;
            let csv = util::canonicalize_if_exists(&csv, "csv")?;
            let store = Store::open_or_create(&db_path, &cfg.store).context("open/create store")?;
            let n = catalog::import_products_csv(&store, &csv).context("import products")?;
            info!(rows = n, "products imported");
        }

        Commands::Issue {
            product_id,
            batch_number,
            private_key_pem,
        } => {
            let source = private_key_source(&mut cfg, private_key_pem)?.context(
                "no private key configured (use --private-key-pem, QRAUTH_RSA_PRIVATE_KEY or [keys].private_key_pem)",
            )?;
            let store = open_store(&db_path, &cfg)?;
            let keys = StoreKeyProvider::with_private_key(&store, source);
            let resp = api::handle_issue(
                &store,
                &keys,
                &IssueRequest {
                    product_id,
                    batch_number,
                },
            )
            .context("issue")?;
            print_json(&resp)?;
        }

        Commands::Verify {
            qr_payload,
            qr_payload_file,
            device_id,
            location,
            user_agent,
            ip_address,
        } => {
            let text = match (qr_payload, qr_payload_file) {
                (Some(text), _) => text,
                (None, Some(path)) => {
                    util::validate_path(&path, "qr payload file")?;
                    std::fs::read_to_string(&path)
                        .with_context(|| format!("read {}", path.display()))?
                }
                (None, None) => anyhow::bail!("either --qr-payload or --qr-payload-file is required"),
            };
            let store = open_store(&db_path, &cfg)?;
            let keys = StoreKeyProvider::public_only(&store);
            let ctx = ScanContext {
                device_id,
                location,
                user_agent,
                ip_address,
            };
            let result = api::verify_scanned_text(&store, &keys, text.trim(), &ctx);
            print_json(&result)?;
            if matches!(
                result.response,
                VerifyResponse::SignatureInvalid { .. } | VerifyResponse::Error { .. }
            ) {
                std::process::exit(1);
            }
        }

        Commands::VerifyLegacy { request } => {
            util::validate_path(&request, "request")?;
            let text = std::fs::read_to_string(&request)
                .with_context(|| format!("read {}", request.display()))?;
            let req: LegacyVerifyRequest =
                serde_json::from_str(&text).context("parse legacy verify request")?;
            let engine = RiskEngine::new(&cfg.risk).context("build risk engine")?;
            let store = open_store(&db_path, &cfg)?;
            match api::handle_verify_legacy(&store, &engine, &req) {
                Ok(resp) => print_json(&resp)?,
                Err(body) => {
                    print_json(&body)?;
                    std::process::exit(1);
                }
            }
        }

        Commands::ScanHistory { qr_id } => {
            let store = open_store(&db_path, &cfg)?;
            let history = ScanHistory {
                entry: ledger::get_entry(&store, &qr_id).context("read ledger entry")?,
                attempts: audit::list_scan_attempts(&store, &qr_id).context("read attempts")?,
            };
            print_json(&history)?;
        }

        Commands::Version => {
            println!("{}", util::version_string());
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn open_store(db_path: &Path, cfg: &QrAuthConfig) -> Result<Store> {
    Store::open_existing(db_path, &cfg.store)
        .with_context(|| format!("open store {} (run init-store first)", db_path.display()))
}

/// CLI path, then the `QRAUTH_RSA_PRIVATE_KEY` secret, then the config path.
fn private_key_source(cfg: &mut QrAuthConfig, cli_path: Option<PathBuf>) -> Result<Option<PrivateKeySource>> {
    if let Some(path) = cli_path {
        util::validate_path(&path, "private key")?;
        return Ok(Some(PrivateKeySource::PemFile(path)));
    }
    if let Some(secret) = cfg.keys.private_key_pem_inline.take() {
        return Ok(Some(PrivateKeySource::Pem(secret)));
    }
    match &cfg.keys.private_key_pem {
        Some(path) => {
            util::validate_path(path, "private key")?;
            Ok(Some(PrivateKeySource::PemFile(path.clone())))
        }
        None => Ok(None),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("serialize output")?);
    Ok(())
}

fn init_logging(cfg: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::prelude::*;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.level));

    let registry = tracing_subscriber::registry().with(filter);

    if cfg.json_stdout {
        // JSON output to stdout for container / SIEM pipelines.
        let json_layer = tracing_subscriber::fmt::layer().json();
        registry.with(json_layer).init();
    } else if !cfg.json_log_file.is_empty() {
        // JSON-lines output to file, human-readable to stderr.
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&cfg.json_log_file)
            .with_context(|| format!("open json log file {}", cfg.json_log_file))?;
        let file_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::sync::Mutex::new(log_file));
        let console_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
        registry.with(file_layer).with(console_layer).init();
    } else {
        // Default: human-readable output to stderr.
        let console_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
        registry.with(console_layer).init();
    }
    Ok(())
}
