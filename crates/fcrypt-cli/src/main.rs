//! fcrypt: password-based file encryption CLI
//!
//! Commands:
//!   init                      - set the owner's password
//!   encrypt <paths...>        - encrypt files into the storage directory
//!   decrypt <ids...> | --all  - decrypt stored files and forget them
//!   list                      - show stored files
//!   delete <id>               - erase a stored file without decrypting it
//!   passwd                    - change password and rekey every file
//!   backup                    - mirror ciphertexts into the backup directory
//!   history                   - show audit rows
//!   config show               - print the active configuration
//!
//! Passwords come from FCRYPT_PASSWORD / FCRYPT_NEW_PASSWORD when set,
//! otherwise from a terminal prompt.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use secrecy::{ExposeSecret, SecretString};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use fcrypt_core::config::expand_home;
use fcrypt_core::{
    BulkReport, FcryptConfig, FileId, MetadataPort, ProgressPort, UserId,
};
use fcrypt_engine::{EncryptOptions, EngineOptions, FileEncryptor, Hooks, Ports, Vault};
use fcrypt_store::{DirectoryBackup, JsonMetadataStore, JsonVerifierStore, JsonlAuditLog};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "fcrypt",
    version,
    about = "Password-based file encryption",
    long_about = "fcrypt: encrypt files at rest with AES-256-GCM under a per-file PBKDF2 key"
)]
struct Cli {
    /// Path to the fcrypt.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "FCRYPT_CONFIG",
        default_value = "~/.config/fcrypt/config.toml"
    )]
    config: PathBuf,

    /// Owner id the command acts for
    #[arg(long, short = 'u', env = "FCRYPT_USER", default_value_t = 1)]
    user: u64,

    /// Log format (overrides config)
    #[arg(long, env = "FCRYPT_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Set the password for the owner (first time only)
    Init,

    /// Encrypt files; the plaintexts are erased afterwards
    Encrypt {
        /// Files to encrypt
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// GZIP the plaintext before encrypting
        #[arg(long, short = 'z')]
        compress: bool,
    },

    /// Decrypt stored files by id; the ciphertexts are erased afterwards
    Decrypt {
        /// File ids (see `fcrypt list`)
        ids: Vec<u64>,
        /// Decrypt every file the owner has
        #[arg(long, conflicts_with = "ids")]
        all: bool,
        /// Output directory (default: config decrypt_dir, else next to the ciphertext)
        #[arg(long, short = 'o')]
        out: Option<PathBuf>,
    },

    /// List stored files
    List {
        /// Print records as JSON
        #[arg(long)]
        json: bool,
    },

    /// Erase a stored file and its record without decrypting
    Delete {
        id: u64,
    },

    /// Change the password and rekey every stored file
    Passwd,

    /// Copy ciphertexts not yet mirrored into state.backup_dir
    Backup,

    /// Show audit history for the owner
    History {
        /// Earliest timestamp (Unix ms)
        #[arg(long, default_value_t = 0)]
        since_ms: u64,
        /// Latest timestamp (Unix ms)
        #[arg(long)]
        until_ms: Option<u64>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = expand_home(&cli.config);
    let config = FcryptConfig::load(&config_path)?;

    let format = cli.log_format.clone().unwrap_or(match config.log.format.as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    });
    init_logging(&config.log.level, &format);
    debug!(config = %config_path.display(), user = cli.user, "fcrypt starting");

    let owner = UserId(cli.user);
    let app = || App::open(&config);
    match cli.command {
        Commands::Init => cmd_init(&app()?, owner),
        Commands::Encrypt { paths, compress } => cmd_encrypt(&app()?, owner, &paths, compress),
        Commands::Decrypt { ids, all, out } => {
            cmd_decrypt(&app()?, owner, &ids, all, out.as_deref())
        }
        Commands::List { json } => cmd_list(&app()?, owner, json),
        Commands::Delete { id } => cmd_delete(&app()?, owner, id),
        Commands::Passwd => cmd_passwd(&app()?, owner),
        Commands::Backup => cmd_backup(&app()?),
        Commands::History { since_ms, until_ms } => {
            cmd_history(&app()?, owner, since_ms, until_ms.unwrap_or(u64::MAX))
        }
        Commands::Config { action: ConfigAction::Show } => cmd_config_show(&config, &config_path),
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_env("FCRYPT_LOG").unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

// ── Wiring ────────────────────────────────────────────────────────────────────

/// File-backed collaborators plus the engine built on them.
struct App {
    vault: Vault,
    metadata: Arc<JsonMetadataStore>,
    audit: Arc<JsonlAuditLog>,
    backup: Option<Arc<DirectoryBackup>>,
}

impl App {
    fn open(config: &FcryptConfig) -> Result<Self> {
        let state = &config.state;
        let metadata_path = expand_home(&state.metadata_file);
        let metadata = Arc::new(
            JsonMetadataStore::open(&metadata_path)
                .with_context(|| format!("opening metadata store: {}", metadata_path.display()))?,
        );
        let verifier_path = expand_home(&state.verifier_file);
        let verifiers = Arc::new(
            JsonVerifierStore::open(&verifier_path)
                .with_context(|| format!("opening verifier store: {}", verifier_path.display()))?,
        );
        let audit = Arc::new(JsonlAuditLog::new(&expand_home(&state.audit_file)));
        let backup = state
            .backup_dir
            .as_deref()
            .map(|dir| Arc::new(DirectoryBackup::new(&expand_home(dir))));

        let ports = Ports {
            metadata: metadata.clone(),
            verifiers,
            audit: audit.clone(),
            backup: backup
                .clone()
                .map(|b| b as Arc<dyn fcrypt_core::BackupPort>),
        };
        let options = EngineOptions::from_config(config)?;
        let vault = Vault::new(FileEncryptor::new(ports, options)?);
        Ok(Self {
            vault,
            metadata,
            audit,
            backup,
        })
    }

    fn options(&self) -> &EngineOptions {
        self.vault.encryptor().options()
    }

    fn record(&self, owner: UserId, id: u64) -> Result<fcrypt_core::FileRecord> {
        let record = self
            .metadata
            .find_by_id(FileId(id))?
            .with_context(|| format!("no stored file with id {id}"))?;
        if record.owner_id != owner {
            bail!("file {id} belongs to another user");
        }
        Ok(record)
    }
}

// ── Passwords ─────────────────────────────────────────────────────────────────

fn read_password(env_var: &str, prompt: &str) -> Result<SecretString> {
    if let Ok(value) = std::env::var(env_var) {
        return Ok(SecretString::from(value));
    }
    let value = rpassword::prompt_password(prompt).context("reading password")?;
    Ok(SecretString::from(value))
}

/// Read a new password, asking twice when prompting interactively.
fn read_new_password(env_var: &str) -> Result<SecretString> {
    let password = match std::env::var(env_var) {
        Ok(value) => SecretString::from(value),
        Err(_) => {
            let first = rpassword::prompt_password("New password: ").context("reading password")?;
            let second =
                rpassword::prompt_password("Repeat password: ").context("reading password")?;
            if first != second {
                bail!("passwords do not match");
            }
            SecretString::from(first)
        }
    };
    check_new_password(&password)?;
    Ok(password)
}

fn check_new_password(password: &SecretString) -> Result<()> {
    if password.expose_secret().is_empty() {
        bail!("password must not be empty");
    }
    Ok(())
}

// ── Progress helpers ──────────────────────────────────────────────────────────

/// Byte-level bar for a single-file operation.
struct BarProgress(ProgressBar);

impl ProgressPort for BarProgress {
    fn on_progress(&self, _fraction: f64, bytes_done: u64, bytes_total: u64) {
        self.0.set_length(bytes_total);
        self.0.set_position(bytes_done);
    }
}

fn make_progress_bar(prefix: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::with_template(
            "{prefix:.bold} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}",
        )?
        .progress_chars("=>-"),
    );
    pb.set_prefix(prefix.to_string());
    Ok(pb)
}

fn make_spinner(prefix: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::with_template("{prefix:.bold} {spinner} {msg}")?);
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    Ok(pb)
}

fn print_report(op: &str, report: &BulkReport) -> Result<()> {
    for item in &report.succeeded {
        println!("  ok    {item}");
    }
    for (item, reason) in &report.failed_with_reasons {
        println!("  FAIL  {item}: {reason}");
    }
    if !report.is_clean() {
        bail!(
            "{op}: {} of {} failed",
            report.failed_with_reasons.len(),
            report.succeeded.len() + report.failed_with_reasons.len()
        );
    }
    Ok(())
}

// ── Commands ──────────────────────────────────────────────────────────────────

fn cmd_init(app: &App, owner: UserId) -> Result<()> {
    let password = read_new_password("FCRYPT_PASSWORD")?;
    app.vault.set_password(owner, &password)?;
    println!("password set for user {owner}");
    Ok(())
}

fn cmd_encrypt(app: &App, owner: UserId, paths: &[PathBuf], compress: bool) -> Result<()> {
    let password = read_password("FCRYPT_PASSWORD", "Password: ")?;
    let opts = EncryptOptions { compress };

    if let [path] = paths {
        let pb = make_progress_bar("encrypt")?;
        pb.set_message(path.display().to_string());
        let hooks = Hooks::with_progress(Arc::new(BarProgress(pb.clone())));
        let record = app
            .vault
            .encryptor()
            .encrypt(path, owner, &password, opts, &hooks)
            .with_context(|| format!("encrypting {}", path.display()))?;
        pb.finish_and_clear();
        println!(
            "encrypted {} → id {} ({} bytes{})",
            path.display(),
            record.file_id,
            record.original_size,
            if record.compressed { ", gzip" } else { "" }
        );
        return Ok(());
    }

    let spinner = make_spinner("encrypt")?;
    spinner.set_message(format!("{} files", paths.len()));
    let report = app
        .vault
        .encrypt_all(owner, paths, &password, opts, &Hooks::default());
    spinner.finish_and_clear();
    print_report("encrypt", &report?)
}

fn cmd_decrypt(app: &App, owner: UserId, ids: &[u64], all: bool, out: Option<&Path>) -> Result<()> {
    if !all && ids.is_empty() {
        bail!("name at least one file id, or pass --all");
    }
    let password = read_password("FCRYPT_PASSWORD", "Password: ")?;

    if all {
        let spinner = make_spinner("decrypt")?;
        let report = app
            .vault
            .decrypt_all(owner, &password, out, &Hooks::default());
        spinner.finish_and_clear();
        return print_report("decrypt", &report?);
    }

    for &id in ids {
        let record = app.record(owner, id)?;
        let pb = make_progress_bar("decrypt")?;
        pb.set_message(record.original_name.clone());
        let hooks = Hooks::with_progress(Arc::new(BarProgress(pb.clone())));
        let path = app
            .vault
            .encryptor()
            .decrypt(&record, owner, &password, out, &hooks)
            .with_context(|| format!("decrypting file {id}"))?;
        pb.finish_and_clear();
        println!("decrypted id {id} → {}", path.display());
    }
    Ok(())
}

fn cmd_list(app: &App, owner: UserId, json: bool) -> Result<()> {
    let mut records = app.metadata.list_by_owner(owner)?;
    records.sort_by_key(|r| r.file_id);

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    if records.is_empty() {
        println!("no stored files for user {owner}");
        return Ok(());
    }
    println!("{:>6}  {:>12}  {:4}  name", "id", "bytes", "gzip");
    for record in &records {
        println!(
            "{:>6}  {:>12}  {:4}  {}",
            record.file_id,
            record.original_size,
            if record.compressed { "yes" } else { "no" },
            record.original_name
        );
    }
    Ok(())
}

fn cmd_delete(app: &App, owner: UserId, id: u64) -> Result<()> {
    let record = app.record(owner, id)?;
    app.vault.encryptor().delete(&record, owner)?;
    println!("deleted id {id} ({})", record.original_name);
    Ok(())
}

fn cmd_passwd(app: &App, owner: UserId) -> Result<()> {
    let old = read_password("FCRYPT_PASSWORD", "Current password: ")?;
    let new = read_new_password("FCRYPT_NEW_PASSWORD")?;

    let spinner = make_spinner("rekey")?;
    let report = app
        .vault
        .change_password(owner, &old, &new, &Hooks::default());
    spinner.finish_and_clear();
    let report = report?;

    info!(
        owner = %owner,
        rekeyed = report.succeeded.len(),
        failed = report.failed_with_reasons.len(),
        "password changed"
    );
    for (id, reason) in &report.failed_with_reasons {
        println!("  FAIL  {id}: {reason}");
    }
    if !report.is_clean() {
        bail!(
            "password changed, but {} file(s) still use the old password",
            report.failed_with_reasons.len()
        );
    }
    println!("password changed; {} file(s) rekeyed", report.succeeded.len());
    Ok(())
}

fn cmd_backup(app: &App) -> Result<()> {
    let Some(backup) = &app.backup else {
        bail!("no backup directory configured (set state.backup_dir)");
    };
    let storage = &app.options().storage_dir;
    if !storage.exists() {
        println!("nothing to back up: {} does not exist", storage.display());
        return Ok(());
    }
    let copied = backup.mirror(storage)?;
    println!(
        "mirrored {copied} file(s) into {}",
        backup.mirror_dir().display()
    );
    Ok(())
}

fn cmd_history(app: &App, owner: UserId, since_ms: u64, until_ms: u64) -> Result<()> {
    let entries = app.audit.history(owner, since_ms, until_ms)?;
    for entry in &entries {
        println!("{}", serde_json::to_string(entry)?);
    }
    Ok(())
}

fn cmd_config_show(config: &FcryptConfig, path: &Path) -> Result<()> {
    println!("# config: {}", path.display());
    println!("{}", toml::to_string_pretty(config).context("serializing config")?);
    Ok(())
}
