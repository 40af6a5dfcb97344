//! memvault - Client-side encrypted vault storage
//!
//! Usage:
//!   memvault init                     - Write a config and enroll the passphrase
//!   memvault create --name <name>     - Create an empty vault
//!   memvault show                     - Print the most recent vault
//!   memvault write <json>             - Merge memory records into a vault
//!   memvault export <dir>             - Copy the sealed container out
//!   memvault import <file>            - Bring a container in and re-seal it
//!   memvault manifest create <file>   - Build an integrity manifest

use anyhow::{anyhow, bail, Context, Result};
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use memvault::{
    config::{BackendPreference, Config},
    container::{ContainerCodec, VaultDocument},
    crypto::{profile_pbkdf2, random_salt, tune_iterations},
    integrity::{check_manifest, create_manifest_with_chunk_size, IntegrityManifest},
    keyring::Keyring,
    session::VaultSession,
    storage::{
        select_adapter, Environment, ExportOptions, FileSink, ImportSource, OpenOptions,
        VaultHandle, WriteRecord, WRITE_KIND,
    },
    store::{JsonFileKv, LocalStore},
    worker::{CryptoWorker, WorkerClient},
    Error,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const PROFILE_PASSPHRASE: &str = "memvault-profile";

#[derive(Parser)]
#[command(name = "memvault")]
#[command(author = "memvault Contributors")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Client-side encrypted vault storage")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "~/.config/memvault/config.json")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Read the passphrase from a file instead of prompting
    #[arg(long, global = true)]
    password_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a config file and enroll the vault passphrase
    Init {
        /// Storage backend (auto, memory, private-fs, host, native)
        #[arg(long)]
        backend: Option<BackendPreference>,

        /// PBKDF2 iterations for the new keyring
        #[arg(long)]
        iterations: Option<u32>,

        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },

    /// Create a new, empty vault
    Create {
        #[arg(long)]
        name: String,
    },

    /// Decrypt a vault and print its document
    Show {
        /// Vault id (defaults to the most recently opened)
        #[arg(long)]
        id: Option<String>,
    },

    /// Merge a JSON object of memory records into a vault
    Write {
        /// e.g. '{"m1": {"text": "hello"}}'
        json: String,

        #[arg(long)]
        id: Option<String>,
    },

    /// Export the sealed container into a directory
    Export {
        dir: PathBuf,

        #[arg(long)]
        id: Option<String>,

        /// Exported file name (defaults to `<vault name>.mvlt`)
        #[arg(long)]
        file_name: Option<String>,
    },

    /// Import a container sealed with the same passphrase
    Import { file: PathBuf },

    /// List recently opened vaults
    Recent,

    /// Integrity manifest operations
    #[command(subcommand)]
    Manifest(ManifestCommands),

    /// Time one PBKDF2 derivation
    Profile {
        #[arg(long)]
        iterations: Option<u32>,
    },

    /// Suggest an iteration count for a target unlock time
    Tune {
        #[arg(long)]
        target_ms: Option<u64>,

        /// Store the suggestion in the config file
        #[arg(long)]
        save: bool,
    },

    /// Show entries from the native local store log
    Log {
        /// Only entries newer than this millisecond timestamp
        #[arg(long)]
        after: Option<u64>,

        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum ManifestCommands {
    /// Build a manifest for a file
    Create {
        file: PathBuf,

        /// Write the manifest here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Check a file against a manifest
    Verify { file: PathBuf, manifest: PathBuf },
}

fn main() {
    let cli = Cli::parse();

    // Expand ~ in config path
    let config_path = expand_tilde(&cli.config);

    let config = match load_config(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = init_logging(&config, cli.verbose) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    let password_file = cli.password_file;
    let result = runtime.block_on(run_command(
        cli.command,
        &config_path,
        config,
        password_file.as_deref(),
    ));

    if let Err(e) = result {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        Config::load(path).with_context(|| format!("Failed to load config {:?}", path))
    } else {
        Ok(Config::from_env()?)
    }
}

/// Logs go to stderr (or the configured file) so stdout stays machine-readable
fn init_logging(config: &Config, verbose: bool) -> Result<()> {
    let level = if verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match &config.logging.file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {:?}", path))?;

            let subscriber = FmtSubscriber::builder()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        None => {
            let subscriber = FmtSubscriber::builder()
                .with_env_filter(filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }

    Ok(())
}

async fn run_command(
    command: Commands,
    config_path: &Path,
    config: Config,
    password_file: Option<&Path>,
) -> Result<()> {
    match command {
        Commands::Init {
            backend,
            iterations,
            force,
        } => cmd_init(config_path, config, backend, iterations, force, password_file).await,

        Commands::Create { name } => cmd_create(&config, &name, password_file).await,

        Commands::Show { id } => cmd_show(&config, id, password_file).await,

        Commands::Write { json, id } => cmd_write(&config, &json, id, password_file).await,

        Commands::Export { dir, id, file_name } => cmd_export(&config, dir, id, file_name).await,

        Commands::Import { file } => cmd_import(&config, &file, password_file).await,

        Commands::Recent => cmd_recent(&config).await,

        Commands::Manifest(manifest_cmd) => run_manifest_command(manifest_cmd, &config),

        Commands::Profile { iterations } => cmd_profile(&config, iterations).await,

        Commands::Tune { target_ms, save } => cmd_tune(config_path, config, target_ms, save).await,

        Commands::Log { after, limit } => cmd_log(&config, after, limit),
    }
}

fn run_manifest_command(command: ManifestCommands, config: &Config) -> Result<()> {
    match command {
        ManifestCommands::Create { file, output } => cmd_manifest_create(config, &file, output),
        ManifestCommands::Verify { file, manifest } => cmd_manifest_verify(&file, &manifest),
    }
}

/// Session plus the worker pool backing it
struct Vault {
    session: VaultSession,
    client: Option<WorkerClient>,
    worker: Option<CryptoWorker>,
}

impl Vault {
    fn open(config: &Config) -> Result<Self> {
        config.ensure_directories()?;

        let (worker, client) = if config.worker.enabled {
            let (worker, client) = CryptoWorker::spawn(config.worker.threads)?;
            let timeout = config.worker.request_timeout_ms.map(Duration::from_millis);
            (Some(worker), Some(client.with_timeout(timeout)))
        } else {
            (None, None)
        };

        let store = Arc::new(JsonFileKv::open(config.keyring_path())?);
        let mut keyring = Keyring::new(store, config.kdf.clone());
        if let Some(client) = &client {
            keyring = keyring.with_worker(client.clone());
        }

        let adapter = select_adapter(&Environment::from_config(config), config)?;
        let mut session = VaultSession::new(Arc::new(keyring), adapter, config);
        if let Some(client) = &client {
            session = session.with_worker(client.clone());
        }

        Ok(Vault {
            session,
            client,
            worker,
        })
    }

    async fn unlock(&self, passphrase: &str) -> Result<()> {
        match self.session.unlock(passphrase).await {
            Ok(()) => Ok(()),
            Err(Error::InvalidPassphrase) => bail!("Wrong passphrase"),
            Err(e) => Err(e.into()),
        }
    }

    /// Open `id`, or the most recently opened vault
    async fn select(&self, id: Option<String>) -> Result<VaultHandle> {
        let id = match id {
            Some(id) => id,
            None => self
                .session
                .recent()
                .await?
                .into_iter()
                .next()
                .map(|record| record.id)
                .context("No vaults yet, run `memvault create --name <name>` first")?,
        };

        Ok(self.session.open(OpenOptions::existing(id)).await?)
    }

    fn close(self) {
        self.session.lock();
        if let Some(worker) = self.worker {
            worker.shutdown();
        }
    }
}

fn read_passphrase(password_file: Option<&Path>) -> Result<String> {
    let password = if let Some(path) = password_file {
        std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read password file {:?}", path))?
            .trim()
            .to_string()
    } else {
        rpassword::prompt_password("Enter vault passphrase: ")?
    };

    if password.is_empty() {
        bail!("Passphrase must not be empty");
    }
    Ok(password)
}

fn read_new_passphrase(password_file: Option<&Path>) -> Result<String> {
    let password = read_passphrase(password_file)?;
    if password_file.is_none() {
        let confirm = rpassword::prompt_password("Confirm vault passphrase: ")?;
        if confirm != password {
            bail!("Passphrases do not match");
        }
    }
    Ok(password)
}

async fn cmd_init(
    config_path: &Path,
    mut config: Config,
    backend: Option<BackendPreference>,
    iterations: Option<u32>,
    force: bool,
    password_file: Option<&Path>,
) -> Result<()> {
    if config_path.exists() && !force {
        bail!(
            "Config already exists at {:?} (use --force to overwrite)",
            config_path
        );
    }

    info!("Initializing memvault...");

    if let Some(backend) = backend {
        config.storage.backend = backend;
    }
    if let Some(iterations) = iterations {
        config.kdf.iterations = iterations;
    }
    config.validate()?;

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    config.save(config_path)?;
    info!("Config written to {:?}", config_path);

    let vault = Vault::open(&config)?;
    let passphrase = read_new_passphrase(password_file)?;
    vault.unlock(&passphrase).await?;

    let settings = vault
        .session
        .keyring()
        .settings()
        .ok_or_else(|| anyhow!("Keyring settings missing after unlock"))?;

    println!("memvault initialized");
    println!("  Config:     {}", config_path.display());
    println!("  Keyring:    {}", config.keyring_path().display());
    println!("  KDF:        {}", settings.kdf.as_str());
    println!("  Iterations: {}", settings.iterations);
    println!("  Storage:    {}", vault.session.adapter().kind().as_str());

    vault.close();
    Ok(())
}

async fn cmd_create(config: &Config, name: &str, password_file: Option<&Path>) -> Result<()> {
    let vault = Vault::open(config)?;
    vault.unlock(&read_passphrase(password_file)?).await?;

    let handle = vault.session.open(OpenOptions::create(name)).await?;
    vault.session.save(&VaultDocument::new(name)).await?;

    println!("Created vault {} ({})", handle.name, handle.id);
    vault.close();
    Ok(())
}

async fn cmd_show(config: &Config, id: Option<String>, password_file: Option<&Path>) -> Result<()> {
    let vault = Vault::open(config)?;
    vault.unlock(&read_passphrase(password_file)?).await?;

    let handle = vault.select(id).await?;
    let doc = vault.session.load().await?;
    info!("Loaded vault {} ({})", handle.name, handle.id);

    println!("{}", serde_json::to_string_pretty(&doc)?);
    vault.close();
    Ok(())
}

async fn cmd_write(
    config: &Config,
    json: &str,
    id: Option<String>,
    password_file: Option<&Path>,
) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(json).context("Invalid JSON")?;
    let serde_json::Value::Object(records) = value else {
        bail!("Memory records must be a JSON object keyed by record id");
    };

    let vault = Vault::open(config)?;
    vault.unlock(&read_passphrase(password_file)?).await?;
    let handle = vault.select(id).await?;

    let mut doc = match vault.session.load().await {
        Ok(doc) => doc,
        Err(Error::NotFound(_)) => {
            warn!("Vault {} has no data yet, starting empty", handle.id);
            VaultDocument::new(&handle.name)
        }
        Err(e) => return Err(e.into()),
    };

    let count = records.len();
    for (record_id, record) in records {
        doc.insert_memory(record_id, record);
    }
    vault.session.save(&doc).await?;

    println!("Wrote {} record(s) to {}", count, handle.name);
    vault.close();
    Ok(())
}

async fn cmd_export(
    config: &Config,
    dir: PathBuf,
    id: Option<String>,
    file_name: Option<String>,
) -> Result<()> {
    // Exported bytes stay sealed, so no unlock
    let vault = Vault::open(config)?;
    let handle = vault.select(id).await?;

    vault
        .session
        .export(ExportOptions {
            file_name,
            sink: Arc::new(FileSink::new(&dir)),
        })
        .await?;

    println!("Exported {} to {}", handle.name, dir.display());
    vault.close();
    Ok(())
}

async fn cmd_import(config: &Config, file: &Path, password_file: Option<&Path>) -> Result<()> {
    let vault = Vault::open(config)?;
    let passphrase = read_passphrase(password_file)?;
    vault.unlock(&passphrase).await?;

    let bytes = tokio::fs::read(file)
        .await
        .with_context(|| format!("Failed to read {:?}", file))?;

    let codec = ContainerCodec::new(config.kdf.iterations);
    let opened = match &vault.client {
        Some(client) => {
            codec
                .decrypt_container_offloaded(client, &bytes, &passphrase)
                .await
        }
        None => {
            let passphrase = passphrase.clone();
            tokio::task::spawn_blocking(move || codec.decrypt_container(&bytes, &passphrase))
                .await?
        }
    };
    let doc = opened.map_err(|e| {
        if e.is_passphrase_rejection() {
            anyhow!(
                "Cannot decrypt {:?} with this passphrase at {} iterations",
                file,
                codec.iterations()
            )
        } else {
            anyhow!(e)
        }
    })?;

    let handle = vault
        .session
        .import(ImportSource::File(file.to_path_buf()))
        .await?;
    // Re-seal under this keyring's salt so later loads use the session key
    vault.session.save(&doc).await?;

    println!("Imported {} as {} ({})", file.display(), handle.name, handle.id);
    vault.close();
    Ok(())
}

async fn cmd_recent(config: &Config) -> Result<()> {
    let vault = Vault::open(config)?;
    let recent = vault.session.recent().await?;

    if recent.is_empty() {
        println!("No recent vaults");
    } else {
        println!("{:<38} {:<24} {:<12} LAST OPENED", "ID", "NAME", "SOURCE");
        for record in &recent {
            println!(
                "{:<38} {:<24} {:<12} {}",
                record.id,
                record.name,
                record.source,
                record.last_opened_at.to_rfc3339()
            );
        }
    }

    vault.close();
    Ok(())
}

fn cmd_manifest_create(config: &Config, file: &Path, output: Option<PathBuf>) -> Result<()> {
    let data = std::fs::read(file).with_context(|| format!("Failed to read {:?}", file))?;
    let manifest = create_manifest_with_chunk_size(&data, config.integrity.chunk_size)?;
    let json = manifest.to_json()?;

    match output {
        Some(path) => {
            std::fs::write(&path, json)
                .with_context(|| format!("Failed to write manifest {:?}", path))?;
            info!(
                "Manifest for {:?} ({} chunks) written to {:?}",
                file, manifest.chunk_count, path
            );
        }
        None => println!("{}", json),
    }

    Ok(())
}

fn cmd_manifest_verify(file: &Path, manifest_path: &Path) -> Result<()> {
    let data = std::fs::read(file).with_context(|| format!("Failed to read {:?}", file))?;
    let json = std::fs::read_to_string(manifest_path)
        .with_context(|| format!("Failed to read manifest {:?}", manifest_path))?;
    let manifest = IntegrityManifest::from_json(&json)?;

    match check_manifest(&data, &manifest) {
        Ok(()) => {
            println!(
                "OK: {} bytes, {} chunks, root {}",
                manifest.total_bytes, manifest.chunk_count, manifest.root_hash
            );
            Ok(())
        }
        Err(Error::ManifestMismatch(reason)) => bail!("Manifest mismatch: {}", reason),
        Err(e) => Err(e.into()),
    }
}

async fn cmd_profile(config: &Config, iterations: Option<u32>) -> Result<()> {
    let iterations = iterations.unwrap_or(config.kdf.iterations);
    let salt = random_salt().to_vec();

    let elapsed = if config.worker.enabled {
        let (worker, client) = CryptoWorker::spawn(1)?;
        let result = client
            .profile_pbkdf2(PROFILE_PASSPHRASE.to_string(), salt, iterations)
            .await;
        worker.shutdown();
        result?.1
    } else {
        tokio::task::spawn_blocking(move || {
            profile_pbkdf2(PROFILE_PASSPHRASE.as_bytes(), &salt, iterations)
        })
        .await??
        .1
    };

    println!(
        "PBKDF2-SHA256, {} iterations: {:.1} ms",
        iterations,
        elapsed.as_secs_f64() * 1000.0
    );
    Ok(())
}

async fn cmd_tune(
    config_path: &Path,
    mut config: Config,
    target_ms: Option<u64>,
    save: bool,
) -> Result<()> {
    let target = Duration::from_millis(target_ms.unwrap_or(config.kdf.target_unlock_ms));
    let iterations = tokio::task::spawn_blocking(move || tune_iterations(target)).await??;

    println!(
        "Suggested iterations for ~{} ms: {}",
        target.as_millis(),
        iterations
    );

    if save {
        config.kdf.iterations = iterations;
        config.validate()?;
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        config.save(config_path)?;
        println!("Saved to {}", config_path.display());
        println!("Existing keyrings keep the iteration count they were enrolled with.");
    }

    Ok(())
}

fn cmd_log(config: &Config, after: Option<u64>, limit: usize) -> Result<()> {
    let store = LocalStore::open(config.native_dir())?;
    let entries = store.list(after, limit)?;

    if entries.is_empty() {
        println!("No log entries");
        return Ok(());
    }

    for entry in &entries {
        let at = Utc
            .timestamp_millis_opt(entry.timestamp_ms as i64)
            .single()
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| entry.timestamp_ms.to_string());

        let detail = if entry.kind == WRITE_KIND {
            match WriteRecord::decode(entry) {
                Some(record) => {
                    let missing = if store.has_blob(&record.blob_id)? {
                        ""
                    } else {
                        " [blob missing]"
                    };
                    format!(
                        "vault {} blob {} ({} bytes){}",
                        record.vault_id, record.blob_id, record.size, missing
                    )
                }
                None => format!("{} bytes (unreadable)", entry.payload.len()),
            }
        } else {
            format!("{} bytes", entry.payload.len())
        };

        println!("{} {} {:<12} {}", entry.timestamp_ms, at, entry.kind, detail);
    }

    Ok(())
}

/// Expand ~ to home directory
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
