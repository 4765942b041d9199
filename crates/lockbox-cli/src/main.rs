//! lockbox: encrypted file storage CLI
//!
//! Commands:
//!   store <file>         - store a file (encrypted when a key is given)
//!   retrieve <id>        - write a file's plaintext to stdout or --out
//!   stat <id>            - show a file's metadata
//!   list                 - list the caller's files
//!   update <id>          - rename or re-describe a file
//!   delete <id>          - delete a file and its bytes
//!   check                - verify the storage root is usable
//!   keygen               - print a fresh random key (base64)
//!   config show          - display current configuration
//!
//! Identity comes from `--as <OWNER_ID>` (or LOCKBOX_USER) and is trusted as-is.

use anyhow::{Context, Result};
use base64::Engine as _;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use zeroize::Zeroizing;

use lockbox_core::config::LockboxConfig;
use lockbox_core::{FileId, FileRecord, LockboxError, OwnerId, RecordPatch};
use lockbox_crypto::EncryptionKey;
use lockbox_engine::{FileEngine, JsonMetadataStore, StoreRequest};
use lockbox_storage::{check_root, AtomicWriter};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "lockbox",
    version,
    about = "Encrypted, owner-scoped file storage",
    long_about = "lockbox: store files at rest under AES-GCM, scoped per owner, published atomically"
)]
struct Cli {
    /// Path to lockbox.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "LOCKBOX_CONFIG",
        default_value = "lockbox.toml",
        global = true
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides [log] level
    #[arg(long, env = "LOCKBOX_LOG", global = true)]
    log: Option<String>,

    /// Log format; overrides [log] format
    #[arg(long, env = "LOCKBOX_LOG_FORMAT", global = true)]
    log_format: Option<LogFormat>,

    /// Owner id of the caller
    #[arg(long = "as", env = "LOCKBOX_USER", global = true, value_name = "OWNER_ID")]
    owner: Option<u64>,

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
    /// Store a file ("-" reads stdin and requires --name)
    Store {
        /// Local file to store
        file: PathBuf,
        /// Stored name (default: the local file name)
        #[arg(long, short = 'n')]
        name: Option<String>,
        /// MIME type recorded with the file
        #[arg(long, short = 't', default_value = "application/octet-stream")]
        content_type: String,
        /// Free-form description
        #[arg(long, short = 'd', default_value = "")]
        description: String,
        #[command(flatten)]
        key: KeyArgs,
    },

    /// Write a stored file's plaintext to stdout or a file
    Retrieve {
        id: u64,
        /// Destination file, published only once fully decrypted
        #[arg(long, short = 'o')]
        out: Option<PathBuf>,
        #[command(flatten)]
        key: KeyArgs,
    },

    /// Show a file's metadata
    Stat {
        id: u64,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// List the caller's files
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Change a file's name, content type or description
    Update {
        id: u64,
        #[arg(long, short = 'n')]
        name: Option<String>,
        #[arg(long, short = 't')]
        content_type: Option<String>,
        #[arg(long, short = 'd')]
        description: Option<String>,
    },

    /// Delete a file and its stored bytes
    Delete { id: u64 },

    /// Verify the storage root exists and is writable
    Check,

    /// Print a new random key, base64-encoded
    Keygen {
        /// Key length in bytes (16, 24 or 32)
        #[arg(long, default_value_t = 32)]
        bytes: usize,
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

#[derive(Args, Debug, Default)]
struct KeyArgs {
    /// Base64-encoded AES key (16, 24 or 32 bytes once decoded)
    #[arg(long, env = "LOCKBOX_KEY", hide_env_values = true, conflicts_with = "key_file")]
    key: Option<String>,

    /// File holding the raw key bytes
    #[arg(long)]
    key_file: Option<PathBuf>,
}

impl KeyArgs {
    /// Raw key bytes, if any were supplied. Length is checked by the engine.
    fn load(&self) -> Result<Option<Zeroizing<Vec<u8>>>> {
        if let Some(encoded) = &self.key {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(encoded.trim())
                .context("--key is not valid base64")?;
            return Ok(Some(Zeroizing::new(bytes)));
        }
        if let Some(path) = &self.key_file {
            let bytes = std::fs::read(path)
                .with_context(|| format!("reading key file: {}", path.display()))?;
            return Ok(Some(Zeroizing::new(bytes)));
        }
        Ok(None)
    }
}

// ── Entry point ────────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let cli = Cli::parse();

    // [log] lives in the config file, so read it before logging starts and
    // report a missing file afterwards
    let loaded = LockboxConfig::load_optional(&cli.config)
        .with_context(|| format!("loading config: {}", cli.config.display()))?;
    let found = loaded.is_some();
    let config = loaded.unwrap_or_default();

    let level = cli.log.clone().unwrap_or_else(|| config.log.level.clone());
    let format = match &cli.log_format {
        Some(format) => format.clone(),
        None => LogFormat::from_str(&config.log.format, true).unwrap_or(LogFormat::Text),
    };
    init_logging(&level, &format);

    if !found {
        warn!(
            "config file not found: {}  (using defaults)",
            cli.config.display()
        );
    }

    match cli.command {
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config, &cli.config),
        Commands::Keygen { bytes } => cmd_keygen(bytes),
        Commands::Check => cmd_check(&config),
        Commands::Store {
            file,
            name,
            content_type,
            description,
            key,
        } => {
            let owner = require_owner(cli.owner)?;
            let request = StoreRequest::new(owner, store_name(&file, name)?)
                .content_type(content_type)
                .description(description);
            cmd_store(&config, request, &file, &key)
        }
        Commands::Retrieve { id, out, key } => {
            cmd_retrieve(&config, require_owner(cli.owner)?, FileId(id), out.as_deref(), &key)
        }
        Commands::Stat { id, json } => {
            cmd_stat(&config, require_owner(cli.owner)?, FileId(id), json)
        }
        Commands::List { json } => cmd_list(&config, require_owner(cli.owner)?, json),
        Commands::Update {
            id,
            name,
            content_type,
            description,
        } => {
            let patch = RecordPatch {
                name,
                content_type,
                description,
            };
            cmd_update(&config, require_owner(cli.owner)?, FileId(id), &patch)
        }
        Commands::Delete { id } => cmd_delete(&config, require_owner(cli.owner)?, FileId(id)),
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // stdout carries file content for `retrieve`; logs go to stderr
    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(io::stderr))
                .init();
        }
    }
}

fn require_owner(owner: Option<u64>) -> Result<OwnerId> {
    owner
        .map(OwnerId)
        .context("no identity: pass --as <OWNER_ID> or set LOCKBOX_USER")
}

fn store_name(file: &Path, name: Option<String>) -> Result<String> {
    if let Some(name) = name {
        return Ok(name);
    }
    if file == Path::new("-") {
        anyhow::bail!("reading from stdin requires --name");
    }
    file.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .with_context(|| format!("cannot derive a name from {}; pass --name", file.display()))
}

fn open_engine(config: &LockboxConfig) -> Result<FileEngine<JsonMetadataStore>> {
    let metadata = JsonMetadataStore::open(&config.metadata.path)
        .with_context(|| format!("opening metadata: {}", config.metadata.path.display()))?;
    let engine = FileEngine::open(&config.storage, metadata)
        .with_context(|| format!("opening storage root: {}", config.storage.root.display()))?;

    if let Err(e) = check_root(&config.storage.root) {
        warn!("storage root failed health check: {e}");
    }
    Ok(engine)
}

// ── `lockbox store` ────────────────────────────────────────────────────────────

fn cmd_store(
    config: &LockboxConfig,
    request: StoreRequest,
    file: &Path,
    key: &KeyArgs,
) -> Result<()> {
    let key = key.load()?;
    let engine = open_engine(config)?;

    let content: Box<dyn Read> = if file == Path::new("-") {
        Box::new(io::stdin().lock())
    } else {
        Box::new(
            std::fs::File::open(file)
                .with_context(|| format!("opening {}", file.display()))?,
        )
    };

    let record = engine
        .store(request, content, key.as_deref().map(Vec::as_slice))
        .context("store failed")?;

    println!(
        "stored  id={}  {}  ({}{})",
        record.id,
        record.storage_path.display(),
        fmt_bytes(record.size),
        if record.is_encrypted { ", encrypted" } else { "" }
    );
    Ok(())
}

// ── `lockbox retrieve` ─────────────────────────────────────────────────────────

fn cmd_retrieve(
    config: &LockboxConfig,
    owner: OwnerId,
    id: FileId,
    out: Option<&Path>,
    key: &KeyArgs,
) -> Result<()> {
    let key = key.load()?;
    let engine = open_engine(config)?;

    let mut retrieved = engine
        .retrieve(id, owner, key.as_deref().map(Vec::as_slice))
        .with_context(|| format!("retrieve {id} failed"))?;

    match out {
        Some(path) => {
            // Stage then rename, so a mid-stream auth failure never leaves partial plaintext
            let written = AtomicWriter::new(config.storage.dir_mode)
                .write(path, |w| {
                    io::copy(&mut retrieved.content, w)
                        .map_err(|e| LockboxError::from_io(e, "decrypting"))
                })
                .with_context(|| format!("retrieve {id} failed"))?;
            info!(id = %id, path = %path.display(), bytes = written, "wrote plaintext");
            eprintln!("wrote {} to {}", fmt_bytes(written), path.display());
        }
        None => {
            let stdout = io::stdout();
            let mut lock = stdout.lock();
            io::copy(&mut retrieved.content, &mut lock)
                .map_err(|e| LockboxError::from_io(e, "writing to stdout"))
                .with_context(|| format!("retrieve {id} failed"))?;
            lock.flush().context("flushing stdout")?;
        }
    }
    Ok(())
}

// ── `lockbox stat` / `lockbox list` ────────────────────────────────────────────

fn cmd_stat(config: &LockboxConfig, owner: OwnerId, id: FileId, json: bool) -> Result<()> {
    let engine = open_engine(config)?;
    let record = engine
        .stat(id, owner)
        .with_context(|| format!("stat {id} failed"))?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&record).context("serializing record")?
        );
        return Ok(());
    }

    println!("id:            {}", record.id);
    println!("name:          {}", record.name);
    println!("content type:  {}", record.content_type);
    println!("description:   {}", record.description);
    println!("owner:         {}", record.owner_id);
    println!("storage path:  {}", record.storage_path.display());
    println!("encrypted:     {}", record.is_encrypted);
    println!("size:          {} ({} bytes)", fmt_bytes(record.size), record.size);
    println!("created:       {}", record.created_at);
    println!("updated:       {}", record.updated_at);
    Ok(())
}

fn cmd_list(config: &LockboxConfig, owner: OwnerId, json: bool) -> Result<()> {
    let engine = open_engine(config)?;
    let records = engine.list(owner).context("list failed")?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&records).context("serializing records")?
        );
        return Ok(());
    }

    if records.is_empty() {
        println!("no files for owner {owner}");
        return Ok(());
    }
    println!("{:>6}  {:>10}  {:<4}  NAME", "ID", "SIZE", "ENC");
    for record in &records {
        print_row(record);
    }
    Ok(())
}

fn print_row(record: &FileRecord) {
    println!(
        "{:>6}  {:>10}  {:<4}  {}",
        record.id,
        fmt_bytes(record.size),
        if record.is_encrypted { "yes" } else { "no" },
        record.name
    );
}

// ── `lockbox update` / `lockbox delete` ────────────────────────────────────────

fn cmd_update(config: &LockboxConfig, owner: OwnerId, id: FileId, patch: &RecordPatch) -> Result<()> {
    if patch.is_empty() {
        anyhow::bail!("nothing to update: pass --name, --content-type or --description");
    }
    let engine = open_engine(config)?;
    let record = engine
        .update(id, owner, patch)
        .with_context(|| format!("update {id} failed"))?;
    print_row(&record);
    Ok(())
}

fn cmd_delete(config: &LockboxConfig, owner: OwnerId, id: FileId) -> Result<()> {
    let engine = open_engine(config)?;
    engine
        .delete(id, owner)
        .with_context(|| format!("delete {id} failed"))?;
    println!("deleted {id}");
    Ok(())
}

// ── `lockbox check` / `lockbox keygen` / `lockbox config show` ────────────────

fn cmd_check(config: &LockboxConfig) -> Result<()> {
    let root = &config.storage.root;
    check_root(root).with_context(|| format!("storage root {} is not usable", root.display()))?;
    lockbox_crypto::validate_chunk_size(config.storage.chunk_size).context("invalid [storage]")?;
    println!("storage root:  {}  ok", root.display());
    println!("chunk size:    {}", fmt_bytes(config.storage.chunk_size as u64));
    println!("metadata:      {}", config.metadata.path.display());
    Ok(())
}

fn cmd_keygen(bytes: usize) -> Result<()> {
    let key = EncryptionKey::generate(bytes).context("keygen failed")?;
    let encoded = Zeroizing::new(base64::engine::general_purpose::STANDARD.encode(key.as_bytes()));
    println!("{}", encoded.as_str());
    Ok(())
}

fn cmd_config_show(config: &LockboxConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_store() {
        let cli = Cli::try_parse_from([
            "lockbox", "--as", "7", "store", "report.pdf", "-t", "application/pdf",
        ])
        .unwrap();
        assert_eq!(cli.owner, Some(7));
        match cli.command {
            Commands::Store {
                file, content_type, ..
            } => {
                assert_eq!(file, PathBuf::from("report.pdf"));
                assert_eq!(content_type, "application/pdf");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_config_flag_after_subcommand() {
        let cli = Cli::try_parse_from([
            "lockbox", "store", "-c", "x.toml", "report.pdf", "--as", "3",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("x.toml"));
        assert_eq!(cli.owner, Some(3));
        assert!(matches!(cli.command, Commands::Store { .. }));

        let cli = Cli::try_parse_from(["lockbox", "config", "show", "--config", "y.toml"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("y.toml"));
    }

    #[test]
    fn test_key_and_key_file_conflict() {
        let result = Cli::try_parse_from([
            "lockbox", "retrieve", "1", "--key", "AAAA", "--key-file", "k.bin",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_key_from_base64() {
        let args = KeyArgs {
            key: Some(base64::engine::general_purpose::STANDARD.encode([5u8; 16])),
            key_file: None,
        };
        assert_eq!(args.load().unwrap().unwrap().as_slice(), &[5u8; 16]);

        let bad = KeyArgs {
            key: Some("not base64!".into()),
            key_file: None,
        };
        assert!(bad.load().is_err());
        assert!(KeyArgs::default().load().unwrap().is_none());
    }

    #[test]
    fn test_key_from_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("key.bin");
        std::fs::write(&path, [9u8; 32]).unwrap();

        let args = KeyArgs {
            key: None,
            key_file: Some(path),
        };
        assert_eq!(args.load().unwrap().unwrap().len(), 32);
    }

    #[test]
    fn test_store_name() {
        assert_eq!(store_name(Path::new("dir/a.txt"), None).unwrap(), "a.txt");
        assert_eq!(
            store_name(Path::new("-"), Some("piped.txt".into())).unwrap(),
            "piped.txt"
        );
        assert!(store_name(Path::new("-"), None).is_err());
    }

    #[test]
    fn test_fmt_bytes() {
        assert_eq!(fmt_bytes(512), "512 B");
        assert_eq!(fmt_bytes(1536), "1.5 KB");
        assert_eq!(fmt_bytes(5 * 1024 * 1024), "5.0 MB");
    }
}
