use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use tracing_log::LogTracer;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use helpdesk_sync::credentials::CredentialSource;
use helpdesk_sync::enrich::{enrich_users, USERS};
use helpdesk_sync::export::{collection_documents, export_documents, ExportFormat};
use helpdesk_sync::sync::{sync_tenant, CancelFlag, LogProgress, SyncOptions};
use helpdesk_sync::{AppConfig, CredentialStore, Credentials, EndpointRegistry, TenantStore};

struct RotatingFile {
    path: String,
    max_size: u64,
    max_files: u32,
    file: File,
    current_size: u64,
}

fn init_logging() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // stdout is kept for command output.
    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_writer(io::stderr)
        .with_timer(fmt::time::UtcTime::rfc_3339());

    if let Ok(path) = std::env::var("HELPDESK_SYNC_LOG_FILE") {
        let max_size_mb = std::env::var("HELPDESK_SYNC_LOG_MAX_SIZE_MB")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(10);
        let max_files = std::env::var("HELPDESK_SYNC_LOG_MAX_FILES")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(3);
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        if let Ok(rot) = RotatingFile::new(path, max_size_mb * 1024 * 1024, max_files) {
            builder.target(env_logger::Target::Pipe(Box::new(rot)));
        }
        // `log` records go to the file; tracing keeps its own stderr output.
        let _ = builder.try_init();
    } else {
        let _ = LogTracer::init();
    }

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init();
}

impl RotatingFile {
    fn new(path: String, max_size: u64, max_files: u32) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let current_size = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            path,
            max_size,
            max_files,
            file,
            current_size,
        })
    }

    // path -> path.1 -> path.2 ... up to max_files
    fn rotate(&mut self) -> io::Result<()> {
        for i in (1..self.max_files).rev() {
            let _ = std::fs::rename(format!("{}.{}", self.path, i), format!("{}.{}", self.path, i + 1));
        }
        let _ = std::fs::rename(&self.path, format!("{}.1", self.path));
        self.file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        self.current_size = 0;
        Ok(())
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.current_size + buf.len() as u64 > self.max_size {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.current_size += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

#[derive(Parser)]
#[command(name = "helpdesk-sync")]
#[command(about = "Mirror help desk REST resources into per-tenant local collections")]
struct Cli {
    /// Optional JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Overrides the configured data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Overrides the configured endpoint configuration file
    #[arg(long, global = true)]
    endpoint_config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Manage tenant credentials
    Tenant {
        #[command(subcommand)]
        cmd: TenantCmd,
    },
    /// List configured endpoints
    Endpoints {
        /// Include inactive endpoints
        #[arg(long)]
        all: bool,
    },
    /// Sync every active endpoint of a tenant
    Sync {
        #[arg(short, long)]
        tenant: String,
        /// Clear each target collection before its first write
        #[arg(long)]
        refresh: bool,
        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },
    /// List a tenant's collections with document counts
    Collections {
        #[arg(short, long)]
        tenant: String,
    },
    /// Export one collection to a file
    Export {
        #[arg(short, long)]
        tenant: String,
        #[arg(short, long)]
        collection: String,
        #[arg(short, long, value_enum, default_value_t = ExportFormat::Csv)]
        format: ExportFormat,
        #[arg(short, long)]
        output: PathBuf,
        /// Export users with organization, group and role names resolved
        #[arg(long)]
        enrich_users: bool,
    },
    /// Build an index on a collection field
    Index {
        #[arg(short, long)]
        tenant: String,
        #[arg(short, long)]
        collection: String,
        #[arg(long)]
        field: String,
        #[arg(long)]
        unique: bool,
    },
}

#[derive(Subcommand)]
enum TenantCmd {
    /// Register a tenant
    Add {
        #[arg(short, long)]
        subdomain: String,
        #[arg(short, long)]
        email: String,
        #[arg(short = 'k', long)]
        api_key: String,
    },
    /// Replace a tenant's credentials, optionally under a new subdomain
    Update {
        /// Subdomain currently registered
        #[arg(short, long)]
        subdomain: String,
        #[arg(long)]
        new_subdomain: Option<String>,
        #[arg(short, long)]
        email: String,
        #[arg(short = 'k', long)]
        api_key: String,
    },
    /// List registered tenants
    List,
    /// Remove a tenant's credentials
    Remove {
        #[arg(short, long)]
        subdomain: String,
    },
}

fn load_config(cli: &Cli) -> Result<AppConfig> {
    let mut config = AppConfig::load(cli.config.as_deref())?;
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(file) = &cli.endpoint_config {
        config.endpoint_config = file.clone();
    }
    Ok(config)
}

async fn run_tenant(config: &AppConfig, cmd: TenantCmd) -> Result<()> {
    let store = CredentialStore::open(&config.credentials_dir())?;
    match cmd {
        TenantCmd::Add {
            subdomain,
            email,
            api_key,
        } => {
            store.add(&Credentials::new(subdomain.as_str(), email, api_key))?;
            println!("Added tenant {subdomain}");
        }
        TenantCmd::Update {
            subdomain,
            new_subdomain,
            email,
            api_key,
        } => {
            let target = new_subdomain.unwrap_or_else(|| subdomain.clone());
            store.update(&subdomain, &Credentials::new(target.as_str(), email, api_key))?;
            println!("Updated tenant {target}");
        }
        TenantCmd::List => {
            for creds in store.list()? {
                println!("{}\t{}", creds.subdomain, creds.api_user_email);
            }
        }
        TenantCmd::Remove { subdomain } => {
            if !store.remove(&subdomain)? {
                bail!("unknown tenant: {subdomain}");
            }
            println!("Removed tenant {subdomain}");
        }
    }
    store.close().await?;
    Ok(())
}

fn run_endpoints(config: &AppConfig, all: bool) {
    let registry = EndpointRegistry::load(&config.endpoint_config);

    if all {
        println!("All endpoints ({}):", registry.len());
        for spec in registry.iter() {
            println!("  {} [{:?}] {}", spec.name, spec.status, spec.path_template);
        }
    }

    let independent = registry.active_independent_endpoint_names();
    let dependent = registry.active_dependent_endpoint_names();
    println!("Independent endpoints ({}):", independent.len());
    for name in &independent {
        println!("  {name}");
    }
    println!("Dependent endpoints ({}):", dependent.len());
    for name in &dependent {
        println!("  {name}");
    }
    println!(
        "Active endpoints: {}, active collections: {}, dependent collections: {}",
        registry.active_endpoint_names().len(),
        registry.active_collection_names().len(),
        registry.active_dependent_collection_names().len()
    );
    for name in registry.duplicate_names() {
        warn!("Endpoint name '{name}' is declared more than once");
    }
}

async fn run_sync(config: &AppConfig, tenant: &str, refresh: bool, json: bool) -> Result<()> {
    let credentials = {
        let store = CredentialStore::open(&config.credentials_dir())?;
        let creds = store.credentials(tenant)?;
        store.close().await?;
        creds
    };
    let registry = EndpointRegistry::load(&config.endpoint_config);
    if registry.is_empty() {
        bail!(
            "no endpoints configured in {}",
            config.endpoint_config.display()
        );
    }

    let cancel = CancelFlag::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, stopping after the current endpoint");
            on_ctrl_c.cancel();
        }
    });

    info!("Starting sync for tenant '{tenant}'");
    let progress = LogProgress::new(cancel);
    let report = sync_tenant(
        config,
        &registry,
        &credentials,
        &progress,
        SyncOptions { refresh },
    )
    .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Tenant: {}", report.tenant);
        println!("Finished as: {:?}", report.final_phase);
        println!("Populated endpoints: {}", report.populated_count);
        println!("Documents written: {}", report.documents_written);
        for name in &report.empty_endpoints {
            println!("Empty: {name}");
        }
        for (name, message) in &report.errored_endpoints {
            println!("Error: {name}: {message}");
        }
    }
    Ok(())
}

async fn run_collections(config: &AppConfig, tenant: &str) -> Result<()> {
    let store = TenantStore::open(&config.tenants_dir(), tenant)?;
    for name in store.list_collections() {
        let count = store.existing_collection(&name)?.map(|c| c.count()).unwrap_or(0);
        println!("{name}\t{count}");
    }
    store.close().await?;
    Ok(())
}

async fn run_export(
    config: &AppConfig,
    tenant: &str,
    collection: &str,
    format: ExportFormat,
    output: &Path,
    enrich: bool,
) -> Result<()> {
    let store = TenantStore::open(&config.tenants_dir(), tenant)?;
    let docs = if enrich {
        if collection != USERS {
            warn!("--enrich-users reads the '{USERS}' collection, not '{collection}'");
        }
        enrich_users(&store, &config.base_url_for(tenant))?
    } else {
        collection_documents(&store, collection)?
    };
    let written = export_documents(&docs, format, output)
        .with_context(|| format!("exporting to {}", output.display()))?;
    store.close().await?;
    println!("Exported {written} documents to {}", output.display());
    Ok(())
}

async fn run_index(
    config: &AppConfig,
    tenant: &str,
    collection: &str,
    field: &str,
    unique: bool,
) -> Result<()> {
    let store = TenantStore::open(&config.tenants_dir(), tenant)?;
    let Some(coll) = store.existing_collection(collection)? else {
        bail!("collection '{collection}' does not exist for tenant '{tenant}'");
    };
    coll.create_index(field, unique)?;
    coll.close().await?;
    store.close().await?;
    println!("Indexed {collection}.{field}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let outcome = match cli.command {
        Command::Tenant { cmd } => run_tenant(&config, cmd).await,
        Command::Endpoints { all } => {
            run_endpoints(&config, all);
            Ok(())
        }
        Command::Sync {
            tenant,
            refresh,
            json,
        } => run_sync(&config, &tenant, refresh, json).await,
        Command::Collections { tenant } => run_collections(&config, &tenant).await,
        Command::Export {
            tenant,
            collection,
            format,
            output,
            enrich_users,
        } => run_export(&config, &tenant, &collection, format, &output, enrich_users).await,
        Command::Index {
            tenant,
            collection,
            field,
            unique,
        } => run_index(&config, &tenant, &collection, &field, unique).await,
    };

    if let Err(e) = &outcome {
        error!("{e:#}");
    }
    outcome
}
