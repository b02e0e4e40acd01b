use anyhow::{Context, Result};
use azprov::azure::auth::AzureCredentials;
use azprov::azure::client::ArmClient;
use azprov::config::{load_ssh_public_key, Config};
use azprov::orchestrator::{CancelSignal, ProvisioningRun};
use azprov::provider::memory::InMemoryProvider;
use azprov::provider::ResourceApi;
use azprov::resource::template::{standard_topology, TemplateParams};
use azprov::resource::{parse_descriptors, ResourceDescriptor, SchemaRegistry};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::level_filters::LevelFilter;
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Version injected at compile time via AZPROV_VERSION env var (set by CI/CD),
/// or "dev" for local builds.
pub const VERSION: &str = match option_env!("AZPROV_VERSION") {
    Some(v) => v,
    None => "dev",
};

/// Provision a set of dependent Azure resources
#[derive(Parser, Debug)]
#[command(name = "azprov", version, about, long_about = None)]
struct Args {
    /// Descriptor file (YAML or JSON); the built-in VM topology when omitted
    #[arg(short, long)]
    spec: Option<PathBuf>,

    /// Azure subscription id
    #[arg(long)]
    subscription: Option<String>,

    /// Region for the built-in topology
    #[arg(short, long)]
    location: Option<String>,

    /// Resource group name for the built-in topology
    #[arg(short = 'g', long)]
    resource_group: Option<String>,

    /// SSH public key for the VM admin account (default: ~/.ssh/id_rsa.pub, then id_ed25519.pub)
    #[arg(long)]
    ssh_public_key: Option<PathBuf>,

    /// Provision against an in-memory simulation instead of Azure
    #[arg(long)]
    dry_run: bool,

    /// Resources in flight at once
    #[arg(long)]
    max_concurrency: Option<usize>,

    /// Cancel the run after this many seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Update existing resources whose configuration differs
    #[arg(long)]
    allow_update: bool,

    /// Report format
    #[arg(short, long, value_enum, default_value = "text")]
    output: OutputFormat,

    /// Log level for debugging
    #[arg(long, value_enum, default_value = "off")]
    log_level: LogLevel,

    /// Persist subscription, location and concurrency for later runs
    #[arg(long)]
    save_config: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Option<Level> {
        match self {
            LogLevel::Off => None,
            LogLevel::Error => Some(Level::ERROR),
            LogLevel::Warn => Some(Level::WARN),
            LogLevel::Info => Some(Level::INFO),
            LogLevel::Debug => Some(Level::DEBUG),
            LogLevel::Trace => Some(Level::TRACE),
        }
    }
}

/// `RUST_LOG` wins over `--log-level` when set
fn setup_logging(level: LogLevel) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = match (std::env::var("RUST_LOG").ok(), level.to_tracing_level()) {
        (Some(directives), _) => EnvFilter::new(directives),
        (None, Some(level)) => EnvFilter::default().add_directive(LevelFilter::from_level(level).into()),
        (None, None) => return None,
    };

    let log_path = get_log_path();

    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let file = match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
    {
        Ok(file) => file,
        Err(e) => {
            eprintln!("Cannot open log file {:?}: {}", log_path, e);
            return None;
        }
    };

    let (non_blocking, guard) = tracing_appender::non_blocking(file);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::info!("azprov {} started with log level: {:?}", VERSION, level);
    tracing::info!("Log file: {:?}", log_path);

    Some(guard)
}

fn get_log_path() -> PathBuf {
    if let Some(config_dir) = dirs::config_dir() {
        return config_dir.join("azprov").join("azprov.log");
    }
    if let Some(home) = dirs::home_dir() {
        return home.join(".azprov").join("azprov.log");
    }
    PathBuf::from("azprov.log")
}

fn load_descriptors(args: &Args, config: &Config) -> Result<Vec<ResourceDescriptor>> {
    if let Some(path) = &args.spec {
        let content = std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
        return parse_descriptors(&content).with_context(|| format!("Invalid descriptor file {:?}", path));
    }

    let mut params = TemplateParams {
        location: config.effective_location(),
        ssh_public_key: load_ssh_public_key(
            args.ssh_public_key.as_deref(),
            dirs::home_dir().map(|home| home.join(".ssh")).as_deref(),
        )?,
        ..TemplateParams::default()
    };
    if let Some(group) = &args.resource_group {
        params.resource_group = group.clone();
    }

    Ok(standard_topology(&params))
}

async fn connect(args: &Args, config: &Config) -> Result<Arc<dyn ResourceApi>> {
    if args.dry_run {
        let provider = match &config.subscription_id {
            Some(subscription) => InMemoryProvider::new().with_subscription(subscription),
            None => InMemoryProvider::new(),
        };
        return Ok(Arc::new(provider));
    }

    let subscription = config
        .effective_subscription()
        .await
        .context("No subscription configured. Pass --subscription, set AZURE_SUBSCRIPTION_ID, or run 'az login'")?;

    let client = ArmClient::new(AzureCredentials::from_env(), &subscription, &config.effective_endpoint())?;
    Ok(Arc::new(client))
}

async fn provision(args: Args) -> Result<ExitCode> {
    let mut config = Config::load();
    config.merge(Config {
        subscription_id: args.subscription.clone(),
        location: args.location.clone(),
        max_concurrency: args.max_concurrency,
        allow_update: args.allow_update.then_some(true),
        ..Config::default()
    });

    if args.save_config {
        config.save().context("Failed to save configuration")?;
    }

    let descriptors = load_descriptors(&args, &config)?;
    let api = connect(&args, &config).await?;

    let run = ProvisioningRun::new(
        api,
        Arc::new(SchemaRegistry::builtin().clone()),
        config.executor_config(),
        config.run_options(args.timeout.map(Duration::from_secs)),
    );

    let cancel = CancelSignal::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted, waiting for in-flight operations...");
            on_interrupt.cancel();
        }
    });

    let report = match run.execute(&descriptors, &cancel).await {
        Ok(report) => report,
        Err(e) => {
            eprintln!("Error: {}", e);
            return Ok(ExitCode::from(1));
        }
    };

    match args.output {
        OutputFormat::Text => print!("{}", report.render_text()),
        OutputFormat::Json => println!("{}", report.to_json()?),
    }

    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let _log_guard = setup_logging(args.log_level);

    match provision(args).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::from(2)
        }
    }
}
