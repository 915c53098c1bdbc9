//! certkeeper - ACME http-01 certificate issuance and renewal
//!
//! Prints `changed=true|false` on success; on failure prints
//! `error[<kind>]: <message>` and exits with the error's status code.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{debug, info};

use certkeeper::{
    AccountKey, HttpAcmeClient, IssueError, Orchestrator, ServiceReloader, SystemctlReloader,
    TrustBootstrap, WebrootPublisher,
};
use certkeeper_config::CertConfig;

/// certkeeper - keeps one service's TLS certificate issued and current
#[derive(Parser, Debug)]
#[command(name = "certkeeper")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config", env = "CERTKEEPER_CONFIG", global = true)]
    config: Option<String>,

    /// Renew even if the installed certificate is current
    #[arg(long = "force", global = true)]
    force: bool,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose", global = true)]
    verbose: bool,

    /// Log output format
    #[arg(long = "log-format", value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Commands {
    /// Issue or renew the certificate if needed (default)
    Run,
    /// Show the renewal decision without contacting the CA
    Check,
    /// Validate the configuration file and exit
    Test,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Text,
    Json,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format);

    let code = match dispatch(cli) {
        Ok(()) => 0,
        Err(err) => report(&err),
    };
    std::process::exit(code);
}

fn init_logging(verbose: bool, format: LogFormat) {
    // stdout is reserved for the changed=... line
    let log_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    match format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
    }
}

fn report(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<IssueError>() {
        Some(issue) => {
            eprintln!("error[{}]: {}", issue.kind(), issue);
            issue.exit_code()
        }
        None => {
            eprintln!("error: {:#}", err);
            1
        }
    }
}

fn dispatch(cli: Cli) -> Result<()> {
    let mut config = load_config(cli.config.as_deref())?;
    config.renewal.force |= cli.force;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Test => {
            println!(
                "certkeeper: configuration for service '{}' test is successful",
                config.service_name
            );
            Ok(())
        }
        Commands::Check => check(&config),
        Commands::Run => {
            let runtime = tokio::runtime::Runtime::new().context("Failed to start runtime")?;
            runtime.block_on(run(&config))
        }
    }
}

fn load_config(path: Option<&str>) -> Result<CertConfig> {
    let path = path.ok_or_else(|| {
        IssueError::Configuration(
            "no configuration file given (use --config or CERTKEEPER_CONFIG)".to_string(),
        )
    })?;
    info!("Loading configuration from: {}", path);
    Ok(CertConfig::from_file(path).map_err(IssueError::from)?)
}

/// Print the renewal decision; touches neither the network nor the install dir
fn check(config: &CertConfig) -> Result<()> {
    let decision = Orchestrator::from_config(config)?.decide();
    println!("renew={}", decision.reason.should_renew());
    println!("reason={}", decision.reason);
    if let Some(existing) = &decision.existing {
        println!("not_after={}", existing.not_after.to_rfc3339());
    }
    Ok(())
}

async fn run(config: &CertConfig) -> Result<()> {
    let extra_root = match TrustBootstrap::from_config(config) {
        Some(bootstrap) => Some(bootstrap.bootstrap().await?),
        None => None,
    };

    let account_key = AccountKey::load(&config.acme.account_key)?;
    debug!(thumbprint = %account_key.thumbprint(), "Loaded ACME account key");

    let client = HttpAcmeClient::new(&config.acme.directory_url, account_key, extra_root.as_deref())
        .map_err(|e| IssueError::Configuration(e.to_string()))?;
    let publisher = WebrootPublisher::new(&config.webroot);

    let outcome = Orchestrator::from_config(config)?
        .run(&client, &publisher)
        .await?;
    println!("changed={}", outcome.changed);

    if outcome.changed {
        if let Some(service) = &config.reload.service {
            SystemctlReloader::new().reload(service).await?;
        }
    }
    Ok(())
}
