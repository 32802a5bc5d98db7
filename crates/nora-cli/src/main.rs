use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use nora_translation::config_file::{self, ConfigFile};
use nora_translation::preflight;
use nora_translation::{
    LocalProber, PortProber, Supervisor, TranslationClient, TranslationRequest, TranslatorConfig,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod output;

use output::ColorMode;

/// Bibliographic metadata for URLs and identifiers via a local Zotero translation-server
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct GlobalArgs {
    /// Port the translation-server listens on
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Translation-server installation directory
    #[arg(long, global = true)]
    server_dir: Option<PathBuf>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Translate a web page URL into a Zotero item
    Url {
        url: String,

        /// Request timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Translate a DOI, ISBN, PMID or arXiv ID into a Zotero item
    Identifier {
        identifier: String,

        /// Request timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Report whether a translation-server is answering on the port
    Status,

    /// Terminate whatever process currently owns the port
    KillStale,

    /// Check Node.js and the translation-server installation
    Doctor,

    /// Inspect or write the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the resolved settings as TOML
    Show,

    /// Write the resolved settings to the config file
    Init {
        /// Write here instead of the platform config directory
        #[arg(long)]
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.global.verbose);

    let config = resolve_config(&cli.global)?;
    let color = ColorMode(!cli.global.no_color && std::io::stdout().is_terminal());

    match cli.command {
        Command::Url { url, timeout } => {
            translate(config, TranslationRequest::ByUrl(url), timeout, color).await
        }
        Command::Identifier {
            identifier,
            timeout,
        } => {
            translate(
                config,
                TranslationRequest::ByIdentifier(identifier),
                timeout,
                color,
            )
            .await
        }
        Command::Status => status(config, color).await,
        Command::KillStale => kill_stale(config).await,
        Command::Doctor => doctor(config, color),
        Command::Config { action } => match action {
            ConfigAction::Show => {
                print!("{}", config_file::to_toml(&ConfigFile::from_config(&config))?);
                Ok(())
            }
            ConfigAction::Init { path, force } => {
                let written = init_config(&config, path.as_deref(), force)?;
                println!("Wrote {}", written.display());
                Ok(())
            }
        },
    }
}

fn init_tracing(verbose: u8) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(match verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        })
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Resolve configuration: CLI flags > env vars > config file > defaults.
fn resolve_config(args: &GlobalArgs) -> anyhow::Result<TranslatorConfig> {
    let mut config = config_file::load_config().apply(TranslatorConfig::default())?;

    if let Ok(dir) = std::env::var("NORA_SERVER_DIR") {
        config.server_dir = PathBuf::from(dir);
    }
    if let Ok(port) = std::env::var("NORA_PORT") {
        config.port = port
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid NORA_PORT {:?}: {}", port, e))?;
    }
    if let Some(secs) = std::env::var("NORA_REQUEST_TIMEOUT")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
    {
        config.request_timeout = Duration::from_secs(secs);
    }

    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(dir) = &args.server_dir {
        config.server_dir = dir.clone();
    }
    if config.port == 0 {
        anyhow::bail!("port must be non-zero");
    }
    tracing::debug!(?config, "resolved configuration");
    Ok(config)
}

async fn translate(
    config: TranslatorConfig,
    request: TranslationRequest,
    timeout: Option<u64>,
    color: ColorMode,
) -> anyhow::Result<()> {
    let timeout = timeout
        .map(Duration::from_secs)
        .unwrap_or(config.request_timeout);
    let client = TranslationClient::new(config);

    let cancel = CancellationToken::new();

    // Set up Ctrl+C handler
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel_clone.cancel();
        }
    });

    let outcome = tokio::select! {
        result = client.translate(&request, timeout) => Some(result),
        _ = cancel.cancelled() => None,
    };

    // Stop the helper on every path, including Ctrl+C.
    client.shutdown().await;

    let Some(result) = outcome else {
        anyhow::bail!("interrupted");
    };
    let result = result?;

    let stdout = std::io::stdout();
    let mut writer = stdout.lock();
    output::print_result(&mut writer, &result, color)?;
    writer.flush()?;
    Ok(())
}

async fn status(config: TranslatorConfig, color: ColorMode) -> anyhow::Result<()> {
    let port = config.port;
    let base_url = config.base_url();
    let mut supervisor = Supervisor::new(config);
    let state = supervisor.readiness().await;
    let owner = LocalProber::default().owner_pid(port).await;

    let stdout = std::io::stdout();
    let mut writer = stdout.lock();
    output::print_status(&mut writer, &base_url, state, owner, color)?;
    Ok(())
}

async fn kill_stale(config: TranslatorConfig) -> anyhow::Result<()> {
    let port = config.port;
    let patience = config.kill_patience;
    let poll_interval = config.poll_interval;
    let supervisor = Supervisor::new(config);
    supervisor
        .terminator()
        .kill_port_owner(port, patience, poll_interval)
        .await;
    Ok(())
}

fn doctor(config: TranslatorConfig, color: ColorMode) -> anyhow::Result<()> {
    let node = preflight::check_node_version(config.node_min_major, config.node_max_major)
        .map(|v| format!("v{}.{}.{}", v.major, v.minor, v.patch))
        .map_err(|e| e.to_string());
    let server_dir = preflight::check_server_dir(&config.server_dir)
        .map(|()| config.server_dir.display().to_string())
        .map_err(|e| e.to_string());
    let command = Ok(config.helper_command().join(" "));

    let stdout = std::io::stdout();
    let mut writer = stdout.lock();
    output::print_check(&mut writer, "node", &node, color)?;
    output::print_check(&mut writer, "server dir", &server_dir, color)?;
    output::print_check(&mut writer, "command", &command, color)?;

    if node.is_err() || server_dir.is_err() {
        anyhow::bail!("preflight checks failed");
    }
    Ok(())
}

/// Write `config` as a full config file, to `path` or the platform location.
fn init_config(
    config: &TranslatorConfig,
    path: Option<&Path>,
    force: bool,
) -> anyhow::Result<PathBuf> {
    let file = ConfigFile::from_config(config);
    let target = match path {
        Some(p) => p.to_path_buf(),
        None => config_file::config_path()
            .ok_or_else(|| anyhow::anyhow!("could not determine config directory"))?,
    };
    if target.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", target.display());
    }
    match path {
        Some(p) => config_file::save_to_path(&file, p)?,
        None => {
            config_file::save_config(&file)?;
        }
    }
    Ok(target)
}
