use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use hearth_hub::broker::{BrokerClient, module_topic};
use hearth_hub::envelope::{Envelope, Request, decode_response, encode_request};
use hearth_hub::invoke::rpc::{self, socket_path};
use hearth_hub::invoke::{Invoker, RemoteHandle};
use hearth_hub::lifecycle::Supervisor;
use hearth_hub::modules::build_service;
use hearth_hub::security::{EnvelopeCipher, HubIdentity, SharedKeyCipher, write_key_file};
use hearth_hub::Config;
use uuid::Uuid;

/// Hearth - home automation hub bridging a WAN relay to local modules
#[derive(Parser)]
#[command(name = "hearth", version, about)]
struct Cli {
    /// Config file (defaults to ~/.config/hearth/config.toml)
    #[arg(short, long, env = "HEARTH_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the hub (default)
    Run,
    /// Serve one configured module on its socket
    ServeModule {
        /// Module name from the config file
        name: String,
    },
    /// Call a method on a running module socket
    Invoke {
        /// Module socket; the file name is the module name
        #[arg(short, long)]
        socket: PathBuf,
        /// Method name
        method: String,
        /// Arguments as a JSON object
        args: Option<String>,
    },
    /// Call a module through the running hub's broker
    Call {
        /// Module name
        module: String,
        /// Method name
        method: String,
        /// Arguments as a JSON object
        args: Option<String>,
        /// How long to wait for the reply
        #[arg(long, default_value_t = 2000)]
        timeout_ms: u64,
    },
    /// Check that a reply envelope was signed by this hub
    VerifyReply {
        /// Envelope as JSON; `-` reads standard input
        envelope: String,
    },
    /// Write a fresh shared envelope key
    Keygen {
        /// Where to write the key
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,hearth_hub=info",
        1 => "info,hearth_hub=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_hub(cli.config.as_deref()).await,
        Command::ServeModule { name } => serve_module(cli.config.as_deref(), &name).await,
        Command::Invoke {
            socket,
            method,
            args,
        } => invoke(&socket, &method, args.as_deref()).await,
        Command::Call {
            module,
            method,
            args,
            timeout_ms,
        } => {
            let request = Request::new(module, method, parse_args(args.as_deref())?)?;
            call(cli.config.as_deref(), request, Duration::from_millis(timeout_ms)).await
        }
        Command::VerifyReply { envelope } => verify_reply(cli.config.as_deref(), &envelope),
        Command::Keygen { path } => {
            write_key_file(&path)?;
            println!("wrote key to {}", path.display());
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let config = Config::load(path).context("failed to load configuration")?;
    config.validate()?;
    Ok(config)
}

async fn run_hub(config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;

    tracing::info!(
        hub_id = %config.id,
        discovery = ?config.discovery.mode,
        socket_dir = %config.discovery.socket_dir.display(),
        relay = config.relay.enabled,
        "starting hearth hub"
    );

    let mut supervisor = Supervisor::from_config(&config)?;
    if config.broker.listen {
        supervisor.start_broker_endpoint(&config.broker.socket)?;
    }
    supervisor.start_configured_discovery(&config)?;
    supervisor.start_relay()?;
    supervisor.run_until_signal().await?;
    Ok(())
}

async fn serve_module(config_path: Option<&Path>, name: &str) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let module = config
        .module(name)
        .with_context(|| format!("module '{name}' is not configured"))?;
    let service = build_service(module)?;

    let dir = &config.discovery.socket_dir;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create socket directory {}", dir.display()))?;
    let path = socket_path(dir, name);

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
        }
        on_signal.cancel();
    });

    tracing::info!(module = name, socket = %path.display(), "serving module");
    rpc::serve(&path, service, shutdown).await?;
    Ok(())
}

async fn invoke(socket: &Path, method: &str, args: Option<&str>) -> anyhow::Result<()> {
    let module = socket
        .file_name()
        .and_then(|name| name.to_str())
        .context("socket path has no file name")?;
    let args = parse_args(args)?;

    let handle = RemoteHandle::connect(module, socket).await?;
    let result = handle.invoke(Request::new(module, method, args)?).await;
    handle.close().await;

    let response = result?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

async fn call(config_path: Option<&Path>, request: Request, timeout: Duration) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let cipher = SharedKeyCipher::load(&config.key_file)?;

    let contents = cipher.encrypt(&encode_request(&request)?)?;
    let envelope = Envelope::new(Uuid::new_v4(), config.id, contents);

    let client = BrokerClient::connect(&config.broker.socket).await?;
    let result = client
        .request(&module_topic(&request.module), envelope, timeout)
        .await;
    client.close().await;

    let reply = result?;
    let response = decode_response(&cipher.decrypt(&reply.contents)?)?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

fn verify_reply(config_path: Option<&Path>, raw: &str) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    if !config.identity_file.exists() {
        anyhow::bail!("no hub identity at {}", config.identity_file.display());
    }
    let identity = HubIdentity::load_or_create(&config.identity_file)?;

    let raw = if raw == "-" {
        std::io::read_to_string(std::io::stdin()).context("failed to read standard input")?
    } else {
        raw.to_string()
    };
    let envelope: Envelope = serde_json::from_str(&raw).context("envelope must be JSON")?;

    if identity.verify_envelope(&envelope)? {
        println!("signed by {}", identity.short_id());
        Ok(())
    } else {
        anyhow::bail!("envelope is not signed by {}", identity.short_id())
    }
}

fn parse_args(args: Option<&str>) -> anyhow::Result<serde_json::Value> {
    match args {
        Some(raw) => serde_json::from_str(raw).context("arguments must be JSON"),
        None => Ok(serde_json::Value::Null),
    }
}
