mod cli;
mod error;
mod listeners;
mod notify;

use std::path::Path;
use std::sync::Arc;

use clap::{CommandFactory, Parser};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use wazigate_config::Config;
use wazigate_core::clouds::registry::parse_configs;
use wazigate_core::{Gateway, GatewayOptions, MemoryStore, Store};
use wazigate_mqtt::BrokerOptions;

use crate::cli::{Cli, Command, ConfigArgs, ServeArgs};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(err) = run(cli).await {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}

// ── Tracing ──────────────────────────────────────────────────────────

/// `RUST_LOG` wins, then `-v`, then the legacy `log` setting.
fn init_tracing(verbose: u8, legacy: Option<&str>) -> WorkerGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = match verbose {
            0 => legacy.unwrap_or("info"),
            1 => "debug",
            _ => "trace",
        };
        EnvFilter::new(level)
    });

    let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(writer).compact())
        .init();
    guard
}

// ── Dispatch ─────────────────────────────────────────────────────────

async fn run(cli: Cli) -> Result<(), CliError> {
    if let Some(Command::Completions(args)) = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(args.shell, &mut cmd, "wazigate", &mut std::io::stdout());
        return Ok(());
    }

    let config_path = cli.global.config.as_deref();
    let config = wazigate_config::load_config(config_path)?;

    match cli.command {
        None => serve(config, ServeArgs::default(), cli.global.verbose).await,
        Some(Command::Serve(args)) => serve(config, args, cli.global.verbose).await,
        Some(Command::Clouds) => print_clouds(&config.clouds_file),
        Some(Command::Config(args)) => print_config(&config, &args, config_path),
        Some(Command::Completions(_)) => Ok(()),
    }
}

// ── serve ────────────────────────────────────────────────────────────

async fn serve(mut config: Config, args: ServeArgs, verbose: u8) -> Result<(), CliError> {
    if args.crt.is_some() {
        config.tls_crt = args.crt;
    }
    if args.key.is_some() {
        config.tls_key = args.key;
    }
    if args.id.is_some() {
        config.local_id = args.id;
    }
    config.validate()?;

    let _guard = init_tracing(verbose, config.log_level());
    info!(version = env!("CARGO_PKG_VERSION"), "wazigate starting");

    let tls = config
        .tls()
        .map(|(crt, key)| listeners::tls_acceptor(crt, key))
        .transpose()?;

    let options = GatewayOptions {
        local_id: config.local_id.clone(),
        clouds_file: config.clouds_file.clone(),
        session_dir: config.session_dir.clone(),
        sync_interval: config.sync_interval()?,
        read_timeout: config.read_timeout()?,
        broker: BrokerOptions {
            max_pending: config.max_pending,
            ..BrokerOptions::default()
        },
        ..GatewayOptions::default()
    };
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let gateway = Gateway::start(options, store).await?;

    let cancel = CancellationToken::new();
    let tasks = match listeners::bind_all(&config, gateway.broker(), tls, &cancel).await {
        Ok(tasks) => tasks,
        Err(e) => {
            gateway.shutdown().await;
            return Err(e);
        }
    };
    notify::ready();
    info!(local_id = gateway.local_id(), "gateway ready");

    shutdown_signal().await;
    info!("shutting down");

    gateway.shutdown().await;
    cancel.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "listener task failed");
        }
    }
    info!("bye");
    Ok(())
}

/// Ctrl-C everywhere, SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let term = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let term = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = term => {}
    }
}

// ── clouds ───────────────────────────────────────────────────────────

fn print_clouds(path: &Path) -> Result<(), CliError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            eprintln!(
                "No clouds file at {}. It is created on first start.",
                path.display()
            );
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    let configs = parse_configs(&raw)?;
    if configs.is_empty() {
        println!("No clouds configured.");
        return Ok(());
    }

    println!("{:<12} {:<8} {:<7} {:<16} REST", "ID", "STATE", "STATUS", "USER");
    for cloud in configs.values() {
        let state = if cloud.paused { "paused" } else { "active" };
        let status = if cloud.status_code == 0 {
            "-".to_owned()
        } else {
            cloud.status_code.to_string()
        };
        let user = if cloud.credentials.username.is_empty() {
            "-"
        } else {
            cloud.credentials.username.as_str()
        };
        println!(
            "{:<12} {:<8} {:<7} {:<16} {}",
            cloud.id, state, status, user, cloud.rest
        );
        if !cloud.status_text.is_empty() {
            println!("{:<12} {}", "", cloud.status_text);
        }
    }
    Ok(())
}

// ── config ───────────────────────────────────────────────────────────

fn print_config(
    config: &Config,
    args: &ConfigArgs,
    explicit: Option<&Path>,
) -> Result<(), CliError> {
    print!("{}", config.to_toml()?);
    if args.write {
        let path = wazigate_config::config_path(explicit);
        wazigate_config::save_config(config, &path)?;
        eprintln!("Wrote {}", path.display());
    }
    Ok(())
}
