//! Entry point: parses configuration, loads any existing snapshot, and
//! hands off to the selected concurrency driver.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crimsoncache::config::Config;
use crimsoncache::context::ServerContext;

/// CrimsonCache server.
#[derive(Parser, Debug)]
#[command(name = "crimsoncache", version, about = "An in-memory key/value server")]
struct Cli {
    /// A port number (1-65535) to override the default port, or a path to
    /// a config file. Omit to run with defaults.
    arg: Option<String>,

    /// Path to the CCDB snapshot file.
    #[arg(long, default_value = "dump.ccdb")]
    dbfile: PathBuf,
}

fn init_logging(log_file: Option<&str>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path);
            match file {
                Ok(file) => {
                    let (writer, guard) = tracing_appender::non_blocking(file);
                    Box::leak(Box::new(guard));
                    tracing_subscriber::fmt()
                        .with_env_filter(filter)
                        .with_target(false)
                        .with_writer(writer)
                        .init();
                }
                Err(e) => {
                    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
                    tracing::warn!("could not open log file {path} ({e}), logging to stderr");
                }
            }
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::resolve(cli.arg.as_deref());
    init_logging(config.log_file.as_deref());

    tracing::info!("starting crimsoncache on port {}", config.port);

    let ctx = Arc::new(ServerContext::new(config, cli.dbfile.clone()));
    {
        let mut keyspace = ctx.keyspace.lock().unwrap();
        crimsoncache::persistence::load(&mut keyspace, &cli.dbfile)
            .context("loading snapshot")?;
    }

    crimsoncache::driver::run(ctx).context("server loop failed")?;
    Ok(())
}
