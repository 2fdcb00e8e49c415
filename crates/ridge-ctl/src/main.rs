//! ridge-ctl — command-line client for a Ridge cluster.

use std::net::SocketAddr;
use std::path::Path;

use anyhow::{Context, Result};

use ridge_core::config::RidgeConfig;
use ridge_ctl::Client;

// ── Subcommand handlers ───────────────────────────────────────────────────────

async fn cmd_write(config: &RidgeConfig, path: &str) -> Result<()> {
    let client = Client::connect(config).await?;
    let chunks = client
        .write_file(Path::new(path))
        .await
        .with_context(|| format!("failed to write {path}"))?;
    println!("Stored {path} as {chunks} chunk(s)");
    println!("  replication : {}", config.replication.factor);
    println!("  controller  : {}", config.network.controller_addr);
    Ok(())
}

async fn cmd_read(config: &RidgeConfig, name: &str, out_dir: &str) -> Result<()> {
    let client = Client::connect(config).await?;
    let path = client
        .read_file(name, Path::new(out_dir))
        .await
        .with_context(|| format!("failed to read {name}"))?;
    println!("Wrote {}", path.display());
    Ok(())
}

fn print_usage() {
    println!("Usage: ridge-ctl [--controller <addr>] <command>");
    println!();
    println!("Commands:");
    println!("  write <path>              Chunk a file and store it in the cluster");
    println!("  read <name> [out_dir]     Fetch a stored file into out_dir (default: .)");
    println!();
    println!("Options:");
    println!("  --controller <addr>   Controller address (default: from config)");
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut config = RidgeConfig::load().context("failed to load config")?;

    // Parse --controller option
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        if args[i] == "--controller" {
            i += 1;
            config.network.controller_addr = args
                .get(i)
                .context("--controller requires a value")?
                .parse::<SocketAddr>()
                .context("--controller must be ip:port")?;
        } else {
            remaining.push(&args[i]);
        }
        i += 1;
    }
    config.validate().context("invalid config")?;

    match remaining.as_slice() {
        ["write", path] => cmd_write(&config, path).await,
        ["read", name] => cmd_read(&config, name, ".").await,
        ["read", name, out_dir] => cmd_read(&config, name, out_dir).await,
        ["help"] | ["--help"] | ["-h"] | [] => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
