//! tork bridge binary
//!
//! Usage: tork-bridge [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>  Path to configuration file
//!   -g, --generate       Print a default configuration
//!   -h, --help           Print help information

use std::env;
use std::sync::Arc;
use std::time::Duration;

use tork::proxy::{ProxyServer, RunMode};
use tork::{Mode, Side, TorkConfig};

const STATS_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    match args[1].as_str() {
        "-h" | "--help" => {
            print_usage();
        }
        "-g" | "--generate" => {
            generate_config()?;
        }
        "-c" | "--config" => {
            if args.len() < 3 {
                eprintln!("Error: --config requires a file path");
                return Ok(());
            }
            run_bridge(&args[2]).await?;
        }
        _ => {
            eprintln!("Unknown option: {}", args[1]);
            print_usage();
        }
    }

    Ok(())
}

fn print_usage() {
    println!(
        r#"tork bridge - unwraps tork links into the local onion router

USAGE:
    tork-bridge [OPTIONS]

OPTIONS:
    -c, --config <FILE>  Path to configuration file
    -g, --generate       Print a default configuration
    -h, --help           Print help information

EXAMPLES:
    Generate a configuration:
        tork-bridge --generate > bridge.toml

    Run the bridge in front of Tor's ORPort:
        tork-bridge --config bridge.toml
"#
    );
}

fn generate_config() -> anyhow::Result<()> {
    let config = TorkConfig {
        mode: Mode::Bridge,
        ..Default::default()
    };
    println!("# tork bridge configuration");
    println!("# tls.cert_path / tls.key_path must point at PEM files");
    println!();
    println!("{}", config.to_toml()?);
    Ok(())
}

async fn run_bridge(config_path: &str) -> anyhow::Result<()> {
    let mut config = TorkConfig::load(config_path)?;
    if config.mode != Mode::Bridge {
        tracing::warn!("{}: mode is {:?}, running as bridge", config_path, config.mode);
        config.mode = Mode::Bridge;
    }
    if let Err(e) = config.validate() {
        tracing::error!("invalid configuration: {}", e);
        return Err(e.into());
    }

    tracing::info!("tork {} bridge starting", tork::VERSION);

    let tls = match config.tls.server() {
        Ok(tls) => tls,
        Err(e) => {
            tracing::error!("cannot load TLS material: {}", e);
            return Err(e.into());
        }
    };
    if tls.is_none() {
        tracing::warn!("TLS disabled; links are carried in the clear");
    }

    let shaper = config.shaping.build(Side::Client)?;
    let server = Arc::new(ProxyServer::new(config.bridge.clone(), tls, shaper));

    let stats_server = Arc::clone(&server);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(STATS_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            tracing::info!("stats: {}", stats_server.stats());
        }
    });

    server.initialize(RunMode::Foreground).await?;
    Ok(())
}
