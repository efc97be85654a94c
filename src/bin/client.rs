//! tork client binary
//!
//! Usage: tork-client [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>  Path to configuration file
//!   -g, --generate       Print a default configuration
//!   -h, --help           Print help information

use std::env;
use std::sync::Arc;
use std::time::Duration;

use tork::proxy::{ProxyClient, RunMode, Started};
use tork::{Mode, TorkConfig};

/// Interval between statistics log lines
const STATS_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Respects RUST_LOG (e.g. RUST_LOG=tork=debug)
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
            println!("# tork client configuration");
            println!();
            println!("{}", TorkConfig::default().to_toml()?);
        }
        "-c" | "--config" => {
            if args.len() < 3 {
                eprintln!("Error: --config requires a file path");
                return Ok(());
            }
            run_client(&args[2]).await?;
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
        r#"tork client - SOCKS front-end for a tork bridge

USAGE:
    tork-client [OPTIONS]

OPTIONS:
    -c, --config <FILE>  Path to configuration file
    -g, --generate       Print a default configuration
    -h, --help           Print help information

MODES (config `mode`):
    client   Accept SOCKS4/4a/5 on proxy.listen_port and relay to the bridge
    chaff    Hold one shaped link to proxy.bridge_addr, emitting cover traffic

EXAMPLES:
    Generate a configuration:
        tork-client --generate > client.toml

    Run the proxy, then point Tor's ClientTransportPlugin at it:
        tork-client --config client.toml
"#
    );
}

async fn run_client(config_path: &str) -> anyhow::Result<()> {
    let config = TorkConfig::load(config_path)?;
    if config.mode == Mode::Bridge {
        anyhow::bail!("{}: mode = \"bridge\" is served by tork-bridge", config_path);
    }
    if let Err(e) = config.validate() {
        tracing::error!("invalid configuration: {}", e);
        return Err(e.into());
    }

    tracing::info!("tork {} starting in {:?} mode", tork::VERSION, config.mode);

    let shaper = config.shaping.build(tork::Side::Bridge)?;
    let tls = config.tls.client()?;
    let client = Arc::new(ProxyClient::new(config.proxy.clone(), shaper).with_tls(tls));

    let bridge = match config.mode {
        Mode::Chaff => match client.connect_bridge().await {
            Ok(bridge) => {
                tracing::info!("chaff link to bridge established");
                Some(bridge)
            }
            Err(e) if config.proxy.abort_on_conn => {
                tracing::error!("cannot reach bridge: {}", e);
                return Err(e.into());
            }
            Err(e) => {
                tracing::warn!("cannot reach bridge, serving SOCKS instead: {}", e);
                None
            }
        },
        _ => None,
    };

    let stats_client = Arc::clone(&client);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(STATS_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            tracing::info!("stats: {}", stats_client.stats());
        }
    });

    match client.initialize(bridge, RunMode::Foreground).await? {
        Started::Completed => tracing::info!("proxy stopped"),
        Started::Background(task) => task.await??,
    }

    Ok(())
}
