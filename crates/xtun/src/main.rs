//! xtun: proxy client control tool
//!
//! Parses share-links, renders engine configurations, classifies targets
//! against the routing lists and probes node latency.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use xtun_link::LinkParser;
use xtun_router::RoutingEngine;
use xtun_vpn::{CoreConfig, Pinger, ProbeKind, TunnelConfig};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "xtun")]
#[command(about = "Proxy client control tool", long_about = None)]
struct Cli {
    /// Configuration file (.toml or .json)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Parse a share-link and print the node
    Parse {
        #[arg(value_name = "LINK")]
        link: String,
    },

    /// Print the full engine configuration for a share-link
    Config {
        #[arg(value_name = "LINK")]
        link: String,
    },

    /// Show which outbound a domain or IP is routed to
    Classify {
        #[arg(value_name = "TARGET")]
        target: String,
    },

    /// Print the routing lists as records
    Rules,

    /// Probe endpoints (host:port, URLs or share-links)
    Ping {
        #[arg(value_name = "ENDPOINT", required = true)]
        endpoints: Vec<String>,

        /// Measure time to first HTTP byte instead of TCP handshake
        #[arg(long)]
        http: bool,
    },
}

struct Core {
    config: CoreConfig,
    parser: Arc<LinkParser>,
    router: Arc<RoutingEngine>,
}

impl Core {
    fn load(path: Option<&PathBuf>) -> Result<Self> {
        let config = match path {
            Some(path) => CoreConfig::from_file(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            None => CoreConfig::default(),
        };
        config.validate().context("invalid configuration")?;

        let parser = Arc::new(LinkParser::new());
        let router = Arc::new(RoutingEngine::new());
        config.apply(&parser, &router);
        debug!("Loaded {} routing rules", router.snapshot().rule_count());

        Ok(Self {
            config,
            parser,
            router,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false).compact())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let core = Core::load(cli.config.as_ref())?;

    match cli.command {
        Command::Parse { link } => {
            let node = core.parser.parse(&link, None)?;
            println!("{}", serde_json::to_string_pretty(&node)?);
        }
        Command::Config { link } => {
            let node = Arc::new(core.parser.parse(&link, None)?);
            let tunnel = TunnelConfig::compose(
                link,
                node,
                &core.parser,
                &core.router,
                core.config.engine_type,
            );
            println!("{}", tunnel.engine.to_json());
        }
        Command::Classify { target } => {
            let is_domain = target.trim().parse::<IpAddr>().is_err();
            let action = core.router.classify(&target, is_domain);
            println!("{} -> {}", target, action);
        }
        Command::Rules => {
            let records = core.router.router_configuration();
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        Command::Ping { endpoints, http } => {
            let kind = if http { ProbeKind::Http } else { ProbeKind::Tcp };
            let pinger = Pinger::new(core.config.ping.pinger_config(), core.parser.clone());

            info!("Probing {} endpoints", endpoints.len());
            let mut results = pinger.ping(endpoints, kind);
            loop {
                tokio::select! {
                    result = results.next() => match result {
                        Some(result) => match result.rtt {
                            Some(_) => println!("{:>6}ms  {}", result.rtt_ms(), result.endpoint),
                            None => println!("{:>8}  {}", "timeout", result.endpoint),
                        },
                        None => break,
                    },
                    _ = tokio::signal::ctrl_c() => {
                        pinger.stop();
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}
