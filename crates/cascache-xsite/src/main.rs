#![warn(missing_docs)]

//! `cas-xsite`: runs an in-process multi-site replication scenario and
//! reports convergence and per-site statistics.

use anyhow::{bail, Context, Result};
use cascache_xsite::{CacheTopology, InMemorySiteNetwork, IracNode, XSiteConfig};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "cas-xsite")]
#[command(about = "CasCache cross-site replication simulator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Replicate writes between in-process sites until they converge.
    Run {
        /// Template configuration (.toml or .json); site names are generated.
        #[arg(short, long, env = "CAS_XSITE_CONFIG")]
        config: Option<PathBuf>,
        /// Number of sites.
        #[arg(short, long, default_value = "3")]
        sites: usize,
        /// Writes issued by each site.
        #[arg(short, long, default_value = "100")]
        writes: usize,
        /// Every site writes the same keys concurrently.
        #[arg(long)]
        conflict: bool,
        /// Seconds to wait for convergence.
        #[arg(long, default_value = "10")]
        timeout: u64,
    },
    /// Print the default configuration as TOML.
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            config,
            sites,
            writes,
            conflict,
            timeout,
        } => run(config, sites, writes, conflict, Duration::from_secs(timeout)).await,
        Command::Config => {
            let text = toml::to_string_pretty(&XSiteConfig::default())?;
            println!("{}", text);
            Ok(())
        }
    }
}

async fn run(
    config_path: Option<PathBuf>,
    sites: usize,
    writes: usize,
    conflict: bool,
    timeout: Duration,
) -> Result<()> {
    if sites < 2 {
        bail!("at least two sites are required");
    }
    let template = match &config_path {
        Some(path) => XSiteConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => XSiteConfig::default(),
    };

    let names: Vec<String> = (1..=sites).map(|i| format!("site-{}", i)).collect();
    let network = InMemorySiteNetwork::new();
    let mut nodes = Vec::with_capacity(sites);
    for name in &names {
        let mut config = template.clone();
        config.local_site = name.clone();
        config.backups = names
            .iter()
            .filter(|n| *n != name)
            .map(|n| cascache_xsite::config::BackupSiteConfig::new(n.clone()))
            .collect();
        let node = IracNode::builder(config, 1, CacheTopology::round_robin(1, vec![1], 16, 1))
            .transport(network.transport_for(name.clone()))
            .build()?;
        network.register(name.clone(), node.applier());
        node.start()?;
        nodes.push(node);
    }
    tracing::info!(sites, writes, conflict, "replication scenario started");

    for (i, node) in nodes.iter().enumerate() {
        for w in 0..writes {
            let key = if conflict {
                format!("key-{}", w)
            } else {
                format!("key-{}-{}", i, w)
            };
            node.put(key, format!("{}:{}", node.site(), w)).await?;
        }
    }

    let deadline = tokio::time::Instant::now() + timeout;
    while nodes.iter().any(|n| n.manager().queue_size() > 0) {
        if tokio::time::Instant::now() >= deadline {
            bail!("sites did not drain their queues within {:?}", timeout);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let diverged = count_diverged(&nodes, sites, writes, conflict);
    for node in &nodes {
        print!(
            "{}",
            node.statistics()
                .format_prometheus(&template.cache_name, node.site())
        );
        node.stop().await?;
    }
    if diverged > 0 {
        bail!("{} keys diverged between sites", diverged);
    }
    println!("all {} sites converged", sites);
    Ok(())
}

fn count_diverged(nodes: &[Arc<IracNode>], sites: usize, writes: usize, conflict: bool) -> usize {
    let keys: Vec<String> = if conflict {
        (0..writes).map(|w| format!("key-{}", w)).collect()
    } else {
        (0..sites)
            .flat_map(|i| (0..writes).map(move |w| format!("key-{}-{}", i, w)))
            .collect()
    };
    keys.iter()
        .filter(|key| {
            let first = nodes[0].get(key.as_bytes());
            nodes.iter().any(|n| n.get(key.as_bytes()) != first)
        })
        .count()
}
