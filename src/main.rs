use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use serde_json::json;
use tokio::time::sleep;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

use crossbus::{Action, Bus, BusConfig, SendOptions, SharedStore};

#[derive(Parser, Debug)]
#[command(name = "crossbus")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of nested child contexts to spawn alongside the parent.
    #[arg(short, long, default_value = "2")]
    children: usize,

    /// Discovery timeout in milliseconds.
    #[arg(short, long, default_value = "500")]
    timeout: u64,
}

fn demo_config(origin: &str) -> BusConfig {
    let mut config = BusConfig::new(origin);
    config.trusted_patterns = vec!["*.example.com".to_string()];
    config
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    // One shared store stands in for the context-wide fallback channel.
    let store = SharedStore::default();

    let (parent, mut parent_rx) = Bus::spawn(demo_config("https://parent.example.com"), store.clone());
    tokio::spawn(async move {
        while let Some(delivery) = parent_rx.recv().await {
            info!(
                action = %delivery.envelope.action,
                from = %delivery.envelope.from,
                channel = %delivery.channel,
                "parent received"
            );
        }
    });

    for i in 0..args.children {
        let origin = format!("https://child-{i}.example.com");
        let (child, mut child_rx) = Bus::spawn(demo_config(&origin), store.clone());

        // Parent and child can address each other directly.
        parent.link(format!("child-{i}"), child.endpoint());
        child.link("parent", parent.endpoint());

        let label = origin.clone();
        tokio::spawn(async move {
            while let Some(delivery) = child_rx.recv().await {
                info!(
                    context = %label,
                    action = %delivery.envelope.action,
                    from = %delivery.envelope.from,
                    "child received"
                );
            }
        });
    }

    info!(children = args.children, "contexts wired, probing for listeners");
    parent
        .ping(json!({"probe": "demo"}), Duration::from_millis(args.timeout), |reply| {
            info!(from = %reply.from, "first discovery reply");
        })
        .await?;

    sleep(Duration::from_millis(args.timeout)).await;

    let id = parent
        .send(
            Action::SolverStatusChanged,
            json!({"enabled": true}),
            SendOptions::default(),
        )
        .await?;
    info!(message_id = ?id, "status change published");

    sleep(Duration::from_millis(300)).await;

    let report = parent.report().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    parent.shutdown().await;
    Ok(())
}
