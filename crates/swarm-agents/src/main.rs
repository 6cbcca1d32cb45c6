//! Swarm daemon.
//!
//! Reads one JSON task per line on stdin, drives each through the swarm and
//! writes one JSON result per line on stdout. With `--events` the chosen
//! swarm events are interleaved on stdout too. Logs go to stderr.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use coordination::SwarmConfig;
use swarm_agents::daemon::{event_filter, Reply, Session};
use swarm_agents::telemetry::init_tracing;
use swarm_agents::Swarm;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "swarm-agents", about = "Hierarchical agent swarm over local model backends")]
struct Args {
    /// YAML config file; built-in defaults when omitted
    #[arg(long, env = "SWARM_CONFIG")]
    config: Option<PathBuf>,

    /// Probe every backend once, print the registry and exit
    #[arg(long)]
    probe_once: bool,

    /// Event types to stream to stdout, comma separated; `all` streams every event
    #[arg(long, value_delimiter = ',')]
    events: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut swarm = match &args.config {
        Some(path) => Swarm::from_file(path)?,
        None => Swarm::build(&SwarmConfig::default())?,
    };

    if args.probe_once {
        let changed = swarm.prober.probe_all().await;
        for id in swarm.orchestrator.registry().ids() {
            if let Some(descriptor) = swarm.orchestrator.registry().get(&id) {
                println!("{}", serde_json::to_string(&descriptor)?);
            }
        }
        info!(changed, "Probe finished");
        swarm.shutdown().await;
        return Ok(());
    }

    swarm.start_background()?;
    info!(
        backends = swarm.orchestrator.registry().len(),
        "Swarm ready, reading tasks from stdin"
    );

    let (tx, mut rx) = mpsc::unbounded_channel::<Reply>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(reply) = rx.recv().await {
            let Ok(mut line) = serde_json::to_vec(&reply) else {
                continue;
            };
            line.push(b'\n');
            if stdout.write_all(&line).await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    let forwarder = (!args.events.is_empty()).then(|| {
        let mut events = swarm.watch(event_filter(&args.events));
        let tx = tx.clone();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if tx.send(Reply::Event { event }).is_err() {
                    break;
                }
            }
        })
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut session = Session::new(swarm.orchestrator.clone(), tx.clone());
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                session.abort();
                break;
            }
            _ = session.reap(), if session.in_flight() > 0 => {}
            line = lines.next_line() => {
                match line.context("failed to read stdin")? {
                    Some(line) => session.accept(&line),
                    None => break,
                }
            }
        }
    }

    // Stdin closed: let submitted tasks finish before tearing down
    session.finish().await;
    drop(session);
    if let Some(forwarder) = forwarder {
        forwarder.abort();
        let _ = forwarder.await;
    }
    drop(tx);
    let _ = writer.await;

    let report = swarm.report();
    info!(
        events = report.events.total_events,
        resolved = report.events.resolved,
        failed = report.events.task_failures,
        backend_calls = report.backends.total_calls,
        success_rate = report.backends.success_rate,
        energy_wh = report.backends.total_energy_wh,
        "Session summary"
    );
    swarm.shutdown().await;
    Ok(())
}
