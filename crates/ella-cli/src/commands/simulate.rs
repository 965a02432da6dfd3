//! Simulate command: a full session and scheduler against the mock transport.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Result;
use ella_core::{
    ConfigFile, ConnectionMetricsSnapshot, ConnectionSession, ConnectionState, DeviceIdentity,
    DisconnectReason, MemoryPreferences, MockTransport, ReconnectionScheduler, SessionConfig,
};
use serde::Serialize;
use tokio::time::{Instant, sleep};
use tracing::{debug, info};

use crate::cli::SimulateArgs;

const SIMULATED_ID: &str = "SIM:00:00:00:01";

#[derive(Debug, Clone, Serialize)]
struct Transition {
    at_ms: u64,
    state: ConnectionState,
}

#[derive(Debug, Serialize)]
struct SimulationReport {
    transitions: Vec<Transition>,
    links_dropped: usize,
    connect_calls: u32,
    final_state: ConnectionState,
    metrics: ConnectionMetricsSnapshot,
}

/// Session settings for a simulation: the file's timeouts with a backoff
/// scaled to the requested tick.
fn simulation_config(config: &ConfigFile, tick: Duration) -> Result<SessionConfig> {
    let base = config.to_session_config();
    let backoff = base.backoff.clone().base_interval(tick).max_backoff(tick * 16);
    let session = base.backoff(backoff);
    session.validate()?;
    Ok(session)
}

pub async fn cmd_simulate(config: &ConfigFile, args: SimulateArgs, quiet: bool) -> Result<()> {
    let report = run(config, &args, !args.json && !quiet).await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if !quiet {
        print_summary(&report);
    }
    Ok(())
}

async fn run(config: &ConfigFile, args: &SimulateArgs, echo: bool) -> Result<SimulationReport> {
    let tick = Duration::from_millis(args.tick_ms);
    let duration = Duration::from_secs(args.duration_secs);

    let transport = Arc::new(MockTransport::new());
    transport.fail_next(args.failures);
    transport.set_connect_latency(tick / 4);

    let session = ConnectionSession::with_preferences(
        transport.clone(),
        Arc::new(MemoryPreferences::new()),
        simulation_config(config, tick)?,
    )?;
    session
        .bind(DeviceIdentity::new(SIMULATED_ID, "Simulated Pendant"), false)
        .await?;

    let started = Instant::now();
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    let subscription = session.observe().subscribe_all(move |state| {
        let at_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        if echo {
            println!("[{:>6}ms] {}", at_ms, state);
        }
        sink.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Transition { at_ms, state });
    });

    info!(
        "Simulating {:?} with {} failure(s) and {} drop(s)",
        duration, args.failures, args.drops
    );
    let scheduler = ReconnectionScheduler::new(session.clone());
    scheduler.start();

    let slot = duration / args.drops.saturating_add(1);
    let mut links_dropped = 0;
    for _ in 0..args.drops {
        sleep(slot).await;
        let dropped = transport.drop_link(DisconnectReason::OutOfRange);
        if dropped == 0 {
            debug!("No live link to drop at {:?}", started.elapsed());
        }
        links_dropped += dropped;
    }
    sleep(duration.saturating_sub(started.elapsed())).await;

    scheduler.stop();
    let final_state = session.state();
    session.dispose().await;
    subscription.cancel();

    let transitions = log.lock().unwrap_or_else(PoisonError::into_inner).clone();
    Ok(SimulationReport {
        transitions,
        links_dropped,
        connect_calls: transport.connect_calls(),
        final_state,
        metrics: session.metrics(),
    })
}

fn print_summary(report: &SimulationReport) {
    let metrics = &report.metrics;
    println!();
    println!("Final state:    {}", report.final_state);
    println!("Transitions:    {}", report.transitions.len());
    println!("Connect calls:  {}", report.connect_calls);
    println!(
        "Attempts:       {} ({} ok, {} failed)",
        metrics.attempts, metrics.successes, metrics.failures
    );
    println!("Links dropped:  {}", report.links_dropped);
    if let Some(rate) = metrics.success_rate() {
        println!("Success rate:   {:.0}%", rate * 100.0);
    }
    if let Some(avg) = metrics.avg_connect_ms {
        println!("Avg connect:    {:.1}ms", avg);
    }
}
