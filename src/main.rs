/*
 * Copyright © 2025, the mav_telemetry contributors.
 *
 * Licensed under the Apache License, Version 2.0 (the "License"); you may not
 * use this file except in compliance with the License. You may obtain a copy
 * of the License at http://www.apache.org/licenses/LICENSE-2.0.
 *
 * Unless required by applicable law or agreed to in writing, software distributed under
 * the License is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND,
 * either express or implied. See the License for the specific language governing permissions
 * and limitations under the License.
 */

use std::path::PathBuf;
use std::sync::Arc;

use structopt::StructOpt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mav_telemetry::config::{load_config, TelemetryConfig};
use mav_telemetry::listener::ListenerRegistry;
use mav_telemetry::persist::{InMemoryStore, Persister, TelemetryStore};
use mav_telemetry::ports::PortSet;
use mav_telemetry::probe::PortProbe;
use mav_telemetry::scanner::ScanOrchestrator;
use mav_telemetry::server::{self, ServerState};
use mav_telemetry::state::StateEngine;
use mav_telemetry::ws::BroadcastHub;

#[derive(StructOpt, Debug)]
#[structopt(about = "MAVLink telemetry aggregation service")]
struct Args {
    /// path to the RON configuration file
    #[structopt(short, long, default_value = "config/mav_telemetry.ron")]
    config: PathBuf,
}

fn main() -> anyhow::Result<()> {
    let args = Args::from_args();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env()) // RUST_LOG sets the max level
        .init();

    let config = load_config(&args.config)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.thread_pool_size)
        .enable_all()
        .build()?;

    runtime.block_on(run(Arc::new(config)))
}

async fn run(config: Arc<TelemetryConfig>) -> anyhow::Result<()> {
    let engine = Arc::new(StateEngine::new(config.stale_threshold_ms));
    let store: Arc<dyn TelemetryStore> = Arc::new(InMemoryStore::new());
    let ports = Arc::new(PortSet::new(&config));
    let probe = Arc::new(PortProbe::new(&config));
    let registry = Arc::new(ListenerRegistry::new(engine.clone(), config.clone()));
    let hub = Arc::new(BroadcastHub::new(engine.clone()));
    let persister = Arc::new(Persister::new(engine.clone(), store));
    let orchestrator = Arc::new(ScanOrchestrator::new(ports.clone(), probe, registry.clone()));

    let scan_task = ScanOrchestrator::spawn(orchestrator);
    let health_task = ListenerRegistry::spawn_health_task(registry.clone());
    let evict_task = StateEngine::spawn_evictor(engine.clone());
    let broadcast_task = BroadcastHub::spawn_tick_task(hub.clone());
    let persist_task = Persister::spawn(persister.clone());

    let server_state = ServerState {
        engine: engine.clone(),
        hub: hub.clone(),
        ports: ports.clone(),
        registry: registry.clone(),
    };
    let tcp_listener = tokio::net::TcpListener::bind(config.server_addr).await?;
    let server_task = tokio::spawn(server::serve(tcp_listener, server_state));

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");

    // ordered teardown: stop discovering, drain listeners, stop fan-out, flush
    scan_task.abort();
    registry.shutdown().await;
    health_task.abort();
    broadcast_task.abort();
    hub.close_all();
    evict_task.abort();
    persist_task.abort();
    if let Err(e) = persister.flush().await {
        warn!("final persist flush failed: {e}");
    }
    server_task.abort();

    info!("shutdown complete");
    Ok(())
}
