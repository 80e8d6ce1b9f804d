//! Simulate command implementation.

use serde::Serialize;
use std::str::FromStr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use syncline_engine::{
    ChangeQueue, HttpChannel, LoopbackClient, LoopbackServer, MemoryEntityStore,
    MemoryWatermarkStore, MessageBuilder, RemoteChannel, SyncConfig, SyncEngine, SyncResult,
};
use syncline_protocol::{BatchReply, EntityId, EntityType, OutgoingMessage};
use syncline_server::{ServerConfig, SyncServer};
use thiserror::Error;
use tracing::info;

/// First ID used for entities written on the server side.
const REMOTE_ID_BASE: EntityId = 1_000_000;

/// Errors specific to the simulation.
#[derive(Debug, Error)]
pub enum SimulateError {
    /// Unknown `--transport` value.
    #[error("unknown transport '{0}' (expected http or direct)")]
    UnknownTransport(String),

    /// A flag value the simulation cannot run with.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The engine did not settle in time.
    #[error("simulation did not settle within {0:?}")]
    Timeout(Duration),
}

/// How the engine reaches the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// CBOR bodies through a loopback HTTP client.
    Http,
    /// Direct method calls.
    Direct,
}

impl FromStr for Transport {
    type Err = SimulateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(Self::Http),
            "direct" => Ok(Self::Direct),
            other => Err(SimulateError::UnknownTransport(other.to_string())),
        }
    }
}

/// Simulation parameters.
#[derive(Debug, Clone)]
pub struct SimulateOptions {
    /// Entities written locally.
    pub entities: u64,
    /// Producer threads.
    pub producers: u64,
    /// Tracked entity types.
    pub entity_types: u16,
    /// Entities written on the server by other clients.
    pub remote_writes: u64,
    /// Client batch ceiling.
    pub max_batch: Option<usize>,
    /// Server batch limit.
    pub server_max_batch: usize,
    /// Fail every n-th server request.
    pub fail_every: Option<u64>,
    /// Server latency in milliseconds.
    pub latency_ms: Option<u64>,
    /// Background poll interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Settle timeout in seconds.
    pub timeout_secs: u64,
    /// Transport to use.
    pub transport: Transport,
}

/// Simulation result.
#[derive(Debug, Serialize)]
pub struct SimulateReport {
    /// Transport used.
    pub transport: String,
    /// Entities written locally.
    pub entities: u64,
    /// Producer threads.
    pub producers: u64,
    /// Wall-clock time until settled, in milliseconds.
    pub elapsed_ms: u128,
    /// Cycles that dispatched a batch.
    pub cycles: u64,
    /// Cycles the server did not fully process.
    pub partial_cycles: u64,
    /// Cycles that failed in transport.
    pub transport_failures: u64,
    /// `ChangesHappened` messages sent.
    pub changes_sent: u64,
    /// `BriefMe` messages sent.
    pub brief_me_sent: u64,
    /// Responses applied locally.
    pub responses_applied: u64,
    /// Notifications skipped.
    pub items_skipped: u64,
    /// Notifications requeued.
    pub items_requeued: u64,
    /// Notifications dropped after repeated worker faults.
    pub items_dropped: u64,
    /// Worker restarts.
    pub restarts: u64,
    /// Batch size at the end of the run.
    pub final_batch_size: usize,
    /// Encoded requests the server received (HTTP transport only).
    pub server_requests: u64,
    /// Batches the server answered.
    pub server_batches: u64,
    /// Entities known to the server.
    pub server_entities: usize,
    /// Remote entities pulled into the local store.
    pub pulled: u64,
    /// Last error the engine recorded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

struct DirectChannel(Arc<SyncServer>);

impl RemoteChannel for DirectChannel {
    fn send(&self, batch: &[OutgoingMessage]) -> SyncResult<BatchReply> {
        Ok(self.0.handle_batch(batch.to_vec()))
    }
}

struct ServerEndpoint(Arc<SyncServer>);

impl LoopbackServer for ServerEndpoint {
    fn handle_post(&self, path: &str, body: &[u8]) -> Result<Vec<u8>, String> {
        self.0.handle_post(path, body)
    }
}

/// Runs the simulate command.
pub fn run(options: &SimulateOptions, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let report = simulate(options)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        _ => {
            print_text_output(&report);
        }
    }

    Ok(())
}

/// Runs one simulation and returns its report.
pub fn simulate(options: &SimulateOptions) -> Result<SimulateReport, Box<dyn std::error::Error>> {
    if options.producers == 0 {
        return Err(SimulateError::InvalidArgument("--producers must be at least 1").into());
    }
    if options.entity_types == 0 {
        return Err(SimulateError::InvalidArgument("--entity-types must be at least 1").into());
    }

    let mut server_config = ServerConfig::new().with_max_batch(options.server_max_batch);
    if let Some(n) = options.fail_every {
        server_config = server_config.with_fail_every(n);
    }
    if let Some(ms) = options.latency_ms {
        server_config = server_config.with_latency(Duration::from_millis(ms));
    }
    let server = Arc::new(SyncServer::new(server_config));

    let types: Vec<EntityType> = (1..=options.entity_types).map(EntityType::new).collect();
    for i in 0..options.remote_writes {
        server
            .ledger()
            .write(types[0], REMOTE_ID_BASE + i, "title", format!("remote {i}"), 1);
    }

    let stores: Vec<Arc<MemoryEntityStore>> = types
        .iter()
        .map(|t| Arc::new(MemoryEntityStore::new(*t)))
        .collect();
    let mut builder = MessageBuilder::new(Arc::new(MemoryWatermarkStore::new()));
    for store in &stores {
        builder.register(store.entity_type(), store.clone());
    }

    let mut config =
        SyncConfig::new().with_poll_interval(Duration::from_millis(options.poll_interval_ms));
    if let Some(max) = options.max_batch {
        config = config.with_max_batch_size(max);
    }

    let channel: Arc<dyn RemoteChannel> = match options.transport {
        Transport::Http => Arc::new(HttpChannel::new(
            "http://localhost",
            LoopbackClient::new(ServerEndpoint(Arc::clone(&server))),
        )),
        Transport::Direct => Arc::new(DirectChannel(Arc::clone(&server))),
    };
    let engine = Arc::new(SyncEngine::with_queue(
        config,
        Arc::new(ChangeQueue::new()),
        builder,
        channel,
    ));

    info!(
        entities = options.entities,
        producers = options.producers,
        transport = ?options.transport,
        "starting simulation"
    );
    let started = Instant::now();
    engine.start()?;

    let producers: Vec<_> = (0..options.producers)
        .map(|p| {
            let engine = Arc::clone(&engine);
            let stores = stores.clone();
            let (entities, producers) = (options.entities, options.producers);
            thread::spawn(move || {
                for i in (p..entities).step_by(producers as usize) {
                    let store = &stores[(i % stores.len() as u64) as usize];
                    let id = i + 1;
                    store.write(id, "title", format!("entity {id}"));
                    store.write(id, "owner", format!("producer {p}"));
                    engine.enqueue_change(id, store.entity_type());
                }
            })
        })
        .collect();
    for producer in producers {
        if producer.join().is_err() {
            return Err("producer thread panicked".into());
        }
    }
    engine.request_sync();

    let timeout = Duration::from_secs(options.timeout_secs);
    let settled = || {
        engine.queue().is_empty()
            && stores.iter().all(|s| s.dirty_ids().is_empty())
            && pulled(&stores[0], options.remote_writes) == options.remote_writes
    };
    while !settled() {
        if started.elapsed() >= timeout {
            engine.shutdown();
            return Err(SimulateError::Timeout(timeout).into());
        }
        thread::sleep(Duration::from_millis(10));
    }
    let elapsed = started.elapsed();
    engine.shutdown();

    let stats = engine.stats();
    info!(elapsed_ms = elapsed.as_millis() as u64, "simulation settled");

    Ok(SimulateReport {
        transport: format!("{:?}", options.transport).to_lowercase(),
        entities: options.entities,
        producers: options.producers,
        elapsed_ms: elapsed.as_millis(),
        cycles: stats.cycles_completed,
        partial_cycles: stats.partial_cycles,
        transport_failures: stats.transport_failures,
        changes_sent: stats.changes_sent,
        brief_me_sent: stats.brief_me_sent,
        responses_applied: stats.responses_applied,
        items_skipped: stats.items_skipped,
        items_requeued: stats.items_requeued,
        items_dropped: stats.items_dropped,
        restarts: stats.restarts,
        final_batch_size: stats.batch_size,
        server_requests: server.request_count(),
        server_batches: server.batch_count(),
        server_entities: server.ledger().len(),
        pulled: pulled(&stores[0], options.remote_writes),
        last_error: stats.last_error,
    })
}

fn pulled(store: &MemoryEntityStore, remote_writes: u64) -> u64 {
    (0..remote_writes)
        .filter(|i| store.get(REMOTE_ID_BASE + i).is_some())
        .count() as u64
}

fn print_text_output(report: &SimulateReport) {
    println!("Syncline Simulation");
    println!("===================");
    println!();
    println!("Transport:          {}", report.transport);
    println!("Entities:           {}", report.entities);
    println!("Producers:          {}", report.producers);
    println!("Elapsed:            {} ms", report.elapsed_ms);
    println!();
    println!("Engine:");
    println!("  Cycles:           {}", report.cycles);
    println!("  Partial cycles:   {}", report.partial_cycles);
    println!("  Transport errors: {}", report.transport_failures);
    println!("  Changes sent:     {}", report.changes_sent);
    println!("  BriefMe sent:     {}", report.brief_me_sent);
    println!("  Responses:        {}", report.responses_applied);
    println!("  Skipped:          {}", report.items_skipped);
    println!("  Requeued:         {}", report.items_requeued);
    println!("  Dropped:          {}", report.items_dropped);
    println!("  Restarts:         {}", report.restarts);
    println!("  Final batch size: {}", report.final_batch_size);
    println!();
    println!("Server:");
    println!("  Requests:         {}", report.server_requests);
    println!("  Batches:          {}", report.server_batches);
    println!("  Entities:         {}", report.server_entities);
    println!("  Pulled locally:   {}", report.pulled);
    if let Some(error) = &report.last_error {
        println!();
        println!("Last error: {error}");
    }
}
