use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use rand::seq::SliceRandom;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use quorum_replay::clock::{Clock, SystemClock};
use quorum_replay::config::CoordinatorConfig;
use quorum_replay::election::{
    LeaderElector, LeaderState, QuorumCalculator, QuorumPolicy, Vote,
};
use quorum_replay::replay::{CheckpointManager, Event, Payload, ReplayEngine};
use quorum_replay::shutdown::install_shutdown_handler;
use quorum_replay::store::{FileStore, KvStore, MemoryStore};
use quorum_replay::transport::LocalNetwork;
use quorum_replay::{CoordError, Coordinator, Escalation};

#[derive(Parser, Debug)]
#[command(name = "quorum-replay")]
#[command(version)]
#[command(about = "Leader election with quorum checks and deterministic event replay")]
#[command(propagate_version = true)]
struct Args {
    /// Output format
    #[arg(long, short = 'o', global = true, default_value = "table")]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Replay an event file into state, writing checkpoints
    Replay {
        /// JSON array of events
        #[arg(long)]
        events: PathBuf,

        /// Checkpoint every N sequences
        #[arg(long, default_value = "100")]
        checkpoint_interval: u64,

        /// Directory for checkpoints (in memory when omitted)
        #[arg(long)]
        store: Option<PathBuf>,

        #[arg(long, default_value = "default")]
        stream: String,
    },

    /// Conclude one election round from a vote file
    Elect {
        /// JSON array of votes
        #[arg(long)]
        votes: PathBuf,

        /// Term being elected
        #[arg(long)]
        term: u64,

        /// Voting members in the cluster
        #[arg(long)]
        nodes: u64,

        #[arg(long, default_value = "majority")]
        policy: PolicyArg,

        #[arg(long, default_value = "3000")]
        lease_ttl_ms: u64,
    },

    /// Run an in-process cluster through elections, failovers and replay
    Simulate {
        #[arg(long, default_value = "5")]
        nodes: usize,

        /// Leader failovers to force
        #[arg(long, default_value = "3")]
        rounds: usize,

        /// Events replayed on every node
        #[arg(long, default_value = "250")]
        events: u64,

        /// Base config file; node ids and peers are generated
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PolicyArg {
    Majority,
    Supermajority,
    Byzantine,
}

impl From<PolicyArg> for QuorumPolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::Majority => QuorumPolicy::Majority,
            PolicyArg::Supermajority => QuorumPolicy::Supermajority,
            PolicyArg::Byzantine => QuorumPolicy::Byzantine,
        }
    }
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct ReplayOutput {
    watermark: u64,
    applied: u64,
    superseded: u64,
    duplicates: u64,
    stale: u64,
    digest: String,
    checkpoints: Vec<u64>,
    fields: Payload,
}

#[derive(Serialize)]
struct ElectOutput {
    leader: String,
    term: u64,
    votes: u64,
    required: u64,
    counted: u64,
    stale: u64,
    health: String,
    lease_expiry: u64,
}

#[derive(Serialize)]
struct FailoverOutput {
    round: usize,
    isolated: String,
    new_leader: String,
    term: u64,
}

#[derive(Serialize)]
struct NodeOutput {
    node_id: String,
    term: u64,
    role: String,
    watermark: u64,
    digest: String,
}

#[derive(Serialize)]
struct SimulateOutput {
    initial_leader: String,
    failovers: Vec<FailoverOutput>,
    split_brain_detections: u64,
    escalations: Vec<String>,
    converged: bool,
    nodes: Vec<NodeOutput>,
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn handle_replay(
    events_path: PathBuf,
    interval: u64,
    store_dir: Option<PathBuf>,
    stream: String,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let raw = tokio::fs::read_to_string(&events_path).await?;
    let events: Vec<Event> = serde_json::from_str(&raw)?;
    let store: Arc<dyn KvStore> = match store_dir {
        Some(dir) => Arc::new(FileStore::open(dir)?),
        None => Arc::new(MemoryStore::new()),
    };

    let checkpoints = CheckpointManager::open(stream, interval, store)?;
    let engine = ReplayEngine::from_state(checkpoints.recover()?);
    let cancel = install_shutdown_handler();

    tracing::info!(
        events = events.len(),
        interval,
        resumed_at = engine.watermark(),
        "Replaying events"
    );
    let outcome = checkpoints.apply_or_rollback(&engine, &events, &cancel)?;
    let state = engine.snapshot();

    match output_format {
        OutputFormat::Json => {
            let output = ReplayOutput {
                watermark: state.watermark,
                applied: state.applied,
                superseded: outcome.superseded,
                duplicates: outcome.duplicates,
                stale: outcome.stale,
                digest: state.digest(),
                checkpoints: checkpoints.sequences(),
                fields: state.fields,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Replay");
            println!("{}", "=".repeat(40));
            println!("Watermark:   {}", state.watermark);
            println!("Keys:        {}", state.applied);
            println!(
                "Batch:       {} applied, {} superseded, {} duplicates, {} stale",
                outcome.applied, outcome.superseded, outcome.duplicates, outcome.stale
            );
            println!("Checkpoints: {:?}", checkpoints.sequences());
            println!("Digest:      {}", state.digest());
            println!();
            println!("{:<24} VALUE", "FIELD");
            println!("{}", "-".repeat(40));
            for (field, value) in &state.fields {
                println!("{:<24} {}", field, value);
            }
        }
    }
    Ok(())
}

fn handle_elect(
    votes_path: PathBuf,
    term: u64,
    nodes: u64,
    policy: PolicyArg,
    lease_ttl_ms: u64,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(&votes_path)?;
    let votes: Vec<Vote> = serde_json::from_str(&raw)?;
    let elector = LeaderElector::new(QuorumCalculator::new(policy.into(), nodes), lease_ttl_ms);
    let outcome = elector.elect(term, &votes, SystemClock.now_ms())?;

    match output_format {
        OutputFormat::Json => {
            let output = ElectOutput {
                leader: outcome.leader.node_id.clone(),
                term: outcome.leader.term,
                votes: outcome.votes_for_leader,
                required: outcome.required,
                counted: outcome.counted,
                stale: outcome.stale,
                health: outcome.health.to_string(),
                lease_expiry: outcome.leader.lease_expiry,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Leader:   {}", outcome.leader.node_id);
            println!("Term:     {}", outcome.leader.term);
            println!("Votes:    {} (need {})", outcome.votes_for_leader, outcome.required);
            println!("Counted:  {} ({} stale dropped)", outcome.counted, outcome.stale);
            println!("Health:   {}", outcome.health);
            println!();
            println!("{:<16} VOTES", "CANDIDATE");
            println!("{}", "-".repeat(24));
            for (candidate, count) in &outcome.tally {
                println!("{:<16} {}", candidate, count);
            }
        }
    }
    Ok(())
}

struct Cluster {
    network: Arc<LocalNetwork>,
    nodes: Vec<Arc<Coordinator>>,
    escalations: Vec<mpsc::Receiver<Escalation>>,
}

impl Cluster {
    fn build(size: usize, base: &CoordinatorConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let ids: Vec<String> = (1..=size).map(|i| format!("n{i}")).collect();
        let network = LocalNetwork::new();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let mut nodes = Vec::with_capacity(size);
        let mut escalations = Vec::with_capacity(size);

        for id in &ids {
            let config = CoordinatorConfig {
                node_id: id.clone(),
                peers: ids.iter().filter(|p| *p != id).cloned().collect(),
                ..base.clone()
            };
            let (coordinator, rx) = Coordinator::new(
                config,
                clock.clone(),
                network.endpoint(id.clone()),
                Arc::new(MemoryStore::new()),
            )?;
            let coordinator = Arc::new(coordinator);
            network.register(id.clone(), &coordinator);
            nodes.push(coordinator);
            escalations.push(rx);
        }
        Ok(Self {
            network,
            nodes,
            escalations,
        })
    }

    fn leader(&self) -> Option<&Arc<Coordinator>> {
        self.nodes.iter().find(|n| n.holds_lease())
    }

    fn views(&self) -> Vec<LeaderState> {
        self.nodes.iter().map(|n| n.leader_state()).collect()
    }

    /// Wait for a leader satisfying `accept`, polling the cluster.
    async fn await_leader<F>(&self, timeout: Duration, accept: F) -> Option<Arc<Coordinator>>
    where
        F: Fn(&Coordinator) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if let Some(leader) = self.nodes.iter().find(|n| n.holds_lease() && accept(n)) {
                return Some(leader.clone());
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        None
    }
}

fn synthetic_events(count: u64) -> Vec<Event> {
    let keys = (count / 4).max(1);
    let mut events = Vec::with_capacity(count as usize * 2);
    for version in 1..=count {
        let mut payload = Payload::new();
        payload.insert(format!("field-{}", version % 7), serde_json::json!(version));
        let event = Event::new(format!("key-{}", version % keys), version, payload);
        // At-least-once delivery: every third event arrives twice.
        if version % 3 == 0 {
            events.push(event.clone());
        }
        events.push(event);
    }
    events
}

async fn handle_simulate(
    size: usize,
    rounds: usize,
    event_count: u64,
    config_path: Option<PathBuf>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    if size == 0 {
        return Err(CoordError::InvalidConfig("simulate needs at least one node".into()).into());
    }
    let mut base = match config_path {
        Some(path) => CoordinatorConfig::from_json_file(&path)?,
        None => {
            let mut config = CoordinatorConfig::default();
            config.election.round_timeout_ms = 50;
            config.election.lease_ttl_ms = 600;
            config.election.election_timeout_min_ms = 100;
            config.election.election_timeout_max_ms = 200;
            config.backoff.base_ms = 20;
            config.backoff.max_ms = 200;
            config.backoff.jitter = true;
            config
        }
    };
    base.peers.clear();

    let mut cluster = Cluster::build(size, &base)?;
    let shutdown = install_shutdown_handler();
    let cancel = shutdown.child_token();
    let mut handles = Vec::with_capacity(size);
    for node in &cluster.nodes {
        handles.push(tokio::spawn(node.clone().run(cancel.clone())));
    }

    let settle = Duration::from_millis(base.election.lease_ttl_ms * 10);
    let initial = cluster
        .await_leader(settle, |_| true)
        .await
        .ok_or("no leader elected")?;
    tracing::info!(leader = %initial.node_id(), term = initial.term(), "Initial leader");

    let mut failovers = Vec::new();
    for round in 1..=rounds {
        let Some(leader) = cluster.leader().cloned() else {
            break;
        };
        let isolated = leader.node_id().to_string();
        let rest: Vec<&str> = cluster
            .nodes
            .iter()
            .map(|n| n.node_id())
            .filter(|id| *id != isolated)
            .collect();
        if rest.is_empty() {
            break;
        }
        let minority = [isolated.as_str()];
        let groups: [&[&str]; 2] = [&minority, &rest];
        cluster.network.partition(&groups);

        let next = cluster
            .await_leader(settle, |n| n.node_id() != isolated)
            .await;
        let views = cluster.views();
        if let Some(observer) = cluster.nodes.first() {
            if let Err(e) = observer.check_split_brain(&views[1..]) {
                tracing::error!(error = %e, "Split brain during failover");
            }
        }
        cluster.network.heal();

        match next {
            Some(next) => failovers.push(FailoverOutput {
                round,
                isolated,
                new_leader: next.node_id().to_string(),
                term: next.term(),
            }),
            None => {
                tracing::warn!(round, isolated = %isolated, "No failover leader elected");
                break;
            }
        }
        cluster.await_leader(settle, |_| true).await;
    }

    let events = synthetic_events(event_count);
    for node in &cluster.nodes {
        let mut delivery = events.clone();
        delivery.shuffle(&mut rand::thread_rng());
        node.ingest(&delivery, &cancel)?;
    }
    let reference = cluster.nodes[0].engine().snapshot();
    let mut converged = true;
    for node in &cluster.nodes[1..] {
        if node.verify_convergence(&reference).is_err() {
            converged = false;
        }
    }

    cancel.cancel();
    for handle in handles {
        if let Ok(Err(e)) = handle.await {
            tracing::warn!(error = %e, "Coordinator exited with error");
        }
    }

    let mut escalations = Vec::new();
    for rx in &mut cluster.escalations {
        while let Ok(escalation) = rx.try_recv() {
            escalations.push(escalation.to_error().to_string());
        }
    }

    let nodes: Vec<NodeOutput> = cluster
        .nodes
        .iter()
        .map(|n| {
            let state = n.engine().snapshot();
            NodeOutput {
                node_id: n.node_id().to_string(),
                term: n.term(),
                role: n.role().to_string(),
                watermark: state.watermark,
                digest: state.digest(),
            }
        })
        .collect();
    let output = SimulateOutput {
        initial_leader: initial.node_id().to_string(),
        failovers,
        split_brain_detections: cluster.nodes.iter().map(|n| n.split_brain_detections()).sum(),
        escalations,
        converged,
        nodes,
    };

    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&output)?),
        OutputFormat::Table => {
            println!("Simulation");
            println!("{}", "=".repeat(40));
            println!("Initial leader: {}", output.initial_leader);
            for f in &output.failovers {
                println!(
                    "Round {}: isolated {}, new leader {} (term {})",
                    f.round, f.isolated, f.new_leader, f.term
                );
            }
            println!("Split-brain detections: {}", output.split_brain_detections);
            for e in &output.escalations {
                println!("Escalation: {e}");
            }
            println!("Replay converged: {}", output.converged);
            println!();
            println!("{:<6} {:<6} {:<10} {:<10} DIGEST", "NODE", "TERM", "ROLE", "WATERMARK");
            println!("{}", "-".repeat(60));
            for n in &output.nodes {
                println!(
                    "{:<6} {:<6} {:<10} {:<10} {}",
                    n.node_id,
                    n.term,
                    n.role,
                    n.watermark,
                    n.digest.get(..16).unwrap_or(&n.digest)
                );
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Replay {
            events,
            checkpoint_interval,
            store,
            stream,
        } => {
            handle_replay(events, checkpoint_interval, store, stream, &args.output).await?;
        }
        Commands::Elect {
            votes,
            term,
            nodes,
            policy,
            lease_ttl_ms,
        } => {
            handle_elect(votes, term, nodes, policy, lease_ttl_ms, &args.output)?;
        }
        Commands::Simulate {
            nodes,
            rounds,
            events,
            config,
        } => {
            handle_simulate(nodes, rounds, events, config, &args.output).await?;
        }
    }

    Ok(())
}
