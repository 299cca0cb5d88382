use std::collections::HashMap;
use std::error::Error;
use std::io::{self, BufRead};
use std::path::PathBuf;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use clap::Parser;
use log::info;
use quorum_log::impls::{ChanNetwork, FileStorage};
use quorum_log::{
    Config, MemStorage, Node, NodeId, RaftClient, RaftError, StateMachine, Storage, SubmitOutcome,
};

const SUBMIT_TIMEOUT: Duration = Duration::from_secs(2);
const SUBMIT_ATTEMPTS: usize = 10;
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// In-process replicated key-value store. Reads commands from stdin:
/// `SET key=value`, `STATUS`, `EXIT`.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of nodes in the cluster
    #[arg(long, default_value_t = 3)]
    nodes: usize,

    /// Lower bound of the randomized election timeout
    #[arg(long, default_value_t = 150)]
    election_min_ms: u64,

    /// Upper bound of the randomized election timeout
    #[arg(long, default_value_t = 300)]
    election_max_ms: u64,

    #[arg(long, default_value_t = 50)]
    heartbeat_ms: u64,

    /// Persist each node under `<data-dir>/node-<id>`. Kept in memory if unset.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

type Command = (String, String);

struct KVStore {
    node_id: NodeId,
    data: HashMap<String, String>,
}

impl StateMachine for KVStore {
    type Command = Command;

    fn apply(&mut self, index: u64, command: &Self::Command) {
        info!(
            "[{}] Apply #{}: {} = {}",
            self.node_id, index, command.0, command.1
        );
        self.data.insert(command.0.clone(), command.1.clone());
    }
}

type NodeHandle = JoinHandle<Result<(), RaftError>>;

fn start_nodes<S, F>(
    networks: Vec<ChanNetwork<Command>>,
    config: &Config,
    mut open_storage: F,
) -> Result<Vec<NodeHandle>, RaftError>
where
    S: Storage<Command = Command>,
    F: FnMut(NodeId) -> Result<S, RaftError>,
{
    let mut handles = Vec::new();
    for network in networks {
        let id = network.id();
        let sm = KVStore {
            node_id: id,
            data: HashMap::new(),
        };
        let storage = open_storage(id)?;
        let node = Node::new(id, network.peer_ids(), config.clone(), sm, storage, network)?;
        handles.push(node.start_loop());
    }
    Ok(handles)
}

// submit to `clients`, following redirects to the leader
fn submit(clients: &[RaftClient<Command>], command: Command) -> Result<SubmitOutcome, RaftError> {
    let mut target = 0;
    for _ in 0..SUBMIT_ATTEMPTS {
        match clients[target].submit(command.clone(), SUBMIT_TIMEOUT)? {
            SubmitOutcome::Redirect {
                leader: Some(leader),
            } if (leader as usize) < clients.len() => {
                target = leader as usize;
            }
            SubmitOutcome::Redirect { .. } => {
                // no leader known yet, give the election time
                thread::sleep(RETRY_BACKOFF);
                target = (target + 1) % clients.len();
            }
            outcome => return Ok(outcome),
        }
    }
    Ok(SubmitOutcome::NotCommitted)
}

fn handle_set(clients: &[RaftClient<Command>], content: &str) {
    let mut kv = content.splitn(2, '=');
    let (key, value) = match (kv.next(), kv.next()) {
        (Some(k), Some(v)) if !k.is_empty() => (k, v),
        _ => {
            println!("usage: SET key=value");
            return;
        }
    };
    info!("Send command to cluster");
    match submit(clients, (key.to_owned(), value.to_owned())) {
        Ok(SubmitOutcome::Committed { index, term }) => {
            println!("committed {}={} at index {} term {}", key, value, index, term)
        }
        Ok(outcome) => println!("not committed: {:?}", outcome),
        Err(e) => println!("error: {}", e),
    }
}

fn print_status(clients: &[RaftClient<Command>]) {
    for client in clients {
        match client.status() {
            Ok(status) => println!(
                "node {}: {} term {} leader {:?} commit {} applied {} last log {}@{}",
                status.id,
                status.role,
                status.term,
                status.leader_id,
                status.commit_index,
                status.last_applied,
                status.last_log_index,
                status.last_log_term
            ),
            Err(e) => println!("node {}: {}", client.node_id(), e),
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let args = Args::parse();
    if args.nodes == 0 {
        return Err("at least one node is required".into());
    }

    let config = Config::default()
        .with_election_timeout(args.election_min_ms, args.election_max_ms)
        .with_heartbeat_interval(args.heartbeat_ms);
    config.validate()?;

    let (networks, clients, _links) = ChanNetwork::cluster(args.nodes);
    let node_threads = match &args.data_dir {
        Some(dir) => start_nodes(networks, &config, |id| {
            Ok(FileStorage::open(dir.join(format!("node-{}", id)))?)
        })?,
        None => start_nodes(networks, &config, |_| Ok(MemStorage::new()))?,
    };
    info!("Started {} nodes", args.nodes);

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("EXIT") => break,
            Some("SET") => match parts.next() {
                Some(content) => handle_set(&clients, content),
                None => println!("usage: SET key=value"),
            },
            Some("STATUS") => print_status(&clients),
            Some(other) => println!("unknown command {}", other),
            None => {}
        }
    }

    for client in clients.iter() {
        let _ = client.shutdown();
    }
    for (id, handle) in node_threads.into_iter().enumerate() {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::error!("[{}] Node failed: {}", id, e),
            Err(_) => log::error!("[{}] Node thread panicked", id),
        }
    }
    Ok(())
}
