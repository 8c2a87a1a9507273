//! PeerCtl - Command line client for PeerDB clusters
//!
//! Usage:
//!   peerctl query "SELECT * FROM clientes"   - Run one statement
//!   peerctl query --node 2 "INSERT ..."      - Run it on a specific node
//!   peerctl shell                            - Interactive session
//!   peerctl coordinator                      - Show whom every node follows

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rand::seq::SliceRandom;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use peerdb::config::{default_config_path, PeerDbConfig};
use peerdb::network::PeerClient;
use peerdb::protocol::{
    CoordinatorReply, Message, MessageKind, NodeId, QueryRequest, QueryResponse, CLIENT_ORIGIN,
};
use peerdb::storage::{QueryResult, Row};

/// PeerDB Cluster Client
#[derive(Parser)]
#[command(name = "peerctl")]
#[command(about = "Send statements to a PeerDB cluster", long_about = None)]
struct Cli {
    /// Path to config file (only the node table is used)
    #[arg(short, long, default_value_os_t = default_config_path())]
    config: PathBuf,

    /// Reply timeout in milliseconds
    #[arg(short, long, default_value_t = 10_000)]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one statement
    Query {
        /// SQL statement
        sql: String,
        /// Node to send it to (random when omitted)
        #[arg(short, long)]
        node: Option<NodeId>,
    },
    /// Interactive session; each statement goes to a random node
    Shell,
    /// Ask every node which coordinator it follows
    Coordinator,
}

struct Session {
    client: PeerClient,
    nodes: Vec<NodeId>,
    timeout: Duration,
}

impl Session {
    fn pick_node(&self) -> Result<NodeId> {
        self.nodes
            .choose(&mut rand::thread_rng())
            .copied()
            .context("no nodes configured")
    }

    async fn query(&self, node: NodeId, sql: &str) -> Result<()> {
        let request = QueryRequest {
            sql: sql.to_string(),
            forwarded: false,
        };
        let msg = Message::new(MessageKind::QueryRequest, CLIENT_ORIGIN, &request)?;
        let reply = self
            .client
            .request(node, &msg, self.timeout)
            .await
            .with_context(|| format!("node {} did not answer", node))?;

        match reply.kind() {
            MessageKind::QueryResponse => {
                let response: QueryResponse = reply.payload_as()?;
                let role = if response.coordinator { "coordinator" } else { "follower" };
                println!("[node {} ({})]", response.node, role);
                print_result(&response.result);
                Ok(())
            }
            MessageKind::Error => bail!(
                "node {}: {}",
                reply.origin(),
                reply.error_message().unwrap_or_default()
            ),
            other => bail!("unexpected reply {} from node {}", other, node),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = PeerDbConfig::from_file(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    let client = PeerClient::new(&config.cluster.nodes);
    let session = Session {
        nodes: client.nodes(),
        client,
        timeout: Duration::from_millis(cli.timeout_ms),
    };

    match cli.command {
        Commands::Query { sql, node } => {
            let node = match node {
                Some(n) => n,
                None => session.pick_node()?,
            };
            session.query(node, &sql).await
        }
        Commands::Shell => run_shell(&session).await,
        Commands::Coordinator => show_coordinators(&session).await,
    }
}

async fn run_shell(session: &Session) -> Result<()> {
    println!("PeerDB shell ({} nodes). Type 'exit' to quit.", session.nodes.len());

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        stdout.write_all(b"peerdb> ").await?;
        stdout.flush().await?;

        let Some(line) = stdin.next_line().await? else {
            break;
        };
        let sql = line.trim();
        if sql.is_empty() {
            continue;
        }
        if sql.eq_ignore_ascii_case("exit") || sql.eq_ignore_ascii_case("quit") {
            break;
        }

        let node = session.pick_node()?;
        if let Err(e) = session.query(node, sql).await {
            eprintln!("Error: {:#}", e);
        }
    }

    Ok(())
}

async fn show_coordinators(session: &Session) -> Result<()> {
    println!("{:<8} {:<14} {:<10}", "NODE", "COORDINATOR", "CLAIMS");
    println!("{}", "-".repeat(34));

    for &node in &session.nodes {
        let msg = Message::empty(MessageKind::WhoIsCoordinator, CLIENT_ORIGIN);
        match session.client.request(node, &msg, session.timeout).await {
            Ok(reply) if reply.kind() == MessageKind::CoordinatorReply => {
                let claim: CoordinatorReply = reply.payload_as()?;
                println!(
                    "{:<8} {:<14} {:<10}",
                    node,
                    claim.coordinator_id,
                    if claim.is_coordinator { "yes" } else { "no" }
                );
            }
            Ok(reply) => println!("{:<8} unexpected reply {}", node, reply.kind()),
            Err(e) => println!("{:<8} \x1b[31munreachable\x1b[0m ({})", node, e),
        }
    }

    Ok(())
}

fn print_result(result: &QueryResult) {
    if !result.is_ok() {
        println!("\x1b[31mERROR\x1b[0m {}", result.message.as_deref().unwrap_or(""));
        return;
    }

    match &result.rows {
        Some(rows) => print_rows(rows),
        None => println!("OK, {} row(s) affected", result.affected_rows),
    }
}

fn print_rows(rows: &[Row]) {
    let Some(first) = rows.first() else {
        println!("(no rows)");
        return;
    };

    let columns: Vec<&String> = first.keys().collect();
    let cell = |row: &Row, column: &str| match row.get(column) {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Null) | None => "NULL".to_string(),
        Some(other) => other.to_string(),
    };

    let widths: Vec<usize> = columns
        .iter()
        .map(|c| {
            rows.iter()
                .map(|r| cell(r, c).len())
                .max()
                .unwrap_or(0)
                .max(c.len())
        })
        .collect();

    let header: Vec<String> = columns
        .iter()
        .zip(&widths)
        .map(|(c, w)| format!("{:<width$}", c, width = *w))
        .collect();
    println!("{}", header.join(" | "));
    println!("{}", widths.iter().map(|w| "-".repeat(*w)).collect::<Vec<_>>().join("-+-"));

    for row in rows {
        let line: Vec<String> = columns
            .iter()
            .zip(&widths)
            .map(|(c, w)| format!("{:<width$}", cell(row, c), width = *w))
            .collect();
        println!("{}", line.join(" | "));
    }
    println!("({} row(s))", rows.len());
}
