use clap::{Parser, Subcommand};
use hypha::{
    config::init_logging,
    protocol::{MessageType, TaskRequest},
    validation, Agent, AppConfig, Identity, Listing, Message,
};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "hypha-client")]
#[command(about = "One-shot HYPHA commands: inspect identity, search topics, send tasks")]
struct Args {
    #[arg(short, long, default_value = "hypha.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the node id and wallet derived from the configured seed.
    Identity,
    /// List agents announced on a topic.
    Discover {
        #[arg(short, long)]
        topic: Option<String>,
    },
    /// Send a task request to an agent found on a topic and wait for its answer.
    RequestTask {
        /// Task description.
        task: String,
        #[arg(short, long)]
        topic: Option<String>,
        /// Node id (or hex prefix) of the provider; first match on the topic if omitted.
        #[arg(short, long)]
        provider: Option<String>,
        #[arg(short, long, default_value = "1.0")]
        amount: f64,
        #[arg(long, default_value = "24")]
        deadline_hours: u32,
        /// Existing escrow id; a fresh correlation id is generated otherwise.
        #[arg(long)]
        escrow_id: Option<String>,
        #[arg(long, default_value = "30")]
        wait_seconds: u64,
    },
    /// Send a PING envelope to host:port.
    Ping {
        host: String,
        port: u16,
    },
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = if std::path::Path::new(&args.config).exists() {
        AppConfig::load_with_env_overrides(&args.config)?
    } else {
        let mut config = AppConfig::default();
        config.apply_env_overrides();
        config
    };
    // A client runs next to a node, so never compete for its ports.
    config.discovery.port = 0;
    config.transport.port = 0;
    config.server.enabled = false;
    config.validate()?;
    init_logging(&config.logging)?;

    match args.command {
        Command::Identity => {
            let identity = Identity::from_seed(&config.identity.master_seed()?)?;
            println!("Node id: {}", identity.node_id());
            println!("DHT id:  {}", hex::encode(identity.node_id().dht_bytes()));
            println!("Wallet:  {}", identity.wallet_address());
        }
        Command::Discover { topic } => {
            let agent = Agent::new(config)?;
            agent.directory().start().await?;
            let peers = agent.discover(topic.as_deref()).await?;
            if peers.is_empty() {
                println!("No agents found");
            }
            for peer in &peers {
                print_listing(peer);
            }
            agent.shutdown().await;
        }
        Command::RequestTask {
            task,
            topic,
            provider,
            amount,
            deadline_hours,
            escrow_id,
            wait_seconds,
        } => {
            let agent = Arc::new(Agent::new(config)?);
            agent.start().await?;
            let outcome = request_task(
                &agent,
                &task,
                topic.as_deref(),
                provider.as_deref(),
                amount,
                deadline_hours,
                escrow_id,
                Duration::from_secs(wait_seconds),
            )
            .await;
            agent.shutdown().await;
            outcome?;
        }
        Command::Ping { host, port } => {
            let identity = Identity::from_seed(&config.identity.master_seed()?)?;
            let transport = hypha::Transport::new(&identity, config.transport.clone());
            let ping = Message::create(
                MessageType::Ping,
                identity.node_id().to_hex(),
                "",
                serde_json::Map::new(),
            );
            if transport.send(ping, &host, port).await {
                println!("Delivered PING to {}:{}", host, port);
            } else {
                println!("Could not reach {}:{}", host, port);
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn request_task(
    agent: &Arc<Agent>,
    task: &str,
    topic: Option<&str>,
    provider: Option<&str>,
    amount: f64,
    deadline_hours: u32,
    escrow_id: Option<String>,
    wait: Duration,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let hours = validation::validate_deadline_hours(deadline_hours, "deadline_hours")?;
    let peers = agent.discover(topic).await?;
    let target = match provider {
        Some(prefix) => {
            let prefix = prefix.to_ascii_lowercase();
            peers.into_iter().find(|p| p.node_id.starts_with(&prefix))
        }
        None => peers.into_iter().next(),
    }
    .ok_or("no matching provider on the topic")?;

    let escrow_id = match escrow_id {
        Some(id) => validation::validate_escrow_id(&id, "escrow_id")?,
        None => correlation_id(agent, task),
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    let responses = tx.clone();
    agent.coordinator().on_task_response(move |sender, response| {
        let responses = responses.clone();
        async move {
            let _ = responses.send(format!(
                "{} {} {}",
                sender,
                if response.accepted { "accepted" } else { "rejected" },
                response.message.unwrap_or_default()
            ));
            Ok(())
        }
    });
    agent.coordinator().on_task_complete(move |sender, complete| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(format!("{} completed: {}", sender, complete.result));
            Ok(())
        }
    });

    let request = TaskRequest {
        escrow_id: escrow_id.clone(),
        task_description: task.to_string(),
        amount,
        deadline: chrono::Utc::now().timestamp() + i64::from(hours) * 3600,
        requirements: None,
        reply_to: None,
    };
    agent.coordinator().request_task(&target, request).await?;
    println!("Sent {} to {}", escrow_id, target.node_id);

    let deadline = tokio::time::Instant::now() + wait;
    while let Ok(Some(update)) = tokio::time::timeout_at(deadline, rx.recv()).await {
        println!("{}", update);
        if let Some(record) = agent.coordinator().get_task(&escrow_id).await {
            if record.status.is_terminal() || record.status == hypha::TaskStatus::Completed {
                break;
            }
        }
    }
    Ok(())
}

/// `0x` + SHA-256 over our node id, the task and the current time.
fn correlation_id(agent: &Agent, task: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(agent.node_id().as_bytes());
    hasher.update(task.as_bytes());
    hasher.update(uuid::Uuid::new_v4().as_bytes());
    format!("0x{}", hex::encode(hasher.finalize()))
}

fn print_listing(listing: &Listing) {
    println!("{}", listing.node_id);
    println!("  wallet:   {}", listing.wallet_address);
    if let Some(endpoint) = listing.endpoint() {
        println!("  endpoint: {}", endpoint);
    }
    if !listing.capabilities.is_empty() {
        println!("  offers:   {}", listing.capabilities.join(", "));
    }
}
