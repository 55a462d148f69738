use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use clap::Parser;
use hypha::{
    config::{create_default_config_file, init_logging},
    Agent, AppConfig,
};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

#[derive(Parser)]
#[command(name = "hypha-node")]
#[command(about = "Long-running HYPHA agent: joins the overlay, announces itself and serves tasks")]
struct Args {
    #[arg(short, long, default_value = "hypha.toml")]
    config: String,

    /// Topic to announce on (defaults to discovery.default_topic).
    #[arg(short, long)]
    topic: Option<String>,

    /// Write a default config file to --config and exit.
    #[arg(long)]
    init: bool,

    /// Accept every incoming task request and reply with an echo result.
    #[arg(long)]
    auto_accept: bool,

    /// Seconds before an auto-accepted task is reported complete.
    #[arg(long, default_value = "2")]
    work_seconds: u64,
}

#[derive(Clone)]
struct AppState {
    agent: Arc<Agent>,
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.init {
        create_default_config_file(&args.config)?;
        println!("Wrote default configuration to {}", args.config);
        return Ok(());
    }

    let config = if std::path::Path::new(&args.config).exists() {
        AppConfig::load_with_env_overrides(&args.config)?
    } else {
        let mut config = AppConfig::default();
        config.apply_env_overrides();
        config
    };
    config.validate()?;
    init_logging(&config.logging)?;

    let topic = args
        .topic
        .clone()
        .unwrap_or_else(|| config.discovery.default_topic.clone());
    let reannounce_every = config.discovery.reannounce_interval();
    let server_enabled = config.server.enabled;
    let server_address = config.get_server_address();

    let agent = Arc::new(Agent::new(config)?);
    if args.auto_accept {
        install_echo_worker(&agent, Duration::from_secs(args.work_seconds));
    }

    let messaging = agent.start().await?;
    agent.announce(Some(topic.as_str())).await?;
    agent.spawn_reannounce(topic.clone(), reannounce_every);

    tracing::info!("Node {} announced on '{}'", agent.node_id(), topic);
    println!("Node id:  {}", agent.node_id());
    println!("Wallet:   {}", agent.wallet_address());
    println!("Messages: {}", messaging);
    if let Some(dht) = agent.directory().local_addr() {
        println!("DHT:      {}", dht);
    }

    if server_enabled {
        let app = Router::new()
            .route("/health", get(health_check))
            .route("/tasks", get(list_tasks))
            .route("/peers/:topic", get(list_peers))
            .layer(TraceLayer::new_for_http())
            .with_state(AppState {
                agent: Arc::clone(&agent),
            });

        let listener = TcpListener::bind(&server_address).await?;
        println!("Status API: http://{}", server_address);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!("Status API stopped: {}", e);
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    agent.shutdown().await;

    Ok(())
}

/// Accept every request, then report an echo of the description as the result.
fn install_echo_worker(agent: &Arc<Agent>, work: Duration) {
    let coordinator = Arc::downgrade(agent.coordinator());
    agent.coordinator().on_task_request(move |sender, request| {
        let coordinator: Weak<_> = coordinator.clone();
        async move {
            tracing::info!("Accepting {} from {}", request.escrow_id, sender);
            tokio::spawn(async move {
                tokio::time::sleep(work).await;
                let Some(coordinator) = coordinator.upgrade() else {
                    return;
                };
                let result = serde_json::json!({
                    "status": "done",
                    "echo": request.task_description,
                });
                if let Err(e) = coordinator.complete_task(&request.escrow_id, result, None).await {
                    tracing::warn!("Could not deliver result for {}: {}", request.escrow_id, e);
                }
            });
            Ok(true)
        }
    });
}

async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let report = state.agent.health().await;
    let code = match report.overall {
        hypha::HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (code, Json(serde_json::to_value(report).unwrap_or_default()))
}

async fn list_tasks(State(state): State<AppState>) -> Json<serde_json::Value> {
    let tasks = state.agent.coordinator().tasks().await;
    Json(serde_json::json!({
        "count": tasks.len(),
        "tasks": tasks,
    }))
}

async fn list_peers(
    State(state): State<AppState>,
    Path(topic): Path<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    match state.agent.discover(Some(topic.as_str())).await {
        Ok(peers) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "topic": topic,
                "peers": peers,
            })),
        ),
        Err(e) => {
            tracing::error!("Discovery on '{}' failed: {}", topic, e);
            (
                StatusCode::BAD_GATEWAY,
                Json(serde_json::json!({
                    "status": "error",
                    "message": e.to_string(),
                })),
            )
        }
    }
}
