//! A provider that announces itself and answers every task with a canned result.
//!
//! Point a requester at it with
//! `hypha-client --config other.toml request-task "translate this" --topic hypha-agents`.

use hypha::{config::init_logging, Agent, AppConfig, Result};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    let mut config = AppConfig::default();
    config.apply_env_overrides();
    config.discovery.capabilities = vec!["translate".to_string(), "summarize".to_string()];
    config.server.enabled = false;
    config.validate()?;
    init_logging(&config.logging)?;

    let agent = Arc::new(Agent::new(config)?);

    let worker = Arc::downgrade(agent.coordinator());
    agent.coordinator().on_task_request(move |sender, request| {
        let worker = worker.clone();
        async move {
            if request.amount < 0.5 {
                tracing::info!("Declining {} from {}: offer too low", request.escrow_id, sender);
                return Ok(false);
            }
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                let Some(coordinator) = worker.upgrade() else {
                    return;
                };
                let result = serde_json::json!({
                    "translated": request.task_description.to_uppercase(),
                });
                if let Err(e) = coordinator
                    .complete_task(&request.escrow_id, result, Some("demo-proof".to_string()))
                    .await
                {
                    tracing::warn!("Result for {} not delivered: {}", request.escrow_id, e);
                }
            });
            Ok(true)
        }
    });
    agent.coordinator().on_payment(|sender, payment| async move {
        tracing::info!("{} paid {} for {}", sender, payment.amount, payment.escrow_id);
        Ok(())
    });

    let addr = agent.start().await?;
    agent.announce(None).await?;
    agent.spawn_reannounce(
        agent.config().discovery.default_topic.clone(),
        agent.config().discovery.reannounce_interval(),
    );

    println!("Provider {} listening on {}", agent.node_id(), addr);
    println!("Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    agent.shutdown().await;
    Ok(())
}
