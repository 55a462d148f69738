//! Two agents on loopback walk through a full paid task.
//!
//! 1. The provider joins an isolated overlay and announces on a topic
//! 2. The requester bootstraps off the provider and discovers it
//! 3. The requester locks funds in escrow and sends the task request
//! 4. The provider accepts, works, and reports the result
//! 5. The requester releases the escrow and sends the payment notification
//!
//! Run with `cargo run --example complete_workflow`.

use hypha::{
    config::{DiscoveryConfig, IdentityConfig, TransportConfig},
    Agent, AppConfig, Identity, LocalLedger, MasterSeed, Result, TaskStatus,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

const TOPIC: &str = "hypha-demo";

fn loopback_config(passphrase: &str, bootstrap: Vec<String>) -> AppConfig {
    AppConfig {
        identity: IdentityConfig {
            seed_hex: None,
            passphrase: Some(passphrase.to_string()),
        },
        discovery: DiscoveryConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            bootstrap,
            default_topic: TOPIC.to_string(),
            rpc_timeout_seconds: 2,
            capabilities: vec!["summarize".to_string()],
            ..DiscoveryConfig::default()
        },
        transport: TransportConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..TransportConfig::default()
        },
        ..AppConfig::default()
    }
}

fn identity_for(config: &AppConfig) -> Result<Identity> {
    let passphrase = config.identity.passphrase.as_deref().unwrap_or_default();
    Identity::from_seed(&MasterSeed::from_passphrase(passphrase)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("HYPHA complete workflow");
    println!("=======================\n");

    // Provider
    let provider = Arc::new(Agent::new(loopback_config("provider demo seed", vec![]))?);
    let completer = Arc::downgrade(provider.coordinator());
    provider.coordinator().on_task_request(move |sender, request| {
        let completer = completer.clone();
        async move {
            println!("   provider: request {} from {}", request.escrow_id, &sender[..8]);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                if let Some(coordinator) = completer.upgrade() {
                    let summary = serde_json::json!({
                        "summary": format!("{} words", request.task_description.split_whitespace().count()),
                    });
                    if let Err(e) = coordinator.complete_task(&request.escrow_id, summary, None).await {
                        eprintln!("   provider: could not deliver result: {}", e);
                    }
                }
            });
            Ok(true)
        }
    });
    provider.coordinator().on_payment(|_, payment| async move {
        println!("   provider: paid {} (tx {})", payment.amount, payment.tx_hash);
        Ok(())
    });

    println!("1. Starting provider...");
    provider.start().await?;
    provider.announce(None).await?;
    let dht_addr = provider
        .directory()
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_default();
    println!("   provider {} announced on '{}'\n", provider.node_id().short(), TOPIC);

    // Requester with a funded in-memory ledger
    let requester_config = loopback_config("requester demo seed", vec![dht_addr]);
    let requester_identity = identity_for(&requester_config)?;
    let ledger = LocalLedger::new(requester_identity.wallet_address());
    ledger.deposit(requester_identity.wallet_address(), 25.0);
    let requester = Agent::with_identity(requester_config, requester_identity)
        .with_escrow(Arc::new(ledger.clone()));

    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    requester.coordinator().on_task_response(|_, response| async move {
        println!("   requester: accepted = {}", response.accepted);
        Ok(())
    });
    requester.coordinator().on_task_complete(move |_, complete| {
        let done_tx = done_tx.clone();
        async move {
            println!("   requester: result {}", complete.result);
            let _ = done_tx.send(complete.escrow_id);
            Ok(())
        }
    });

    println!("2. Discovering providers...");
    requester.start().await?;
    let peers = requester.discover(None).await?;
    let Some(target) = peers.first().cloned() else {
        println!("   no providers found");
        return Ok(());
    };
    println!("   found {} provider(s)\n", peers.len());

    println!("3. Hiring {}...", &target.node_id[..8]);
    let escrow_id = requester
        .hire(&target, "Summarize the quarterly network report", 10.0, 24)
        .await?;
    println!("   escrow {}", escrow_id);
    println!("   requester balance: {}\n", ledger.balance(requester.wallet_address()));

    println!("4. Waiting for the result...");
    match timeout(Duration::from_secs(10), done_rx.recv()).await {
        Ok(Some(_)) => println!(),
        _ => {
            println!("   timed out");
            return Ok(());
        }
    }

    println!("5. Paying...");
    let tx_hash = requester.pay(&escrow_id).await?;
    println!("   tx {}", tx_hash);
    println!("   provider balance: {}", ledger.balance(&target.wallet_address));
    tokio::time::sleep(Duration::from_millis(200)).await;

    if let Some(record) = provider.coordinator().get_task(&escrow_id).await {
        assert_eq!(record.status, TaskStatus::Paid);
        println!("   provider sees the task as {:?}\n", record.status);
    }

    requester.shutdown().await;
    provider.shutdown().await;
    println!("Done");
    Ok(())
}
