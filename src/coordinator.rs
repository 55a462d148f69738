//! Task lifecycle bookkeeping driven by inbound and outbound task messages.
//!
//! One [`TaskRecord`] per escrow id, each behind its own async mutex: a message and
//! the callback it triggers run while holding that escrow's lock, so two messages
//! for the same escrow never interleave while different escrows proceed in
//! parallel. Status only moves forward; out-of-order messages create the record on
//! the spot.
//!
//! Every task message must carry a valid signature from the key its `sender` names,
//! whether or not the transport already knew that key. Once a record exists only its
//! counterparty can move it.

use crate::error::{HyphaError, Result};
use crate::identity::NodeId;
use crate::model::{Listing, TaskRecord, TaskRole, TaskStatus};
use crate::protocol::{
    ErrorPayload, Message, MessageType, Payload, PaymentNotification, TaskComplete, TaskRequest,
    TaskResponse,
};
use crate::transport::{verify_message, MessageHandler, Transport};
use crate::validation;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

type Callback<T, R> = Arc<dyn Fn(String, T) -> BoxFuture<'static, anyhow::Result<R>> + Send + Sync>;

fn boxed<T, R, F, Fut>(f: F) -> Callback<T, R>
where
    F: Fn(String, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    T: 'static,
    R: 'static,
{
    Arc::new(move |sender, payload| f(sender, payload).boxed())
}

#[derive(Default)]
struct Callbacks {
    task_request: Option<Callback<TaskRequest, bool>>,
    task_response: Option<Callback<TaskResponse, ()>>,
    task_complete: Option<Callback<TaskComplete, ()>>,
    payment: Option<Callback<PaymentNotification, ()>>,
    error: Option<Callback<ErrorPayload, ()>>,
}

const ROUTED_TYPES: [MessageType; 5] = [
    MessageType::TaskRequest,
    MessageType::TaskResponse,
    MessageType::TaskComplete,
    MessageType::PaymentNotification,
    MessageType::Error,
];

pub struct TaskCoordinator {
    transport: Arc<Transport>,
    tasks: DashMap<String, Arc<Mutex<TaskRecord>>>,
    callbacks: RwLock<Callbacks>,
}

impl TaskCoordinator {
    pub fn new(transport: Arc<Transport>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            tasks: DashMap::new(),
            callbacks: RwLock::new(Callbacks::default()),
        })
    }

    /// Route task messages arriving on the transport to this coordinator.
    pub fn install(self: &Arc<Self>) {
        for message_type in ROUTED_TYPES {
            self.transport
                .register_handler(message_type, Arc::new(Route(Arc::downgrade(self))));
        }
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// Decide on incoming work. `Ok(true)` accepts; `Ok(false)` or an error rejects.
    pub fn on_task_request<F, Fut>(&self, f: F)
    where
        F: Fn(String, TaskRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        self.callbacks.write().task_request = Some(boxed(f));
    }

    pub fn on_task_response<F, Fut>(&self, f: F)
    where
        F: Fn(String, TaskResponse) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.callbacks.write().task_response = Some(boxed(f));
    }

    pub fn on_task_complete<F, Fut>(&self, f: F)
    where
        F: Fn(String, TaskComplete) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.callbacks.write().task_complete = Some(boxed(f));
    }

    pub fn on_payment<F, Fut>(&self, f: F)
    where
        F: Fn(String, PaymentNotification) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.callbacks.write().payment = Some(boxed(f));
    }

    pub fn on_error<F, Fut>(&self, f: F)
    where
        F: Fn(String, ErrorPayload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.callbacks.write().error = Some(boxed(f));
    }

    /// Apply one task message. Fails with `SignatureInvalid` unless the envelope is
    /// signed by the key encoded in its `sender` field.
    pub async fn handle_inbound(&self, message: Message) -> Result<()> {
        if !ROUTED_TYPES.contains(&message.message_type) {
            return Err(HyphaError::UnknownMessageType(message.message_type.to_string()));
        }
        authenticate(&message)?;
        match message.message_type.clone() {
            MessageType::TaskRequest => self.handle_task_request(message).await,
            MessageType::TaskResponse => self.handle_task_response(message).await,
            MessageType::TaskComplete => self.handle_task_complete(message).await,
            MessageType::PaymentNotification => self.handle_payment(message).await,
            MessageType::Error => self.handle_error(message).await,
            other => Err(HyphaError::UnknownMessageType(other.to_string())),
        }
    }

    async fn handle_task_request(&self, message: Message) -> Result<()> {
        let request = TaskRequest::from_message(&message)?;
        let sender = message.sender_id;
        let slot = self.slot(&request.escrow_id, &sender, TaskRole::Provider);
        let mut record = slot.lock().await;
        if !is_counterparty(&record, &sender) {
            return Ok(());
        }
        record.fill_request(&request.task_description, request.amount, request.deadline);
        info!(
            "Task request {} from {}: {} ({} USDT)",
            request.escrow_id, sender, request.task_description, request.amount
        );

        if let Some((host, port)) = request.reply_to.as_deref().and_then(split_endpoint) {
            self.transport.remember_address(&sender, &host, port);
        }

        if record.status != TaskStatus::Pending {
            debug!("Late request for {} ({:?}), keeping status", request.escrow_id, record.status);
            return Ok(());
        }

        let callback = self.callbacks.read().task_request.clone();
        let Some(callback) = callback else {
            debug!("No task-request callback, {} stays pending", request.escrow_id);
            return Ok(());
        };

        let escrow_id = request.escrow_id.clone();
        let accepted = match callback(sender.clone(), request).await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("Task-request callback failed for {}: {:#}", escrow_id, e);
                false
            }
        };
        record.advance(if accepted {
            TaskStatus::Accepted
        } else {
            TaskStatus::Rejected
        });

        let response = TaskResponse {
            escrow_id: escrow_id.clone(),
            accepted,
            estimated_completion: None,
            message: Some(if accepted { "Task accepted" } else { "Task rejected" }.to_string()),
        };
        let reply = response.to_message(&self.transport.sender_id(), &sender)?;
        if let Err(e) = self.transport.send_to_peer(reply).await {
            warn!("Could not answer task request {}: {}", escrow_id, e);
        }
        Ok(())
    }

    async fn handle_task_response(&self, message: Message) -> Result<()> {
        let response = TaskResponse::from_message(&message)?;
        let sender = message.sender_id;
        let slot = self.slot(&response.escrow_id, &sender, TaskRole::Requester);
        let mut record = slot.lock().await;
        if !is_counterparty(&record, &sender) {
            return Ok(());
        }

        if response.estimated_completion.is_some() {
            record.estimated_completion = response.estimated_completion;
        }
        let changed = record.advance(if response.accepted {
            TaskStatus::Accepted
        } else {
            TaskStatus::Rejected
        });
        if !changed {
            debug!("Late response for {} ({:?}), keeping status", response.escrow_id, record.status);
            return Ok(());
        }
        info!(
            "Task {} {} by {}",
            response.escrow_id,
            if response.accepted { "accepted" } else { "rejected" },
            sender
        );

        let callback = self.callbacks.read().task_response.clone();
        if let Some(callback) = callback {
            let escrow_id = response.escrow_id.clone();
            if let Err(e) = callback(sender, response).await {
                error!("Task-response callback failed for {}: {:#}", escrow_id, e);
            }
        }
        Ok(())
    }

    async fn handle_task_complete(&self, message: Message) -> Result<()> {
        let complete = TaskComplete::from_message(&message)?;
        let sender = message.sender_id;
        let slot = self.slot(&complete.escrow_id, &sender, TaskRole::Requester);
        let mut record = slot.lock().await;
        if !is_counterparty(&record, &sender) {
            return Ok(());
        }

        record.advance(TaskStatus::Completed);
        record.result = Some(complete.result.clone());
        record.completion_proof = complete.completion_proof.clone();
        info!("Task {} completed by {}", complete.escrow_id, sender);

        let callback = self.callbacks.read().task_complete.clone();
        if let Some(callback) = callback {
            let escrow_id = complete.escrow_id.clone();
            if let Err(e) = callback(sender, complete).await {
                error!("Task-complete callback failed for {}: {:#}", escrow_id, e);
            }
        }
        Ok(())
    }

    async fn handle_payment(&self, message: Message) -> Result<()> {
        let payment = PaymentNotification::from_message(&message)?;
        let sender = message.sender_id;
        let slot = self.slot(&payment.escrow_id, &sender, TaskRole::Provider);
        let mut record = slot.lock().await;
        if !is_counterparty(&record, &sender) {
            return Ok(());
        }

        record.advance(TaskStatus::Paid);
        record.tx_hash = Some(payment.tx_hash.clone());
        if record.amount.is_none() {
            record.amount = Some(payment.amount);
        }
        info!("Payment for {} received: {} ({})", payment.escrow_id, payment.amount, payment.tx_hash);

        let callback = self.callbacks.read().payment.clone();
        if let Some(callback) = callback {
            let escrow_id = payment.escrow_id.clone();
            if let Err(e) = callback(sender, payment).await {
                error!("Payment callback failed for {}: {:#}", escrow_id, e);
            }
        }
        Ok(())
    }

    async fn handle_error(&self, message: Message) -> Result<()> {
        let payload = ErrorPayload::from_message(&message)?;
        warn!(
            "Peer {} reported {}: {}",
            message.sender_id, payload.error_code, payload.error_message
        );
        let callback = self.callbacks.read().error.clone();
        if let Some(callback) = callback {
            if let Err(e) = callback(message.sender_id, payload).await {
                error!("Error callback failed: {:#}", e);
            }
        }
        Ok(())
    }

    /// Ask `provider` to do work. The record is only kept if the request was delivered.
    pub async fn request_task(&self, provider: &Listing, mut request: TaskRequest) -> Result<()> {
        validation::validate_task_description(&request.task_description, "task_description")?;
        validation::validate_amount(request.amount, "amount")?;
        let (host, port) = provider
            .host
            .clone()
            .zip(provider.port)
            .ok_or_else(|| HyphaError::UnknownPeer(format!("{} advertises no endpoint", provider.node_id)))?;
        if let Err(e) = self.transport.learn_peer(provider) {
            debug!("Listing for {} carries no usable key: {}", provider.node_id, e);
        }
        if request.reply_to.is_none() {
            request.reply_to = self.reply_address();
        }

        let escrow_id = request.escrow_id.clone();
        let created = !self.tasks.contains_key(&escrow_id);
        let slot = self.slot(&escrow_id, &provider.node_id, TaskRole::Requester);
        let mut record = slot.lock().await;

        let message = request.to_message(&self.transport.sender_id(), &provider.node_id)?;
        if let Err(e) = self.transport.try_send(message, &host, port).await {
            if created && record.status == TaskStatus::Pending {
                drop(record);
                self.tasks.remove(&escrow_id);
            }
            return Err(e);
        }

        record.fill_request(&request.task_description, request.amount, request.deadline);
        info!("Requested task {} from {}", escrow_id, provider.node_id);
        Ok(())
    }

    /// Answer a pending request by hand (when no task-request callback decides).
    pub async fn respond(
        &self,
        escrow_id: &str,
        accepted: bool,
        estimated_completion: Option<i64>,
        message: Option<String>,
    ) -> Result<()> {
        let slot = self.existing(escrow_id)?;
        let mut record = slot.lock().await;
        let response = TaskResponse {
            escrow_id: escrow_id.to_string(),
            accepted,
            estimated_completion,
            message,
        };
        self.transport
            .send_to_peer(response.to_message(&self.transport.sender_id(), &record.counterparty_id)?)
            .await?;

        record.advance(if accepted {
            TaskStatus::Accepted
        } else {
            TaskStatus::Rejected
        });
        if estimated_completion.is_some() {
            record.estimated_completion = estimated_completion;
        }
        Ok(())
    }

    pub async fn complete_task(&self, escrow_id: &str, result: Value, completion_proof: Option<String>) -> Result<()> {
        let slot = self.existing(escrow_id)?;
        let mut record = slot.lock().await;
        let complete = TaskComplete {
            escrow_id: escrow_id.to_string(),
            result: result.clone(),
            completion_proof: completion_proof.clone(),
        };
        self.transport
            .send_to_peer(complete.to_message(&self.transport.sender_id(), &record.counterparty_id)?)
            .await?;

        record.advance(TaskStatus::Completed);
        record.result = Some(result);
        record.completion_proof = completion_proof;
        info!("Delivered result for {}", escrow_id);
        Ok(())
    }

    pub async fn notify_payment(&self, escrow_id: &str, amount: f64, tx_hash: &str, from_address: &str, to_address: &str) -> Result<()> {
        let slot = self.existing(escrow_id)?;
        let mut record = slot.lock().await;
        let payment = PaymentNotification {
            escrow_id: escrow_id.to_string(),
            amount,
            tx_hash: tx_hash.to_string(),
            from_address: from_address.to_string(),
            to_address: to_address.to_string(),
        };
        self.transport
            .send_to_peer(payment.to_message(&self.transport.sender_id(), &record.counterparty_id)?)
            .await?;

        record.advance(TaskStatus::Paid);
        record.tx_hash = Some(tx_hash.to_string());
        Ok(())
    }

    pub async fn send_error(&self, recipient_id: &str, payload: ErrorPayload) -> Result<()> {
        let message = payload.to_message(&self.transport.sender_id(), recipient_id)?;
        self.transport.send_to_peer(message).await
    }

    pub async fn get_task(&self, escrow_id: &str) -> Option<TaskRecord> {
        let slot = self.tasks.get(escrow_id).map(|s| Arc::clone(s.value()))?;
        let record = slot.lock().await;
        Some(record.clone())
    }

    /// Records still waiting on a decision or on delivery.
    pub async fn list_active(&self) -> Vec<TaskRecord> {
        self.tasks()
            .await
            .into_iter()
            .filter(|r| r.status.is_active())
            .collect()
    }

    pub async fn tasks(&self) -> Vec<TaskRecord> {
        let mut records = Vec::with_capacity(self.tasks.len());
        for slot in self.slots() {
            records.push(slot.lock().await.clone());
        }
        records.sort_by_key(|r| r.created_at);
        records
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Drop rejected and paid records. Returns how many were removed.
    pub async fn prune_finished(&self) -> usize {
        let mut finished = Vec::new();
        for slot in self.slots() {
            let record = slot.lock().await;
            if record.status.is_terminal() {
                finished.push(record.escrow_id.clone());
            }
        }
        for escrow_id in &finished {
            self.tasks.remove(escrow_id);
        }
        finished.len()
    }

    fn slots(&self) -> Vec<Arc<Mutex<TaskRecord>>> {
        self.tasks.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    fn slot(&self, escrow_id: &str, counterparty_id: &str, role: TaskRole) -> Arc<Mutex<TaskRecord>> {
        let entry = self.tasks.entry(escrow_id.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(TaskRecord::new(escrow_id, counterparty_id, role)))
        });
        Arc::clone(entry.value())
    }

    fn existing(&self, escrow_id: &str) -> Result<Arc<Mutex<TaskRecord>>> {
        self.tasks
            .get(escrow_id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| HyphaError::TaskNotFound(escrow_id.to_string()))
    }

    fn reply_address(&self) -> Option<String> {
        let addr = self.transport.local_addr()?;
        Some(format!("{}:{}", self.transport.config().advertised_host(), addr.port()))
    }
}

struct Route(Weak<TaskCoordinator>);

#[async_trait]
impl MessageHandler for Route {
    async fn handle(&self, message: Message) -> anyhow::Result<()> {
        let Some(coordinator) = self.0.upgrade() else {
            return Ok(());
        };
        coordinator.handle_inbound(message).await?;
        Ok(())
    }
}

fn authenticate(message: &Message) -> Result<()> {
    let key = message
        .sender_id
        .parse::<NodeId>()
        .and_then(|id| id.verifying_key())
        .map_err(|e| {
            HyphaError::SignatureInvalid(format!(
                "{} sender {} is not a public key: {}",
                message.message_type, message.sender_id, e
            ))
        })?;
    if verify_message(message, &key) {
        Ok(())
    } else {
        Err(HyphaError::SignatureInvalid(format!(
            "{} from {}",
            message.message_type, message.sender_id
        )))
    }
}

fn is_counterparty(record: &TaskRecord, sender: &str) -> bool {
    if record.counterparty_id.eq_ignore_ascii_case(sender) {
        return true;
    }
    warn!(
        "Ignoring message for {} from {}, counterparty is {}",
        record.escrow_id, sender, record.counterparty_id
    );
    false
}

fn split_endpoint(endpoint: &str) -> Option<(String, u16)> {
    let (host, port) = endpoint.rsplit_once(':')?;
    Some((host.to_string(), port.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::identity::Identity;
    use crate::transport::sign_message;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn coordinator(byte: u8) -> Arc<TaskCoordinator> {
        let identity = Identity::derive(&[byte; 32]).unwrap();
        let config = TransportConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            connect_timeout_seconds: 1,
            ..TransportConfig::default()
        };
        TaskCoordinator::new(Arc::new(Transport::new(&identity, config)))
    }

    fn peer() -> Identity {
        Identity::derive(&[9; 32]).unwrap()
    }

    fn signed<P: Payload>(from: &Identity, payload: &P) -> Message {
        let message = payload.to_message(&from.node_id().to_hex(), "me").unwrap();
        sign_message(message, from.signing_key()).unwrap()
    }

    fn request(escrow_id: &str) -> TaskRequest {
        TaskRequest {
            escrow_id: escrow_id.to_string(),
            task_description: "review code".to_string(),
            amount: 5.0,
            deadline: 1_999_999_999,
            requirements: None,
            reply_to: None,
        }
    }

    #[tokio::test]
    async fn test_request_without_callback_stays_pending() {
        let c = coordinator(1);
        c.handle_inbound(signed(&peer(), &request("e1")))
            .await
            .unwrap();
        let record = c.get_task("e1").await.unwrap();
        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(record.role, TaskRole::Provider);
        assert_eq!(record.description.as_deref(), Some("review code"));
        assert_eq!(c.list_active().await.len(), 1);
    }

    #[tokio::test]
    async fn test_callback_decides_even_when_reply_fails() {
        let c = coordinator(1);
        c.on_task_request(|_, req| async move { Ok(req.amount >= 5.0) });
        c.handle_inbound(signed(&peer(), &request("e1")))
            .await
            .unwrap();
        assert_eq!(c.get_task("e1").await.unwrap().status, TaskStatus::Accepted);

        c.on_task_request(|_, _| async { Err::<bool, _>(anyhow::anyhow!("model offline")) });
        c.handle_inbound(signed(&peer(), &request("e2")))
            .await
            .unwrap();
        assert_eq!(c.get_task("e2").await.unwrap().status, TaskStatus::Rejected);
    }

    #[tokio::test]
    async fn test_complete_before_request() {
        let c = coordinator(1);
        let complete = TaskComplete {
            escrow_id: "e9".to_string(),
            result: json!({"summary": "ok"}),
            completion_proof: Some("ipfs://proof".to_string()),
        };
        c.handle_inbound(signed(&peer(), &complete))
            .await
            .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        c.on_task_request(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
            async { Ok(false) }
        });
        c.handle_inbound(signed(&peer(), &request("e9")))
            .await
            .unwrap();

        let record = c.get_task("e9").await.unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.result, Some(json!({"summary": "ok"})));
        assert_eq!(record.amount, Some(5.0));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_response_and_payment_flow() {
        let c = coordinator(1);
        let accepted = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&accepted);
        c.on_task_response(move |_, response| {
            if response.accepted {
                seen.fetch_add(1, Ordering::SeqCst);
            }
            async { Ok(()) }
        });

        let response = TaskResponse {
            escrow_id: "e1".to_string(),
            accepted: true,
            estimated_completion: Some(1_900_000_000),
            message: None,
        };
        c.handle_inbound(signed(&peer(), &response)).await.unwrap();
        // duplicate does not fire the callback again
        c.handle_inbound(signed(&peer(), &response)).await.unwrap();
        assert_eq!(accepted.load(Ordering::SeqCst), 1);

        let payment = PaymentNotification {
            escrow_id: "e1".to_string(),
            amount: 5.0,
            tx_hash: "0xabc".to_string(),
            from_address: "0x1".to_string(),
            to_address: "0x2".to_string(),
        };
        c.handle_inbound(signed(&peer(), &payment)).await.unwrap();
        let record = c.get_task("e1").await.unwrap();
        assert_eq!(record.status, TaskStatus::Paid);
        assert_eq!(record.tx_hash.as_deref(), Some("0xabc"));
        assert_eq!(record.estimated_completion, Some(1_900_000_000));

        assert!(c.list_active().await.is_empty());
        assert_eq!(c.prune_finished().await, 1);
        assert_eq!(c.task_count(), 0);
    }

    #[tokio::test]
    async fn test_error_message_changes_nothing() {
        let c = coordinator(1);
        let payload = ErrorPayload {
            error_code: "busy".to_string(),
            error_message: "try later".to_string(),
            context: None,
        };
        c.handle_inbound(signed(&peer(), &payload)).await.unwrap();
        assert_eq!(c.task_count(), 0);

        let ping = Message::create(MessageType::Ping, "peer", "me", Default::default());
        assert!(matches!(
            c.handle_inbound(ping).await,
            Err(HyphaError::UnknownMessageType(_))
        ));
    }

    #[tokio::test]
    async fn test_outbound_requires_known_task_and_peer() {
        let c = coordinator(1);
        assert!(matches!(
            c.complete_task("nope", json!(null), None).await,
            Err(HyphaError::TaskNotFound(_))
        ));

        c.handle_inbound(signed(&peer(), &request("e1")))
            .await
            .unwrap();
        assert!(matches!(
            c.respond("e1", true, None, None).await,
            Err(HyphaError::UnknownPeer(_))
        ));
        assert_eq!(c.get_task("e1").await.unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_failed_request_leaves_no_record() {
        let c = coordinator(1);
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let provider = Identity::derive(&[2; 32]).unwrap();
        let listing = Listing::new(provider.node_id().to_hex(), provider.wallet_address())
            .with_endpoint("127.0.0.1", port);
        assert!(c.request_task(&listing, request("e1")).await.is_err());
        assert!(c.get_task("e1").await.is_none());

        let no_endpoint = Listing::new(provider.node_id().to_hex(), provider.wallet_address());
        assert!(matches!(
            c.request_task(&no_endpoint, request("e2")).await,
            Err(HyphaError::UnknownPeer(_))
        ));
    }

    #[tokio::test]
    async fn test_unsigned_and_forged_messages_rejected() {
        let c = coordinator(1);
        c.handle_inbound(signed(&peer(), &request("e1"))).await.unwrap();

        let payment = PaymentNotification {
            escrow_id: "e1".to_string(),
            amount: 5.0,
            tx_hash: "0xfake".to_string(),
            from_address: "0x1".to_string(),
            to_address: "0x2".to_string(),
        };
        let anonymous = payment.to_message("mallory", "me").unwrap();
        assert!(matches!(
            c.handle_inbound(anonymous).await,
            Err(HyphaError::SignatureInvalid(_))
        ));

        let unsigned = payment.to_message(&peer().node_id().to_hex(), "me").unwrap();
        assert!(matches!(
            c.handle_inbound(unsigned.clone()).await,
            Err(HyphaError::SignatureInvalid(_))
        ));

        let mallory = Identity::derive(&[66; 32]).unwrap();
        let impersonated = sign_message(unsigned, mallory.signing_key()).unwrap();
        assert!(matches!(
            c.handle_inbound(impersonated).await,
            Err(HyphaError::SignatureInvalid(_))
        ));

        let record = c.get_task("e1").await.unwrap();
        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(record.tx_hash, None);
    }

    #[tokio::test]
    async fn test_only_counterparty_moves_existing_record() {
        let c = coordinator(1);
        let provider = peer();
        let mallory = Identity::derive(&[66; 32]).unwrap();
        let completions = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&completions);
        c.on_task_complete(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        });

        let response = TaskResponse {
            escrow_id: "e2".to_string(),
            accepted: true,
            estimated_completion: None,
            message: None,
        };
        c.handle_inbound(signed(&provider, &response)).await.unwrap();

        let forged = TaskComplete {
            escrow_id: "e2".to_string(),
            result: json!("forged"),
            completion_proof: None,
        };
        c.handle_inbound(signed(&mallory, &forged)).await.unwrap();
        let record = c.get_task("e2").await.unwrap();
        assert_eq!(record.status, TaskStatus::Accepted);
        assert_eq!(record.result, None);
        assert_eq!(record.counterparty_id, provider.node_id().to_hex());
        assert_eq!(completions.load(Ordering::SeqCst), 0);

        let payment = PaymentNotification {
            escrow_id: "e2".to_string(),
            amount: 5.0,
            tx_hash: "0xfake".to_string(),
            from_address: "0x1".to_string(),
            to_address: "0x2".to_string(),
        };
        c.handle_inbound(signed(&mallory, &payment)).await.unwrap();
        assert_eq!(c.get_task("e2").await.unwrap().status, TaskStatus::Accepted);

        let genuine = TaskComplete {
            escrow_id: "e2".to_string(),
            result: json!("done"),
            completion_proof: None,
        };
        c.handle_inbound(signed(&provider, &genuine)).await.unwrap();
        let record = c.get_task("e2").await.unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.result, Some(json!("done")));
        assert_eq!(completions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_respond_keeps_estimate_when_none_given() {
        let c = coordinator(1);
        let requester = peer();
        c.handle_inbound(signed(&requester, &request("e3"))).await.unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let drain = tokio::spawn(async move {
            for _ in 0..2 {
                let (mut stream, _) = listener.accept().await.unwrap();
                let mut buf = Vec::new();
                tokio::io::AsyncReadExt::read_to_end(&mut stream, &mut buf).await.unwrap();
            }
        });
        c.transport()
            .remember_address(&requester.node_id().to_hex(), "127.0.0.1", port);

        c.respond("e3", true, Some(1_900_000_000), None).await.unwrap();
        c.respond("e3", true, None, Some("still on it".to_string())).await.unwrap();
        drain.await.unwrap();

        let record = c.get_task("e3").await.unwrap();
        assert_eq!(record.status, TaskStatus::Accepted);
        assert_eq!(record.estimated_completion, Some(1_900_000_000));
    }

    #[test]
    fn test_split_endpoint() {
        assert_eq!(split_endpoint("10.0.0.1:8469"), Some(("10.0.0.1".to_string(), 8469)));
        assert_eq!(split_endpoint("nohost"), None);
        assert_eq!(split_endpoint("h:notaport"), None);
    }
}
