//! Seams to the payment side: escrow contracts and direct transfers.
//!
//! The messaging core never moves money itself. An agent is handed implementations
//! of these traits and only reports the outcome to its counterparty in a
//! PAYMENT_NOTIFICATION. [`LocalLedger`] is an in-memory implementation for demos
//! and tests.

use crate::error::{HyphaError, Result};
use crate::validation;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaymentSettlement: Send + Sync {
    /// Wallet address funds are sent from.
    fn address(&self) -> String;

    /// Move `amount` to `to_address`. Returns the transaction hash.
    async fn transfer(&self, to_address: &str, amount: f64) -> Result<String>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EscrowService: Send + Sync {
    /// Lock `amount` for `provider_address` until `deadline` (Unix seconds).
    /// Returns the escrow id as `0x` + 64 hex chars.
    async fn create_escrow(
        &self,
        provider_address: &str,
        amount: f64,
        task_description: &str,
        deadline: i64,
    ) -> Result<String>;

    /// Release the escrowed funds to the provider. Returns the transaction hash.
    async fn complete_escrow(&self, escrow_id: &str) -> Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowStatus {
    Active,
    Released,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowHold {
    pub escrow_id: String,
    pub payer: String,
    pub provider: String,
    pub amount: f64,
    pub task_description: String,
    pub deadline: i64,
    pub status: EscrowStatus,
}

#[derive(Debug, Default)]
struct LedgerState {
    balances: HashMap<String, f64>,
    escrows: HashMap<String, EscrowHold>,
    nonce: u64,
}

impl LedgerState {
    fn next_hash(&mut self, parts: &[&str]) -> String {
        self.nonce += 1;
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part.as_bytes());
        }
        hasher.update(self.nonce.to_be_bytes());
        hasher.update(Utc::now().timestamp_nanos_opt().unwrap_or_default().to_be_bytes());
        format!("0x{}", hex::encode(hasher.finalize()))
    }

    fn debit(&mut self, address: &str, amount: f64) -> Result<()> {
        let balance = self.balances.entry(address.to_string()).or_insert(0.0);
        if *balance < amount {
            return Err(HyphaError::Settlement(format!(
                "insufficient balance: {} has {}, needs {}",
                address, balance, amount
            )));
        }
        *balance -= amount;
        Ok(())
    }

    fn credit(&mut self, address: &str, amount: f64) {
        *self.balances.entry(address.to_string()).or_insert(0.0) += amount;
    }
}

/// Shared in-memory ledger. Every handle acts on behalf of one owner address;
/// handles made with [`LocalLedger::for_owner`] see the same balances.
#[derive(Clone)]
pub struct LocalLedger {
    owner: String,
    state: Arc<Mutex<LedgerState>>,
}

impl LocalLedger {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            state: Arc::new(Mutex::new(LedgerState::default())),
        }
    }

    pub fn for_owner(&self, owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            state: Arc::clone(&self.state),
        }
    }

    pub fn deposit(&self, address: &str, amount: f64) {
        self.state.lock().credit(address, amount);
    }

    pub fn balance(&self, address: &str) -> f64 {
        self.state.lock().balances.get(address).copied().unwrap_or(0.0)
    }

    pub fn escrow(&self, escrow_id: &str) -> Option<EscrowHold> {
        self.state.lock().escrows.get(escrow_id).cloned()
    }
}

#[async_trait]
impl PaymentSettlement for LocalLedger {
    fn address(&self) -> String {
        self.owner.clone()
    }

    async fn transfer(&self, to_address: &str, amount: f64) -> Result<String> {
        validation::validate_amount(amount, "amount")?;
        let mut state = self.state.lock();
        state.debit(&self.owner, amount)?;
        state.credit(to_address, amount);
        let tx_hash = state.next_hash(&["transfer", &self.owner, to_address]);
        tracing::info!("Ledger transfer {} -> {}: {} ({})", self.owner, to_address, amount, tx_hash);
        Ok(tx_hash)
    }
}

#[async_trait]
impl EscrowService for LocalLedger {
    async fn create_escrow(
        &self,
        provider_address: &str,
        amount: f64,
        task_description: &str,
        deadline: i64,
    ) -> Result<String> {
        validation::validate_amount(amount, "amount")?;
        let mut state = self.state.lock();
        state.debit(&self.owner, amount)?;
        let escrow_id = state.next_hash(&["escrow", &self.owner, provider_address, task_description]);
        state.escrows.insert(
            escrow_id.clone(),
            EscrowHold {
                escrow_id: escrow_id.clone(),
                payer: self.owner.clone(),
                provider: provider_address.to_string(),
                amount,
                task_description: task_description.to_string(),
                deadline,
                status: EscrowStatus::Active,
            },
        );
        tracing::info!("Created escrow {} for {} ({})", escrow_id, provider_address, amount);
        Ok(escrow_id)
    }

    async fn complete_escrow(&self, escrow_id: &str) -> Result<String> {
        let mut state = self.state.lock();
        let hold = state
            .escrows
            .get(escrow_id)
            .cloned()
            .ok_or_else(|| HyphaError::Settlement(format!("unknown escrow {}", escrow_id)))?;
        if hold.payer != self.owner {
            return Err(HyphaError::Settlement(format!(
                "escrow {} belongs to {}",
                escrow_id, hold.payer
            )));
        }
        if hold.status == EscrowStatus::Released {
            return Err(HyphaError::Settlement(format!("escrow {} already released", escrow_id)));
        }

        state.credit(&hold.provider, hold.amount);
        if let Some(entry) = state.escrows.get_mut(escrow_id) {
            entry.status = EscrowStatus::Released;
        }
        let tx_hash = state.next_hash(&["release", escrow_id]);
        tracing::info!("Released escrow {} to {} ({})", escrow_id, hold.provider, tx_hash);
        Ok(tx_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYER: &str = "0x1111111111111111111111111111111111111111";
    const PROVIDER: &str = "0x2222222222222222222222222222222222222222";

    #[tokio::test]
    async fn test_escrow_lifecycle() {
        let ledger = LocalLedger::new(PAYER);
        ledger.deposit(PAYER, 10.0);

        let escrow_id = ledger.create_escrow(PROVIDER, 4.0, "review code", 0).await.unwrap();
        assert!(validation::validate_escrow_id(&escrow_id, "escrow_id").is_ok());
        assert_eq!(ledger.balance(PAYER), 6.0);
        assert_eq!(ledger.balance(PROVIDER), 0.0);

        let provider_view = ledger.for_owner(PROVIDER);
        assert!(provider_view.complete_escrow(&escrow_id).await.is_err());

        let tx = ledger.complete_escrow(&escrow_id).await.unwrap();
        assert!(tx.starts_with("0x"));
        assert_eq!(provider_view.balance(PROVIDER), 4.0);
        assert_eq!(ledger.escrow(&escrow_id).unwrap().status, EscrowStatus::Released);
        assert!(ledger.complete_escrow(&escrow_id).await.is_err());
    }

    #[tokio::test]
    async fn test_transfer_requires_funds() {
        let ledger = LocalLedger::new(PAYER);
        assert!(matches!(
            ledger.transfer(PROVIDER, 1.0).await,
            Err(HyphaError::Settlement(_))
        ));
        ledger.deposit(PAYER, 2.0);
        ledger.transfer(PROVIDER, 1.5).await.unwrap();
        assert_eq!(ledger.balance(PROVIDER), 1.5);
        assert!(ledger.transfer(PROVIDER, -1.0).await.is_err());
    }

    #[tokio::test]
    async fn test_mock_settlement() {
        let mut mock = MockPaymentSettlement::new();
        mock.expect_transfer()
            .withf(|to, amount| to == PROVIDER && *amount == 3.0)
            .times(1)
            .returning(|_, _| Ok("0xfeed".to_string()));
        assert_eq!(mock.transfer(PROVIDER, 3.0).await.unwrap(), "0xfeed");
    }
}
