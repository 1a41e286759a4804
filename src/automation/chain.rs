//! Chain access for the orchestrator
//!
//! Balance reads, blockhashes and signature lookups go through
//! [`ChainClient`] so passes can run against a fake chain in tests.

use async_trait::async_trait;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::{
    commitment_config::CommitmentConfig, hash::Hash, pubkey::Pubkey, signature::Signature,
};
use solana_transaction_status::TransactionStatus;
use spl_associated_token_account::get_associated_token_address;
use std::sync::Arc;
use std::time::Duration;

use super::errors::OrchestrationError;
use crate::relay::confirmation::{ConfirmationProbe, ConfirmationStatus, StatusSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBalance {
    pub amount: u64,
    pub decimals: u8,
}

/// What the chain knows about one signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureState {
    pub slot: u64,
    pub err: Option<String>,
    /// Reached at least `confirmed` commitment
    pub confirmed: bool,
}

impl From<TransactionStatus> for SignatureState {
    fn from(status: TransactionStatus) -> Self {
        Self {
            slot: status.slot,
            confirmed: status.satisfies_commitment(CommitmentConfig::confirmed()),
            err: status.err.map(|e| e.to_string()),
        }
    }
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn latest_blockhash(&self) -> Result<Hash, OrchestrationError>;

    /// Lamports held by `owner`
    async fn balance(&self, owner: &Pubkey) -> Result<u64, OrchestrationError>;

    /// Balance of `owner`'s associated token account for `mint`
    async fn token_balance(&self, owner: &Pubkey, mint: &Pubkey) -> Result<TokenBalance, OrchestrationError>;

    /// `None` when the signature is unknown to the cluster
    async fn signature_state(&self, signature: &Signature) -> Result<Option<SignatureState>, OrchestrationError>;
}

pub struct RpcChainClient {
    rpc: RpcClient,
}

impl RpcChainClient {
    pub fn new(url: &str, timeout: Duration) -> Self {
        Self {
            rpc: RpcClient::new_with_timeout_and_commitment(
                url.to_string(),
                timeout,
                CommitmentConfig::confirmed(),
            ),
        }
    }
}

fn chain_err(op: &str, err: impl std::fmt::Display) -> OrchestrationError {
    OrchestrationError::Chain(format!("{}: {}", op, err))
}

#[async_trait]
impl ChainClient for RpcChainClient {
    async fn latest_blockhash(&self) -> Result<Hash, OrchestrationError> {
        self.rpc
            .get_latest_blockhash()
            .await
            .map_err(|e| chain_err("get_latest_blockhash", e))
    }

    async fn balance(&self, owner: &Pubkey) -> Result<u64, OrchestrationError> {
        self.rpc
            .get_balance(owner)
            .await
            .map_err(|e| chain_err("get_balance", e))
    }

    async fn token_balance(&self, owner: &Pubkey, mint: &Pubkey) -> Result<TokenBalance, OrchestrationError> {
        let ata = get_associated_token_address(owner, mint);
        let ui = self
            .rpc
            .get_token_account_balance(&ata)
            .await
            .map_err(|e| chain_err("get_token_account_balance", e))?;
        let amount = ui
            .amount
            .parse::<u64>()
            .map_err(|e| chain_err("token amount", e))?;
        Ok(TokenBalance {
            amount,
            decimals: ui.decimals,
        })
    }

    async fn signature_state(&self, signature: &Signature) -> Result<Option<SignatureState>, OrchestrationError> {
        let response = self
            .rpc
            .get_signature_statuses(&[*signature])
            .await
            .map_err(|e| chain_err("get_signature_statuses", e))?;
        Ok(response
            .value
            .into_iter()
            .next()
            .flatten()
            .map(SignatureState::from))
    }
}

/// Confirmation source that asks the chain directly about the set's first signature
pub struct ChainStatusSource {
    chain: Arc<dyn ChainClient>,
    signature: Signature,
}

impl ChainStatusSource {
    pub fn new(chain: Arc<dyn ChainClient>, signature: Signature) -> Self {
        Self { chain, signature }
    }
}

#[async_trait]
impl StatusSource for ChainStatusSource {
    async fn check(&self, _id: &str) -> ConfirmationProbe {
        match self.chain.signature_state(&self.signature).await {
            Err(e) => ConfirmationProbe {
                status: ConfirmationStatus::NetworkError,
                slot: None,
                reason: Some(e.to_string()),
            },
            Ok(None) => ConfirmationProbe::of(ConfirmationStatus::NotFound),
            Ok(Some(state)) => match state.err {
                Some(err) => ConfirmationProbe::failed(err),
                None if state.confirmed => ConfirmationProbe::landed(Some(state.slot)),
                None => ConfirmationProbe {
                    status: ConfirmationStatus::Processing,
                    slot: Some(state.slot),
                    reason: None,
                },
            },
        }
    }
}
