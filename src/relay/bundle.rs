//! Atomic transaction sets
//!
//! A bundle is an ordered list of 1-5 transactions that land together or not
//! at all. The size ceiling is enforced when the set is built, so an oversized
//! bundle can never reach the network.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use solana_sdk::{signature::Signature, transaction::VersionedTransaction};
use thiserror::Error;

use super::errors::SubmissionError;

/// Protocol ceiling on transactions per bundle
pub const MAX_BUNDLE_SIZE: usize = 5;

/// Errors raised while constructing a [`TransactionSet`]
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BundleError {
    #[error("Transaction set is empty")]
    Empty,

    #[error("Transaction set has {0} entries, maximum is {MAX_BUNDLE_SIZE}")]
    TooLarge(usize),

    #[error("Failed to serialize transaction {index}: {reason}")]
    Serialization { index: usize, reason: String },
}

/// One wire-ready transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedTransaction {
    /// base64 of the bincode-serialized transaction
    pub base64: String,
    /// First signature, when the transaction was signed locally
    pub signature: Option<Signature>,
}

/// Ordered, size-checked set of transactions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionSet {
    transactions: Vec<EncodedTransaction>,
}

impl TransactionSet {
    /// Serialize signed transactions into a set
    pub fn from_transactions(txs: &[VersionedTransaction]) -> Result<Self, BundleError> {
        check_len(txs.len())?;
        let transactions = txs
            .iter()
            .enumerate()
            .map(|(index, tx)| {
                let bytes = bincode::serialize(tx).map_err(|e| BundleError::Serialization {
                    index,
                    reason: e.to_string(),
                })?;
                Ok(EncodedTransaction {
                    base64: BASE64_STANDARD.encode(bytes),
                    signature: tx.signatures.first().copied(),
                })
            })
            .collect::<Result<Vec<_>, BundleError>>()?;
        Ok(Self { transactions })
    }

    /// Wrap transactions that were already serialized and base64-encoded elsewhere
    pub fn from_encoded(encoded: Vec<String>) -> Result<Self, BundleError> {
        check_len(encoded.len())?;
        Ok(Self {
            transactions: encoded
                .into_iter()
                .map(|base64| EncodedTransaction {
                    base64,
                    signature: None,
                })
                .collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn transactions(&self) -> &[EncodedTransaction] {
        &self.transactions
    }

    pub fn encoded(&self) -> Vec<&str> {
        self.transactions.iter().map(|t| t.base64.as_str()).collect()
    }

    /// Signature of the first transaction, usable for direct chain lookups
    pub fn first_signature(&self) -> Option<Signature> {
        self.transactions.first().and_then(|t| t.signature)
    }

    /// Stable digest of the wire payload
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for tx in &self.transactions {
            hasher.update(tx.base64.as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }
}

fn check_len(len: usize) -> Result<(), BundleError> {
    match len {
        0 => Err(BundleError::Empty),
        n if n > MAX_BUNDLE_SIZE => Err(BundleError::TooLarge(n)),
        _ => Ok(()),
    }
}

/// Supplies the set to submit and, after a stale-blockhash failure, a rebuilt one
#[async_trait]
pub trait BundleSource: Send + Sync {
    async fn current(&self) -> Result<TransactionSet, SubmissionError>;

    /// Rebuild against fresh chain state. Sources that cannot rebuild resend the current set.
    async fn refreshed(&self) -> Result<TransactionSet, SubmissionError> {
        self.current().await
    }
}

#[async_trait]
impl BundleSource for TransactionSet {
    async fn current(&self) -> Result<TransactionSet, SubmissionError> {
        Ok(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("dHg{}", i)).collect()
    }

    #[test]
    fn test_six_entries_rejected() {
        assert_eq!(
            TransactionSet::from_encoded(encoded(6)),
            Err(BundleError::TooLarge(6))
        );
    }

    #[test]
    fn test_empty_rejected() {
        assert_eq!(TransactionSet::from_encoded(vec![]), Err(BundleError::Empty));
        assert_eq!(TransactionSet::from_transactions(&[]), Err(BundleError::Empty));
    }

    #[test]
    fn test_five_entries_accepted() {
        let set = TransactionSet::from_encoded(encoded(5)).unwrap();
        assert_eq!(set.len(), 5);
        assert_eq!(set.encoded()[4], "dHg4");
    }

    #[test]
    fn test_digest_depends_on_order() {
        let a = TransactionSet::from_encoded(vec!["a".into(), "b".into()]).unwrap();
        let b = TransactionSet::from_encoded(vec!["b".into(), "a".into()]).unwrap();
        assert_ne!(a.digest(), b.digest());
        assert_eq!(a.digest(), a.clone().digest());
    }

    #[test]
    fn test_signed_transaction_keeps_signature() {
        use solana_sdk::{
            hash::Hash,
            message::{v0::Message as MessageV0, VersionedMessage},
            signature::{Keypair, Signer},
            system_instruction,
        };

        let payer = Keypair::new();
        let ix = system_instruction::transfer(&payer.pubkey(), &payer.pubkey(), 1);
        let msg = MessageV0::try_compile(&payer.pubkey(), &[ix], &[], Hash::default()).unwrap();
        let tx = VersionedTransaction::try_new(VersionedMessage::V0(msg), &[&payer]).unwrap();

        let set = TransactionSet::from_transactions(&[tx.clone()]).unwrap();
        assert_eq!(set.first_signature(), Some(tx.signatures[0]));
    }
}
