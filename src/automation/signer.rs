//! Key decryption and local signing
//!
//! Keys are stored encrypted as base64 `nonce || ciphertext`. The AES-256-GCM
//! key is derived with Argon2id from the per-installation secret, salted with
//! the wallet address and, for session-bound flows, the session id. Decrypted
//! bytes live in [`Zeroizing`] buffers and are dropped right after signing.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use sha2::{Digest, Sha256};
use solana_sdk::{
    message::VersionedMessage,
    signature::{Keypair, Signer},
    transaction::VersionedTransaction,
};
use zeroize::Zeroizing;

use super::errors::OrchestrationError;

const AES_NONCE_LEN: usize = 12;

/// Binds a decryption to one wallet (and optionally one session)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyContext {
    pub address: String,
    pub session_id: Option<String>,
}

impl KeyContext {
    fn salt(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.address.as_bytes());
        if let Some(session) = &self.session_id {
            hasher.update(b":");
            hasher.update(session.as_bytes());
        }
        hasher.finalize().into()
    }
}

/// Encrypted-at-rest key storage
pub trait KeyStore: Send + Sync {
    fn decrypt(&self, blob: &str, ctx: &KeyContext) -> Result<Zeroizing<Vec<u8>>, OrchestrationError>;
}

/// Argon2id cost parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 19_456,
            iterations: 2,
        }
    }
}

pub struct InstallationKeyStore {
    secret: Zeroizing<String>,
    params: KdfParams,
}

impl InstallationKeyStore {
    pub fn new(secret: Zeroizing<String>, params: KdfParams) -> Self {
        Self { secret, params }
    }

    fn derive(&self, ctx: &KeyContext) -> Result<Zeroizing<[u8; 32]>, OrchestrationError> {
        let params = Params::new(self.params.memory_kib, self.params.iterations, 1, Some(32))
            .map_err(|e| OrchestrationError::DecryptFailure(format!("kdf params: {}", e)))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
        let mut key = Zeroizing::new([0u8; 32]);
        argon2
            .hash_password_into(self.secret.as_bytes(), &ctx.salt(), &mut key[..])
            .map_err(|e| OrchestrationError::DecryptFailure(format!("kdf: {}", e)))?;
        Ok(key)
    }

    /// Produce a blob this store can decrypt; used when provisioning units
    pub fn encrypt(&self, plaintext: &[u8], ctx: &KeyContext) -> Result<String, OrchestrationError> {
        let key_bytes = self.derive(ctx)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes[..]));
        let nonce_bytes: [u8; AES_NONCE_LEN] = rand::random();
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| OrchestrationError::DecryptFailure(format!("encryption failed: {}", e)))?;

        let mut blob = nonce_bytes.to_vec();
        blob.extend_from_slice(&ciphertext);
        Ok(BASE64_STANDARD.encode(blob))
    }
}

impl KeyStore for InstallationKeyStore {
    fn decrypt(&self, blob: &str, ctx: &KeyContext) -> Result<Zeroizing<Vec<u8>>, OrchestrationError> {
        let raw = BASE64_STANDARD
            .decode(blob.trim())
            .map_err(|e| OrchestrationError::DecryptFailure(format!("blob encoding: {}", e)))?;
        if raw.len() <= AES_NONCE_LEN {
            return Err(OrchestrationError::DecryptFailure("blob too short".into()));
        }
        let (nonce_bytes, ciphertext) = raw.split_at(AES_NONCE_LEN);

        let key_bytes = self.derive(ctx)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes[..]));
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map(Zeroizing::new)
            .map_err(|_| OrchestrationError::DecryptFailure("authentication failed".into()))
    }
}

/// Decrypt the unit's key, check it matches the funding wallet, sign every message
pub fn sign_messages(
    store: &dyn KeyStore,
    blob: &str,
    ctx: &KeyContext,
    messages: Vec<VersionedMessage>,
) -> Result<Vec<VersionedTransaction>, OrchestrationError> {
    let keypair = {
        let secret = store.decrypt(blob, ctx)?;
        Keypair::try_from(secret.as_slice())
            .map_err(|e| OrchestrationError::DecryptFailure(format!("invalid key bytes: {}", e)))?
    };

    if keypair.pubkey().to_string() != ctx.address {
        return Err(OrchestrationError::DecryptFailure(
            "decrypted key does not match funding wallet".into(),
        ));
    }

    messages
        .into_iter()
        .map(|message| {
            VersionedTransaction::try_new(message, &[&keypair])
                .map_err(|e| OrchestrationError::Build(format!("signing failed: {}", e)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use solana_sdk::{hash::Hash, message::v0::Message as MessageV0, system_instruction};

    fn store(secret: &str) -> InstallationKeyStore {
        InstallationKeyStore::new(
            Zeroizing::new(secret.to_string()),
            KdfParams {
                memory_kib: 64,
                iterations: 1,
            },
        )
    }

    fn message(payer: &Keypair) -> VersionedMessage {
        let ix = system_instruction::transfer(&payer.pubkey(), &payer.pubkey(), 1);
        VersionedMessage::V0(MessageV0::try_compile(&payer.pubkey(), &[ix], &[], Hash::default()).unwrap())
    }

    #[test]
    fn test_sign_with_decrypted_key() {
        let wallet = Keypair::new();
        let ctx = KeyContext {
            address: wallet.pubkey().to_string(),
            session_id: Some("session-7".into()),
        };
        let ks = store("installation-secret");
        let blob = ks.encrypt(&wallet.to_bytes(), &ctx).unwrap();

        let txs = sign_messages(&ks, &blob, &ctx, vec![message(&wallet)]).unwrap();
        assert_eq!(txs.len(), 1);
        assert!(txs[0].verify_with_results().iter().all(|ok| *ok));
    }

    #[test]
    fn test_wrong_secret_or_session_fails() {
        let wallet = Keypair::new();
        let ctx = KeyContext {
            address: wallet.pubkey().to_string(),
            session_id: Some("a".into()),
        };
        let blob = store("right").encrypt(&wallet.to_bytes(), &ctx).unwrap();

        let err = store("wrong").decrypt(&blob, &ctx).unwrap_err();
        assert!(matches!(err, OrchestrationError::DecryptFailure(_)));

        let other_session = KeyContext {
            session_id: Some("b".into()),
            ..ctx.clone()
        };
        assert!(store("right").decrypt(&blob, &other_session).is_err());
    }

    #[test]
    fn test_key_for_other_wallet_rejected() {
        let wallet = Keypair::new();
        let other = Keypair::new();
        let ctx = KeyContext {
            address: wallet.pubkey().to_string(),
            session_id: None,
        };
        let ks = store("secret");
        let blob = ks.encrypt(&other.to_bytes(), &ctx).unwrap();
        let err = sign_messages(&ks, &blob, &ctx, vec![message(&wallet)]).unwrap_err();
        assert_eq!(err.kind(), "decrypt_failure");
    }
}
