//! Bot definition lifecycle and the one-time-token / long-lived-key swap.
//!
//! Credential material is minted here and handed out exactly once: the
//! one-time token in the create response, the long-lived key in the
//! handshake response that consumed the token. At rest only SHA-256
//! digests exist, and every comparison is constant-time.

use crate::error::{AuthError, Result, StoreError};
use crate::store::{BotDefinition, ConsumeOutcome, CredentialRecord, StateStore};

use chrono::Utc;
use rand::RngCore as _;
use sha2::{Digest as _, Sha256};
use std::sync::Arc;
use subtle::ConstantTimeEq as _;

/// Admin-supplied fields of a new definition.
#[derive(Debug, Clone)]
pub struct DefinitionSpec {
    pub name: String,
    pub description: String,
    pub adapter_type: String,
    pub capabilities: Vec<String>,
    pub configuration: serde_json::Value,
}

/// A freshly created definition plus its single-use registration token.
#[derive(Debug)]
pub struct MintedDefinition {
    pub definition: BotDefinition,
    pub one_time_token: String,
}

/// How a handshake credential was accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthGrant {
    /// The presented token matched the stored long-lived key.
    LongLived,
    /// The presented token was the one-time token; a fresh key was minted
    /// and must be returned to the agent in the handshake response.
    Minted { issued_api_key: String },
}

/// Definition and credential operations over the state store.
#[derive(Clone)]
pub struct CredentialStore {
    store: Arc<dyn StateStore>,
}

impl CredentialStore {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Create a definition with a fresh bot id and a 128-bit one-time
    /// token. The token is returned here and never again.
    pub async fn create_definition(&self, spec: DefinitionSpec) -> Result<MintedDefinition> {
        let definition = BotDefinition {
            bot_id: uuid::Uuid::new_v4().to_string(),
            name: spec.name,
            description: spec.description,
            adapter_type: spec.adapter_type,
            declared_capabilities: spec.capabilities,
            configuration: spec.configuration,
            created_at: Utc::now(),
        };
        let one_time_token = random_hex(16);

        self.store.put_definition(&definition).await?;
        self.store
            .put_credentials(&CredentialRecord {
                bot_id: definition.bot_id.clone(),
                one_time_digest: Some(digest_hex(&one_time_token)),
                long_lived_digest: None,
            })
            .await?;

        tracing::info!(bot_id = %definition.bot_id, name = %definition.name, "bot definition created");
        Ok(MintedDefinition {
            definition,
            one_time_token,
        })
    }

    /// Consume the one-time token and mint a 256-bit long-lived key in
    /// one atomic step. Non-replayable: exactly one caller ever wins.
    pub async fn consume_one_time(
        &self,
        bot_id: &str,
        candidate_token: &str,
    ) -> std::result::Result<String, AuthError> {
        let issued_api_key = random_hex(32);
        let outcome = self
            .store
            .consume_one_time(
                bot_id,
                &digest_hex(candidate_token),
                &digest_hex(&issued_api_key),
            )
            .await
            .map_err(store_auth_error)?;

        match outcome {
            ConsumeOutcome::Swapped => Ok(issued_api_key),
            ConsumeOutcome::Mismatch => Err(AuthError::InvalidCredential),
            ConsumeOutcome::NoUnconsumedToken => Err(AuthError::Conflict),
            ConsumeOutcome::UnknownBot => Err(AuthError::UnknownBot(bot_id.to_string())),
        }
    }

    /// Constant-time check of a candidate against the stored key digest.
    pub async fn verify_long_lived(&self, bot_id: &str, candidate_key: &str) -> Result<bool> {
        let Some(record) = self.store.get_credentials(bot_id).await? else {
            return Ok(false);
        };
        let Some(stored) = record.long_lived_digest else {
            return Ok(false);
        };
        Ok(bool::from(
            stored
                .as_bytes()
                .ct_eq(digest_hex(candidate_key).as_bytes()),
        ))
    }

    /// Handshake authentication: accept either the long-lived key or the
    /// still-unconsumed one-time token.
    pub async fn authenticate(
        &self,
        bot_id: &str,
        auth_token: &str,
    ) -> std::result::Result<AuthGrant, AuthError> {
        if self.store.get_definition(bot_id).await.map_err(store_auth_error)?.is_none() {
            return Err(AuthError::UnknownBot(bot_id.to_string()));
        }

        if self
            .verify_long_lived(bot_id, auth_token)
            .await
            .map_err(|_| AuthError::InvalidCredential)?
        {
            return Ok(AuthGrant::LongLived);
        }

        let issued_api_key = self.consume_one_time(bot_id, auth_token).await?;
        Ok(AuthGrant::Minted { issued_api_key })
    }

    pub async fn get_definition(&self, bot_id: &str) -> Result<Option<BotDefinition>> {
        Ok(self.store.get_definition(bot_id).await?)
    }

    pub async fn list_definitions(&self) -> Result<Vec<BotDefinition>> {
        Ok(self.store.list_definitions().await?)
    }

    pub async fn update_definition(&self, definition: &BotDefinition) -> Result<()> {
        Ok(self.store.put_definition(definition).await?)
    }

    /// Removes the definition and every credential attached to it. The
    /// caller is responsible for tearing down live instances.
    pub async fn delete_definition(&self, bot_id: &str) -> Result<bool> {
        let deleted = self.store.delete_definition(bot_id).await?;
        if deleted {
            tracing::info!(bot_id = %bot_id, "bot definition deleted");
        }
        Ok(deleted)
    }
}

fn store_auth_error(error: StoreError) -> AuthError {
    tracing::error!(%error, "state store failure during authentication");
    AuthError::InvalidCredential
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

fn digest_hex(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn credential_store() -> CredentialStore {
        CredentialStore::new(Arc::new(MemoryStore::new()))
    }

    fn spec() -> DefinitionSpec {
        DefinitionSpec {
            name: "b1".into(),
            description: String::new(),
            adapter_type: "demo".into(),
            capabilities: vec!["t.exec".into()],
            configuration: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn one_time_token_swaps_once_then_key_works() {
        let credentials = credential_store();
        let minted = credentials
            .create_definition(spec())
            .await
            .expect("create definition");
        let bot_id = minted.definition.bot_id.clone();

        let grant = credentials
            .authenticate(&bot_id, &minted.one_time_token)
            .await
            .expect("first handshake consumes the token");
        let AuthGrant::Minted { issued_api_key } = grant else {
            panic!("expected a freshly minted key");
        };

        // Replay of the consumed token must fail.
        let replay = credentials
            .authenticate(&bot_id, &minted.one_time_token)
            .await
            .expect_err("token replay must fail");
        assert!(matches!(
            replay,
            AuthError::InvalidCredential | AuthError::Conflict
        ));

        // The minted key authenticates without minting another.
        let grant = credentials
            .authenticate(&bot_id, &issued_api_key)
            .await
            .expect("long-lived key should authenticate");
        assert_eq!(grant, AuthGrant::LongLived);
    }

    #[tokio::test]
    async fn concurrent_consumption_has_exactly_one_winner() {
        let credentials = credential_store();
        let minted = credentials
            .create_definition(spec())
            .await
            .expect("create definition");
        let bot_id = minted.definition.bot_id.clone();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let credentials = credentials.clone();
            let bot_id = bot_id.clone();
            let token = minted.one_time_token.clone();
            handles.push(tokio::spawn(async move {
                credentials.consume_one_time(&bot_id, &token).await.is_ok()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.expect("join") {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn unknown_bot_and_bad_credentials_are_rejected() {
        let credentials = credential_store();
        let minted = credentials
            .create_definition(spec())
            .await
            .expect("create definition");

        let unknown = credentials
            .authenticate("nope", "whatever")
            .await
            .expect_err("unknown bot");
        assert!(matches!(unknown, AuthError::UnknownBot(_)));

        let bad = credentials
            .authenticate(&minted.definition.bot_id, "wrong-token")
            .await
            .expect_err("bad token");
        assert_eq!(bad, AuthError::InvalidCredential);
    }
}
