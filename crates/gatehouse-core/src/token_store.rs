//! Issued credentials and revocations.
//!
//! Tokens are presented as `gh_<jti>.<secret>`. Only the SHA-256 of the
//! secret is stored. Several processes may share one store file; every
//! mutation goes through a locked read-modify-write.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::clock::SharedClock;
use crate::config::data_dir;
use crate::error::Result;
use crate::file_store::{JsonFileStore, LockOptions};
use crate::secret::{random_token, sha256_hex, verify_hash};

const TOKEN_PREFIX: &str = "gh_";
const STORE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenMetadata {
    pub jti: String,
    pub subject: String,
    pub role: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub issued_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at_ms: Option<u64>,
    /// Absent for tokens registered through [`TokenStore::ensure_allowed`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_hash: Option<String>,
}

impl TokenMetadata {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms.is_some_and(|exp| now_ms >= exp)
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked_at_ms.is_some()
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }

    /// Copy without the secret hash, for listing to clients.
    pub fn redacted(&self) -> Self {
        Self {
            secret_hash: None,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenFile {
    version: u32,
    #[serde(default)]
    tokens: BTreeMap<String, TokenMetadata>,
}

impl Default for TokenFile {
    fn default() -> Self {
        Self {
            version: STORE_VERSION,
            tokens: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    Allowed,
    Revoked,
    Expired,
}

/// A freshly issued token. `token` is the only copy of the secret.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub metadata: TokenMetadata,
}

/// Split `gh_<jti>.<secret>` into its parts.
pub fn parse_token(presented: &str) -> Option<(&str, &str)> {
    let rest = presented.strip_prefix(TOKEN_PREFIX)?;
    let (jti, secret) = rest.split_once('.')?;
    if jti.is_empty() || secret.is_empty() {
        return None;
    }
    Some((jti, secret))
}

pub struct TokenStore {
    store: JsonFileStore,
    clock: SharedClock,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>, lock: LockOptions, clock: SharedClock) -> Self {
        Self {
            store: JsonFileStore::new(path, lock, clock.clone()),
            clock,
        }
    }

    pub fn default_path() -> PathBuf {
        data_dir().join("tokens.json")
    }

    /// Issue a new token. The plaintext is returned once and never stored.
    pub async fn issue(
        &self,
        subject: &str,
        role: &str,
        scopes: Vec<String>,
        ttl_ms: Option<u64>,
    ) -> Result<IssuedToken> {
        let now = self.clock.now_ms();
        let jti = uuid::Uuid::new_v4().simple().to_string();
        let secret = random_token(32);
        let metadata = TokenMetadata {
            jti: jti.clone(),
            subject: subject.to_string(),
            role: role.to_string(),
            scopes,
            issued_at_ms: now,
            expires_at_ms: ttl_ms.map(|ttl| now.saturating_add(ttl)),
            revoked_at_ms: None,
            secret_hash: Some(sha256_hex(&secret)),
        };

        let stored = metadata.clone();
        self.store
            .update(move |file: &mut TokenFile| {
                file.version = STORE_VERSION;
                file.tokens.insert(stored.jti.clone(), stored);
                Ok(())
            })
            .await?;

        info!(jti = %jti, subject, role, "Issued token");
        Ok(IssuedToken {
            token: format!("{TOKEN_PREFIX}{jti}.{secret}"),
            metadata,
        })
    }

    /// Register `metadata` if its jti is unknown, then report whether it may be used.
    ///
    /// An existing entry is never overwritten, so a revocation recorded by
    /// another process is preserved.
    pub async fn ensure_allowed(&self, metadata: TokenMetadata) -> Result<TokenStatus> {
        let now = self.clock.now_ms();
        let status = self
            .store
            .update(move |file: &mut TokenFile| {
                file.version = STORE_VERSION;
                let entry = file
                    .tokens
                    .entry(metadata.jti.clone())
                    .or_insert(metadata);
                Ok(if entry.is_revoked() {
                    TokenStatus::Revoked
                } else if entry.is_expired(now) {
                    TokenStatus::Expired
                } else {
                    TokenStatus::Allowed
                })
            })
            .await?;
        Ok(status)
    }

    /// Resolve a presented token to its metadata if it is valid right now.
    pub async fn verify(&self, presented: &str) -> Result<Option<TokenMetadata>> {
        let Some((jti, secret)) = parse_token(presented) else {
            return Ok(None);
        };
        let file: TokenFile = self.store.read().await?;
        let Some(meta) = file.tokens.get(jti) else {
            debug!(jti, "Unknown token");
            return Ok(None);
        };
        let hash_ok = meta
            .secret_hash
            .as_deref()
            .is_some_and(|hash| verify_hash(secret, hash));
        if !hash_ok {
            debug!(jti, "Token secret mismatch");
            return Ok(None);
        }
        if meta.is_revoked() {
            debug!(jti, "Token revoked");
            return Ok(None);
        }
        if meta.is_expired(self.clock.now_ms()) {
            debug!(jti, "Token expired");
            return Ok(None);
        }
        Ok(Some(meta.clone()))
    }

    /// Revoke a token. Revoking twice keeps the original revocation time.
    /// Returns `None` if the jti is unknown.
    pub async fn revoke(&self, jti: &str) -> Result<Option<TokenMetadata>> {
        let now = self.clock.now_ms();
        let jti_owned = jti.to_string();
        let revoked = self
            .store
            .update(move |file: &mut TokenFile| {
                Ok(file.tokens.get_mut(&jti_owned).map(|meta| {
                    if meta.revoked_at_ms.is_none() {
                        meta.revoked_at_ms = Some(now);
                    }
                    meta.clone()
                }))
            })
            .await?;
        if revoked.is_some() {
            info!(jti, "Revoked token");
        }
        Ok(revoked)
    }

    pub async fn get(&self, jti: &str) -> Result<Option<TokenMetadata>> {
        let file: TokenFile = self.store.read().await?;
        Ok(file.tokens.get(jti).cloned())
    }

    /// All tokens, oldest first.
    pub async fn list(&self) -> Result<Vec<TokenMetadata>> {
        let file: TokenFile = self.store.read().await?;
        let mut tokens: Vec<_> = file.tokens.into_values().collect();
        tokens.sort_by(|a, b| {
            a.issued_at_ms
                .cmp(&b.issued_at_ms)
                .then_with(|| a.jti.cmp(&b.jti))
        });
        Ok(tokens)
    }

    /// Remove entries that are both expired and revoked. Returns how many were removed.
    pub async fn prune(&self) -> Result<usize> {
        let now = self.clock.now_ms();
        let removed = self
            .store
            .update(move |file: &mut TokenFile| {
                let before = file.tokens.len();
                file.tokens
                    .retain(|_, meta| !(meta.is_expired(now) && meta.is_revoked()));
                Ok(before - file.tokens.len())
            })
            .await?;
        if removed > 0 {
            info!(removed, "Pruned tokens");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::clock::ManualClock;

    fn store_at(path: PathBuf, clock: Arc<ManualClock>) -> TokenStore {
        let lock = LockOptions {
            stale_after: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(5),
        };
        TokenStore::new(path, lock, clock)
    }

    fn external(jti: &str) -> TokenMetadata {
        TokenMetadata {
            jti: jti.into(),
            subject: "bridge".into(),
            role: "operator".into(),
            scopes: vec![],
            issued_at_ms: 0,
            expires_at_ms: None,
            revoked_at_ms: None,
            secret_hash: None,
        }
    }

    #[test]
    fn test_parse_token() {
        assert_eq!(parse_token("gh_abc.def"), Some(("abc", "def")));
        assert_eq!(parse_token("abc.def"), None);
        assert_eq!(parse_token("gh_abc"), None);
        assert_eq!(parse_token("gh_.def"), None);
    }

    #[tokio::test]
    async fn test_issue_and_verify() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(1_000));
        let store = store_at(dir.path().join("tokens.json"), clock);

        let issued = store
            .issue("alice", "operator", vec!["admin".into()], None)
            .await
            .unwrap();
        assert!(issued.token.starts_with("gh_"));

        let meta = store.verify(&issued.token).await.unwrap().unwrap();
        assert_eq!(meta.subject, "alice");
        assert!(meta.has_scope("admin"));

        let tampered = format!("{}x", issued.token);
        assert!(store.verify(&tampered).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_plaintext_secret_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        let store = store_at(path.clone(), Arc::new(ManualClock::new(0)));

        let issued = store.issue("bob", "node", vec![], None).await.unwrap();
        let (_, secret) = parse_token(&issued.token).unwrap();
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains(secret));
        assert!(raw.contains("\"version\": 1"));
    }

    #[tokio::test]
    async fn test_expired_token_rejected_but_listed() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(0));
        let store = store_at(dir.path().join("tokens.json"), clock.clone());

        let issued = store.issue("carol", "operator", vec![], Some(1_000)).await.unwrap();
        clock.set(1_000);
        assert!(store.verify(&issued.token).await.unwrap().is_none());
        assert_eq!(store.list().await.unwrap().len(), 1);
        assert_eq!(store.prune().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_revoke_is_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(100));
        let store = store_at(dir.path().join("tokens.json"), clock.clone());

        let issued = store.issue("dan", "operator", vec![], None).await.unwrap();
        let jti = issued.metadata.jti.clone();

        let first = store.revoke(&jti).await.unwrap().unwrap();
        assert_eq!(first.revoked_at_ms, Some(100));

        clock.set(500);
        let second = store.revoke(&jti).await.unwrap().unwrap();
        assert_eq!(second.revoked_at_ms, Some(100));

        assert!(store.verify(&issued.token).await.unwrap().is_none());
        assert!(store.revoke("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_prune_requires_expired_and_revoked() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(0));
        let store = store_at(dir.path().join("tokens.json"), clock.clone());

        let revoked_only = store.issue("a", "r", vec![], None).await.unwrap();
        let expired_only = store.issue("b", "r", vec![], Some(10)).await.unwrap();
        let both = store.issue("c", "r", vec![], Some(10)).await.unwrap();
        store.revoke(&revoked_only.metadata.jti).await.unwrap();
        store.revoke(&both.metadata.jti).await.unwrap();

        clock.set(50);
        assert_eq!(store.prune().await.unwrap(), 1);

        let remaining: Vec<String> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.jti)
            .collect();
        assert!(remaining.contains(&revoked_only.metadata.jti));
        assert!(remaining.contains(&expired_only.metadata.jti));
        assert!(!remaining.contains(&both.metadata.jti));
    }

    #[tokio::test]
    async fn test_ensure_allowed_does_not_overwrite_revocation() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(0));
        let store = store_at(dir.path().join("tokens.json"), clock);

        assert_eq!(
            store.ensure_allowed(external("x1")).await.unwrap(),
            TokenStatus::Allowed
        );
        store.revoke("x1").await.unwrap();
        assert_eq!(
            store.ensure_allowed(external("x1")).await.unwrap(),
            TokenStatus::Revoked
        );
    }

    #[tokio::test]
    async fn test_two_processes_ensure_allowed_keep_both() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        let clock = Arc::new(ManualClock::new(0));

        // Separate store instances stand in for separate processes.
        let a = store_at(path.clone(), clock.clone());
        let b = store_at(path.clone(), clock.clone());

        let (ra, rb) = tokio::join!(
            tokio::spawn(async move { a.ensure_allowed(external("jti-a")).await }),
            tokio::spawn(async move { b.ensure_allowed(external("jti-b")).await }),
        );
        assert_eq!(ra.unwrap().unwrap(), TokenStatus::Allowed);
        assert_eq!(rb.unwrap().unwrap(), TokenStatus::Allowed);

        let check = store_at(path, clock);
        let jtis: Vec<String> = check.list().await.unwrap().into_iter().map(|m| m.jti).collect();
        assert_eq!(jtis.len(), 2);
        assert!(jtis.contains(&"jti-a".to_string()));
        assert!(jtis.contains(&"jti-b".to_string()));
    }
}
