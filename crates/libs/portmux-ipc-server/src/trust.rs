//! Deciding whether a connecting peer may reach the handler at all.
//!
//! A synchronous fast path settles well-known peers; everything else goes to
//! an injected [`ApprovalPolicy`]. Rejection is silent: the caller closes the
//! channel and never posts to it.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use portmux_ipc::{ConnectionMetadata, HandlerError};
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject,
}

impl Verdict {
    pub fn is_accept(&self) -> bool {
        matches!(self, Self::Accept)
    }
}

/// Injected decision for peers outside the default-trusted set.
///
/// An `Err` is treated as a rejection and never retried.
#[async_trait]
pub trait ApprovalPolicy: Send + Sync {
    async fn approve(&self, metadata: &ConnectionMetadata) -> Result<bool, HandlerError>;
}

/// Policy that approves nobody beyond the fast path.
pub struct DenyAll;

#[async_trait]
impl ApprovalPolicy for DenyAll {
    async fn approve(&self, _metadata: &ConnectionMetadata) -> Result<bool, HandlerError> {
        Ok(false)
    }
}

pub struct TrustValidator {
    trusted_origins: BTreeSet<String>,
    allow_insecure_origins: BTreeSet<String>,
    approval_timeout: Option<Duration>,
    policy: Option<Arc<dyn ApprovalPolicy>>,
}

impl TrustValidator {
    pub fn new(config: &ServerConfig, policy: Option<Arc<dyn ApprovalPolicy>>) -> Self {
        Self {
            trusted_origins: config.trusted_origins.clone(),
            allow_insecure_origins: config.allow_insecure_origins.clone(),
            approval_timeout: config.approval_timeout(),
            policy,
        }
    }

    pub fn policy(&self) -> Option<&Arc<dyn ApprovalPolicy>> {
        self.policy.as_ref()
    }

    /// Fast path. `None` means the approval policy has to decide.
    pub fn validate(&self, metadata: &ConnectionMetadata) -> Option<Verdict> {
        let origin = metadata.peer.origin.as_str();
        if !is_origin(origin) {
            return Some(Verdict::Reject);
        }
        if metadata.is_same_origin() || self.trusted_origins.contains(origin) {
            return Some(Verdict::Accept);
        }
        if !metadata.top_level {
            return Some(Verdict::Reject);
        }
        if !origin.starts_with("https://") && !self.allow_insecure_origins.contains(origin) {
            return Some(Verdict::Reject);
        }
        if self.policy.is_none() {
            return Some(Verdict::Reject);
        }
        None
    }

    /// Full validation, consulting the policy when the fast path defers.
    ///
    /// Resolves to `Reject` if `cancel` fires first (the channel went away),
    /// the policy errors, or the approval timeout elapses.
    pub async fn validate_async(
        &self,
        metadata: &ConnectionMetadata,
        cancel: &CancellationToken,
    ) -> Verdict {
        if let Some(verdict) = self.validate(metadata) {
            return verdict;
        }
        let Some(policy) = self.policy.as_ref() else {
            return Verdict::Reject;
        };

        let approval = async {
            match self.approval_timeout {
                Some(limit) => match tokio::time::timeout(limit, policy.approve(metadata)).await {
                    Ok(result) => result,
                    Err(_) => {
                        log::warn!("trust: approval timed out peer={}", metadata.peer);
                        Ok(false)
                    }
                },
                None => policy.approve(metadata).await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                log::debug!("trust: approval abandoned peer={}", metadata.peer);
                Verdict::Reject
            }
            result = approval => match result {
                Ok(true) => Verdict::Accept,
                Ok(false) => Verdict::Reject,
                Err(err) => {
                    log::warn!("trust: approval failed peer={} err={}", metadata.peer, err);
                    Verdict::Reject
                }
            },
        }
    }
}

/// `scheme://rest` with a non-empty scheme and rest.
fn is_origin(origin: &str) -> bool {
    match origin.split_once("://") {
        Some((scheme, rest)) => {
            !scheme.is_empty()
                && scheme.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
                && !rest.is_empty()
                && !rest.contains(char::is_whitespace)
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portmux_ipc::{IpcError, PeerIdentity};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const LOCAL: &str = "chrome-extension://local";

    fn meta(origin: &str) -> ConnectionMetadata {
        ConnectionMetadata::new(PeerIdentity::new(origin), LOCAL)
    }

    struct Fixed(bool, AtomicUsize);

    #[async_trait]
    impl ApprovalPolicy for Fixed {
        async fn approve(&self, _metadata: &ConnectionMetadata) -> Result<bool, HandlerError> {
            self.1.fetch_add(1, Ordering::SeqCst);
            Ok(self.0)
        }
    }

    struct Failing;

    #[async_trait]
    impl ApprovalPolicy for Failing {
        async fn approve(&self, _metadata: &ConnectionMetadata) -> Result<bool, HandlerError> {
            Err(Box::new(IpcError::Unavailable {
                reason: "prompt closed".into(),
            }))
        }
    }

    struct Forever;

    #[async_trait]
    impl ApprovalPolicy for Forever {
        async fn approve(&self, _metadata: &ConnectionMetadata) -> Result<bool, HandlerError> {
            std::future::pending().await
        }
    }

    fn validator(policy: Option<Arc<dyn ApprovalPolicy>>) -> TrustValidator {
        let config = ServerConfig::default().trust("https://wallet.example");
        TrustValidator::new(&config, policy)
    }

    #[test]
    fn fast_path() {
        let v = validator(Some(Arc::new(DenyAll)));
        assert_eq!(v.validate(&meta(LOCAL)), Some(Verdict::Accept));
        assert_eq!(v.validate(&meta("https://wallet.example")), Some(Verdict::Accept));
        assert_eq!(v.validate(&meta("")), Some(Verdict::Reject));
        assert_eq!(v.validate(&meta("not an origin")), Some(Verdict::Reject));
        assert_eq!(v.validate(&meta("http://plain.example")), Some(Verdict::Reject));
        assert_eq!(v.validate(&meta("https://dapp.example")), None);

        let mut framed = meta("https://dapp.example");
        framed.top_level = false;
        assert_eq!(v.validate(&framed), Some(Verdict::Reject));
    }

    #[test]
    fn no_policy_rejects_unknown_peers() {
        let v = validator(None);
        assert_eq!(v.validate(&meta("https://dapp.example")), Some(Verdict::Reject));
    }

    #[test]
    fn insecure_allowlist_defers() {
        let mut config = ServerConfig::default();
        config.allow_insecure_origins.insert("http://localhost:8080".into());
        let v = TrustValidator::new(&config, Some(Arc::new(DenyAll)));
        assert_eq!(v.validate(&meta("http://localhost:8080")), None);
    }

    #[tokio::test]
    async fn policy_decides_deferred_peers() {
        let approve = Arc::new(Fixed(true, AtomicUsize::new(0)));
        let v = validator(Some(approve.clone()));
        let cancel = CancellationToken::new();
        assert_eq!(v.validate_async(&meta("https://dapp.example"), &cancel).await, Verdict::Accept);
        // trusted peers never reach the policy
        assert_eq!(v.validate_async(&meta(LOCAL), &cancel).await, Verdict::Accept);
        assert_eq!(approve.1.load(Ordering::SeqCst), 1);

        let v = validator(Some(Arc::new(Fixed(false, AtomicUsize::new(0)))));
        assert_eq!(v.validate_async(&meta("https://dapp.example"), &cancel).await, Verdict::Reject);
    }

    #[tokio::test]
    async fn policy_failure_is_rejection() {
        let v = validator(Some(Arc::new(Failing)));
        let verdict =
            v.validate_async(&meta("https://dapp.example"), &CancellationToken::new()).await;
        assert_eq!(verdict, Verdict::Reject);
    }

    #[tokio::test]
    async fn cancellation_discards_pending_approval() {
        let v = validator(Some(Arc::new(Forever)));
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let verdict = v.validate_async(&meta("https://dapp.example"), &cancel).await;
        assert_eq!(verdict, Verdict::Reject);
    }

    #[tokio::test]
    async fn approval_timeout_rejects() {
        let mut config = ServerConfig::default();
        config.approval_timeout_ms = 30;
        let v = TrustValidator::new(&config, Some(Arc::new(Forever)));
        let verdict =
            v.validate_async(&meta("https://dapp.example"), &CancellationToken::new()).await;
        assert_eq!(verdict, Verdict::Reject);
    }
}
