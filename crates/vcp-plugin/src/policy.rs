//! Authorization policies consulted when a plugin asks for a permission it
//! has not been granted yet.
//!
//! The permission manager never decides on its own; it asks the injected
//! [`AuthorizationPolicy`]. The default is [`AlwaysDeny`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};
use uuid::Uuid;

use vcp_config::PermissionsConfig;
use vcp_core::PermissionSpec;

/// A pending request for the user (or host policy) to approve a permission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationRequest {
    pub id: Uuid,
    pub plugin_id: String,
    /// Full permission string, e.g. `network.request:*.example.com`.
    pub permission: String,
    pub created_at: DateTime<Utc>,
}

impl AuthorizationRequest {
    pub fn new(plugin_id: &str, permission: &PermissionSpec) -> Self {
        Self {
            id: Uuid::new_v4(),
            plugin_id: plugin_id.to_string(),
            permission: permission.to_string(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthorizationDecision {
    Approved,
    Denied,
    TimedOut,
}

impl AuthorizationDecision {
    pub fn is_approved(self) -> bool {
        self == AuthorizationDecision::Approved
    }
}

#[async_trait]
pub trait AuthorizationPolicy: Send + Sync {
    fn name(&self) -> &str;
    async fn authorize(&self, request: &AuthorizationRequest) -> AuthorizationDecision;
}

/// Denies every request. The production default.
pub struct AlwaysDeny;

#[async_trait]
impl AuthorizationPolicy for AlwaysDeny {
    fn name(&self) -> &str {
        "deny"
    }

    async fn authorize(&self, _request: &AuthorizationRequest) -> AuthorizationDecision {
        AuthorizationDecision::Denied
    }
}

/// Approves every request. Development and tests only.
pub struct AlwaysApprove;

#[async_trait]
impl AuthorizationPolicy for AlwaysApprove {
    fn name(&self) -> &str {
        "approve"
    }

    async fn authorize(&self, _request: &AuthorizationRequest) -> AuthorizationDecision {
        AuthorizationDecision::Approved
    }
}

/// Approves permissions matching one of a fixed set of patterns.
///
/// A pattern is either an exact permission string (`system.notify`) or a
/// prefix ending in `*` (`ui.*`, `network.request:*`).
pub struct AllowListPolicy {
    patterns: Vec<String>,
}

impl AllowListPolicy {
    pub fn new(patterns: Vec<String>) -> Self {
        Self { patterns }
    }

    pub fn allows(&self, permission: &str) -> bool {
        self.patterns.iter().any(|p| match p.strip_suffix('*') {
            Some(prefix) => permission.starts_with(prefix),
            None => p == permission,
        })
    }
}

#[async_trait]
impl AuthorizationPolicy for AllowListPolicy {
    fn name(&self) -> &str {
        "allowlist"
    }

    async fn authorize(&self, request: &AuthorizationRequest) -> AuthorizationDecision {
        if self.allows(&request.permission) {
            AuthorizationDecision::Approved
        } else {
            AuthorizationDecision::Denied
        }
    }
}

type PendingAuthorization = (AuthorizationRequest, oneshot::Sender<AuthorizationDecision>);

/// Forwards requests to whoever holds the receiver (an approval dialog, a
/// remote UI) and waits for the answer.
///
/// No listener, a dropped reply, or no answer within the timeout all count as
/// a denial.
pub struct ChannelPolicy {
    request_tx: mpsc::Sender<PendingAuthorization>,
    request_rx: parking_lot::Mutex<Option<mpsc::Receiver<PendingAuthorization>>>,
    timeout: Duration,
}

impl ChannelPolicy {
    pub fn new(timeout: Duration) -> Self {
        let (tx, rx) = mpsc::channel(64);
        Self {
            request_tx: tx,
            request_rx: parking_lot::Mutex::new(Some(rx)),
            timeout,
        }
    }

    /// Take the receiver (used by the UI layer to answer requests).
    pub fn take_receiver(&self) -> Option<mpsc::Receiver<PendingAuthorization>> {
        self.request_rx.lock().take()
    }
}

#[async_trait]
impl AuthorizationPolicy for ChannelPolicy {
    fn name(&self) -> &str {
        "channel"
    }

    async fn authorize(&self, request: &AuthorizationRequest) -> AuthorizationDecision {
        info!(
            request_id = %request.id,
            plugin = %request.plugin_id,
            permission = %request.permission,
            "requesting permission approval"
        );

        let (response_tx, response_rx) = oneshot::channel();
        if self
            .request_tx
            .send((request.clone(), response_tx))
            .await
            .is_err()
        {
            // No one listening, deny
            return AuthorizationDecision::Denied;
        }

        match tokio::time::timeout(self.timeout, response_rx).await {
            Ok(Ok(decision)) => decision,
            Ok(Err(_)) => AuthorizationDecision::Denied,
            Err(_) => {
                info!(request_id = %request.id, "permission approval timed out");
                AuthorizationDecision::TimedOut
            }
        }
    }
}

/// Build the policy named by `permissions.policy`.
///
/// `prompt` needs an interactive approver supplied by the host; without one
/// the result is [`AlwaysDeny`].
pub fn policy_from_config(
    config: &PermissionsConfig,
    prompt: Option<Arc<dyn AuthorizationPolicy>>,
) -> vcp_core::Result<Arc<dyn AuthorizationPolicy>> {
    let policy: Arc<dyn AuthorizationPolicy> = match config.policy.as_str() {
        "deny" => Arc::new(AlwaysDeny),
        "approve" => Arc::new(AlwaysApprove),
        "allowlist" => Arc::new(AllowListPolicy::new(config.auto_approve.clone())),
        "prompt" => match prompt {
            Some(p) => p,
            None => {
                warn!("prompt policy configured but no interactive approver attached, denying");
                Arc::new(AlwaysDeny)
            }
        },
        other => {
            return Err(vcp_core::VcpError::Config(format!(
                "unknown authorization policy '{other}'"
            )));
        }
    };
    Ok(policy)
}
