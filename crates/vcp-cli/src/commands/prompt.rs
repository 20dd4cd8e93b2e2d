use async_trait::async_trait;
use console::{Term, style};
use dialoguer::{Confirm, theme::ColorfulTheme};
use tracing::warn;

use vcp_plugin::{AuthorizationDecision, AuthorizationPolicy, AuthorizationRequest};

/// Asks on the terminal. Without a terminal every request is denied.
pub struct PromptPolicy {
    term: Term,
}

impl PromptPolicy {
    pub fn new() -> Self {
        Self { term: Term::stderr() }
    }
}

impl Default for PromptPolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthorizationPolicy for PromptPolicy {
    fn name(&self) -> &str {
        "prompt"
    }

    async fn authorize(&self, request: &AuthorizationRequest) -> AuthorizationDecision {
        if !self.term.is_term() {
            warn!(plugin = %request.plugin_id, permission = %request.permission, "no terminal to ask on, denying");
            return AuthorizationDecision::Denied;
        }

        let term = self.term.clone();
        let prompt = format!(
            "Allow {} to use {}?",
            style(&request.plugin_id).bold(),
            style(&request.permission).cyan()
        );
        let answer = tokio::task::spawn_blocking(move || {
            Confirm::with_theme(&ColorfulTheme::default())
                .with_prompt(prompt)
                .default(false)
                .interact_on(&term)
        })
        .await;

        match answer {
            Ok(Ok(true)) => AuthorizationDecision::Approved,
            Ok(Ok(false)) => AuthorizationDecision::Denied,
            Ok(Err(e)) => {
                warn!(error = %e, "permission prompt failed, denying");
                AuthorizationDecision::Denied
            }
            Err(e) => {
                warn!(error = %e, "permission prompt task failed, denying");
                AuthorizationDecision::Denied
            }
        }
    }
}
