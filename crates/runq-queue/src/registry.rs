//! Runner registry: registration tokens, runner identities and liveness.

use std::collections::HashMap;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use runq_models::{
    RegisterRunner, RegistrationToken, RegistrationTokenId, Runner, RunnerCredential, RunnerId,
    RunnerToken,
};

use crate::error::{DispatchError, DispatchResult};

/// A registration token with the number of runners registered through it.
#[derive(Debug, Clone)]
pub struct RegistrationTokenSummary {
    pub token: RegistrationToken,
    pub registered_runners: usize,
}

#[derive(Default)]
struct RegistryState {
    registration_tokens: HashMap<RegistrationTokenId, RegistrationToken>,
    runners: HashMap<RunnerId, Runner>,
    by_token: HashMap<RunnerToken, RunnerId>,
}

/// Registry of runners allowed to claim jobs.
#[derive(Default)]
pub struct RunnerRegistry {
    state: RwLock<RegistryState>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new registration token.
    pub async fn generate_registration_token(&self) -> RegistrationToken {
        let token = RegistrationToken::generate();
        let mut state = self.state.write().await;
        state
            .registration_tokens
            .insert(token.id.clone(), token.clone());

        info!(registration_token_id = %token.id, "Generated registration token");
        token
    }

    /// Register a registration token created elsewhere (e.g. from configuration).
    pub async fn add_registration_token(&self, token: RegistrationToken) {
        let mut state = self.state.write().await;
        state.registration_tokens.insert(token.id.clone(), token);
    }

    /// List registration tokens, oldest first.
    pub async fn list_registration_tokens(&self) -> Vec<RegistrationTokenSummary> {
        let state = self.state.read().await;

        let mut summaries: Vec<RegistrationTokenSummary> = state
            .registration_tokens
            .values()
            .map(|token| RegistrationTokenSummary {
                token: token.clone(),
                registered_runners: state
                    .runners
                    .values()
                    .filter(|r| r.registration_token_id == token.id)
                    .count(),
            })
            .collect();
        summaries.sort_by_key(|s| s.token.created_at);
        summaries
    }

    /// Delete a registration token.
    ///
    /// Runners already registered with it keep their credentials.
    pub async fn delete_registration_token(&self, id: &RegistrationTokenId) -> DispatchResult<()> {
        let mut state = self.state.write().await;

        state
            .registration_tokens
            .remove(id)
            .map(|_| info!(registration_token_id = %id, "Deleted registration token"))
            .ok_or_else(|| DispatchError::invalid_input(format!("Unknown registration token {}", id)))
    }

    /// Register a new runner.
    ///
    /// Every call creates a distinct runner identity, even with the same name.
    pub async fn register(&self, request: RegisterRunner) -> DispatchResult<RunnerCredential> {
        request.validate().map_err(DispatchError::InvalidInput)?;

        let mut state = self.state.write().await;

        let registration_token_id = state
            .registration_tokens
            .values()
            .find(|t| t.secret == request.secret)
            .map(|t| t.id.clone())
            .ok_or(DispatchError::InvalidSecret)?;

        let now = Utc::now();
        let runner = Runner {
            id: RunnerId::new(),
            token: RunnerToken::generate(),
            name: request.name,
            description: request.description,
            ip: request.ip,
            last_contact_at: now,
            registration_token_id,
            created_at: now,
        };

        let credential = RunnerCredential {
            runner_id: runner.id.clone(),
            runner_token: runner.token.clone(),
        };

        info!(runner_id = %runner.id, name = %runner.name, "Registered runner");

        state.by_token.insert(runner.token.clone(), runner.id.clone());
        state.runners.insert(runner.id.clone(), runner);

        Ok(credential)
    }

    /// Resolve a runner token and record the contact.
    pub async fn authenticate(&self, token: &RunnerToken) -> DispatchResult<Runner> {
        let mut state = self.state.write().await;

        let runner_id = state
            .by_token
            .get(token)
            .cloned()
            .ok_or(DispatchError::Unauthorized)?;
        let runner = state
            .runners
            .get_mut(&runner_id)
            .ok_or(DispatchError::Unauthorized)?;

        runner.last_contact_at = Utc::now();
        Ok(runner.clone())
    }

    /// Update `last_contact_at` for the runner behind `token`.
    pub async fn touch(&self, token: &RunnerToken) -> DispatchResult<()> {
        self.authenticate(token).await.map(|_| ())
    }

    /// A runner removes itself.
    pub async fn unregister(&self, token: &RunnerToken) -> DispatchResult<()> {
        let mut state = self.state.write().await;

        let runner_id = state
            .by_token
            .remove(token)
            .ok_or(DispatchError::Unauthorized)?;
        state.runners.remove(&runner_id);

        info!(runner_id = %runner_id, "Runner unregistered");
        Ok(())
    }

    /// Administrative removal of a runner.
    pub async fn delete_runner(&self, id: &RunnerId) -> DispatchResult<()> {
        let mut state = self.state.write().await;

        let runner = state
            .runners
            .remove(id)
            .ok_or_else(|| DispatchError::invalid_input(format!("Unknown runner {}", id)))?;
        state.by_token.remove(&runner.token);

        debug!(runner_id = %id, "Deleted runner");
        Ok(())
    }

    /// List runners, oldest first.
    pub async fn list_runners(&self) -> Vec<Runner> {
        let state = self.state.read().await;
        let mut runners: Vec<Runner> = state.runners.values().cloned().collect();
        runners.sort_by_key(|r| r.created_at);
        runners
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn registry_with_token() -> (RunnerRegistry, RegistrationToken) {
        let registry = RunnerRegistry::new();
        let token = registry.generate_registration_token().await;
        (registry, token)
    }

    #[tokio::test]
    async fn test_register_with_invalid_secret() {
        let (registry, _) = registry_with_token().await;

        let result = registry
            .register(RegisterRunner::new("wrong", "runner"))
            .await;
        assert!(matches!(result, Err(DispatchError::InvalidSecret)));
    }

    #[tokio::test]
    async fn test_register_twice_creates_distinct_runners() {
        let (registry, token) = registry_with_token().await;

        let first = registry
            .register(RegisterRunner::new(&token.secret, "runner"))
            .await
            .unwrap();
        let second = registry
            .register(RegisterRunner::new(&token.secret, "runner"))
            .await
            .unwrap();

        assert_ne!(first.runner_id, second.runner_id);
        assert_ne!(first.runner_token, second.runner_token);
        assert_eq!(registry.list_runners().await.len(), 2);
        assert_eq!(
            registry.list_registration_tokens().await[0].registered_runners,
            2
        );
    }

    #[tokio::test]
    async fn test_authenticate_updates_last_contact() {
        let (registry, token) = registry_with_token().await;
        let credential = registry
            .register(RegisterRunner::new(&token.secret, "runner"))
            .await
            .unwrap();

        let before = registry.list_runners().await[0].last_contact_at;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let runner = registry.authenticate(&credential.runner_token).await.unwrap();

        assert!(runner.last_contact_at > before);
        assert!(matches!(
            registry.touch(&RunnerToken::generate()).await,
            Err(DispatchError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn test_deleting_registration_token_keeps_runners() {
        let (registry, token) = registry_with_token().await;
        let credential = registry
            .register(RegisterRunner::new(&token.secret, "runner"))
            .await
            .unwrap();

        registry.delete_registration_token(&token.id).await.unwrap();

        assert!(registry.authenticate(&credential.runner_token).await.is_ok());
        assert!(matches!(
            registry
                .register(RegisterRunner::new(&token.secret, "late"))
                .await,
            Err(DispatchError::InvalidSecret)
        ));
    }

    #[tokio::test]
    async fn test_unregister_revokes_token() {
        let (registry, token) = registry_with_token().await;
        let credential = registry
            .register(RegisterRunner::new(&token.secret, "runner"))
            .await
            .unwrap();

        registry.unregister(&credential.runner_token).await.unwrap();

        assert!(matches!(
            registry.authenticate(&credential.runner_token).await,
            Err(DispatchError::Unauthorized)
        ));
        assert!(registry.list_runners().await.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_name_rejected() {
        let (registry, token) = registry_with_token().await;
        let result = registry.register(RegisterRunner::new(&token.secret, "")).await;
        assert!(matches!(result, Err(DispatchError::InvalidInput(_))));
    }
}
