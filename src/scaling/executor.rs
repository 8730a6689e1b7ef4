//! Fleet resize commands.
//!
//! The autoscaler hands a [`ResizeCommand`] to a [`FleetExecutor`] when it
//! runs in acting mode. [`SwarmExecutor`] applies it to a Docker swarm
//! service through the Docker API.

use async_trait::async_trait;
use bollard::errors::Error as BollardError;
use bollard::models::{ServiceSpecMode, ServiceSpecModeReplicated};
use bollard::service::{InspectServiceOptions, UpdateServiceOptions};
use bollard::Docker;
use serde::Serialize;
use thiserror::Error;

/// Default role name of the worker service.
pub const DEFAULT_WORKER_ROLE: &str = "worker";

/// Errors raised while resizing the fleet.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The container runtime could not be reached.
    #[error("Docker daemon unavailable: {0}")]
    DaemonUnavailable(String),

    /// No service exists for the role.
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    /// The runtime rejected the update.
    #[error("Fleet update failed: {0}")]
    UpdateFailed(String),
}

/// Request to run `replicas` copies of `role`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResizeCommand {
    /// Worker role (service) to resize.
    pub role: String,
    /// Desired replica count.
    pub replicas: usize,
}

impl ResizeCommand {
    /// Creates a resize command.
    pub fn new(role: impl Into<String>, replicas: usize) -> Self {
        Self {
            role: role.into(),
            replicas,
        }
    }
}

/// Something that can change the size of the worker fleet.
#[async_trait]
pub trait FleetExecutor: Send + Sync {
    /// Applies the command. Returns once the runtime accepted it.
    async fn resize(&self, command: ResizeCommand) -> Result<(), ExecutorError>;
}

/// Resizes a replicated Docker swarm service.
///
/// The service name is the role, optionally prefixed with a stack name
/// (`{stack}_{role}`), matching how `docker stack deploy` names services.
pub struct SwarmExecutor {
    docker: Docker,
    stack: Option<String>,
}

impl SwarmExecutor {
    /// Connects to the local Docker daemon.
    ///
    /// # Errors
    ///
    /// Returns `ExecutorError::DaemonUnavailable` if the daemon is not accessible.
    pub fn new() -> Result<Self, ExecutorError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| ExecutorError::DaemonUnavailable(format!("Failed to connect: {e}")))?;

        Ok(Self {
            docker,
            stack: None,
        })
    }

    /// Creates an executor from an existing bollard Docker instance.
    pub fn from_docker(docker: Docker) -> Self {
        Self {
            docker,
            stack: None,
        }
    }

    /// Sets the stack name used to prefix service names.
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Docker service name for a role.
    pub fn service_name(&self, role: &str) -> String {
        match &self.stack {
            Some(stack) => format!("{stack}_{role}"),
            None => role.to_string(),
        }
    }
}

#[async_trait]
impl FleetExecutor for SwarmExecutor {
    async fn resize(&self, command: ResizeCommand) -> Result<(), ExecutorError> {
        let name = self.service_name(&command.role);

        let service = self
            .docker
            .inspect_service(
                &name,
                Some(InspectServiceOptions {
                    insert_defaults: true,
                }),
            )
            .await
            .map_err(|e| classify(&name, e))?;

        let version = service
            .version
            .and_then(|v| v.index)
            .ok_or_else(|| ExecutorError::UpdateFailed(format!("{name} has no version index")))?;
        let mut spec = service
            .spec
            .ok_or_else(|| ExecutorError::UpdateFailed(format!("{name} has no spec")))?;

        let replicas = i64::try_from(command.replicas).map_err(|_| {
            ExecutorError::UpdateFailed(format!("replica count {} out of range", command.replicas))
        })?;

        let mode = spec.mode.get_or_insert_with(ServiceSpecMode::default);
        if mode.global.is_some() {
            return Err(ExecutorError::UpdateFailed(format!(
                "{name} runs in global mode and cannot be resized"
            )));
        }
        mode.replicated
            .get_or_insert_with(ServiceSpecModeReplicated::default)
            .replicas = Some(replicas);

        let options = UpdateServiceOptions {
            version,
            ..Default::default()
        };

        let response = self
            .docker
            .update_service(&name, spec, options, None)
            .await
            .map_err(|e| classify(&name, e))?;

        for warning in response.warnings.unwrap_or_default() {
            tracing::warn!(service = %name, warning = %warning, "Service update warning");
        }

        tracing::info!(service = %name, replicas = command.replicas, "Service resized");

        Ok(())
    }
}

fn classify(service: &str, err: BollardError) -> ExecutorError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404, ..
        } => ExecutorError::ServiceNotFound(service.to_string()),
        BollardError::DockerResponseServerError { message, .. } => {
            ExecutorError::UpdateFailed(format!("{service}: {message}"))
        }
        other => ExecutorError::DaemonUnavailable(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_service_name_with_stack() {
        let Ok(docker) = Docker::connect_with_local_defaults() else {
            return;
        };
        let executor = SwarmExecutor::from_docker(docker);
        assert_eq!(executor.service_name("worker"), "worker");

        let executor = executor.with_stack("fleet");
        assert_eq!(executor.service_name("worker"), "fleet_worker");
    }

    #[test]
    fn test_classify_not_found() {
        let err = BollardError::DockerResponseServerError {
            status_code: 404,
            message: "service worker not found".to_string(),
        };
        assert!(matches!(
            classify("worker", err),
            ExecutorError::ServiceNotFound(name) if name == "worker"
        ));

        let err = BollardError::DockerResponseServerError {
            status_code: 500,
            message: "boom".to_string(),
        };
        assert!(matches!(classify("worker", err), ExecutorError::UpdateFailed(_)));
    }
}
