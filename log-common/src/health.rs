//! Liveness reporting for the long running loops of a service.
//!
//! Each loop registers a component with a deadline and must report healthy more often than that
//! deadline. The process is healthy only while every registered component is.
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tokio::time::Instant;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentStatus {
    /// Registered but not reported yet
    Starting,
    /// Reported healthy, must report again before the instant
    HealthyUntil(Instant),
    /// Reported unhealthy
    Unhealthy,
    /// Missed its deadline
    Stalled,
}

#[derive(Debug, Default)]
pub struct HealthStatus {
    pub healthy: bool,
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{:?}", self.components);
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

type Components = Arc<RwLock<HashMap<String, ComponentStatus>>>;

pub struct HealthHandle {
    component: String,
    deadline: time::Duration,
    components: Components,
}

impl HealthHandle {
    /// Report healthy until `deadline` from now.
    pub fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(Instant::now() + self.deadline));
    }

    pub fn report_status(&self, status: ComponentStatus) {
        let mut components = self
            .components
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        components.insert(self.component.clone(), status);
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Components,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            components: Components::default(),
        }
    }

    /// Register a component. Pass the returned handle to the loop it watches.
    pub fn register(&self, component: &str, deadline: time::Duration) -> HealthHandle {
        let handle = HealthHandle {
            component: component.to_owned(),
            deadline,
            components: self.components.clone(),
        };
        handle.report_status(ComponentStatus::Starting);
        handle
    }

    /// Compute the process status from every registered component. Can be used as an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let components = self
            .components
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();

        // Unhealthy until at least one component registered.
        let mut status = HealthStatus {
            healthy: !components.is_empty(),
            components: HashMap::new(),
        };

        for (name, component_status) in components.iter() {
            let component_status = match component_status {
                ComponentStatus::HealthyUntil(until) if *until > now => component_status.clone(),
                ComponentStatus::HealthyUntil(_) => ComponentStatus::Stalled,
                other => other.clone(),
            };
            if !matches!(component_status, ComponentStatus::HealthyUntil(_)) {
                status.healthy = false;
            }
            status.components.insert(name.clone(), component_status);
        }

        if !status.healthy {
            warn!("{} health check failed: {:?}", self.name, status.components);
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_registry_is_unhealthy() {
        let registry = HealthRegistry::new("liveness");

        assert!(!registry.get_status().healthy);
    }

    #[tokio::test]
    async fn test_starting_component_is_unhealthy_until_it_reports() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("worker", time::Duration::from_secs(30));

        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(status.components["worker"], ComponentStatus::Starting);

        handle.report_healthy();
        assert!(registry.get_status().healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_component_stalls_after_deadline() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("worker", time::Duration::from_secs(30));
        handle.report_healthy();

        tokio::time::advance(time::Duration::from_secs(31)).await;

        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(status.components["worker"], ComponentStatus::Stalled);
    }

    #[tokio::test]
    async fn test_one_unhealthy_component_fails_the_check() {
        let registry = HealthRegistry::new("liveness");
        let first = registry.register("first", time::Duration::from_secs(30));
        let second = registry.register("second", time::Duration::from_secs(30));

        first.report_healthy();
        second.report_status(ComponentStatus::Unhealthy);

        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(status.components["second"], ComponentStatus::Unhealthy);
    }
}
