use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Liveness of the long-running loops of a process.
///
/// Each loop registers a component with a deadline and must report healthy
/// more often than that. The process is healthy when every component is:
/// a component that reported unhealthy, or went quiet past its deadline,
/// fails the whole check.
#[derive(Clone, Default)]
pub struct HealthRegistry {
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentStatus {
    /// Registered, has not reported yet
    Starting,
    /// Must report again before this instant
    HealthyUntil(Instant),
    Unhealthy,
}

impl ComponentStatus {
    pub fn is_healthy(&self) -> bool {
        match self {
            ComponentStatus::HealthyUntil(until) => *until > Instant::now(),
            _ => false,
        }
    }
}

#[derive(Debug)]
pub struct HealthStatus {
    pub healthy: bool,
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{self:?}");
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
}

impl HealthHandle {
    pub fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(Instant::now() + self.deadline));
    }

    pub fn report_status(&self, status: ComponentStatus) {
        let mut components = match self.components.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        components.insert(self.component.clone(), status);
    }
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, component: &str, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component: component.to_owned(),
            deadline,
            components: self.components.clone(),
        };
        handle.report_status(ComponentStatus::Starting);
        handle
    }

    pub fn get_status(&self) -> HealthStatus {
        let components = match self.components.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };

        HealthStatus {
            healthy: !components.is_empty() && components.values().all(|s| s.is_healthy()),
            components,
        }
    }
}
