//! # Health Checking
//!
//! An implementation of the `grpc.health.v1.Health` service. Statuses are kept per
//! service name; the empty name stands for the whole server.
use super::{HandlerSpec, ResponseStream, ServerContext};
use crate::{ConnectError, ProtoCodec};
use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};
use tokio::sync::broadcast;
use tracing::debug;

pub const HEALTH_CHECK_PROCEDURE: &str = "grpc.health.v1.Health/Check";
pub const HEALTH_WATCH_PROCEDURE: &str = "grpc.health.v1.Health/Watch";

#[derive(Clone, PartialEq, prost::Message)]
pub struct HealthCheckRequest {
    #[prost(string, tag = "1")]
    pub service: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct HealthCheckResponse {
    #[prost(enumeration = "ServingStatus", tag = "1")]
    pub status: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ServingStatus {
    Unknown = 0,
    Serving = 1,
    NotServing = 2,
    /// Only reported by `Watch` and `Check` for services never registered.
    ServiceUnknown = 3,
}

/// Shared, updatable health statuses.
#[derive(Debug, Clone)]
pub struct HealthService {
    statuses: Arc<RwLock<HashMap<String, ServingStatus>>>,
    updates: broadcast::Sender<(String, ServingStatus)>,
}

impl Default for HealthService {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthService {
    /// A health service reporting the server itself as serving.
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(64);
        let statuses = HashMap::from([(String::new(), ServingStatus::Serving)]);
        Self {
            statuses: Arc::new(RwLock::new(statuses)),
            updates,
        }
    }

    pub fn set_status(&self, service: impl Into<String>, status: ServingStatus) {
        let service = service.into();
        debug!(%service, ?status, "health status changed");
        self.statuses
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(service.clone(), status);
        let _ = self.updates.send((service, status));
    }

    /// Forgets a service. Watchers are told it is unknown.
    pub fn clear_status(&self, service: &str) {
        let removed = self
            .statuses
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(service);
        if removed.is_some() {
            let _ = self
                .updates
                .send((service.to_string(), ServingStatus::ServiceUnknown));
        }
    }

    pub fn clear_all(&self) {
        let cleared: Vec<String> = self
            .statuses
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(service, _)| service)
            .collect();
        for service in cleared {
            let _ = self.updates.send((service, ServingStatus::ServiceUnknown));
        }
    }

    /// The status of `service`, `ServiceUnknown` when it was never set.
    pub fn check(&self, service: &str) -> ServingStatus {
        self.statuses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service)
            .copied()
            .unwrap_or(ServingStatus::ServiceUnknown)
    }

    pub fn statuses(&self) -> HashMap<String, ServingStatus> {
        self.statuses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Handlers for `Check` and `Watch`, to register on a
    /// [`ConnectServer`](crate::ConnectServer).
    pub fn handlers(&self) -> Vec<HandlerSpec> {
        let check = self.clone();
        let watch = self.clone();
        vec![
            HandlerSpec::unary(
                HEALTH_CHECK_PROCEDURE,
                ProtoCodec::<HealthCheckResponse, HealthCheckRequest>::new(),
                move |_ctx: ServerContext, request: HealthCheckRequest| {
                    let status = check.check(&request.service);
                    async move { Ok(response(status)) }
                },
            )
            .with_idempotency(crate::Idempotency::NoSideEffects),
            HandlerSpec::server_streaming(
                HEALTH_WATCH_PROCEDURE,
                ProtoCodec::<HealthCheckResponse, HealthCheckRequest>::new(),
                move |_ctx: ServerContext, request: HealthCheckRequest, responses| {
                    watch.clone().watch(request.service, responses)
                },
            ),
        ]
    }

    async fn watch(
        self,
        service: String,
        responses: ResponseStream<HealthCheckResponse>,
    ) -> Result<(), ConnectError> {
        let mut updates = self.updates.subscribe();
        let mut last = self.check(&service);
        responses.send(&response(last)).await?;

        loop {
            match updates.recv().await {
                Ok((updated, status)) if updated == service && status != last => {
                    last = status;
                    responses.send(&response(status)).await?;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    let status = self.check(&service);
                    if status != last {
                        last = status;
                        responses.send(&response(status)).await?;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            }
        }
    }
}

fn response(status: ServingStatus) -> HealthCheckResponse {
    HealthCheckResponse {
        status: status as i32,
    }
}
