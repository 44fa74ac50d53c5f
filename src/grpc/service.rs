//! Admission service implementation.

use parking_lot::RwLock;
use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::{debug, info, instrument, warn};

use super::proto::tollgate::admission::v1::{
    admission_service_server::AdmissionService, check_response::Code, CheckRequest, CheckResponse,
};
use crate::admission::{AdmissionController, AdmissionKey, Clock, Decision, Policy, PolicyTable};

/// Implementation of the `AdmissionService` gRPC interface.
pub struct AdmissionServiceImpl<C: Clock> {
    /// The shared controller
    controller: Arc<AdmissionController<C>>,
    /// Route policies, replaceable while serving
    policies: Arc<RwLock<PolicyTable>>,
}

impl<C: Clock> AdmissionServiceImpl<C> {
    /// Create a service over a controller and a policy table.
    pub fn new(controller: Arc<AdmissionController<C>>, policies: PolicyTable) -> Self {
        Self {
            controller,
            policies: Arc::new(RwLock::new(policies)),
        }
    }

    /// Replace the policy table. Existing buckets keep their windows.
    pub fn set_policies(&self, policies: PolicyTable) {
        info!(routes = policies.route_count(), "Replacing admission policies");
        *self.policies.write() = policies;
    }

    /// A copy of the current policy table.
    pub fn policies(&self) -> PolicyTable {
        self.policies.read().clone()
    }

    /// Route policy with any per-request overrides applied.
    fn effective_policy(&self, req: &CheckRequest) -> Policy {
        let mut policy = self.policies.read().resolve(&req.route);
        if req.limit != 0 {
            policy.limit = req.limit;
        }
        if req.window_ms != 0 {
            policy.window_ms = req.window_ms;
        }
        policy
    }
}

impl<C: Clock> Clone for AdmissionServiceImpl<C> {
    fn clone(&self) -> Self {
        Self {
            controller: Arc::clone(&self.controller),
            policies: Arc::clone(&self.policies),
        }
    }
}

#[tonic::async_trait]
impl<C: Clock + 'static> AdmissionService for AdmissionServiceImpl<C> {
    /// Record one request attempt and decide whether it is admitted.
    #[instrument(
        skip(self, request),
        fields(
            route = %request.get_ref().route,
            client = %request.get_ref().client
        )
    )]
    async fn check(
        &self,
        request: Request<CheckRequest>,
    ) -> Result<Response<CheckResponse>, Status> {
        let req = request.into_inner();

        let key = AdmissionKey::new(&req.route, &req.client).map_err(|e| {
            warn!("Received admission check without a client identifier");
            Status::from(e)
        })?;
        let policy = self.effective_policy(&req);

        debug!(
            key = %key,
            limit = policy.limit,
            window_ms = policy.window_ms,
            "Processing admission check"
        );

        let decision = self
            .controller
            .check(&key.to_string_key(), &policy)
            .map_err(Status::from)?;

        let response = match decision {
            Decision::Allowed { remaining } => CheckResponse {
                code: Code::Ok.into(),
                limit: policy.limit,
                remaining,
                retry_after: None,
                retry_after_seconds: 0,
            },
            Decision::Denied { .. } => {
                let retry_after = decision.retry_after();
                CheckResponse {
                    code: Code::OverLimit.into(),
                    limit: policy.limit,
                    remaining: 0,
                    retry_after: Some(prost_types::Duration {
                        seconds: retry_after.as_secs() as i64,
                        nanos: retry_after.subsec_nanos() as i32,
                    }),
                    retry_after_seconds: decision
                        .retry_after_secs()
                        .map(|secs| secs.min(u32::MAX as u64) as u32)
                        .unwrap_or(0),
                }
            }
        };

        info!(
            key = %key,
            code = ?response.code(),
            "Admission decision made"
        );

        Ok(Response::new(response))
    }
}
