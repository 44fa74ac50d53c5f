//! gRPC server implementation.

use std::net::SocketAddr;
use std::sync::Arc;
use tonic::transport::Server;
use tracing::{error, info};

use super::proto::tollgate::admission::v1::admission_service_server::AdmissionServiceServer;
use super::service::AdmissionServiceImpl;
use crate::admission::{AdmissionController, Clock, PolicyTable};
use crate::error::{Result, TollgateError};

/// gRPC server for the admission service.
pub struct GrpcServer<C: Clock + 'static> {
    /// Address to bind to
    addr: SocketAddr,
    /// The service handling requests
    service: AdmissionServiceImpl<C>,
}

impl<C: Clock + 'static> GrpcServer<C> {
    /// Create a new gRPC server around a shared controller.
    pub fn new(
        addr: SocketAddr,
        controller: Arc<AdmissionController<C>>,
        policies: PolicyTable,
    ) -> Self {
        Self {
            addr,
            service: AdmissionServiceImpl::new(controller, policies),
        }
    }

    /// The service, for replacing policies while serving.
    pub fn service(&self) -> &AdmissionServiceImpl<C> {
        &self.service
    }

    /// Start the gRPC server.
    ///
    /// This method will block until the server is shut down.
    pub async fn serve(self) -> Result<()> {
        info!(addr = %self.addr, "Starting gRPC server for AdmissionService");

        Server::builder()
            .add_service(AdmissionServiceServer::new(self.service))
            .serve(self.addr)
            .await
            .map_err(|e| {
                error!(error = %e, "gRPC server failed");
                TollgateError::Grpc(e)
            })
    }

    /// Start the gRPC server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        info!(
            addr = %self.addr,
            "Starting gRPC server for AdmissionService with graceful shutdown"
        );

        Server::builder()
            .add_service(AdmissionServiceServer::new(self.service))
            .serve_with_shutdown(self.addr, signal)
            .await
            .map_err(|e| {
                error!(error = %e, "gRPC server failed");
                TollgateError::Grpc(e)
            })
    }
}
