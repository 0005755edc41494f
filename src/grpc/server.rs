//! gRPC server implementation.

use std::net::SocketAddr;
use std::sync::Arc;
use tonic::transport::Server;
use tracing::{error, info};

use super::proto::floodgate::admission::v1::admission_service_server::AdmissionServiceServer;
use super::service::AdmissionServiceImpl;
use crate::admission::AdmissionControl;
use crate::error::{FloodgateError, Result};

/// gRPC server for the admission service.
pub struct GrpcServer<A: AdmissionControl + 'static> {
    /// Address to bind to
    addr: SocketAddr,
    /// The admission layer behind the service
    admission: Arc<A>,
}

impl<A: AdmissionControl + 'static> GrpcServer<A> {
    pub fn new(addr: SocketAddr, admission: Arc<A>) -> Self {
        Self { addr, admission }
    }

    /// Start the gRPC server.
    ///
    /// This method will block until the server is shut down.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Start the gRPC server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        let service = AdmissionServiceImpl::new(self.admission);

        info!(addr = %self.addr, "Starting gRPC server for AdmissionService");

        Server::builder()
            .add_service(AdmissionServiceServer::new(service))
            .serve_with_shutdown(self.addr, signal)
            .await
            .map_err(|e| {
                error!(error = %e, "gRPC server failed");
                FloodgateError::Grpc(e)
            })
    }
}
