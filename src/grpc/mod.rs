//! gRPC front end for the admission controller.

mod server;
mod service;

pub use server::GrpcServer;
pub use service::AdmissionServiceImpl;

// Include the generated protobuf code
pub mod proto {
    pub mod tollgate {
        pub mod admission {
            pub mod v1 {
                tonic::include_proto!("tollgate.admission.v1");
            }
        }
    }
}

// Re-export commonly used types
pub use proto::tollgate::admission::v1::{
    admission_service_server::AdmissionServiceServer, CheckRequest, CheckResponse,
};
