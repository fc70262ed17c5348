pub mod endpoint;
pub mod registry;
pub(crate) mod state;

pub use endpoint::{
    CaptureEndpoint, CaptureSession, DeliveredBuffer, Dequeue, EndpointBuilder, SessionState,
};
pub use registry::{Assignment, InstanceEntry, InstanceRegistry, REGISTRY};
