//! Keel core types: resource identifiers, the rendered output model,
//! operation records and the shared error taxonomy.

#![forbid(unsafe_code)]

pub mod error;
pub mod graph;
pub mod id;
pub mod model;

pub use error::{Error, Result};
pub use graph::Dag;
pub use id::ResourceId;
pub use model::{
    local_id, Binding, ComputedValue, LogicalResource, Operation, OperationError, OperationKind, OperationStatus,
    OutputIdentity, OutputKind, OutputResource, ProvisioningState, ResourceGroup, ResourceStatus, SecretValue,
};

pub mod prelude {
    pub use super::{Binding, ComputedValue, Error, LogicalResource, OutputResource, ResourceId, Result};
}
