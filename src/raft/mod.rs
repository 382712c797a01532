pub mod node;
pub mod operations;
pub mod rpc;
pub mod state_machine;
pub mod transport;

pub use node::{RaftNode, Role, Status};
pub use operations::{Operation, OperationResponse, OperationResult, OperationType, ResponseFuture};
pub use state_machine::StateMachine;
pub use transport::{Transport, TransportError};
