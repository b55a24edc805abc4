//! Execution bridge plumbing: agent registry, per-invocation context,
//! transport selection, and the invoker.

mod agent;
mod context;
mod invoker;
mod transport;

pub use agent::{AgentConfig, AgentHandler, AgentRegistry};
pub use context::{ContextBuilder, ExecutionContext, ExecutionPaths, ResourceLimits, TempDirGuard};
pub use invoker::{AgentInvoker, InvocationFailure, InvocationResult, InvokeErrorKind};
pub use transport::{select_transport, TransportKind};
