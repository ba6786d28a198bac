//! Flare Agent Kit - transaction execution and protocol connectors for Flare
//!
//! Write operations of every connector run through one [`tx::ExecutionEngine`]
//! per signing account: gas estimation, nonce reservation, signing, submission
//! with bounded retry and receipt polling. Reads go straight to the
//! [`chain::NetworkEndpoint`].

pub mod chain;
pub mod config;
pub mod error;
pub mod math;
pub mod metrics;
pub mod operation;
pub mod protocols;
pub mod telemetry;
pub mod tx;

#[cfg(test)]
pub mod testing;

pub use chain::{ChainProvider, NetworkEndpoint};
pub use config::Settings;
pub use error::{AgentError, AgentResult, ErrorKind, RevertCategory, RevertReason};
pub use operation::{Bound, Operation, OperationKind, Protocol};
pub use protocols::{Connector, ConnectorContext, ProtocolConnector};
pub use tx::{Execution, ExecutionEngine, ExecutionStatus};
