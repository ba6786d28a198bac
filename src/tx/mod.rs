//! Transaction execution module: nonce management, gas policy, signing,
//! submission with retry, receipt polling and failure classification

pub mod classify;
pub mod engine;
pub mod gas;
pub mod nonce;
pub mod receipt;
pub mod sender;
pub mod signer;

pub use classify::classify;
pub use engine::{Execution, ExecutionEngine, ExecutionStatus, Submitted};
pub use gas::{GasEstimator, GasPlan, GasSource};
pub use nonce::{AccountState, NonceAllocator, Released};
pub use receipt::{ReceiptWatcher, TxState, WatchOutcome};
pub use sender::{Delivery, RetryPolicy, Submitter};
pub use signer::{
    load_wallet, sign_transaction, SignedTransaction, TransactionSigner, UnsignedTransaction,
};
