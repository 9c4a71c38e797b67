// ============================================================================
// Transaction Management Module
// ============================================================================
//
// Transactions are opened on a single physical session and carried to
// nested calls through the request-scoped `Context`:
//
// - TxHandle:  one open transaction or savepoint (single terminal transition)
// - TxOptions: timeouts and modes applied at open time
// - Context:   active transaction + deadline + cancellation
// - TxManager: explicit begin with a guard, for non-closure call sites
//
// ============================================================================

pub mod context;
pub mod handle;
pub mod manager;
pub mod options;
pub mod state;

pub use context::{CancelHandle, Context};
pub use handle::TxHandle;
pub use manager::{TxGuard, TxManager};
pub use options::{AccessMode, IsolationLevel, TxOptions};
pub use state::{TransactionId, TransactionState};
