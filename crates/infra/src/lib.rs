//! Infrastructure layer: ledger storage, the payment engine and background jobs.

pub mod engine;
pub mod jobs;
pub mod store;

pub use engine::{
    AllocationReversalOutcome, BatchSubmission, BatchView, CreateCreditNoteCommand,
    CreateInvoiceCommand, EngineConfig, ExecutionMode, PaymentEngine, PaymentReversalAccepted,
    RecordedPayment,
};
pub use store::{InMemoryLedgerStore, LedgerBackend, LedgerStore, LedgerTx};
