//! `reconcile-payments`: payments, allocations, reversals and batches.
//!
//! Pure domain logic only: every rule that decides whether money may move lives
//! here and works on values handed in by the caller. Locking, persistence and
//! workers are in `reconcile-infra`.

pub mod allocation;
pub mod batch;
pub mod commands;
pub mod payment;
pub mod reversal;
pub mod strategy;
pub mod submission;

pub use allocation::{AllocationMethod, AllocationStatus, PaymentAllocation, allocate};
pub use batch::{
    AcceptBatch, BatchEntry, BatchStatus, EntryError, EntryErrorKind, EntryStatus, PaymentBatch,
    SYSTEM_ERROR, format_batch_number,
};
pub use commands::{
    AllocateCommand, ApplyCreditNoteCommand, AutoAllocateCommand, PaymentSummary,
    RecordPaymentCommand, ReverseCreditApplicationCommand,
};
pub use payment::{
    Payment, PaymentMethod, PaymentPosition, PaymentStatus, RecordPayment, format_payment_number,
};
pub use reversal::{
    AllocationReversal, PaymentReversal, ReversalMethod, ReversalStatus, ReverseAllocationCommand,
    ReversePaymentCommand,
};
pub use strategy::{AllocationStrategy, OpenInvoice, PlannedAllocation, plan};
pub use submission::{
    BankFeedMetadata, BatchSource, CsvFile, NormalizedEntry, RawAmount, RawBatchEntry, SourceType,
    ValidatedSubmission,
};
