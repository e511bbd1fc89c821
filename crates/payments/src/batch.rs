//! Payment batch state machine.
//!
//! `pending -> processing -> completed | failed`. Entries succeed or fail on their
//! own; `failed` is reserved for pipeline-level failures (the worker gave up).

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use reconcile_core::{
    BatchId, CompanyId, Currency, DomainError, DomainResult, Entity, FieldErrors, Money, PaymentId,
    TenantScoped, UserId,
};

use crate::submission::{NormalizedEntry, SourceType, ValidatedSubmission};

/// `error_type` recorded on a batch the worker could not finish.
pub const SYSTEM_ERROR: &str = "system_error";

/// `BATCH-YYYYMMDD-NNN`, sequence per company per day starting at 1.
pub fn format_batch_number(date: NaiveDate, sequence: u32) -> String {
    format!("BATCH-{}-{sequence:03}", date.format("%Y%m%d"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Processing => "processing",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> DomainResult<Self> {
        match s {
            "pending" => Ok(BatchStatus::Pending),
            "processing" => Ok(BatchStatus::Processing),
            "completed" => Ok(BatchStatus::Completed),
            "failed" => Ok(BatchStatus::Failed),
            other => Err(DomainError::invariant(format!("unknown batch status '{other}'"))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Pending,
    Succeeded,
    Failed,
}

/// Error category kept on a failed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryErrorKind {
    Validation,
    Conflict,
    NotFound,
    InvariantViolation,
    Transient,
    Unauthorized,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryError {
    pub kind: EntryErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<FieldErrors>,
}

impl EntryError {
    pub fn is_retryable(&self) -> bool {
        self.kind == EntryErrorKind::Transient
    }
}

impl From<&DomainError> for EntryError {
    fn from(err: &DomainError) -> Self {
        let kind = match err {
            DomainError::Validation(_) => EntryErrorKind::Validation,
            DomainError::Conflict { .. } => EntryErrorKind::Conflict,
            DomainError::NotFound => EntryErrorKind::NotFound,
            DomainError::InvariantViolation(_) => EntryErrorKind::InvariantViolation,
            DomainError::Transient(_) => EntryErrorKind::Transient,
            DomainError::Unauthorized => EntryErrorKind::Unauthorized,
        };
        Self {
            kind,
            message: err.to_string(),
            fields: err.field_errors().cloned(),
        }
    }
}

/// Per-entry outcome log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchEntry {
    pub index: usize,
    pub input: NormalizedEntry,
    pub status: EntryStatus,
    pub payment_id: Option<PaymentId>,
    pub allocated_amount: Money,
    pub error: Option<EntryError>,
    pub attempts: u32,
}

/// Command: accept a validated submission as a new batch.
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptBatch {
    pub company_id: CompanyId,
    pub batch_number: String,
    pub submission: ValidatedSubmission,
    /// Entries whose `entity_id` is unknown to this company.
    pub foreign_entries: Vec<usize>,
    pub idempotency_key: Option<String>,
    pub created_by: UserId,
    pub estimated_completion: DateTime<Utc>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentBatch {
    pub id: BatchId,
    pub company_id: CompanyId,
    pub batch_number: String,
    pub source_type: SourceType,
    pub status: BatchStatus,
    pub receipt_count: usize,
    pub total_amount: Money,
    pub currency: Currency,
    pub processed_count: usize,
    pub failed_count: usize,
    pub metadata: serde_json::Value,
    pub idempotency_key: Option<String>,
    pub entries: Vec<BatchEntry>,
    pub estimated_completion: DateTime<Utc>,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
}

impl PaymentBatch {
    /// Create a `pending` batch. Foreign-tenant entries are failed up front; if
    /// every entry is foreign the submission is rejected as a whole.
    pub fn accept(cmd: AcceptBatch) -> DomainResult<Self> {
        let receipt_count = cmd.submission.entries.len();
        if receipt_count > 0 && cmd.foreign_entries.len() >= receipt_count {
            let mut errors = FieldErrors::new();
            for index in &cmd.foreign_entries {
                errors.add(
                    format!("entries.{index}.entity_id"),
                    "does not belong to this company",
                );
            }
            return Err(DomainError::Validation(errors));
        }

        let entries: Vec<BatchEntry> = cmd
            .submission
            .entries
            .into_iter()
            .enumerate()
            .map(|(index, input)| {
                let foreign = cmd.foreign_entries.contains(&index);
                BatchEntry {
                    index,
                    input,
                    status: if foreign {
                        EntryStatus::Failed
                    } else {
                        EntryStatus::Pending
                    },
                    payment_id: None,
                    allocated_amount: Money::ZERO,
                    error: foreign.then(|| EntryError {
                        kind: EntryErrorKind::Validation,
                        message: "entity does not belong to this company".to_string(),
                        fields: Some(FieldErrors::single(
                            format!("entries.{index}.entity_id"),
                            "does not belong to this company",
                        )),
                    }),
                    attempts: 0,
                }
            })
            .collect();
        let failed_count = entries
            .iter()
            .filter(|e| e.status == EntryStatus::Failed)
            .count();

        Ok(Self {
            id: BatchId::new(),
            company_id: cmd.company_id,
            batch_number: cmd.batch_number,
            source_type: cmd.submission.source_type,
            status: BatchStatus::Pending,
            receipt_count,
            total_amount: cmd.submission.total_amount,
            currency: cmd.submission.currency,
            processed_count: 0,
            failed_count,
            metadata: cmd.submission.metadata,
            idempotency_key: cmd.idempotency_key,
            entries,
            estimated_completion: cmd.estimated_completion,
            created_by: cmd.created_by,
            created_at: cmd.occurred_at,
            started_at: None,
            completed_at: None,
            error_type: None,
            error_message: None,
        })
    }

    /// `pending -> processing`. Re-entering `processing` (worker retry) is allowed.
    pub fn start(&mut self, at: DateTime<Utc>) -> DomainResult<()> {
        match self.status {
            BatchStatus::Pending => {
                self.status = BatchStatus::Processing;
                self.started_at = Some(at);
                Ok(())
            }
            BatchStatus::Processing => Ok(()),
            other => Err(DomainError::conflict_with(
                format!("batch is already {}", other.as_str()),
                self.id,
            )),
        }
    }

    pub fn pending_entries(&self) -> Vec<usize> {
        self.entries
            .iter()
            .filter(|e| e.status == EntryStatus::Pending)
            .map(|e| e.index)
            .collect()
    }

    fn pending_entry_mut(&mut self, index: usize) -> DomainResult<&mut BatchEntry> {
        let entry = self
            .entries
            .get_mut(index)
            .ok_or_else(|| DomainError::validation("index", "no such entry in this batch"))?;
        if entry.status != EntryStatus::Pending {
            return Err(DomainError::invariant(format!(
                "entry {index} was already attempted"
            )));
        }
        Ok(entry)
    }

    pub fn record_success(
        &mut self,
        index: usize,
        payment_id: PaymentId,
        allocated_amount: Money,
    ) -> DomainResult<()> {
        let entry = self.pending_entry_mut(index)?;
        entry.status = EntryStatus::Succeeded;
        entry.payment_id = Some(payment_id);
        entry.allocated_amount = allocated_amount;
        entry.error = None;
        entry.attempts += 1;
        self.processed_count += 1;
        Ok(())
    }

    pub fn record_failure(&mut self, index: usize, error: EntryError) -> DomainResult<()> {
        let entry = self.pending_entry_mut(index)?;
        entry.status = EntryStatus::Failed;
        entry.error = Some(error);
        entry.attempts += 1;
        self.failed_count += 1;
        Ok(())
    }

    /// Complete once every entry has been attempted. Returns whether it did.
    pub fn finish(&mut self, at: DateTime<Utc>) -> bool {
        if self.status != BatchStatus::Processing || !self.pending_entries().is_empty() {
            return false;
        }
        self.status = BatchStatus::Completed;
        self.completed_at = Some(at);
        true
    }

    /// Pipeline-level failure. Entries already attempted keep their outcome.
    pub fn fail_system(&mut self, message: impl Into<String>, at: DateTime<Utc>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = BatchStatus::Failed;
        self.error_type = Some(SYSTEM_ERROR.to_string());
        self.error_message = Some(message.into());
        self.completed_at = Some(at);
    }

    /// Put one transiently failed entry of a completed batch back in the queue.
    pub fn reopen_entry(
        &mut self,
        index: usize,
        estimated_completion: DateTime<Utc>,
    ) -> DomainResult<()> {
        if self.status != BatchStatus::Completed {
            return Err(DomainError::conflict_with(
                format!(
                    "only completed batches can retry entries (batch is {})",
                    self.status.as_str()
                ),
                self.id,
            ));
        }
        let entry = self
            .entries
            .get_mut(index)
            .ok_or_else(|| DomainError::validation("index", "no such entry in this batch"))?;
        let retryable = entry.status == EntryStatus::Failed
            && entry.error.as_ref().is_some_and(EntryError::is_retryable);
        if !retryable {
            return Err(DomainError::conflict(format!(
                "entry {index} did not fail transiently and cannot be retried"
            )));
        }
        entry.status = EntryStatus::Pending;
        entry.error = None;
        self.failed_count -= 1;
        self.status = BatchStatus::Processing;
        self.completed_at = None;
        self.bump_estimate(estimated_completion);
        Ok(())
    }

    /// Forecasts only move forward.
    pub fn bump_estimate(&mut self, candidate: DateTime<Utc>) {
        if candidate > self.estimated_completion {
            self.estimated_completion = candidate;
        }
    }

    /// `(processed + failed) / receipt_count`, as a percentage with two decimals.
    pub fn progress_percentage(&self) -> Decimal {
        if self.receipt_count == 0 {
            return Decimal::ZERO;
        }
        let attempted = Decimal::from(self.processed_count + self.failed_count);
        (attempted * Decimal::ONE_HUNDRED / Decimal::from(self.receipt_count)).round_dp(2)
    }

    pub fn payment_ids(&self) -> Vec<PaymentId> {
        self.entries.iter().filter_map(|e| e.payment_id).collect()
    }
}

impl Entity for PaymentBatch {
    type Id = BatchId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

impl TenantScoped for PaymentBatch {
    fn company_id(&self) -> CompanyId {
        self.company_id
    }
}
