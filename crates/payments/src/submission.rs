//! Batch submission schema.
//!
//! A submission is a tagged union over its source. Shapes are validated once here
//! and turned into typed [`NormalizedEntry`] values; nothing past this module sees
//! raw strings. Errors are keyed `entries.N.field`.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError, ValidationErrors};

use reconcile_core::{Currency, CustomerId, DomainError, DomainResult, FieldErrors, Money, MONEY_SCALE};

use crate::payment::PaymentMethod;
use crate::strategy::AllocationStrategy;

pub const DATE_FORMAT: &str = "%Y-%m-%d";

fn validate_uuid(value: &str) -> Result<(), ValidationError> {
    if value.parse::<CustomerId>().is_err() {
        let mut err = ValidationError::new("uuid");
        err.message = Some("must be a valid identifier".into());
        return Err(err);
    }
    Ok(())
}

fn validate_payment_method(value: &str) -> Result<(), ValidationError> {
    if value.parse::<PaymentMethod>().is_err() {
        let mut err = ValidationError::new("payment_method");
        err.message = Some(format!("'{value}' is not a recognised payment method").into());
        return Err(err);
    }
    Ok(())
}

fn validate_amount(value: &RawAmount) -> Result<(), ValidationError> {
    let Some(value) = value.decimal() else {
        let mut err = ValidationError::new("number");
        err.message = Some("must be a number".into());
        return Err(err);
    };
    if value <= Decimal::ZERO {
        let mut err = ValidationError::new("range");
        err.message = Some("must be greater than zero".into());
        return Err(err);
    }
    if value.normalize().scale() > MONEY_SCALE {
        let mut err = ValidationError::new("scale");
        err.message = Some(format!("must have at most {MONEY_SCALE} decimal places").into());
        return Err(err);
    }
    Ok(())
}

fn validate_currency(value: &str) -> Result<(), ValidationError> {
    if Currency::new(value).is_err() {
        let mut err = ValidationError::new("currency");
        err.message = Some("must be a three-letter currency code".into());
        return Err(err);
    }
    Ok(())
}

fn validate_date(value: &str) -> Result<(), ValidationError> {
    if NaiveDate::parse_from_str(value, DATE_FORMAT).is_err() {
        let mut err = ValidationError::new("date");
        err.message = Some("must be a date in YYYY-MM-DD format".into());
        return Err(err);
    }
    Ok(())
}

/// An amount as submitted. Text that is not a number is kept so it can be
/// reported against its entry instead of failing the whole body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawAmount {
    Number(Decimal),
    Text(String),
}

impl RawAmount {
    pub fn decimal(&self) -> Option<Decimal> {
        match self {
            RawAmount::Number(value) => Some(*value),
            RawAmount::Text(_) => None,
        }
    }
}

impl From<Decimal> for RawAmount {
    fn from(value: Decimal) -> Self {
        RawAmount::Number(value)
    }
}

/// One payment line as submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct RawBatchEntry {
    #[validate(custom(function = "validate_uuid"))]
    pub entity_id: String,

    #[validate(custom(function = "validate_payment_method"))]
    pub payment_method: String,

    #[validate(custom(function = "validate_amount"))]
    pub amount: RawAmount,

    #[validate(custom(function = "validate_currency"))]
    pub currency_id: String,

    #[validate(custom(function = "validate_date"))]
    pub payment_date: String,

    #[validate(length(max = 100, message = "must be at most 100 characters"))]
    pub reference_number: Option<String>,

    #[serde(default)]
    pub auto_allocate: bool,

    pub allocation_strategy: Option<String>,

    #[validate(length(max = 1000, message = "must be at most 1000 characters"))]
    pub notes: Option<String>,
}

/// A batch entry after shape validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedEntry {
    pub entity_id: CustomerId,
    pub payment_method: PaymentMethod,
    pub amount: Money,
    pub currency: Currency,
    pub payment_date: NaiveDate,
    pub reference_number: Option<String>,
    /// `Some` when the entry asked for auto-allocation.
    pub allocation_strategy: Option<AllocationStrategy>,
    pub notes: Option<String>,
}

fn collect(errors: &ValidationErrors) -> FieldErrors {
    let mut out = FieldErrors::new();
    for (field, list) in errors.field_errors() {
        for err in list.iter() {
            let message = err
                .message
                .as_ref()
                .map(|m| m.to_string())
                .unwrap_or_else(|| format!("is invalid ({})", err.code));
            out.add(field.to_string(), message);
        }
    }
    out
}

impl RawBatchEntry {
    /// Validate shape and produce the typed entry, or this entry's field errors.
    pub fn normalize(&self) -> Result<NormalizedEntry, FieldErrors> {
        let mut errors = match self.validate() {
            Ok(()) => FieldErrors::new(),
            Err(e) => collect(&e),
        };

        let strategy = match &self.allocation_strategy {
            Some(name) => match name.parse::<AllocationStrategy>() {
                Ok(s) => Some(s),
                Err(e) => {
                    if let Some(fields) = e.field_errors() {
                        for (field, messages) in fields.iter() {
                            for m in messages {
                                errors.add(field.clone(), m.clone());
                            }
                        }
                    }
                    None
                }
            },
            None => None,
        };

        if !errors.is_empty() {
            return Err(errors);
        }

        let parsed = (|| -> DomainResult<NormalizedEntry> {
            Ok(NormalizedEntry {
                entity_id: self.entity_id.parse()?,
                payment_method: self.payment_method.parse()?,
                amount: self
                    .amount
                    .decimal()
                    .ok_or_else(|| DomainError::validation("amount", "must be a number"))
                    .and_then(Money::new)?,
                currency: Currency::new(&self.currency_id)?,
                payment_date: NaiveDate::parse_from_str(&self.payment_date, DATE_FORMAT)
                    .map_err(|_| DomainError::validation("payment_date", "must parse"))?,
                reference_number: self.reference_number.clone(),
                allocation_strategy: self
                    .auto_allocate
                    .then(|| strategy.clone().unwrap_or_default()),
                notes: self.notes.clone(),
            })
        })();

        parsed.map_err(|e| e.field_errors().cloned().unwrap_or_default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Manual,
    CsvImport,
    BankFeed,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Manual => "manual",
            SourceType::CsvImport => "csv_import",
            SourceType::BankFeed => "bank_feed",
        }
    }

    pub fn parse(s: &str) -> DomainResult<Self> {
        match s {
            "manual" => Ok(SourceType::Manual),
            "csv_import" => Ok(SourceType::CsvImport),
            "bank_feed" => Ok(SourceType::BankFeed),
            other => Err(DomainError::validation(
                "source_type",
                format!("'{other}' is not a recognised source type"),
            )),
        }
    }
}

/// Rows already parsed out of an uploaded CSV by the file collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct CsvFile {
    #[validate(length(min = 1, max = 255, message = "must be between 1 and 255 characters"))]
    pub filename: String,
    pub content_hash: Option<String>,
    #[serde(default)]
    pub rows: Vec<RawBatchEntry>,
}

/// Describes the originating bank feed. Extra keys are kept verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct BankFeedMetadata {
    #[validate(length(min = 1, message = "is required"))]
    pub feed_id: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A submission, tagged by `source_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source_type", rename_all = "snake_case")]
pub enum BatchSource {
    Manual {
        #[serde(default)]
        entries: Vec<RawBatchEntry>,
    },
    CsvImport {
        file: CsvFile,
    },
    BankFeed {
        #[serde(default)]
        entries: Vec<RawBatchEntry>,
        metadata: BankFeedMetadata,
    },
}

/// A submission whose every entry passed shape validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatedSubmission {
    pub source_type: SourceType,
    pub entries: Vec<NormalizedEntry>,
    pub currency: Currency,
    pub total_amount: Money,
    pub metadata: serde_json::Value,
}

impl BatchSource {
    pub fn source_type(&self) -> SourceType {
        match self {
            BatchSource::Manual { .. } => SourceType::Manual,
            BatchSource::CsvImport { .. } => SourceType::CsvImport,
            BatchSource::BankFeed { .. } => SourceType::BankFeed,
        }
    }

    /// Validate the whole submission. Any shape error rejects it.
    pub fn validate_submission(self, max_entries: usize) -> DomainResult<ValidatedSubmission> {
        let source_type = self.source_type();
        let mut errors = FieldErrors::new();

        let (entries, metadata) = match self {
            BatchSource::Manual { entries } => (entries, serde_json::json!({})),
            BatchSource::CsvImport { file } => {
                if let Err(e) = file.validate() {
                    errors.merge_prefixed("file", collect(&e));
                }
                if file.rows.is_empty() {
                    errors.add("file", "contains no payment rows");
                }
                let metadata = serde_json::json!({
                    "filename": file.filename,
                    "file_hash": file.content_hash,
                    "row_count": file.rows.len(),
                });
                (file.rows, metadata)
            }
            BatchSource::BankFeed { entries, metadata } => {
                if let Err(e) = metadata.validate() {
                    errors.merge_prefixed("metadata", collect(&e));
                }
                let metadata = serde_json::to_value(&metadata)
                    .map_err(|e| DomainError::invariant(format!("metadata not serialisable: {e}")))?;
                (entries, metadata)
            }
        };

        if entries.is_empty() && source_type != SourceType::CsvImport {
            errors.add("entries", "at least one entry is required");
        }
        if entries.len() > max_entries {
            errors.add("entries", format!("at most {max_entries} entries per batch"));
        }

        let mut normalized = Vec::with_capacity(entries.len());
        for (index, raw) in entries.iter().enumerate() {
            match raw.normalize() {
                Ok(entry) => normalized.push((index, entry)),
                Err(fields) => errors.merge_prefixed(&format!("entries.{index}"), fields),
            }
        }

        // One settlement currency per batch.
        let currency = normalized.first().map(|(_, e)| e.currency.clone());
        if let Some(currency) = &currency {
            for (index, entry) in &normalized {
                if &entry.currency != currency {
                    errors.add(
                        format!("entries.{index}.currency_id"),
                        format!("must match the batch currency {currency}"),
                    );
                }
            }
        }

        errors.into_result()?;

        let currency = currency
            .ok_or_else(|| DomainError::validation("entries", "at least one entry is required"))?;
        let entries: Vec<NormalizedEntry> = normalized.into_iter().map(|(_, e)| e).collect();
        let total_amount = entries.iter().map(|e| e.amount).sum();
        Ok(ValidatedSubmission {
            source_type,
            entries,
            currency,
            total_amount,
            metadata,
        })
    }
}
