//! Auto-allocation strategies.
//!
//! Every strategy is a pure function of `(available amount, open invoices)`. The
//! same inputs always produce the same plan, which is what makes replaying or
//! reversing an auto-allocation safe.

use core::cmp::Ordering;
use core::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use reconcile_billing::Invoice;
use reconcile_core::{DomainError, InvoiceId, Money};

use crate::allocation::AllocationMethod;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", content = "order", rename_all = "snake_case")]
pub enum AllocationStrategy {
    /// Oldest due date first, tie-break on invoice number.
    #[default]
    Fifo,
    /// Largest outstanding balance first.
    LargestFirst,
    /// Split pro rata to outstanding balances.
    Proportional,
    /// Listed invoices first (in the given order), then the rest FIFO.
    CustomPriority(Vec<InvoiceId>),
}

impl AllocationStrategy {
    pub fn method(&self) -> AllocationMethod {
        match self {
            AllocationStrategy::Fifo => AllocationMethod::Fifo,
            AllocationStrategy::LargestFirst => AllocationMethod::LargestFirst,
            AllocationStrategy::Proportional => AllocationMethod::Proportional,
            AllocationStrategy::CustomPriority(_) => AllocationMethod::CustomPriority,
        }
    }

    pub fn name(&self) -> &'static str {
        self.method().as_str()
    }
}

/// Parses strategy names. `custom_priority` parsed this way has an empty order.
impl FromStr for AllocationStrategy {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fifo" => Ok(AllocationStrategy::Fifo),
            "largest_first" => Ok(AllocationStrategy::LargestFirst),
            "proportional" => Ok(AllocationStrategy::Proportional),
            "custom_priority" => Ok(AllocationStrategy::CustomPriority(Vec::new())),
            other => Err(DomainError::validation(
                "allocation_strategy",
                format!("'{other}' is not a recognised allocation strategy"),
            )),
        }
    }
}

/// The slice of an invoice a strategy needs to see.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenInvoice {
    pub invoice_id: InvoiceId,
    pub invoice_number: String,
    pub due_date: NaiveDate,
    pub balance_due: Money,
}

impl From<&Invoice> for OpenInvoice {
    fn from(invoice: &Invoice) -> Self {
        Self {
            invoice_id: invoice.id_typed(),
            invoice_number: invoice.invoice_number().to_string(),
            due_date: invoice.due_date(),
            balance_due: invoice.balance_due(),
        }
    }
}

/// One planned allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedAllocation {
    pub invoice_id: InvoiceId,
    pub amount: Money,
}

fn fifo_order(a: &OpenInvoice, b: &OpenInvoice) -> Ordering {
    a.due_date
        .cmp(&b.due_date)
        .then_with(|| a.invoice_number.cmp(&b.invoice_number))
        .then_with(|| a.invoice_id.cmp(&b.invoice_id))
}

fn largest_first_order(a: &OpenInvoice, b: &OpenInvoice) -> Ordering {
    b.balance_due
        .cmp(&a.balance_due)
        .then_with(|| fifo_order(a, b))
}

/// Build the allocation plan for `available` against `invoices`.
///
/// Invoices with nothing due are ignored. The plan never exceeds `available` in
/// total nor any invoice's `balance_due`; whatever is left stays unapplied on the
/// payment.
pub fn plan(
    strategy: &AllocationStrategy,
    available: Money,
    invoices: &[OpenInvoice],
) -> Vec<PlannedAllocation> {
    if !available.is_positive() {
        return Vec::new();
    }
    let mut open: Vec<&OpenInvoice> = invoices
        .iter()
        .filter(|i| i.balance_due.is_positive())
        .collect();

    match strategy {
        AllocationStrategy::Fifo => {
            open.sort_by(|a, b| fifo_order(a, b));
            greedy(available, &open)
        }
        AllocationStrategy::LargestFirst => {
            open.sort_by(|a, b| largest_first_order(a, b));
            greedy(available, &open)
        }
        AllocationStrategy::CustomPriority(order) => {
            open.sort_by(|a, b| {
                let rank = |i: &OpenInvoice| {
                    order
                        .iter()
                        .position(|id| *id == i.invoice_id)
                        .unwrap_or(usize::MAX)
                };
                rank(a).cmp(&rank(b)).then_with(|| fifo_order(a, b))
            });
            greedy(available, &open)
        }
        AllocationStrategy::Proportional => {
            open.sort_by(|a, b| fifo_order(a, b));
            proportional(available, &open)
        }
    }
}

fn greedy(available: Money, ordered: &[&OpenInvoice]) -> Vec<PlannedAllocation> {
    let mut remaining = available;
    let mut lines = Vec::new();
    for invoice in ordered {
        if !remaining.is_positive() {
            break;
        }
        let amount = remaining.min(invoice.balance_due);
        remaining = remaining - amount;
        lines.push(PlannedAllocation {
            invoice_id: invoice.invoice_id,
            amount,
        });
    }
    lines
}

fn proportional(available: Money, ordered: &[&OpenInvoice]) -> Vec<PlannedAllocation> {
    let total: Money = ordered.iter().map(|i| i.balance_due).sum();
    if available >= total {
        return greedy(available, ordered);
    }

    let pool = available.as_decimal();
    let total = total.as_decimal();
    let mut shares: Vec<Money> = ordered
        .iter()
        .map(|i| {
            let share = pool * i.balance_due.as_decimal() / total;
            Money::truncate(share).min(i.balance_due)
        })
        .collect();

    // Truncation leaves at most one cent per invoice; hand it out in FIFO order.
    let mut leftover = available - shares.iter().sum::<Money>();
    let cent = Money::one_cent();
    while leftover.is_positive() {
        let mut progressed = false;
        for (share, invoice) in shares.iter_mut().zip(ordered) {
            if !leftover.is_positive() {
                break;
            }
            if *share < invoice.balance_due {
                *share = *share + cent;
                leftover = leftover - cent;
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }

    shares
        .into_iter()
        .zip(ordered)
        .filter(|(share, _)| share.is_positive())
        .map(|(amount, invoice)| PlannedAllocation {
            invoice_id: invoice.invoice_id,
            amount,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn open(number: &str, due: (i32, u32, u32), cents: i64) -> OpenInvoice {
        OpenInvoice {
            invoice_id: InvoiceId::new(),
            invoice_number: number.to_string(),
            due_date: NaiveDate::from_ymd_opt(due.0, due.1, due.2).unwrap(),
            balance_due: Money::from_minor(cents),
        }
    }

    fn amount_for(plan: &[PlannedAllocation], id: InvoiceId) -> Option<Money> {
        plan.iter().find(|l| l.invoice_id == id).map(|l| l.amount)
    }

    #[test]
    fn unspecified_strategy_is_fifo() {
        assert_eq!(AllocationStrategy::default(), AllocationStrategy::Fifo);
        assert_eq!(AllocationStrategy::default().name(), "fifo");
    }

    #[test]
    fn fifo_fills_oldest_due_first() {
        let b = open("B", (2025, 1, 1), 50_000);
        let c = open("C", (2025, 2, 1), 50_000);
        let lines = plan(
            &AllocationStrategy::Fifo,
            Money::from_minor(75_000),
            &[c.clone(), b.clone()],
        );

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].invoice_id, b.invoice_id);
        assert_eq!(lines[0].amount, Money::from_minor(50_000));
        assert_eq!(lines[1].invoice_id, c.invoice_id);
        assert_eq!(lines[1].amount, Money::from_minor(25_000));
    }

    #[test]
    fn fifo_ties_break_on_invoice_number() {
        let second = open("INV-002", (2025, 1, 1), 100);
        let first = open("INV-001", (2025, 1, 1), 100);
        let lines = plan(
            &AllocationStrategy::Fifo,
            Money::from_minor(100),
            &[second, first.clone()],
        );
        assert_eq!(lines, vec![PlannedAllocation { invoice_id: first.invoice_id, amount: Money::from_minor(100) }]);
    }

    #[test]
    fn surplus_stays_unapplied() {
        let a = open("A", (2025, 1, 1), 1_000);
        let lines = plan(&AllocationStrategy::Fifo, Money::from_minor(5_000), &[a]);
        let total: Money = lines.iter().map(|l| l.amount).sum();
        assert_eq!(total, Money::from_minor(1_000));
    }

    #[test]
    fn largest_first_prefers_biggest_balance() {
        let small = open("A", (2025, 1, 1), 1_000);
        let big = open("B", (2025, 6, 1), 9_000);
        let lines = plan(
            &AllocationStrategy::LargestFirst,
            Money::from_minor(9_500),
            &[small.clone(), big.clone()],
        );
        assert_eq!(lines[0].invoice_id, big.invoice_id);
        assert_eq!(amount_for(&lines, small.invoice_id), Some(Money::from_minor(500)));
    }

    #[test]
    fn custom_priority_puts_listed_invoices_first() {
        let a = open("A", (2025, 1, 1), 1_000);
        let b = open("B", (2025, 2, 1), 1_000);
        let c = open("C", (2025, 3, 1), 1_000);
        let strategy = AllocationStrategy::CustomPriority(vec![c.invoice_id]);
        let lines = plan(&strategy, Money::from_minor(1_500), &[a.clone(), b, c.clone()]);

        assert_eq!(lines[0].invoice_id, c.invoice_id);
        assert_eq!(lines[1].invoice_id, a.invoice_id);
        assert_eq!(lines[1].amount, Money::from_minor(500));
    }

    #[test]
    fn proportional_splits_by_balance_and_hands_out_leftover_cents() {
        let a = open("A", (2025, 1, 1), 100);
        let b = open("B", (2025, 1, 2), 100);
        let c = open("C", (2025, 1, 3), 100);
        let lines = plan(
            &AllocationStrategy::Proportional,
            Money::from_minor(100),
            &[a.clone(), b.clone(), c.clone()],
        );

        assert_eq!(amount_for(&lines, a.invoice_id), Some(Money::from_minor(34)));
        assert_eq!(amount_for(&lines, b.invoice_id), Some(Money::from_minor(33)));
        assert_eq!(amount_for(&lines, c.invoice_id), Some(Money::from_minor(33)));
    }

    #[test]
    fn strategy_names_parse() {
        assert_eq!("fifo".parse::<AllocationStrategy>().unwrap(), AllocationStrategy::Fifo);
        assert!("overdue_first".parse::<AllocationStrategy>().is_err());
    }

    fn arb_invoices() -> impl Strategy<Value = Vec<OpenInvoice>> {
        prop::collection::vec((0u32..60, 0i64..500_000), 0..12).prop_map(|rows| {
            rows.into_iter()
                .enumerate()
                .map(|(i, (day, cents))| OpenInvoice {
                    invoice_id: InvoiceId::new(),
                    invoice_number: format!("INV-{i:04}"),
                    due_date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()
                        + chrono::Days::new(u64::from(day)),
                    balance_due: Money::from_minor(cents),
                })
                .collect()
        })
    }

    fn arb_strategy() -> impl Strategy<Value = AllocationStrategy> {
        prop_oneof![
            Just(AllocationStrategy::Fifo),
            Just(AllocationStrategy::LargestFirst),
            Just(AllocationStrategy::Proportional),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, .. ProptestConfig::default() })]

        #[test]
        fn plans_stay_within_available_and_balances(
            strategy in arb_strategy(),
            available in 0i64..2_000_000,
            invoices in arb_invoices(),
        ) {
            let available = Money::from_minor(available);
            let lines = plan(&strategy, available, &invoices);

            let total: Money = lines.iter().map(|l| l.amount).sum();
            prop_assert!(total <= available);
            for line in &lines {
                prop_assert!(line.amount.is_positive());
                let invoice = invoices.iter().find(|i| i.invoice_id == line.invoice_id).unwrap();
                prop_assert!(line.amount <= invoice.balance_due);
            }

            // Nothing is left on the table while an invoice still has room.
            let open_total: Money = invoices.iter().map(|i| i.balance_due).sum();
            prop_assert_eq!(total, available.min(open_total));
        }

        #[test]
        fn fifo_is_deterministic_under_input_permutation(
            available in 0i64..2_000_000,
            invoices in arb_invoices(),
        ) {
            let available = Money::from_minor(available);
            let first = plan(&AllocationStrategy::Fifo, available, &invoices);

            let mut reversed = invoices.clone();
            reversed.reverse();
            let second = plan(&AllocationStrategy::Fifo, available, &reversed);

            prop_assert_eq!(first, second);
        }
    }
}
