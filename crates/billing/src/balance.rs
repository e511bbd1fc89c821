//! The "consume from a bounded balance" primitive.
//!
//! An invoice's `balance_due` and a credit note's `remaining_balance` are the only
//! shared mutable money in the engine. Both live in `[0, ceiling]` and both are
//! mutated exclusively through [`BoundedBalance::consume`] and
//! [`BoundedBalance::restore`], so allocation, allocation reversal and credit
//! application share one set of bounds checks.

use reconcile_core::{DomainError, DomainResult, Money};

pub trait BoundedBalance {
    /// Upper bound of the balance (the document total).
    fn ceiling(&self) -> Money;

    /// Amount still available to consume.
    fn available(&self) -> Money;

    /// Raw setter. Implementors must not call this from anywhere else.
    fn set_available(&mut self, value: Money);

    /// Field name used in error messages (`balance_due`, `remaining_balance`).
    fn balance_field(&self) -> &'static str;

    /// Take `amount` out of the balance. Returns the new available balance.
    fn consume(&mut self, amount: Money) -> DomainResult<Money> {
        if !amount.is_positive() {
            return Err(DomainError::validation("amount", "must be greater than zero"));
        }
        let available = self.available();
        if amount > available {
            return Err(DomainError::invariant(format!(
                "cannot consume {amount} from {} of {available}",
                self.balance_field()
            )));
        }
        let next = available.checked_sub(amount)?;
        self.set_available(next);
        Ok(next)
    }

    /// Put `amount` back. Returns the new available balance.
    fn restore(&mut self, amount: Money) -> DomainResult<Money> {
        if !amount.is_positive() {
            return Err(DomainError::validation("amount", "must be greater than zero"));
        }
        let next = self.available().checked_add(amount)?;
        if next > self.ceiling() {
            return Err(DomainError::invariant(format!(
                "restoring {amount} would push {} above {}",
                self.balance_field(),
                self.ceiling()
            )));
        }
        self.set_available(next);
        Ok(next)
    }

    /// Amount consumed so far (`ceiling - available`).
    fn consumed(&self) -> Money {
        self.ceiling().saturating_sub(self.available())
    }
}
