use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::decimal::Money;
use crate::errors::{CoordinatorError, Result};
use crate::types::{AssetId, PartyId, Transfer};

/// asset custody boundary
///
/// transfers report explicit success or failure, never a silent partial
/// move; `execute` applies a batch all-or-nothing so a failed operation can
/// be compensated cleanly
pub trait AssetCustody {
    fn transfer(&mut self, transfer: &Transfer) -> Result<()>;

    fn execute(&mut self, batch: &[Transfer]) -> Result<()> {
        for (i, transfer) in batch.iter().enumerate() {
            if let Err(e) = self.transfer(transfer) {
                // unwind the executed prefix before reporting the failure
                for done in batch[..i].iter().rev() {
                    self.transfer(&done.reversed())?;
                }
                return Err(e);
            }
        }
        Ok(())
    }
}

/// balance-map custody engine for tests and single-process integrations
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InMemoryCustody {
    balances: HashMap<AssetId, HashMap<PartyId, Money>>,
}

impl InMemoryCustody {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deposit(&mut self, asset: AssetId, party: PartyId, amount: Money) {
        let balance = self
            .balances
            .entry(asset)
            .or_default()
            .entry(party)
            .or_insert(Money::ZERO);
        *balance += amount;
    }

    pub fn balance_of(&self, asset: AssetId, party: PartyId) -> Money {
        self.balances
            .get(&asset)
            .and_then(|accounts| accounts.get(&party))
            .copied()
            .unwrap_or(Money::ZERO)
    }
}

impl AssetCustody for InMemoryCustody {
    fn transfer(&mut self, transfer: &Transfer) -> Result<()> {
        if transfer.amount.is_negative() {
            return Err(transfer_failed(transfer, "negative amount"));
        }
        if transfer.amount.is_zero() {
            return Ok(());
        }

        let available = self.balance_of(transfer.asset, transfer.from);
        if available < transfer.amount {
            return Err(transfer_failed(transfer, "insufficient balance"));
        }

        let accounts = self.balances.entry(transfer.asset).or_default();
        *accounts.entry(transfer.from).or_insert(Money::ZERO) -= transfer.amount;
        *accounts.entry(transfer.to).or_insert(Money::ZERO) += transfer.amount;
        Ok(())
    }
}

fn transfer_failed(transfer: &Transfer, message: &str) -> CoordinatorError {
    CoordinatorError::TransferFailed {
        asset: transfer.asset,
        from: transfer.from,
        to: transfer.to,
        amount: transfer.amount,
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_transfer_moves_balance() {
        let asset = Uuid::new_v4();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let mut custody = InMemoryCustody::new();
        custody.deposit(asset, alice, Money::from_major(10));

        custody
            .transfer(&Transfer::new(asset, alice, bob, Money::from_major(3)))
            .unwrap();

        assert_eq!(custody.balance_of(asset, alice), Money::from_major(7));
        assert_eq!(custody.balance_of(asset, bob), Money::from_major(3));
    }

    #[test]
    fn test_insufficient_balance_fails() {
        let asset = Uuid::new_v4();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let mut custody = InMemoryCustody::new();
        custody.deposit(asset, alice, Money::from_major(1));

        let err = custody
            .transfer(&Transfer::new(asset, alice, bob, Money::from_major(2)))
            .unwrap_err();

        assert!(matches!(err, CoordinatorError::TransferFailed { .. }));
        assert_eq!(custody.balance_of(asset, alice), Money::from_major(1));
    }

    #[test]
    fn test_batch_is_all_or_nothing() {
        let asset = Uuid::new_v4();
        let (alice, bob, carol) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let mut custody = InMemoryCustody::new();
        custody.deposit(asset, alice, Money::from_major(5));

        let batch = [
            Transfer::new(asset, alice, bob, Money::from_major(5)),
            // carol has nothing, this leg must fail
            Transfer::new(asset, carol, bob, Money::from_major(1)),
        ];

        assert!(custody.execute(&batch).is_err());

        // first leg was unwound
        assert_eq!(custody.balance_of(asset, alice), Money::from_major(5));
        assert_eq!(custody.balance_of(asset, bob), Money::ZERO);
    }
}
