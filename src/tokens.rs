use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{GatewayError, Result};

/// One generation call costs one token per produced image: the number of
/// source images times the batch count times the batch size.
pub fn token_cost(num_images: u64, batch_count: u32, batch_size: u32) -> u64 {
    num_images * batch_count as u64 * batch_size as u64
}

/// In-memory token balances, keyed by member id. Members the ledger has
/// not seen yet start with the configured grant, so the cost gate is
/// always exercised.
pub struct TokenLedger {
    default_grant: u64,
    balances: Mutex<HashMap<String, u64>>,
}

impl TokenLedger {
    pub fn new(default_grant: u64) -> Self {
        Self {
            default_grant,
            balances: Mutex::new(HashMap::new()),
        }
    }

    pub fn balance(&self, member_id: &str) -> u64 {
        let mut balances = self.balances.lock().unwrap();
        *balances
            .entry(member_id.to_string())
            .or_insert(self.default_grant)
    }

    /// Deduct `cost` tokens, failing before any upstream work happens when
    /// the balance does not cover it.
    pub fn charge(&self, member_id: &str, cost: u64) -> Result<u64> {
        let mut balances = self.balances.lock().unwrap();
        let balance = balances
            .entry(member_id.to_string())
            .or_insert(self.default_grant);
        if *balance < cost {
            return Err(GatewayError::InsufficientTokens {
                required: cost,
                available: *balance,
            });
        }
        *balance -= cost;
        Ok(*balance)
    }

    /// Return tokens after a charge whose upstream call failed.
    pub fn refund(&self, member_id: &str, cost: u64) -> u64 {
        let mut balances = self.balances.lock().unwrap();
        let balance = balances
            .entry(member_id.to_string())
            .or_insert(self.default_grant);
        *balance = balance.saturating_add(cost);
        *balance
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_is_the_product_of_images_and_batches() {
        assert_eq!(token_cost(1, 1, 1), 1);
        assert_eq!(token_cost(3, 2, 4), 24);
        assert_eq!(token_cost(0, 5, 5), 0);
    }

    #[test]
    fn charge_fails_without_touching_the_balance() {
        let ledger = TokenLedger::new(10);
        let err = ledger.charge("m1", 11).unwrap_err();
        match err {
            GatewayError::InsufficientTokens {
                required,
                available,
            } => {
                assert_eq!(required, 11);
                assert_eq!(available, 10);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(ledger.balance("m1"), 10);
    }

    #[test]
    fn charge_then_refund_restores_the_balance() {
        let ledger = TokenLedger::new(100);
        assert_eq!(ledger.charge("m1", 24).unwrap(), 76);
        assert_eq!(ledger.refund("m1", 24), 100);
    }

    #[test]
    fn members_are_independent() {
        let ledger = TokenLedger::new(5);
        ledger.charge("a", 5).unwrap();
        assert_eq!(ledger.balance("a"), 0);
        assert_eq!(ledger.balance("b"), 5);
    }
}
