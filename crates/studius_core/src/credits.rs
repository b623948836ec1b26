//! The Credit Ledger: atomic check-and-debit before paid operations, and
//! append-only credits for purchases, welcome grants and refunds.

use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::{LedgerEntryKind, OperationKind, PaymentEvent};
use crate::ports::{DatabaseService, DebitOutcome, PortResult};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// An expected business outcome: the caller should be offered a purchase.
    #[error("Insufficient credits: {required} required, {available} available")]
    InsufficientCredits { required: i64, available: i64 },
    #[error(transparent)]
    Port(#[from] crate::ports::PortError),
}

/// A successful debit, kept by callers that may need to refund it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Debit {
    pub account_id: Uuid,
    pub kind: OperationKind,
    pub amount: i64,
    pub new_balance: i64,
}

#[derive(Clone)]
pub struct CreditLedger {
    db: Arc<dyn DatabaseService>,
}

impl CreditLedger {
    pub fn new(db: Arc<dyn DatabaseService>) -> Self {
        Self { db }
    }

    pub async fn balance(&self, account_id: Uuid) -> PortResult<i64> {
        Ok(self.db.get_account(account_id).await?.balance)
    }

    /// Debits the fixed price of `kind`. Two concurrent calls can never both
    /// pass on a balance that only covers one of them: the store performs a
    /// single conditional update.
    pub async fn check_and_debit(
        &self,
        account_id: Uuid,
        kind: OperationKind,
    ) -> Result<Debit, LedgerError> {
        let cost = kind.cost();
        match self.db.try_debit(account_id, kind, cost).await? {
            DebitOutcome::Debited { new_balance } => {
                info!(
                    "Debited {} credits from account {} for {} (balance {})",
                    cost, account_id, kind, new_balance
                );
                Ok(Debit {
                    account_id,
                    kind,
                    amount: cost,
                    new_balance,
                })
            }
            DebitOutcome::Insufficient {
                required,
                available,
            } => {
                info!(
                    "Account {} cannot afford {} ({} required, {} available)",
                    account_id, kind, required, available
                );
                Err(LedgerError::InsufficientCredits {
                    required,
                    available,
                })
            }
        }
    }

    /// Appends a positive entry. Non-positive amounts are ignored.
    pub async fn credit(
        &self,
        account_id: Uuid,
        amount: i64,
        kind: LedgerEntryKind,
    ) -> PortResult<i64> {
        if amount <= 0 {
            warn!(
                "Ignoring non-positive credit of {} for account {}",
                amount, account_id
            );
            return self.balance(account_id).await;
        }
        let new_balance = self.db.credit(account_id, amount, kind).await?;
        info!(
            "Credited {} to account {} as {} (balance {})",
            amount,
            account_id,
            kind.encode(),
            new_balance
        );
        Ok(new_balance)
    }

    /// Returns a debit's credits to the account.
    pub async fn refund(&self, account_id: Uuid, kind: OperationKind, amount: i64) -> PortResult<i64> {
        self.credit(account_id, amount, LedgerEntryKind::Refund(kind))
            .await
    }

    /// Grants the plan's credits for a confirmed payment.
    /// `None` means the event had already been credited.
    pub async fn credit_purchase(&self, event: &PaymentEvent) -> PortResult<Option<i64>> {
        let amount = event.plan.credits();
        let result = self.db.credit_payment(event, amount).await?;
        match result {
            Some(balance) => info!(
                "Payment {} via {} credited {} to account {} (balance {})",
                event.event_id,
                event.provider.as_str(),
                amount,
                event.account_id,
                balance
            ),
            None => info!(
                "Payment {} was already credited; ignoring duplicate callback",
                event.event_id
            ),
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{PaymentProvider, Plan};
    use crate::memory::InMemoryStore;
    use futures::future::join_all;

    async fn ledger_with_balance(balance: i64) -> (CreditLedger, Arc<InMemoryStore>, Uuid) {
        let store = Arc::new(InMemoryStore::new());
        let account = store
            .create_account("student@example.com", "hash", balance)
            .await
            .unwrap();
        (CreditLedger::new(store.clone()), store, account.id)
    }

    #[tokio::test]
    async fn exact_balance_is_spent_then_refused() {
        let (ledger, _, account) = ledger_with_balance(10).await;

        let debit = ledger
            .check_and_debit(account, OperationKind::Summary)
            .await
            .unwrap();
        assert_eq!(debit.new_balance, 0);

        let err = ledger
            .check_and_debit(account, OperationKind::Summary)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InsufficientCredits {
                required: 10,
                available: 0
            }
        ));
    }

    #[tokio::test]
    async fn concurrent_debits_never_overdraw() {
        let (ledger, _, account) = ledger_with_balance(10).await;

        let attempts = (0..8).map(|_| {
            let ledger = ledger.clone();
            tokio::spawn(async move { ledger.check_and_debit(account, OperationKind::Summary).await })
        });
        let results: Vec<_> = join_all(attempts)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect();

        let successes = results.iter().filter(|r| r.is_ok()).count();
        let refused = results
            .iter()
            .filter(|r| matches!(r, Err(LedgerError::InsufficientCredits { .. })))
            .count();
        assert_eq!(successes, 1);
        assert_eq!(refused, 7);
        assert_eq!(ledger.balance(account).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn balance_matches_the_ledger_sum() {
        let (ledger, store, account) = ledger_with_balance(120).await;
        ledger
            .check_and_debit(account, OperationKind::Quiz)
            .await
            .unwrap();
        ledger
            .refund(account, OperationKind::Quiz, 8)
            .await
            .unwrap();
        ledger
            .check_and_debit(account, OperationKind::OralExam)
            .await
            .unwrap();

        let entries = store.list_transactions(account, 100).await.unwrap();
        let sum: i64 = entries.iter().map(|t| t.delta).sum();
        assert_eq!(sum, ledger.balance(account).await.unwrap());
        assert_eq!(sum, 95);
        assert_eq!(
            entries.first().map(|t| t.kind),
            Some(LedgerEntryKind::Operation(OperationKind::OralExam))
        );
    }

    #[tokio::test]
    async fn payment_events_credit_once() {
        let (ledger, _, account) = ledger_with_balance(0).await;
        let event = PaymentEvent {
            event_id: "evt_123".into(),
            provider: PaymentProvider::Stripe,
            account_id: account,
            plan: Plan::Pro,
        };

        assert_eq!(ledger.credit_purchase(&event).await.unwrap(), Some(500));
        assert_eq!(ledger.credit_purchase(&event).await.unwrap(), None);
        assert_eq!(ledger.balance(account).await.unwrap(), 500);
    }

    #[tokio::test]
    async fn zero_credit_is_a_no_op() {
        let (ledger, store, account) = ledger_with_balance(3).await;
        assert_eq!(
            ledger
                .credit(account, 0, LedgerEntryKind::Welcome)
                .await
                .unwrap(),
            3
        );
        assert_eq!(store.list_transactions(account, 10).await.unwrap().len(), 1);
    }
}
