// End-to-end tests for withdrawing custody back to the wallet
// [Undelegate on rollup] → Withdraw on base


#[cfg(test)]
mod tests {
    use crate::test_utils::*;
    use ephemeral_payments::error::PaymentError;
    use ephemeral_payments::ledger::Ledger;
    use ephemeral_payments::saga::Cancellation;

    #[tokio::test]
    async fn test_withdraw_delegated_balance() {
        let h = Harness::new();
        h.sim.seed_custody(&h.wallet, &h.mint, 30, true);
        let vault_before = h.sim.vault_balance(&h.mint).unwrap();

        let receipt = h.saga.withdraw(h.mint, 30).await.expect("withdraw failed");

        let stages: Vec<(Ledger, &str)> = receipt.transactions.iter().map(|t| (t.ledger, t.stage.as_str())).collect();
        assert_eq!(stages, vec![(Ledger::Rollup, "undelegating"), (Ledger::Base, "withdrawing")]);
        assert!(receipt.counterparty.is_none());
        assert_eq!(receipt.owner.effective_balance(), Some(0));
        assert!(!receipt.owner.is_delegated);

        assert_eq!(h.sim.wallet_balance(&h.wallet, &h.mint), Some(30));
        assert_eq!(h.sim.vault_balance(&h.mint), Some(vault_before - 30));
        let (record, delegated) = h.sim.record(&h.wallet, &h.mint).unwrap();
        assert_eq!(record.amount, 0);
        assert!(!delegated);
        assert_eq!(h.sim.rollup_balance(&h.wallet, &h.mint), None);
        assert_eq!(h.signing_rounds(), 2);
        assert_eq!(h.metrics.withdrawals.get(), 1.0);
    }

    #[tokio::test]
    async fn test_partial_withdraw_recreates_missing_wallet_account() {
        let h = Harness::new();
        h.sim.seed_custody(&h.wallet, &h.mint, 50, false);
        let ata = h.factory.base_account(&h.wallet, &h.mint);
        h.sim.put_account(Ledger::Base, ata, None);

        let receipt = h.saga.withdraw(h.mint, 20).await.expect("withdraw failed");

        assert_eq!(receipt.transactions.len(), 1);
        assert_eq!(h.sim.sends(Ledger::Rollup), 0);
        assert_eq!(h.sim.wallet_balance(&h.wallet, &h.mint), Some(20));
        assert_eq!(h.sim.record(&h.wallet, &h.mint).unwrap().0.amount, 30);
        assert_eq!(receipt.owner.effective_balance(), Some(30));
    }

    #[tokio::test]
    async fn test_withdraw_more_than_custody_is_rejected() {
        let h = Harness::new();
        // wallet funds do not count towards a withdrawal
        h.sim.fund_wallet(&h.wallet, &h.mint, 1_000);
        h.sim.seed_custody(&h.wallet, &h.mint, 10, true);

        let err = h.saga.withdraw(h.mint, 11).await.unwrap_err();

        assert!(matches!(err, PaymentError::InsufficientBalance { requested: 11, available: 10 }));
        assert_eq!(h.sim.sends(Ledger::Base) + h.sim.sends(Ledger::Rollup), 0);
        assert_eq!(h.signing_rounds(), 0);
    }

    #[tokio::test]
    async fn test_zero_withdraw_is_rejected_before_any_call() {
        let h = Harness::new();
        let err = h.saga.withdraw(h.mint, 0).await.unwrap_err();
        assert!(matches!(err, PaymentError::InvalidRequest(_)));
        assert_eq!(h.sim.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_on_chain_failure_surfaces_as_transaction_failed() {
        let h = Harness::new();
        h.sim.seed_custody(&h.wallet, &h.mint, 50, false);
        let (vault, _) = h.factory.vault(&h.mint);
        let vault_ata = h.factory.vault_token_account(&h.mint);
        h.sim.put_account(Ledger::Base, vault_ata, Some(token_account(vault, h.mint, 0)));

        let err = h.saga.withdraw(h.mint, 50).await.unwrap_err();

        match err {
            PaymentError::TransactionFailed { ledger, reason, .. } => {
                assert_eq!(ledger, Ledger::Base);
                assert!(reason.contains("vault"));
            }
            other => panic!("expected transaction failure, got {other:?}"),
        }
        assert_eq!(h.sim.record(&h.wallet, &h.mint).unwrap().0.amount, 50);
        assert_eq!(h.metrics.transaction_failures.get(), 1.0);
    }

    #[tokio::test]
    async fn test_stalled_undelegation_times_out() {
        let h = Harness::new();
        h.sim.seed_custody(&h.wallet, &h.mint, 30, true);
        h.sim.stall_undelegation(true);

        let err = h.saga.withdraw(h.mint, 30).await.unwrap_err();

        assert_eq!(
            err,
            PaymentError::ConvergenceTimeout {
                stage: "undelegating".to_string(),
                attempts: fast_saga_config().limits.withdraw_undelegate_attempts,
            }
        );
        assert_eq!(h.sim.sends(Ledger::Base), 0);
        assert_eq!(h.sim.rollup_balance(&h.wallet, &h.mint), Some(30));
    }

    #[tokio::test]
    async fn test_cancelled_withdraw_sends_nothing() {
        let h = Harness::new();
        h.sim.seed_custody(&h.wallet, &h.mint, 30, true);
        let cancel = Cancellation::new();
        cancel.cancel();

        let err = h.saga.withdraw_cancellable(h.mint, 10, &cancel).await.unwrap_err();

        assert!(matches!(err, PaymentError::Cancelled));
        assert_eq!(h.sim.total_calls(), 0);
    }
}
