// End-to-end tests for the transfer saga against the in-memory ledger pair
// Plan → sign once per ledger → send group → converge → next group


#[cfg(test)]
mod tests {
    use crate::test_utils::*;
    use async_trait::async_trait;
    use ephemeral_payments::error::{PaymentError, PaymentResult};
    use ephemeral_payments::ledger::Ledger;
    use ephemeral_payments::saga::Cancellation;
    use ephemeral_payments::signer::WalletSigner;
    use mockall::mock;
    use solana_sdk::pubkey::Pubkey;
    use solana_sdk::signature::Signature;
    use solana_sdk::transaction::Transaction;
    use std::sync::Arc;

    mock! {
        pub Signer {}

        #[async_trait]
        impl WalletSigner for Signer {
            fn pubkey(&self) -> Pubkey;
            async fn sign_transactions(&self, txs: Vec<Transaction>) -> PaymentResult<Vec<Transaction>>;
            async fn sign_message(&self, message: &[u8]) -> PaymentResult<Signature>;
        }
    }

    #[tokio::test]
    async fn test_transfer_to_fresh_recipient() {
        let h = Harness::new();
        let recipient = Pubkey::new_unique();
        h.sim.fund_wallet(&h.wallet, &h.mint, 0);
        h.sim.seed_custody(&h.wallet, &h.mint, 100, true);

        let receipt = h.saga.transfer(h.wallet, recipient, h.mint, 40).await.expect("transfer failed");

        assert_eq!(receipt.deficit, 0);
        let stages: Vec<(Ledger, &str)> = receipt.transactions.iter().map(|t| (t.ledger, t.stage.as_str())).collect();
        assert_eq!(stages, vec![(Ledger::Base, "scaffolding"), (Ledger::Rollup, "executing")]);
        assert_eq!(receipt.owner.effective_balance(), Some(60));
        assert_eq!(receipt.counterparty.as_ref().and_then(|s| s.effective_balance()), Some(40));

        let (record, delegated) = h.sim.record(&recipient, &h.mint).expect("recipient record");
        assert!(delegated);
        assert_eq!(record.owner, recipient);
        assert!(h.sim.wallet_balance(&recipient, &h.mint).is_some());
        assert_eq!(h.signing_rounds(), 2);
    }

    #[tokio::test]
    async fn test_transfer_between_delegated_parties_is_one_rollup_group() {
        let h = Harness::new();
        let recipient = Pubkey::new_unique();
        h.sim.seed_custody(&h.wallet, &h.mint, 100, true);
        h.sim.seed_custody(&recipient, &h.mint, 5, true);

        let receipt = h.saga.transfer(h.wallet, recipient, h.mint, 25).await.unwrap();

        assert_eq!(receipt.transactions.len(), 1);
        assert_eq!(receipt.transactions[0].ledger, Ledger::Rollup);
        assert_eq!(h.sim.sends(Ledger::Base), 0);
        assert_eq!(h.sim.sends(Ledger::Rollup), 1);
        assert_eq!(h.signing_rounds(), 1);
        assert_eq!(h.sim.rollup_balance(&h.wallet, &h.mint), Some(75));
        assert_eq!(h.sim.rollup_balance(&recipient, &h.mint), Some(30));
    }

    #[tokio::test]
    async fn test_top_up_funds_exactly_the_deficit() {
        let h = Harness::new();
        let recipient = Pubkey::new_unique();
        h.sim.fund_wallet(&h.wallet, &h.mint, 500);
        h.sim.seed_custody(&h.wallet, &h.mint, 30, true);
        h.sim.seed_custody(&recipient, &h.mint, 0, true);
        let vault_before = h.sim.vault_balance(&h.mint).unwrap();

        let receipt = h.saga.transfer(h.wallet, recipient, h.mint, 100).await.expect("transfer failed");

        assert_eq!(receipt.deficit, 70);
        let stages: Vec<&str> = receipt.transactions.iter().map(|t| t.stage.as_str()).collect();
        assert_eq!(stages, vec!["undelegating", "scaffolding", "executing"]);
        assert_eq!(h.sim.wallet_balance(&h.wallet, &h.mint), Some(430));
        assert_eq!(h.sim.vault_balance(&h.mint), Some(vault_before + 70));
        assert_eq!(h.sim.rollup_balance(&h.wallet, &h.mint), Some(0));
        assert_eq!(h.sim.rollup_balance(&recipient, &h.mint), Some(100));
        assert!(h.sim.record(&h.wallet, &h.mint).unwrap().1);
        // rollup first, then base
        assert_eq!(h.signing_rounds(), 2);
    }

    #[tokio::test]
    async fn test_transfer_conserves_total_balance() {
        let h = Harness::new();
        let recipient = Pubkey::new_unique();
        h.sim.fund_wallet(&h.wallet, &h.mint, 50);
        h.sim.seed_custody(&h.wallet, &h.mint, 20, true);
        h.sim.seed_custody(&recipient, &h.mint, 10, true);
        let total = |h: &Harness| {
            h.sim.wallet_balance(&h.wallet, &h.mint).unwrap_or(0)
                + h.sim.rollup_balance(&h.wallet, &h.mint).unwrap_or(0)
                + h.sim.rollup_balance(&recipient, &h.mint).unwrap_or(0)
        };
        let before = total(&h);

        h.saga.transfer(h.wallet, recipient, h.mint, 60).await.unwrap();

        assert_eq!(total(&h), before);
        assert_eq!(h.sim.rollup_balance(&recipient, &h.mint), Some(70));
    }

    #[tokio::test]
    async fn test_failed_transfer_resumes_without_double_funding() {
        let h = Harness::new();
        let recipient = Pubkey::new_unique();
        h.sim.fund_wallet(&h.wallet, &h.mint, 100);
        h.sim.seed_custody(&recipient, &h.mint, 0, true);
        h.sim.fail_next_send(Ledger::Rollup);

        let err = h.saga.transfer(h.wallet, recipient, h.mint, 40).await.unwrap_err();
        assert!(matches!(err, PaymentError::Connectivity { ledger: Ledger::Rollup, .. }));
        // scaffolding and funding landed before the rollup send failed
        assert_eq!(h.sim.wallet_balance(&h.wallet, &h.mint), Some(60));
        assert_eq!(h.sim.rollup_balance(&h.wallet, &h.mint), Some(40));
        assert_eq!(h.sim.rollup_balance(&recipient, &h.mint), Some(0));

        let receipt = h.saga.transfer(h.wallet, recipient, h.mint, 40).await.expect("resumed transfer failed");

        assert_eq!(receipt.deficit, 0);
        assert_eq!(receipt.transactions.len(), 1);
        assert_eq!(h.sim.wallet_balance(&h.wallet, &h.mint), Some(60));
        assert_eq!(h.sim.rollup_balance(&h.wallet, &h.mint), Some(0));
        assert_eq!(h.sim.rollup_balance(&recipient, &h.mint), Some(40));
    }

    #[tokio::test]
    async fn test_insufficient_balance_never_touches_the_network_for_writes() {
        let h = Harness::new();
        let recipient = Pubkey::new_unique();
        h.sim.fund_wallet(&h.wallet, &h.mint, 10);
        h.sim.seed_custody(&h.wallet, &h.mint, 20, true);

        let err = h.saga.transfer(h.wallet, recipient, h.mint, 31).await.unwrap_err();

        assert!(matches!(err, PaymentError::InsufficientBalance { requested: 31, available: 30 }));
        assert!(err.is_pre_network());
        assert_eq!(h.sim.sends(Ledger::Base) + h.sim.sends(Ledger::Rollup), 0);
        assert_eq!(h.signing_rounds(), 0);
        assert_eq!(h.metrics.saga_failures.get(), 1.0);
    }

    #[tokio::test]
    async fn test_zero_amount_is_rejected_before_any_call() {
        let h = Harness::new();

        let err = h.saga.transfer(h.wallet, Pubkey::new_unique(), h.mint, 0).await.unwrap_err();

        assert!(matches!(err, PaymentError::InvalidRequest(_)));
        assert_eq!(h.sim.total_calls(), 0);
        assert_eq!(h.signing_rounds(), 0);
    }

    #[tokio::test]
    async fn test_sender_must_be_the_signing_wallet() {
        let h = Harness::new();
        let err = h.saga.transfer(Pubkey::new_unique(), Pubkey::new_unique(), h.mint, 5).await.unwrap_err();
        assert!(matches!(err, PaymentError::InvalidRequest(_)));
        assert_eq!(h.sim.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_self_transfer_is_rejected() {
        let h = Harness::new();
        h.sim.seed_custody(&h.wallet, &h.mint, 10, true);
        let err = h.saga.transfer(h.wallet, h.wallet, h.mint, 5).await.unwrap_err();
        assert!(matches!(err, PaymentError::InvalidRequest(_)));
        assert_eq!(h.sim.sends(Ledger::Rollup), 0);
    }

    #[tokio::test]
    async fn test_signer_rejection_aborts_before_sending() {
        let wallet = Pubkey::new_unique();
        let mut signer = MockSigner::new();
        signer.expect_pubkey().return_const(wallet);
        signer
            .expect_sign_transactions()
            .times(1)
            .returning(|_| Err(PaymentError::Rejection("user declined".to_string())));
        let h = Harness::with_signer(Arc::new(signer));
        h.sim.seed_custody(&wallet, &h.mint, 50, true);
        let recipient = Pubkey::new_unique();
        h.sim.seed_custody(&recipient, &h.mint, 0, true);

        let err = h.saga.transfer(wallet, recipient, h.mint, 10).await.unwrap_err();

        assert!(matches!(err, PaymentError::Rejection(_)));
        assert_eq!(h.sim.sends(Ledger::Base) + h.sim.sends(Ledger::Rollup), 0);
        assert_eq!(h.sim.rollup_balance(&wallet, &h.mint), Some(50));
    }

    #[tokio::test]
    async fn test_cancelled_transfer_sends_nothing() {
        let h = Harness::new();
        let recipient = Pubkey::new_unique();
        h.sim.seed_custody(&h.wallet, &h.mint, 50, true);
        let cancel = Cancellation::new();
        cancel.cancel();

        let err = h.saga.transfer_cancellable(h.wallet, recipient, h.mint, 10, &cancel).await.unwrap_err();

        assert!(matches!(err, PaymentError::Cancelled));
        assert_eq!(h.sim.sends(Ledger::Base) + h.sim.sends(Ledger::Rollup), 0);
    }

    #[tokio::test]
    async fn test_stalled_undelegation_times_out() {
        let h = Harness::new();
        let recipient = Pubkey::new_unique();
        h.sim.fund_wallet(&h.wallet, &h.mint, 100);
        h.sim.seed_custody(&h.wallet, &h.mint, 10, true);
        h.sim.seed_custody(&recipient, &h.mint, 0, true);
        h.sim.stall_undelegation(true);

        let err = h.saga.transfer(h.wallet, recipient, h.mint, 50).await.unwrap_err();

        match err {
            PaymentError::ConvergenceTimeout { stage, attempts } => {
                assert_eq!(stage, "undelegating");
                assert_eq!(attempts, fast_saga_config().limits.transfer_undelegate_attempts);
            }
            other => panic!("expected convergence timeout, got {other:?}"),
        }
        // the funding group was never sent
        assert_eq!(h.sim.sends(Ledger::Base), 0);
        assert_eq!(h.sim.wallet_balance(&h.wallet, &h.mint), Some(100));
    }

    #[tokio::test]
    async fn test_access_denied_sender_is_rejected() {
        let h = Harness::new();
        h.sim.seed_custody(&h.wallet, &h.mint, 50, true);
        h.sim.hide_rollup_account(&h.wallet, &h.mint);

        let err = h.saga.transfer(h.wallet, Pubkey::new_unique(), h.mint, 10).await.unwrap_err();

        assert!(matches!(err, PaymentError::AccessDenied { .. }));
        assert_eq!(h.signing_rounds(), 0);
    }

    #[tokio::test]
    async fn test_successful_transfer_updates_metrics() {
        let h = Harness::new();
        let recipient = Pubkey::new_unique();
        h.sim.seed_custody(&h.wallet, &h.mint, 10, true);
        h.sim.seed_custody(&recipient, &h.mint, 0, true);

        h.saga.transfer(h.wallet, recipient, h.mint, 10).await.unwrap();

        assert_eq!(h.metrics.transfers.get(), 1.0);
        assert_eq!(h.metrics.transactions_sent.get(), 1.0);
        assert!(h.metrics.convergence_polls.get() >= 1.0);
        assert!(h.metrics.render().unwrap().contains("payment_transfers_total 1"));
    }

    #[tokio::test]
    async fn test_unconfirmed_group_times_out_and_stops_the_saga() {
        let h = Harness::new();
        let recipient = Pubkey::new_unique();
        h.sim.seed_custody(&h.wallet, &h.mint, 100, true);
        h.sim.hold_confirmations(Ledger::Base, true);

        let err = h.saga.transfer(h.wallet, recipient, h.mint, 40).await.unwrap_err();

        match err {
            PaymentError::ConfirmationTimeout { ledger, attempts, .. } => {
                assert_eq!(ledger, Ledger::Base);
                assert_eq!(attempts, fast_saga_config().confirm_attempts);
            }
            other => panic!("expected confirmation timeout, got {other:?}"),
        }
        // the rollup transfer was never sent
        assert_eq!(h.sim.sends(Ledger::Base), 1);
        assert_eq!(h.sim.sends(Ledger::Rollup), 0);
        assert_eq!(h.sim.rollup_balance(&h.wallet, &h.mint), Some(100));
        assert_eq!(h.metrics.transaction_failures.get(), 1.0);
    }

    #[tokio::test]
    async fn test_identical_transfers_in_quick_succession_both_land() {
        let h = Harness::new();
        let recipient = Pubkey::new_unique();
        h.sim.seed_custody(&h.wallet, &h.mint, 100, true);
        h.sim.seed_custody(&recipient, &h.mint, 0, true);

        let first = h.saga.transfer(h.wallet, recipient, h.mint, 10).await.expect("first transfer failed");
        let second = h.saga.transfer(h.wallet, recipient, h.mint, 10).await.expect("second transfer failed");

        assert_ne!(first.transactions[0].signature, second.transactions[0].signature);
        assert_eq!(h.sim.rollup_balance(&h.wallet, &h.mint), Some(80));
        assert_eq!(h.sim.rollup_balance(&recipient, &h.mint), Some(20));
        assert_eq!(h.sim.blockhash_fetches(Ledger::Rollup), 2);
    }
}
