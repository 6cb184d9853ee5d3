// End-to-end tests for the background balance monitor


#[cfg(test)]
mod tests {
    use crate::test_utils::*;
    use ephemeral_payments::ledger::Ledger;
    use ephemeral_payments::store::MemoryStore;
    use ephemeral_payments::tasks::balance_monitor::{run_balance_monitor, BalanceMonitor};
    use ephemeral_payments::tokens::{TokenListEntry, TokenRegistry};
    use solana_sdk::pubkey::Pubkey;
    use std::sync::Arc;
    use std::time::Duration;

    fn entry(mint: &Pubkey) -> TokenListEntry {
        TokenListEntry { mint: mint.to_string(), creator: "tester".to_string() }
    }

    #[tokio::test]
    async fn test_sync_follows_the_token_list() {
        let h = Harness::new();
        let other_mint = Pubkey::new_unique();
        h.sim.seed_custody(&h.wallet, &h.mint, 15, true);
        let tokens = TokenRegistry::new(Arc::new(MemoryStore::default()));
        tokens.add(entry(&h.mint)).await.unwrap();
        tokens.add(TokenListEntry { mint: "garbage".to_string(), creator: "x".to_string() }).await.unwrap();
        let mut monitor = BalanceMonitor::new(h.resolver.clone(), tokens.clone(), h.wallet);

        monitor.sync().await.unwrap();
        assert_eq!(monitor.watched(), vec![h.mint]);
        assert_eq!(monitor.current(&h.mint).and_then(|s| s.effective_balance()), Some(15));

        let rollup_ata = h.factory.base_account(&h.wallet, &h.mint);
        h.sim.put_account(Ledger::Rollup, rollup_ata, Some(token_account(h.wallet, h.mint, 11)));
        assert_eq!(monitor.current(&h.mint).and_then(|s| s.effective_balance()), Some(11));

        tokens.set_list(&[entry(&other_mint)]).await.unwrap();
        monitor.sync().await.unwrap();
        assert_eq!(monitor.watched(), vec![other_mint]);
        assert_eq!(h.registry.listener_count(Ledger::Rollup, &rollup_ata).await, 0);
        assert_eq!(h.registry.open_subscriptions(), 4);

        monitor.shutdown().await;
        assert_eq!(h.registry.open_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_running_monitor_picks_up_new_tokens() {
        let h = Harness::new();
        let tokens = TokenRegistry::new(Arc::new(MemoryStore::default()));
        let task = tokio::spawn(run_balance_monitor(h.resolver.clone(), tokens.clone(), h.wallet));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.registry.open_subscriptions(), 0);

        tokens.add(entry(&h.mint)).await.unwrap();
        for _ in 0..50 {
            if h.registry.open_subscriptions() == 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(h.registry.open_subscriptions(), 4);

        // selection changes do not resync
        tokens.select(Some(&entry(&h.mint))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.registry.open_subscriptions(), 4);

        task.abort();
    }
}
