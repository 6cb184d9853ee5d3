// End-to-end tests for the per-ledger blockhash lease


#[cfg(test)]
mod tests {
    use crate::test_utils::*;
    use ephemeral_payments::blockhash::BlockhashCache;
    use ephemeral_payments::error::PaymentError;
    use ephemeral_payments::ledger::Ledger;
    use std::sync::Arc;
    use std::time::Duration;

    fn cache(ttl: Duration) -> (Arc<Simulator>, Arc<BlockhashCache>) {
        let sim = Simulator::new(test_program_ids());
        let cache = Arc::new(BlockhashCache::new(sim.ledgers(), ttl));
        (sim, cache)
    }

    #[tokio::test]
    async fn test_concurrent_gets_share_one_fetch() {
        let (sim, cache) = cache(Duration::from_secs(30));
        sim.set_blockhash_latency(Duration::from_millis(50));

        let (a, b, c, d) = tokio::join!(
            cache.get(Ledger::Base),
            cache.get(Ledger::Base),
            cache.get(Ledger::Base),
            cache.get(Ledger::Base),
        );

        let a = a.unwrap();
        for other in [b.unwrap(), c.unwrap(), d.unwrap()] {
            assert_eq!(other.blockhash, a.blockhash);
        }
        assert_eq!(sim.blockhash_fetches(Ledger::Base), 1);
        assert_eq!(cache.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_fresh_entry_is_served_from_cache() {
        let (sim, cache) = cache(Duration::from_secs(30));
        let first = cache.get(Ledger::Rollup).await.unwrap();
        let second = cache.get(Ledger::Rollup).await.unwrap();

        assert_eq!(first, second);
        assert!(second.is_fresh());
        assert_eq!(sim.blockhash_fetches(Ledger::Rollup), 1);
        assert_eq!(sim.blockhash_fetches(Ledger::Base), 0);
    }

    #[tokio::test]
    async fn test_invalidate_forces_a_refetch() {
        let (sim, cache) = cache(Duration::from_secs(30));
        let first = cache.get(Ledger::Base).await.unwrap();
        cache.invalidate(Ledger::Base).await;
        let second = cache.get(Ledger::Base).await.unwrap();

        assert_ne!(first.blockhash, second.blockhash);
        assert_eq!(sim.blockhash_fetches(Ledger::Base), 2);
    }

    #[tokio::test]
    async fn test_failed_refresh_serves_stale_entry() {
        let (sim, cache) = cache(Duration::ZERO);
        let first = cache.get(Ledger::Base).await.unwrap();
        sim.fail_blockhash(Ledger::Base, true);

        let stale = cache.get(Ledger::Base).await.unwrap();

        assert_eq!(stale.blockhash, first.blockhash);
        assert!(!stale.is_fresh());
        assert_eq!(sim.blockhash_fetches(Ledger::Base), 2);
    }

    #[tokio::test]
    async fn test_failed_first_fetch_is_an_error() {
        let (sim, cache) = cache(Duration::from_secs(30));
        sim.fail_blockhash(Ledger::Rollup, true);

        let err = cache.get(Ledger::Rollup).await.unwrap_err();

        assert!(matches!(err, PaymentError::Connectivity { ledger: Ledger::Rollup, .. }));
    }

    #[tokio::test]
    async fn test_renewal_refreshes_every_nth_slot() {
        let (sim, cache) = cache(Duration::from_secs(30));
        let renewal = cache.start_renewal(3).await.unwrap();
        assert_eq!(sim.blockhash_fetches(Ledger::Base), 1);
        assert_eq!(sim.blockhash_fetches(Ledger::Rollup), 1);

        for _ in 0..7 {
            sim.tick(Ledger::Base);
        }
        sim.tick(Ledger::Rollup);
        for _ in 0..20 {
            if sim.blockhash_fetches(Ledger::Base) == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // slots 3 and 6
        assert_eq!(sim.blockhash_fetches(Ledger::Base), 3);
        assert_eq!(sim.blockhash_fetches(Ledger::Rollup), 1);

        renewal.stop().await;
        for _ in 0..3 {
            sim.tick(Ledger::Base);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sim.blockhash_fetches(Ledger::Base), 3);
    }
}
