use prometheus::{Counter, Encoder, Histogram, HistogramOpts, Opts, Registry, TextEncoder};
use std::sync::Arc;

pub struct Metrics {
    pub transfers: Counter,
    pub withdrawals: Counter,
    pub deposit_actions: Counter,
    pub saga_failures: Counter,
    pub transactions_sent: Counter,
    pub transaction_failures: Counter,
    pub convergence_polls: Counter,
    pub saga_duration: Histogram,
    pub registry: Registry,
}

impl Metrics {
    /// Each instance owns its registry, so several sagas or tests can coexist in one process.
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let transfers = Counter::with_opts(Opts::new(
            "payment_transfers_total",
            "Total number of completed transfers"
        ))?;
        registry.register(Box::new(transfers.clone()))?;

        let withdrawals = Counter::with_opts(Opts::new(
            "payment_withdrawals_total",
            "Total number of completed withdrawals"
        ))?;
        registry.register(Box::new(withdrawals.clone()))?;

        let deposit_actions = Counter::with_opts(Opts::new(
            "payment_deposit_actions_total",
            "Total number of completed single-step deposit actions"
        ))?;
        registry.register(Box::new(deposit_actions.clone()))?;

        let saga_failures = Counter::with_opts(Opts::new(
            "payment_saga_failures_total",
            "Total number of failed transfers, withdrawals and deposit actions"
        ))?;
        registry.register(Box::new(saga_failures.clone()))?;

        let transactions_sent = Counter::with_opts(Opts::new(
            "transaction_submissions_total",
            "Total number of transaction submissions"
        ))?;
        registry.register(Box::new(transactions_sent.clone()))?;

        let transaction_failures = Counter::with_opts(Opts::new(
            "transaction_failures_total",
            "Total number of transaction failures"
        ))?;
        registry.register(Box::new(transaction_failures.clone()))?;

        let convergence_polls = Counter::with_opts(Opts::new(
            "convergence_polls_total",
            "Total number of state convergence polls"
        ))?;
        registry.register(Box::new(convergence_polls.clone()))?;

        let saga_duration_opts = HistogramOpts::new(
            "saga_duration_seconds",
            "Transfer and withdrawal duration in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]);
        let saga_duration = Histogram::with_opts(saga_duration_opts)?;
        registry.register(Box::new(saga_duration.clone()))?;

        Ok(Arc::new(Self {
            transfers,
            withdrawals,
            deposit_actions,
            saga_failures,
            transactions_sent,
            transaction_failures,
            convergence_polls,
            saga_duration,
            registry,
        }))
    }

    /// Prometheus text exposition of every registered metric.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
