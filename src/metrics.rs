use lazy_static::lazy_static;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref BLOCKS_FINALIZED: IntCounter =
        IntCounter::new("BlocksFinalized", "blocks marked as processed by the scanner")
            .expect("can't create blocks_finalized metrics");
    pub static ref PENDING_BLOCKS: IntGauge = IntGauge::new(
        "PendingBlocks",
        "Size of the pending blocks backlog"
    )
    .expect("can't create pending_blocks metrics");
    pub static ref PROBLEMATIC_TRANSACTIONS: IntCounter = IntCounter::new(
        "ProblematicTransactions",
        "transactions queued for a fetch retry"
    )
    .expect("can't create problematic_transactions metrics");
    pub static ref TRANSACTIONS_RECONCILED: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "TransactionsReconciled",
            "reconcile calls per outcome (created, existing, noop)"
        ),
        &["outcome"]
    )
    .expect("can't create transactions_reconciled metrics");
    pub static ref NOTIFICATIONS: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "Notifications",
            "notification deliveries per destination kind and outcome"
        ),
        &["destination", "outcome"]
    )
    .expect("can't create notifications metrics");
    pub static ref REDIS_CONNECTIONS_AVAILABLE: IntGauge = IntGauge::new(
        "RedisConnectionsAvailable",
        "Number of available connections in Redis pool"
    )
    .expect("can't create redis_connections metrics");
    pub static ref POSTGRES_CONNECTIONS_AVAILABLE: IntGauge = IntGauge::new(
        "PostgresConnectionsAvailable",
        "Number of available connections in Postgres pool"
    )
    .expect("can't create postgres_connections metrics");
}

pub fn register_metrics() {
    REGISTRY
        .register(Box::new(BLOCKS_FINALIZED.clone()))
        .expect("can't register blocks_finalized metrics");

    REGISTRY
        .register(Box::new(PENDING_BLOCKS.clone()))
        .expect("can't register pending_blocks metrics");

    REGISTRY
        .register(Box::new(PROBLEMATIC_TRANSACTIONS.clone()))
        .expect("can't register problematic_transactions metrics");

    REGISTRY
        .register(Box::new(TRANSACTIONS_RECONCILED.clone()))
        .expect("can't register transactions_reconciled metrics");

    REGISTRY
        .register(Box::new(NOTIFICATIONS.clone()))
        .expect("can't register notifications metrics");

    REGISTRY
        .register(Box::new(REDIS_CONNECTIONS_AVAILABLE.clone()))
        .expect("can't register redis_connections metrics");

    REGISTRY
        .register(Box::new(POSTGRES_CONNECTIONS_AVAILABLE.clone()))
        .expect("can't register postgres_connections metrics");
}
