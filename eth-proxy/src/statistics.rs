use once_cell::sync::Lazy;
use prometheus::{
    exponential_buckets, register_histogram, register_int_counter, register_int_gauge, Histogram,
    IntCounter, IntGauge,
};

pub static CONNECTIONS_ACCEPTED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "proxy_connections_accepted",
        "Number of websocket connections accepted."
    )
    .unwrap()
});

pub static REQUESTS_RECEIVED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "proxy_requests_received",
        "Number of JSON-RPC requests read from websocket connections."
    )
    .unwrap()
});

pub static REQUESTS_REJECTED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "proxy_requests_rejected",
        "Number of frames rejected as unparseable."
    )
    .unwrap()
});

pub static DISPATCH_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "proxy_dispatch_latency_seconds",
        "Time from reading a request to enqueueing its response.",
        exponential_buckets(0.001, 2.0, 14).unwrap()
    )
    .unwrap()
});

pub static CACHE_HITS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("proxy_cache_hits", "Number of responses served from cache.").unwrap()
});

pub static CACHE_MISSES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "proxy_cache_misses",
        "Number of cacheable requests dispatched downstream."
    )
    .unwrap()
});

pub static CHAIN_UPDATES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "proxy_chain_updates",
        "Number of client status events applied to the chain."
    )
    .unwrap()
});

pub static TRACKED_BLOCKS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("proxy_tracked_blocks", "Number of blocks currently retained.").unwrap()
});

pub static CHAIN_HEAD_NUMBER: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("proxy_chain_head_number", "Block number of the canonical head.").unwrap()
});

pub static ELIGIBLE_CLIENTS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "proxy_eligible_clients",
        "Number of clients in the routing set."
    )
    .unwrap()
});
