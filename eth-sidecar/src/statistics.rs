use once_cell::sync::Lazy;
use prometheus::{register_histogram, register_int_counter, Histogram, IntCounter};

pub static CONNECTION_ATTEMPTS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "sidecar_connection_attempts",
        "Number of attempts to connect to the upstream node."
    )
    .unwrap()
});

pub static HEADS_PUBLISHED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "sidecar_heads_published",
        "Number of new heads published to the stream."
    )
    .unwrap()
});

pub static RPC_REQUESTS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "sidecar_rpc_requests",
        "Number of RPC requests forwarded to the upstream node."
    )
    .unwrap()
});

pub static RPC_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "sidecar_rpc_failures",
        "Number of RPC replies that could not be delivered."
    )
    .unwrap()
});

pub static BLOCK_FETCH_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "sidecar_block_fetch_latency",
        "The latency of re-fetching blocks for total difficulty."
    )
    .unwrap()
});
