//! The supported-method table: per-method routing, caching and request
//! transforms. Built once at startup, read-only thereafter.

use std::{collections::HashMap, sync::Arc};

use anyhow::{bail, Result as AnyResult};
use serde_json::json;
use tracing::debug;
use types::jsonrpc::Request;

use crate::{
    routing::{Router, StaticRouter},
    tracking::HeadHandle,
    transforms::{override_latest_block_param, RequestTransform, TransformError},
};

pub const ETH_BLOCK_NUMBER: &str = "eth_blockNumber";
pub const ETH_GET_BALANCE: &str = "eth_getBalance";
pub const ETH_GET_STORAGE_AT: &str = "eth_getStorageAt";
pub const ETH_GET_BLOCK_BY_NUMBER: &str = "eth_getBlockByNumber";
pub const ETH_GET_BLOCK_BY_HASH: &str = "eth_getBlockByHash";
pub const ETH_GET_TRANSACTION_COUNT: &str = "eth_getTransactionCount";
pub const ETH_GET_BLOCK_TRANSACTION_COUNT_BY_HASH: &str = "eth_getBlockTransactionCountByHash";
pub const ETH_GET_BLOCK_TRANSACTION_COUNT_BY_NUMBER: &str = "eth_getBlockTransactionCountByNumber";
pub const ETH_GET_UNCLE_COUNT_BY_BLOCK_HASH: &str = "eth_getUncleCountByBlockHash";
pub const ETH_GET_UNCLE_COUNT_BY_BLOCK_NUMBER: &str = "eth_getUncleCountByBlockNumber";
pub const ETH_GET_CODE: &str = "eth_getCode";
pub const ETH_GET_TRANSACTION_BY_HASH: &str = "eth_getTransactionByHash";
pub const ETH_GET_TRANSACTION_BY_BLOCK_HASH_AND_INDEX: &str =
    "eth_getTransactionByBlockHashAndIndex";
pub const ETH_GET_TRANSACTION_BY_BLOCK_NUMBER_AND_INDEX: &str =
    "eth_getTransactionByBlockNumberAndIndex";
pub const ETH_GET_TRANSACTION_RECEIPT: &str = "eth_getTransactionReceipt";
pub const ETH_GET_UNCLE_BY_BLOCK_HASH_AND_INDEX: &str = "eth_getUncleByBlockHashAndIndex";
pub const ETH_GET_UNCLE_BY_BLOCK_NUMBER_AND_INDEX: &str = "eth_getUncleByBlockNumberAndIndex";

pub const NET_VERSION: &str = "net_version";
pub const NET_LISTENING: &str = "net_listening";
pub const NET_PEER_COUNT: &str = "net_peerCount";

pub const WEB3_SHA3: &str = "web3_sha3";
pub const WEB3_CLIENT_VERSION: &str = "web3_clientVersion";

// TODO: report the version of the client actually answering
const CLIENT_VERSION: &str = concat!("eth-proxy/", env!("CARGO_PKG_VERSION"), "/linux/rust");

pub struct Method {
    name:           &'static str,
    router:         Arc<dyn Router>,
    cache:          bool,
    before_request: Option<RequestTransform>,
}

impl Method {
    pub fn new(name: &'static str, router: Arc<dyn Router>) -> Self {
        Self {
            name,
            router,
            cache: false,
            before_request: None,
        }
    }

    #[must_use]
    pub fn cached(mut self) -> Self {
        self.cache = true;
        self
    }

    #[must_use]
    pub fn before_request(mut self, transform: RequestTransform) -> Self {
        self.before_request = Some(transform);
        self
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub const fn cache(&self) -> bool {
        self.cache
    }

    #[must_use]
    pub fn router(&self) -> &Arc<dyn Router> {
        &self.router
    }

    pub fn apply_before_request(&self, req: Request) -> Result<Request, TransformError> {
        match &self.before_request {
            None => Ok(req),
            Some(transform) => transform(req),
        }
    }
}

pub struct MethodRegistry {
    methods: HashMap<&'static str, Method>,
}

impl MethodRegistry {
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Method> {
        self.methods.get(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

/// Build the full method table. Duplicate names are rejected.
pub fn build(
    network_id: u64,
    head: &HeadHandle,
    router: Arc<dyn Router>,
) -> AnyResult<MethodRegistry> {
    let mut methods = HashMap::new();

    register(&mut methods, web3_methods(router.clone()))?;
    register(&mut methods, net_methods(network_id))?;
    register(&mut methods, eth_methods(head, router))?;

    let registry = MethodRegistry { methods };
    debug!(methods = registry.len(), "built method table");
    Ok(registry)
}

fn register(map: &mut HashMap<&'static str, Method>, methods: Vec<Method>) -> AnyResult<()> {
    for method in methods {
        let name = method.name();
        if map.insert(name, method).is_some() {
            bail!("a method is already registered with the name '{}'", name);
        }
    }
    Ok(())
}

fn eth_methods(head: &HeadHandle, router: Arc<dyn Router>) -> Vec<Method> {
    let latest_param =
        |position: usize| override_latest_block_param(head.clone(), position);

    vec![
        Method::new(ETH_BLOCK_NUMBER, router.clone()),
        Method::new(ETH_GET_BALANCE, router.clone())
            .cached()
            .before_request(latest_param(1)),
        Method::new(ETH_GET_STORAGE_AT, router.clone())
            .cached()
            .before_request(latest_param(2)),
        Method::new(ETH_GET_BLOCK_BY_NUMBER, router.clone())
            .cached()
            .before_request(latest_param(0)),
        Method::new(ETH_GET_BLOCK_BY_HASH, router.clone()).cached(),
        Method::new(ETH_GET_TRANSACTION_COUNT, router.clone())
            .cached()
            .before_request(latest_param(1)),
        Method::new(ETH_GET_BLOCK_TRANSACTION_COUNT_BY_HASH, router.clone()).cached(),
        Method::new(ETH_GET_BLOCK_TRANSACTION_COUNT_BY_NUMBER, router.clone())
            .cached()
            .before_request(latest_param(0)),
        Method::new(ETH_GET_UNCLE_COUNT_BY_BLOCK_HASH, router.clone()).cached(),
        Method::new(ETH_GET_UNCLE_COUNT_BY_BLOCK_NUMBER, router.clone())
            .cached()
            .before_request(latest_param(0)),
        Method::new(ETH_GET_CODE, router.clone())
            .cached()
            .before_request(latest_param(1)),
        Method::new(ETH_GET_TRANSACTION_BY_HASH, router.clone()).cached(),
        Method::new(ETH_GET_TRANSACTION_BY_BLOCK_HASH_AND_INDEX, router.clone()).cached(),
        Method::new(ETH_GET_TRANSACTION_BY_BLOCK_NUMBER_AND_INDEX, router.clone())
            .cached()
            .before_request(latest_param(0)),
        Method::new(ETH_GET_TRANSACTION_RECEIPT, router.clone()).cached(),
        Method::new(ETH_GET_UNCLE_BY_BLOCK_HASH_AND_INDEX, router.clone()).cached(),
        Method::new(ETH_GET_UNCLE_BY_BLOCK_NUMBER_AND_INDEX, router)
            .cached()
            .before_request(latest_param(0)),
    ]
}

fn net_methods(network_id: u64) -> Vec<Method> {
    vec![
        Method::new(NET_VERSION, Arc::new(StaticRouter::new(json!(network_id)))),
        Method::new(NET_LISTENING, Arc::new(StaticRouter::new(json!(true)))),
        Method::new(NET_PEER_COUNT, Arc::new(StaticRouter::new(json!(1)))),
    ]
}

fn web3_methods(router: Arc<dyn Router>) -> Vec<Method> {
    vec![
        Method::new(WEB3_SHA3, router),
        Method::new(
            WEB3_CLIENT_VERSION,
            Arc::new(StaticRouter::new(json!(CLIENT_VERSION))),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn registry() -> MethodRegistry {
        let head = HeadHandle::default();
        let router: Arc<dyn Router> = Arc::new(StaticRouter::new(json!(null)));
        build(1, &head, router).unwrap()
    }

    #[test]
    fn full_table_is_registered() {
        let registry = registry();
        assert_eq!(registry.len(), 22);
        for name in &[
            ETH_BLOCK_NUMBER,
            ETH_GET_BALANCE,
            ETH_GET_BLOCK_BY_NUMBER,
            NET_VERSION,
            WEB3_SHA3,
            WEB3_CLIENT_VERSION,
        ] {
            assert!(registry.get(name).is_some(), "missing {}", name);
        }
    }

    #[test]
    fn cache_policy_follows_the_table() {
        let registry = registry();
        assert!(!registry.get(ETH_BLOCK_NUMBER).unwrap().cache());
        assert!(!registry.get(WEB3_SHA3).unwrap().cache());
        assert!(registry.get(ETH_GET_BALANCE).unwrap().cache());
        assert!(registry.get(ETH_GET_TRANSACTION_RECEIPT).unwrap().cache());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut methods = HashMap::new();
        let router: Arc<dyn Router> = Arc::new(StaticRouter::new(json!(null)));
        register(&mut methods, vec![Method::new(NET_VERSION, router.clone())]).unwrap();
        let error =
            register(&mut methods, vec![Method::new(NET_VERSION, router)]).unwrap_err();
        assert_eq!(
            error.to_string(),
            "a method is already registered with the name 'net_version'"
        );
    }
}
