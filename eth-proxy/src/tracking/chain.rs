//! Reconstructs the canonical chain from per-client head announcements.
//!
//! The tracker owns a hash-indexed block map fed by the client status
//! watch. The canonical head is the observed block with the greatest
//! total difficulty. External readers never touch the map directly:
//! they either load the head through an atomic pointer or receive a
//! snapshot through a listener channel.

use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use anyhow::Result as AnyResult;
use arc_swap::ArcSwapOption;
use futures::{Stream, StreamExt};
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use types::{
    nats::{Entry, Operation},
    ClientId, ClientStatus,
};
use web3::types::{H256, U256, U64};

use crate::statistics::{CHAIN_HEAD_NUMBER, CHAIN_UPDATES, TRACKED_BLOCKS};

/// A block as observed through client status announcements. Only the
/// client id set mutates after creation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub number:           U64,
    pub hash:             H256,
    pub parent_hash:      H256,
    pub difficulty:       U256,
    pub total_difficulty: U256,
    pub client_ids:       BTreeSet<ClientId>,
}

/// Read-only view over the tracked chain, handed to listeners.
#[derive(Clone, Debug, Default)]
pub struct ChainSnapshot {
    head:           Option<Arc<Block>>,
    blocks_by_hash: HashMap<H256, Arc<Block>>,
}

impl ChainSnapshot {
    #[must_use]
    pub const fn head(&self) -> Option<&Arc<Block>> {
        self.head.as_ref()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks_by_hash.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks_by_hash.is_empty()
    }

    /// Union of the client ids announced on the `max_distance + 1` most
    /// recent canonical blocks, walking parent links from the head.
    #[must_use]
    pub fn clients_near_head(&self, max_distance: u64) -> BTreeSet<ClientId> {
        let mut clients = BTreeSet::new();
        let mut cursor = self.head.clone();
        let mut distance = 0;
        while let Some(block) = cursor {
            if distance > max_distance {
                break;
            }
            clients.extend(block.client_ids.iter().cloned());
            cursor = self.blocks_by_hash.get(&block.parent_hash).cloned();
            distance += 1;
        }
        clients
    }
}

/// Cheaply cloneable handle on the canonical head.
#[derive(Clone, Debug, Default)]
pub struct HeadHandle(Arc<ArcSwapOption<Block>>);

impl HeadHandle {
    #[must_use]
    pub fn load(&self) -> Option<Arc<Block>> {
        self.0.load_full()
    }

    pub(crate) fn store(&self, block: Option<Arc<Block>>) {
        self.0.store(block);
    }
}

pub struct CanonicalChain {
    network_id:             u64,
    chain_id:               u64,
    max_distance_from_head: u64,
    blocks_by_hash:         HashMap<H256, Block>,
    head:                   HeadHandle,
    listeners:              Vec<watch::Sender<ChainSnapshot>>,
}

impl CanonicalChain {
    #[must_use]
    pub fn new(network_id: u64, chain_id: u64, max_distance_from_head: u64) -> Self {
        Self {
            network_id,
            chain_id,
            max_distance_from_head,
            blocks_by_hash: HashMap::new(),
            head: HeadHandle::default(),
            listeners: Vec::new(),
        }
    }

    #[must_use]
    pub fn head_handle(&self) -> HeadHandle {
        self.head.clone()
    }

    /// Register a listener. Delivery is fire-and-forget per listener:
    /// a slow listener only ever misses intermediate snapshots.
    pub fn add_listener(&mut self) -> watch::Receiver<ChainSnapshot> {
        let (tx, rx) = watch::channel(ChainSnapshot::default());
        self.listeners.push(tx);
        rx
    }

    /// Spawn the processing task. It exits cleanly when `updates` ends
    /// or `cancel` fires; a watch failure surfaces as an error so the
    /// supervisor can act on it.
    pub fn start<S>(self, updates: S, cancel: CancellationToken) -> JoinHandle<AnyResult<()>>
    where
        S: Stream<Item = AnyResult<Entry<ClientStatus>>> + Send + 'static,
    {
        tokio::spawn(self.process(updates, cancel))
    }

    async fn process<S>(mut self, updates: S, cancel: CancellationToken) -> AnyResult<()>
    where
        S: Stream<Item = AnyResult<Entry<ClientStatus>>> + Send,
    {
        debug!(
            network_id = self.network_id,
            chain_id = self.chain_id,
            max_distance_from_head = self.max_distance_from_head,
            "tracking canonical chain"
        );
        tokio::pin!(updates);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                update = updates.next() => {
                    let entry = match update {
                        None => {
                            debug!("client status watch closed, no more updates will be processed");
                            return Ok(());
                        }
                        Some(Err(error)) => {
                            return Err(error.context("client status watch failed"));
                        }
                        Some(Ok(entry)) => entry,
                    };
                    self.apply(&entry);
                }
            }
        }
    }

    fn apply(&mut self, entry: &Entry<ClientStatus>) {
        CHAIN_UPDATES.inc();
        match entry.operation() {
            Operation::Put => self.apply_put(entry),
            Operation::Delete | Operation::Purge => self.remove_client(entry.key()),
        }
        self.prune();
        self.publish();
    }

    fn apply_put(&mut self, entry: &Entry<ClientStatus>) {
        let status = match entry.value() {
            Ok(status) => status,
            Err(error) => {
                warn!(%error, key = entry.key(), "failed to decode client status");
                return;
            }
        };
        let head = match &status.head {
            Some(head) => head,
            None => {
                debug!(key = entry.key(), "client status carries no head, skipping");
                return;
            }
        };

        // register that this client has announced the block
        let block = self
            .blocks_by_hash
            .entry(head.block_hash)
            .or_insert_with(|| Block {
                number:           head.block_number,
                hash:             head.block_hash,
                parent_hash:      head.parent_hash,
                difficulty:       head.difficulty,
                total_difficulty: head.total_difficulty,
                client_ids:       BTreeSet::new(),
            });
        block.client_ids.insert(entry.key().to_owned());
        debug!(
            number = %block.number,
            hash = ?block.hash,
            clients = block.client_ids.len(),
            "updated block"
        );

        // the block with the greatest total difficulty is the head;
        // ties keep the current head
        let candidate = block.clone();
        let replace = self
            .head
            .load()
            .map_or(true, |current| candidate.total_difficulty > current.total_difficulty);
        if replace {
            self.head.store(Some(Arc::new(candidate)));
        }
    }

    fn remove_client(&mut self, client_id: &str) {
        self.blocks_by_hash.retain(|_, block| {
            block.client_ids.remove(client_id);
            !block.client_ids.is_empty()
        });
        self.refresh_head();
    }

    /// Re-derive the head when the previous one is no longer retained.
    fn refresh_head(&self) {
        let still_tracked = self
            .head
            .load()
            .map_or(false, |head| self.blocks_by_hash.contains_key(&head.hash));
        if still_tracked {
            return;
        }
        let best = self
            .blocks_by_hash
            .values()
            .max_by(|a, b| a.total_difficulty.cmp(&b.total_difficulty))
            .cloned();
        self.head.store(best.map(Arc::new));
    }

    fn prune(&mut self) {
        let head_number = match self.head.load() {
            Some(head) => head.number,
            None => return,
        };
        let max_distance = self.max_distance_from_head;
        // the head itself is at distance zero and always survives
        self.blocks_by_hash
            .retain(|_, block| distance(head_number, block.number) <= max_distance);
    }

    fn publish(&self) {
        let snapshot = self.snapshot();
        #[allow(clippy::cast_possible_wrap)]
        TRACKED_BLOCKS.set(snapshot.len() as i64);
        if let Some(head) = snapshot.head() {
            #[allow(clippy::cast_possible_wrap)]
            CHAIN_HEAD_NUMBER.set(head.number.as_u64() as i64);
        }
        for listener in &self.listeners {
            // a closed listener is ignored
            let _ = listener.send(snapshot.clone());
        }
        debug!(blocks = snapshot.len(), "chain updated");
    }

    fn snapshot(&self) -> ChainSnapshot {
        let blocks_by_hash: HashMap<H256, Arc<Block>> = self
            .blocks_by_hash
            .iter()
            .map(|(hash, block)| (*hash, Arc::new(block.clone())))
            .collect();
        let head = self
            .head
            .load()
            .and_then(|head| blocks_by_hash.get(&head.hash).cloned());
        ChainSnapshot {
            head,
            blocks_by_hash,
        }
    }
}

fn distance(a: U64, b: U64) -> u64 {
    if a >= b {
        (a - b).as_u64()
    } else {
        (b - a).as_u64()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use time::OffsetDateTime;
    use tracing_test::traced_test;
    use types::Head;

    use super::*;

    const BUCKET: &str = "eth_1_1_client_statuses";

    fn put_entry(client: &str, number: u64, hash: u8, parent: u8, td: u64) -> Entry<ClientStatus> {
        let status = ClientStatus {
            id:          client.to_owned(),
            head:        Some(Head {
                block_number:     U64::from(number),
                block_hash:       H256::repeat_byte(hash),
                parent_hash:      H256::repeat_byte(parent),
                difficulty:       U256::from(1),
                total_difficulty: U256::from(td),
            }),
            sync_status: None,
        };
        Entry::new(
            BUCKET.to_owned(),
            client.to_owned(),
            Bytes::from(serde_json::to_vec(&status).unwrap()),
            1,
            0,
            OffsetDateTime::UNIX_EPOCH,
            Operation::Put,
        )
    }

    fn delete_entry(client: &str) -> Entry<ClientStatus> {
        Entry::new(
            BUCKET.to_owned(),
            client.to_owned(),
            Bytes::new(),
            1,
            0,
            OffsetDateTime::UNIX_EPOCH,
            Operation::Delete,
        )
    }

    fn chain(max_distance: u64) -> CanonicalChain {
        CanonicalChain::new(1, 1, max_distance)
    }

    #[test]
    fn put_registers_block_and_head() {
        let mut chain = chain(12);
        let head = chain.head_handle();
        chain.apply(&put_entry("c1", 0x10, 1, 0, 0x100));

        let current = head.load().unwrap();
        assert_eq!(current.number, U64::from(0x10));
        assert_eq!(current.hash, H256::repeat_byte(1));
        assert!(chain.blocks_by_hash[&H256::repeat_byte(1)]
            .client_ids
            .contains("c1"));
    }

    #[test]
    fn greater_total_difficulty_replaces_head() {
        let mut chain = chain(12);
        let head = chain.head_handle();
        chain.apply(&put_entry("c1", 0x10, 1, 0, 0x100));
        chain.apply(&put_entry("c2", 0x11, 2, 1, 0x200));

        assert_eq!(head.load().unwrap().hash, H256::repeat_byte(2));
        assert_eq!(
            chain.snapshot().clients_near_head(0),
            vec!["c2".to_owned()].into_iter().collect::<BTreeSet<_>>()
        );
    }

    #[test]
    fn lower_total_difficulty_does_not_regress_head() {
        let mut chain = chain(12);
        let head = chain.head_handle();
        chain.apply(&put_entry("c1", 0x11, 2, 1, 0x200));
        chain.apply(&put_entry("c1", 0x10, 1, 0, 0x150));

        assert_eq!(head.load().unwrap().number, U64::from(0x11));
    }

    #[test]
    fn equal_total_difficulty_keeps_current_head() {
        let mut chain = chain(12);
        let head = chain.head_handle();
        chain.apply(&put_entry("c1", 0x10, 1, 0, 0x100));
        chain.apply(&put_entry("c2", 0x10, 9, 0, 0x100));

        assert_eq!(head.load().unwrap().hash, H256::repeat_byte(1));
    }

    #[test]
    fn delete_evicts_blocks_and_head_falls_back() {
        let mut chain = chain(12);
        let head = chain.head_handle();
        chain.apply(&put_entry("c1", 0x10, 1, 0, 0x100));
        chain.apply(&put_entry("c2", 0x11, 2, 1, 0x200));
        chain.apply(&delete_entry("c2"));

        assert!(!chain.blocks_by_hash.contains_key(&H256::repeat_byte(2)));
        assert_eq!(head.load().unwrap().total_difficulty, U256::from(0x100));
        assert_eq!(
            chain.snapshot().clients_near_head(0),
            vec!["c1".to_owned()].into_iter().collect::<BTreeSet<_>>()
        );
    }

    #[test]
    fn delete_of_last_client_clears_head() {
        let mut chain = chain(12);
        let head = chain.head_handle();
        chain.apply(&put_entry("c1", 0x10, 1, 0, 0x100));
        chain.apply(&delete_entry("c1"));

        assert!(head.load().is_none());
        assert!(chain.blocks_by_hash.is_empty());
    }

    #[test]
    #[traced_test]
    fn undecodable_status_is_skipped() {
        let mut chain = chain(12);
        let entry = Entry::new(
            BUCKET.to_owned(),
            "c1".to_owned(),
            Bytes::from_static(b"not json"),
            1,
            0,
            OffsetDateTime::UNIX_EPOCH,
            Operation::Put,
        );
        chain.apply(&entry);
        assert!(chain.blocks_by_hash.is_empty());
        assert!(chain.head_handle().load().is_none());
        assert!(logs_contain("failed to decode client status"));
    }

    #[test]
    fn blocks_past_the_retention_distance_are_pruned() {
        let mut chain = chain(1);
        for number in 10..=13_u64 {
            #[allow(clippy::cast_possible_truncation)]
            chain.apply(&put_entry(
                &format!("c{}", number),
                number,
                number as u8,
                number as u8 - 1,
                number * 100,
            ));
        }
        let retained: BTreeSet<u64> = chain
            .blocks_by_hash
            .values()
            .map(|block| block.number.as_u64())
            .collect();
        assert_eq!(retained, vec![12, 13].into_iter().collect::<BTreeSet<_>>());
    }

    #[test]
    fn listeners_receive_the_latest_snapshot() {
        let mut chain = chain(12);
        let rx = chain.add_listener();
        chain.apply(&put_entry("c1", 0x10, 1, 0, 0x100));

        let snapshot = rx.borrow().clone();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.head().unwrap().number, U64::from(0x10));
    }

    #[test]
    fn walk_unions_clients_within_distance() {
        let mut chain = chain(12);
        chain.apply(&put_entry("c1", 0x10, 1, 0, 0x100));
        chain.apply(&put_entry("c2", 0x11, 2, 1, 0x200));
        chain.apply(&put_entry("c3", 0x12, 3, 2, 0x300));

        let snapshot = chain.snapshot();
        let near: Vec<String> = snapshot.clients_near_head(1).into_iter().collect();
        assert_eq!(near, vec!["c2".to_owned(), "c3".to_owned()]);
        let all: Vec<String> = snapshot.clients_near_head(2).into_iter().collect();
        assert_eq!(all, vec!["c1".to_owned(), "c2".to_owned(), "c3".to_owned()]);
    }

    proptest! {
        /// After any event sequence the tracker invariants hold: the
        /// head carries the greatest retained total difficulty, no
        /// retained block has an empty client set, and every retained
        /// block is within the retention distance of the head.
        #[test]
        fn invariants_hold_for_any_event_sequence(
            events in proptest::collection::vec(
                (any::<bool>(), 0..4_u8, 1..20_u64, 1..1000_u64),
                1..50,
            )
        ) {
            let max_distance = 5;
            let mut chain = chain(max_distance);
            for (is_put, client, number, td) in events {
                let client = format!("c{}", client);
                #[allow(clippy::cast_possible_truncation)]
                let entry = if is_put {
                    put_entry(&client, number, number as u8, number as u8 - 1, td)
                } else {
                    delete_entry(&client)
                };
                chain.apply(&entry);

                let head = chain.head_handle().load();
                let max_td = chain
                    .blocks_by_hash
                    .values()
                    .map(|block| block.total_difficulty)
                    .max();
                match (&head, max_td) {
                    (Some(head), Some(max_td)) => {
                        prop_assert_eq!(head.total_difficulty, max_td);
                        for block in chain.blocks_by_hash.values() {
                            prop_assert!(!block.client_ids.is_empty());
                            prop_assert!(distance(head.number, block.number) <= max_distance);
                        }
                    }
                    (None, None) => {}
                    (head, max_td) => {
                        prop_assert!(false, "head {:?} disagrees with retained blocks {:?}", head, max_td);
                    }
                }
            }
        }
    }
}
