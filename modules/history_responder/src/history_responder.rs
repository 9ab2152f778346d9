//! Breakwater history responder module for Caryatid
//! Answers peers' block identifier and block body queries from a local
//! mirror of the committed chain

use breakwater_common::{
    messages::{HistoryQuery, HistoryQueryResponse, Message},
    Block, BlockId, Height,
};
use anyhow::Result;
use caryatid_sdk::{module, Context};
use config::Config;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

const DEFAULT_CHAIN_TOPIC: &str = "breakwater.chain.events";
const DEFAULT_QUERY_TOPIC: &str = "breakwater.history.query";

/// Most identifiers returned for one query, whatever the caller asked for.
const MAX_IDS_PER_QUERY: u64 = 100;

/// Height-ordered mirror of the committed chain, kept current from
/// chain events and read by the query handler.
struct HistoryStore {
    /// Wire bytes per height; index 0 is genesis
    entries: Vec<(BlockId, Vec<u8>)>,
    index: HashMap<BlockId, Height>,
}

impl HistoryStore {
    fn new() -> Self {
        let genesis = Block::genesis();
        let bytes = genesis.to_bytes().expect("genesis block is always encodable");
        let mut index = HashMap::new();
        index.insert(genesis.id, 0);
        Self {
            entries: vec![(genesis.id, bytes)],
            index,
        }
    }

    /// Record a committed block. A rollback notice always precedes
    /// replacement blocks, so `height` is at most the current tip plus
    /// one; anything else means we missed events and cannot serve the
    /// gap.
    fn applied(&mut self, height: Height, block: &Block) -> Result<()> {
        if height as usize > self.entries.len() {
            warn!(
                height,
                tip = self.entries.len() - 1,
                "Gap in chain events, ignoring block"
            );
            return Ok(());
        }
        self.truncate_to(height.saturating_sub(1));
        let bytes = block.to_bytes()?;
        self.index.insert(block.id, height);
        self.entries.push((block.id, bytes));
        Ok(())
    }

    /// Drop everything above the rollback target.
    fn rolled_back(&mut self, to_height: Height) {
        self.truncate_to(to_height);
    }

    fn truncate_to(&mut self, height: Height) {
        for (id, _) in self.entries.drain((height as usize + 1).min(self.entries.len())..) {
            self.index.remove(&id);
        }
    }

    /// Ordered identifiers after `after`, or from genesis when `None`.
    /// An unknown `after` yields an empty list: no common point.
    fn block_ids(&self, after: Option<&BlockId>, limit: u64) -> Vec<BlockId> {
        let start = match after {
            None => 0,
            Some(id) => match self.index.get(id) {
                Some(height) => *height as usize + 1,
                None => return Vec::new(),
            },
        };
        let limit = limit.min(MAX_IDS_PER_QUERY) as usize;
        self.entries[start.min(self.entries.len())..]
            .iter()
            .take(limit)
            .map(|(id, _)| *id)
            .collect()
    }

    fn block(&self, id: &BlockId) -> Option<Vec<u8>> {
        self.index.get(id).map(|h| self.entries[*h as usize].1.clone())
    }

    fn blocks(&self, ids: &[BlockId]) -> Vec<Option<Vec<u8>>> {
        ids.iter().map(|id| self.block(id)).collect()
    }
}

/// History responder module
/// Parameterised by the outer message enum used on the bus
#[module(
    message_type(Message),
    name = "history-responder",
    description = "Chain history query responder"
)]
pub struct HistoryResponder;

impl HistoryResponder {
    /// Main init function
    pub async fn init(&self, context: Arc<Context<Message>>, config: Arc<Config>) -> Result<()> {
        let chain_topic =
            config.get_string("chain-topic").unwrap_or(DEFAULT_CHAIN_TOPIC.to_string());
        info!("Mirroring chain events from '{chain_topic}'");

        let query_topic =
            config.get_string("query-topic").unwrap_or(DEFAULT_QUERY_TOPIC.to_string());
        info!("Serving history queries on '{query_topic}'");

        let store = Arc::new(Mutex::new(HistoryStore::new()));

        let query_store = store.clone();
        context.handle(&query_topic, move |request| {
            let query_store = query_store.clone();
            async move {
                let Message::HistoryQuery(query) = request.as_ref() else {
                    return Arc::new(Message::HistoryQueryResponse(HistoryQueryResponse::Error(
                        "Invalid message for history query".into(),
                    )));
                };
                let store = query_store.lock().await;
                let response = match query {
                    HistoryQuery::GetBlockIds { after, limit } => {
                        HistoryQueryResponse::BlockIds(store.block_ids(after.as_ref(), *limit))
                    }
                    HistoryQuery::GetBlock { id } => {
                        HistoryQueryResponse::Block(store.block(id))
                    }
                    HistoryQuery::GetBlocks { ids } => {
                        HistoryQueryResponse::Blocks(store.blocks(ids))
                    }
                };
                Arc::new(Message::HistoryQueryResponse(response))
            }
        });

        let mut chain_subscription = context.subscribe(&chain_topic).await?;
        context.run(async move {
            loop {
                let Ok((_, message)) = chain_subscription.read().await else {
                    error!("Chain event read failed");
                    return;
                };

                match message.as_ref() {
                    Message::BlockApplied(applied) => {
                        let mut store = store.lock().await;
                        if let Err(e) = store.applied(applied.height, &applied.block) {
                            error!("Could not mirror block: {e}");
                        }
                    }
                    Message::RolledBack(rolled_back) => {
                        store.lock().await.rolled_back(rolled_back.to_height);
                    }
                    _ => {}
                }
            }
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(n: u8) -> (HistoryStore, Vec<Block>) {
        let mut store = HistoryStore::new();
        let mut blocks = vec![Block::genesis()];
        for i in 1..=n {
            let parent = blocks.last().unwrap().id;
            let block = Block::new(parent, 1000, i as u64, vec![], vec![]).unwrap();
            store.applied(i as Height, &block).unwrap();
            blocks.push(block);
        }
        (store, blocks)
    }

    #[test]
    fn serves_ids_from_genesis_when_no_cursor() {
        let (store, blocks) = chain(3);
        let ids = store.block_ids(None, 10);
        assert_eq!(ids, blocks.iter().map(|b| b.id).collect::<Vec<_>>());
    }

    #[test]
    fn serves_ids_after_a_known_cursor() {
        let (store, blocks) = chain(3);
        let ids = store.block_ids(Some(&blocks[1].id), 10);
        assert_eq!(ids, vec![blocks[2].id, blocks[3].id]);
    }

    #[test]
    fn unknown_cursor_yields_no_ids() {
        let (store, _) = chain(3);
        assert!(store.block_ids(Some(&BlockId::new([9; 32])), 10).is_empty());
    }

    #[test]
    fn limit_is_clamped() {
        let (store, _) = chain(5);
        assert_eq!(store.block_ids(None, 2).len(), 2);
        // An absurd limit cannot exceed the per-query cap
        assert!(store.block_ids(None, u64::MAX).len() <= MAX_IDS_PER_QUERY as usize);
    }

    #[test]
    fn serves_block_bodies_by_id() {
        let (store, blocks) = chain(2);
        let bytes = store.block(&blocks[2].id).unwrap();
        assert_eq!(Block::from_bytes(&bytes).unwrap(), blocks[2]);

        let results = store.blocks(&[blocks[1].id, BlockId::new([9; 32])]);
        assert!(results[0].is_some());
        assert!(results[1].is_none());
    }

    #[test]
    fn rollback_then_replacement_updates_the_mirror() {
        let (mut store, blocks) = chain(3);

        store.rolled_back(1);
        assert!(store.block(&blocks[2].id).is_none());
        assert!(store.block(&blocks[3].id).is_none());

        let rival = Block::new(blocks[1].id, 500, 99, vec![], vec![]).unwrap();
        store.applied(2, &rival).unwrap();
        assert_eq!(store.block_ids(Some(&blocks[1].id), 10), vec![rival.id]);
    }

    #[test]
    fn reapply_at_existing_height_replaces_the_suffix() {
        let (mut store, blocks) = chain(3);

        // Missed rollback notice: height 2 recommitted directly
        let rival = Block::new(blocks[1].id, 500, 99, vec![], vec![]).unwrap();
        store.applied(2, &rival).unwrap();

        assert!(store.block(&blocks[3].id).is_none());
        assert_eq!(store.block_ids(None, 10).len(), 3);
    }

    #[test]
    fn gap_in_events_is_ignored() {
        let (mut store, blocks) = chain(1);
        let far = Block::new(blocks[1].id, 1000, 50, vec![], vec![]).unwrap();

        store.applied(5, &far).unwrap();
        assert!(store.block(&far.id).is_none());
        assert_eq!(store.block_ids(None, 10).len(), 2);
    }
}
