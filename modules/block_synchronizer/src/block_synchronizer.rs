//! Breakwater block synchronizer module for Caryatid
//! Runs sync rounds against peers: sample identifiers, compute the
//! unseen suffix, fetch and reassemble the blocks, hand the ordered
//! batch to the applier

pub mod block_sequence;
pub mod configuration;
pub mod expected_blocks;

use block_sequence::{relative_complement, BlockSequence};
use breakwater_common::{
    messages::{CandidateBatchMessage, GetBlockIdsMessage, GetBlocksMessage, Message},
    Block, BlockId, Height,
};
use configuration::SynchronizerConfig;
use expected_blocks::ExpectedBlocks;

use anyhow::{bail, Result};
use caryatid_sdk::{module, Context};
use config::Config;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// How far the identifier sample may deepen when no common point is
/// found, as a multiple of the configured sample size.
const MAX_SAMPLE_GROWTH: usize = 8;

/// How a sync round ended, for logging and for pacing the next one.
enum RoundEnd {
    /// A batch was published for application
    Published(usize),
    /// The peer had nothing we lack
    NothingNew,
    /// No common point; the next round samples deeper
    NoIntersection,
    /// A wait expired; a fresh round follows
    TimedOut,
    /// The control topic aborted the round
    Cancelled,
}

/// What one round should ask the peer for, given its identifier reply.
#[derive(Debug, PartialEq, Eq)]
enum WindowPlan {
    /// The peer offered nothing beyond what we hold
    NothingNew,
    /// The peer's offer shares no identifier with our sample; requesting
    /// its blocks would only die on an unknown parent
    NoIntersection,
    /// Fetch these, in chain order
    Request(Vec<BlockId>),
}

/// How a block-collection phase ended.
enum CollectEnd {
    Complete,
    TimedOut,
    Cancelled,
}

/// Our own recent chain identifiers, maintained from chain events.
///
/// Shared between the chain-tracking task and the round loop.
struct RecentIds {
    /// `(height, id)` in height order, bounded window
    entries: Vec<(Height, BlockId)>,
    limit: usize,
}

impl RecentIds {
    fn new(limit: usize) -> Self {
        let genesis = Block::genesis();
        Self {
            entries: vec![(0, genesis.id)],
            limit,
        }
    }

    /// Record a committed block. Entries at or above its height are
    /// stale (a rollback notice may have been missed) and are dropped.
    fn applied(&mut self, height: Height, id: BlockId) {
        self.entries.retain(|(h, _)| *h < height);
        self.entries.push((height, id));
        if self.entries.len() > self.limit {
            let excess = self.entries.len() - self.limit;
            self.entries.drain(..excess);
        }
    }

    /// Drop everything above the rollback target.
    fn rolled_back(&mut self, to_height: Height) {
        self.entries.retain(|(h, _)| *h <= to_height);
    }

    /// The most recent `depth` identifiers, oldest first.
    fn sample(&self, depth: usize) -> Vec<BlockId> {
        let start = self.entries.len().saturating_sub(depth);
        self.entries[start..].iter().map(|(_, id)| *id).collect()
    }
}

type SharedRecentIds = Arc<Mutex<RecentIds>>;

/// Block synchronizer module
/// Parameterised by the outer message enum used on the bus
#[module(
    message_type(Message),
    name = "block-synchronizer",
    description = "Peer sync orchestration and batch reassembly"
)]
pub struct BlockSynchronizer;

impl BlockSynchronizer {
    /// Main init function
    pub async fn init(&self, context: Arc<Context<Message>>, config: Arc<Config>) -> Result<()> {
        let cfg = SynchronizerConfig::try_load(&config)?;
        info!(
            "Sync window {} blocks, sample {} ids",
            cfg.max_batch_size, cfg.id_sample_size
        );

        // Bridge bus subscriptions into plain channels so the round
        // logic stays independent of the bus
        let mut peer_ids = Self::spawn_ids_forwarder(context.clone(), &cfg.ids_topic).await?;
        let mut raw_blocks =
            Self::spawn_blocks_forwarder(context.clone(), &cfg.blocks_topic).await?;

        // Track our recent identifiers from chain events in a side task
        let recent_ids =
            Self::spawn_chain_tracker(context.clone(), &cfg.chain_topic, cfg.id_sample_size).await?;

        // Forward control-topic messages into a cancellation signal
        let mut cancel = Self::spawn_cancel_forwarder(context.clone(), &cfg.control_topic).await?;

        context.clone().run(async move {
            let mut sequence = BlockSequence::new(cfg.max_batch_size);
            let mut sample_depth = cfg.id_sample_size;

            loop {
                let span = info_span!("sync_round", depth = sample_depth);
                let outcome = run_round(
                    &context,
                    &cfg,
                    &recent_ids,
                    &mut sequence,
                    sample_depth,
                    &mut peer_ids,
                    &mut raw_blocks,
                    &mut cancel,
                )
                .instrument(span)
                .await;

                match outcome {
                    Ok(RoundEnd::Published(count)) => {
                        info!("Published batch of {count} blocks");
                        sample_depth = cfg.id_sample_size;
                    }
                    Ok(RoundEnd::NothingNew) => {
                        sample_depth = cfg.id_sample_size;
                        sleep(cfg.round_delay()).await;
                    }
                    Ok(RoundEnd::NoIntersection) => {
                        // The peer's window starts beyond our sample:
                        // offer older identifiers next time
                        sample_depth =
                            (sample_depth * 2).min(cfg.id_sample_size * MAX_SAMPLE_GROWTH);
                        warn!("No common point with peer, deepening sample to {sample_depth}");
                        sleep(cfg.round_delay()).await;
                    }
                    Ok(RoundEnd::TimedOut) => {
                        warn!("Sync round timed out, abandoning");
                        sleep(cfg.round_delay()).await;
                    }
                    Ok(RoundEnd::Cancelled) => {
                        info!("Sync round cancelled");
                        sleep(cfg.round_delay()).await;
                    }
                    Err(e) => {
                        error!("Sync round failed: {e}");
                        return;
                    }
                }
            }
        });

        Ok(())
    }

    /// Forward peer identifier replies into a channel.
    async fn spawn_ids_forwarder(
        context: Arc<Context<Message>>,
        topic: &str,
    ) -> Result<mpsc::Receiver<Vec<BlockId>>> {
        let (tx, rx) = mpsc::channel(32);

        let mut subscription = context.subscribe(topic).await?;
        tokio::spawn(async move {
            while let Ok((_, message)) = subscription.read().await {
                if let Message::BlockIdsReceived(received) = message.as_ref() {
                    debug!("Peer {} offered {} ids", received.peer, received.ids.len());
                    let _ = tx.send(received.ids.clone()).await;
                }
            }
        });

        Ok(rx)
    }

    /// Forward raw block deliveries into a channel.
    async fn spawn_blocks_forwarder(
        context: Arc<Context<Message>>,
        topic: &str,
    ) -> Result<mpsc::Receiver<Vec<u8>>> {
        let (tx, rx) = mpsc::channel(1024);

        let mut subscription = context.subscribe(topic).await?;
        tokio::spawn(async move {
            while let Ok((_, message)) = subscription.read().await {
                if let Message::RawBlockReceived(received) = message.as_ref() {
                    let _ = tx.send(received.bytes.clone()).await;
                }
            }
        });

        Ok(rx)
    }

    /// Maintain the recent-identifier window from chain events.
    async fn spawn_chain_tracker(
        context: Arc<Context<Message>>,
        topic: &str,
        sample_size: usize,
    ) -> Result<SharedRecentIds> {
        // Keep enough history for the deepest sample
        let recent = Arc::new(Mutex::new(RecentIds::new(sample_size * MAX_SAMPLE_GROWTH)));

        let mut subscription = context.subscribe(topic).await?;
        let shared = recent.clone();
        tokio::spawn(async move {
            while let Ok((_, message)) = subscription.read().await {
                match message.as_ref() {
                    Message::BlockApplied(applied) => {
                        shared.lock().unwrap().applied(applied.height, applied.block.id);
                    }
                    Message::RolledBack(rolled_back) => {
                        shared.lock().unwrap().rolled_back(rolled_back.to_height);
                    }
                    _ => {}
                }
            }
        });

        Ok(recent)
    }

    /// Any message on the control topic aborts the round in flight.
    async fn spawn_cancel_forwarder(
        context: Arc<Context<Message>>,
        topic: &str,
    ) -> Result<watch::Receiver<bool>> {
        let (tx, rx) = watch::channel(false);

        let mut subscription = context.subscribe(topic).await?;
        tokio::spawn(async move {
            while let Ok((_, _)) = subscription.read().await {
                let _ = tx.send(true);
            }
        });

        Ok(rx)
    }
}

/// One sync round: sample, complement, fetch, reassemble, publish.
///
/// Cancellation and timeouts are observed only at the waits; everything
/// between them is ordinary sequential code.
#[allow(clippy::too_many_arguments)]
async fn run_round(
    context: &Arc<Context<Message>>,
    cfg: &SynchronizerConfig,
    recent_ids: &SharedRecentIds,
    sequence: &mut BlockSequence,
    sample_depth: usize,
    peer_ids: &mut mpsc::Receiver<Vec<BlockId>>,
    raw_blocks: &mut mpsc::Receiver<Vec<u8>>,
    cancel: &mut watch::Receiver<bool>,
) -> Result<RoundEnd> {
    // Mark the round boundary so a stale cancel does not abort us
    cancel.borrow_and_update();

    let known = recent_ids.lock().unwrap().sample(sample_depth);

    let request = Arc::new(Message::GetBlockIds(GetBlockIdsMessage {
        known: known.clone(),
    }));
    context.message_bus.publish(&cfg.request_topic, request).await?;

    // Wait for the peer's identifier list
    let offered = tokio::select! {
        _ = cancel.changed() => return Ok(RoundEnd::Cancelled),
        result = timeout(cfg.ids_timeout(), peer_ids.recv()) => match result {
            Ok(Some(ids)) => ids,
            Ok(None) => bail!("peer identifier channel closed"),
            Err(_) => return Ok(RoundEnd::TimedOut),
        },
    };

    let wanted = match plan_window(&known, &offered, cfg.max_batch_size) {
        WindowPlan::NothingNew => {
            debug!("Peer has nothing new");
            return Ok(RoundEnd::NothingNew);
        }
        WindowPlan::NoIntersection => return Ok(RoundEnd::NoIntersection),
        WindowPlan::Request(ids) => ids,
    };

    // Build the window for this round
    sequence.reset();
    for id in &wanted {
        sequence.push_id(*id);
    }
    info!("Requesting {} blocks", wanted.len());

    let request = Arc::new(Message::GetBlocks(GetBlocksMessage {
        ids: wanted.clone(),
    }));
    context.message_bus.publish(&cfg.request_topic, request).await?;

    match collect_blocks(
        sequence,
        &wanted,
        raw_blocks,
        cancel,
        cfg.block_timeout(),
        cfg.batch_timeout(),
    )
    .await
    {
        CollectEnd::Cancelled => return Ok(RoundEnd::Cancelled),
        CollectEnd::Complete => {}
        CollectEnd::TimedOut => warn!("Block wait expired"),
    }

    // Publish whatever contiguous prefix came together; a partial round
    // still advances the chain, and the rest is picked up next round
    let blocks = sequence.blocks();
    if blocks.is_empty() {
        return Ok(RoundEnd::TimedOut);
    }

    let count = blocks.len();
    if count < wanted.len() {
        warn!("Batch incomplete, publishing prefix of {count}");
    }
    let batch = Arc::new(Message::CandidateBatch(CandidateBatchMessage { blocks }));
    context.message_bus.publish(&cfg.batch_topic, batch).await?;

    Ok(RoundEnd::Published(count))
}

/// Decide what to fetch from the peer's identifier reply.
///
/// Without a common point, the offered blocks cannot attach to our
/// chain, whatever our own sample looks like: the round is abandoned
/// rather than requesting a batch doomed to an unknown parent.
fn plan_window(known: &[BlockId], offered: &[BlockId], max: usize) -> WindowPlan {
    if offered.is_empty() {
        return WindowPlan::NothingNew;
    }

    let (suffix, intersects) = relative_complement(known, offered);
    if !intersects {
        return WindowPlan::NoIntersection;
    }
    if suffix.is_empty() {
        return WindowPlan::NothingNew;
    }
    WindowPlan::Request(suffix.into_iter().take(max).collect())
}

/// Collect the requested blocks: raw arrivals go through the reorder
/// buffer, ordered releases land in the window.
///
/// Bounded by a per-block wait and a whole-batch deadline; whichever is
/// nearer governs each wait. On expiry the window keeps whatever prefix
/// has come together.
async fn collect_blocks(
    sequence: &mut BlockSequence,
    wanted: &[BlockId],
    raw_blocks: &mut mpsc::Receiver<Vec<u8>>,
    cancel: &mut watch::Receiver<bool>,
    block_timeout: Duration,
    batch_timeout: Duration,
) -> CollectEnd {
    let (tx, mut ordered) = mpsc::channel(wanted.len().max(1));
    let expected = ExpectedBlocks::new(wanted, tx);
    let deadline = Instant::now() + batch_timeout;

    while expected.has_next() {
        let wait = block_timeout.min(deadline.saturating_duration_since(Instant::now()));
        if wait.is_zero() {
            return CollectEnd::TimedOut;
        }

        let bytes = tokio::select! {
            _ = cancel.changed() => return CollectEnd::Cancelled,
            result = timeout(wait, raw_blocks.recv()) => match result {
                Ok(Some(bytes)) => bytes,
                Ok(None) => return CollectEnd::TimedOut,
                Err(_) => return CollectEnd::TimedOut,
            },
        };

        if let Err(e) = expected.add(&bytes) {
            warn!("Dropping block: {e}");
        }

        while let Ok(block) = ordered.try_recv() {
            sequence.put_block(block);
        }
    }

    CollectEnd::Complete
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u8) -> BlockId {
        BlockId::new([n; 32])
    }

    fn chain_blocks(n: u8) -> Vec<Block> {
        let mut out: Vec<Block> = Vec::new();
        for i in 0..n {
            let parent = out.last().map(|b| b.id).unwrap_or_default();
            out.push(Block::new(parent, 1000, i as u64, vec![], vec![]).unwrap());
        }
        out
    }

    #[test]
    fn recent_ids_window_tracks_applies_and_rollbacks() {
        let mut recent = RecentIds::new(4);
        recent.applied(1, id(1));
        recent.applied(2, id(2));
        recent.applied(3, id(3));

        assert_eq!(recent.sample(2), vec![id(2), id(3)]);

        recent.rolled_back(1);
        assert_eq!(recent.sample(10).last(), Some(&id(1)));

        // Replacement chain after the rollback
        recent.applied(2, id(9));
        assert_eq!(recent.sample(2), vec![id(1), id(9)]);
    }

    #[test]
    fn recent_ids_drops_stale_entries_on_reapply() {
        let mut recent = RecentIds::new(4);
        recent.applied(1, id(1));
        recent.applied(2, id(2));

        // A missed rollback notice: height 1 is recommitted directly
        recent.applied(1, id(7));
        assert_eq!(recent.sample(10).len(), 2); // genesis + new height 1
        assert_eq!(recent.sample(1), vec![id(7)]);
    }

    #[test]
    fn recent_ids_window_is_bounded() {
        let mut recent = RecentIds::new(3);
        for i in 1..=10u8 {
            recent.applied(i as Height, id(i));
        }
        let all = recent.sample(100);
        assert_eq!(all.len(), 3);
        assert_eq!(all, vec![id(8), id(9), id(10)]);
    }

    #[test]
    fn recent_ids_starts_from_genesis() {
        let recent = RecentIds::new(4);
        assert_eq!(recent.sample(10), vec![Block::genesis().id]);
    }

    #[test]
    fn plan_requests_the_unseen_suffix() {
        let plan = plan_window(&[id(1), id(2)], &[id(2), id(3), id(4)], 100);
        assert_eq!(plan, WindowPlan::Request(vec![id(3), id(4)]));
    }

    #[test]
    fn plan_truncates_to_the_window() {
        let plan = plan_window(&[id(1)], &[id(1), id(2), id(3), id(4)], 2);
        assert_eq!(plan, WindowPlan::Request(vec![id(2), id(3)]));
    }

    #[test]
    fn plan_sees_nothing_new_in_identical_or_empty_offers() {
        assert_eq!(
            plan_window(&[id(1), id(2)], &[id(1), id(2)], 100),
            WindowPlan::NothingNew
        );
        assert_eq!(plan_window(&[id(1)], &[], 100), WindowPlan::NothingNew);
    }

    #[test]
    fn plan_abandons_without_a_common_point() {
        assert_eq!(
            plan_window(&[id(1), id(2)], &[id(3), id(4)], 100),
            WindowPlan::NoIntersection
        );

        // A genesis-only node gets no carve-out: an offer that excludes
        // genesis cannot attach to its chain either
        assert_eq!(
            plan_window(&[Block::genesis().id], &[id(3), id(4)], 100),
            WindowPlan::NoIntersection
        );
    }

    #[tokio::test]
    async fn collection_observes_cancellation_between_arrivals() {
        let chain = chain_blocks(2);
        let wanted: Vec<BlockId> = chain.iter().map(|b| b.id).collect();
        let mut sequence = BlockSequence::new(4);
        for id in &wanted {
            sequence.push_id(*id);
        }

        // Keep the sender alive so the wait pends rather than closing
        let (_raw_tx, mut raw_rx) = mpsc::channel::<Vec<u8>>(4);
        let (cancel_tx, mut cancel) = watch::channel(false);
        cancel_tx.send(true).unwrap();

        let end = collect_blocks(
            &mut sequence,
            &wanted,
            &mut raw_rx,
            &mut cancel,
            Duration::from_secs(30),
            Duration::from_secs(120),
        )
        .await;

        assert!(matches!(end, CollectEnd::Cancelled));
        assert!(sequence.blocks().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn collection_timeout_keeps_the_contiguous_prefix() {
        let chain = chain_blocks(3);
        let wanted: Vec<BlockId> = chain.iter().map(|b| b.id).collect();
        let mut sequence = BlockSequence::new(4);
        for id in &wanted {
            sequence.push_id(*id);
        }

        let (raw_tx, mut raw_rx) = mpsc::channel::<Vec<u8>>(4);
        raw_tx.send(chain[0].to_bytes().unwrap()).await.unwrap();
        raw_tx.send(chain[1].to_bytes().unwrap()).await.unwrap();
        // The third block never arrives; paused time elapses the wait

        let (_cancel_tx, mut cancel) = watch::channel(false);
        let end = collect_blocks(
            &mut sequence,
            &wanted,
            &mut raw_rx,
            &mut cancel,
            Duration::from_secs(30),
            Duration::from_secs(120),
        )
        .await;

        assert!(matches!(end, CollectEnd::TimedOut));
        let blocks = sequence.blocks();
        assert_eq!(
            blocks.iter().map(|b| b.id).collect::<Vec<_>>(),
            vec![chain[0].id, chain[1].id]
        );
        assert!(!sequence.is_full());
    }

    #[tokio::test(start_paused = true)]
    async fn batch_deadline_bounds_the_whole_collection() {
        let chain = chain_blocks(2);
        let wanted: Vec<BlockId> = chain.iter().map(|b| b.id).collect();
        let mut sequence = BlockSequence::new(4);
        for id in &wanted {
            sequence.push_id(*id);
        }

        let (_raw_tx, mut raw_rx) = mpsc::channel::<Vec<u8>>(4);
        let (_cancel_tx, mut cancel) = watch::channel(false);

        // Batch deadline tighter than the per-block wait governs
        let started = Instant::now();
        let end = collect_blocks(
            &mut sequence,
            &wanted,
            &mut raw_rx,
            &mut cancel,
            Duration::from_secs(30),
            Duration::from_secs(10),
        )
        .await;

        assert!(matches!(end, CollectEnd::TimedOut));
        assert!(started.elapsed() <= Duration::from_secs(11));
    }

    #[tokio::test]
    async fn out_of_order_arrivals_complete_in_request_order() {
        let chain = chain_blocks(3);
        let wanted: Vec<BlockId> = chain.iter().map(|b| b.id).collect();
        let mut sequence = BlockSequence::new(4);
        for id in &wanted {
            sequence.push_id(*id);
        }

        let (raw_tx, mut raw_rx) = mpsc::channel::<Vec<u8>>(4);
        for block in chain.iter().rev() {
            raw_tx.send(block.to_bytes().unwrap()).await.unwrap();
        }

        let (_cancel_tx, mut cancel) = watch::channel(false);
        let end = collect_blocks(
            &mut sequence,
            &wanted,
            &mut raw_rx,
            &mut cancel,
            Duration::from_secs(30),
            Duration::from_secs(120),
        )
        .await;

        assert!(matches!(end, CollectEnd::Complete));
        assert!(sequence.is_full());
        assert_eq!(
            sequence.blocks().iter().map(|b| b.id).collect::<Vec<_>>(),
            wanted
        );
    }
}
