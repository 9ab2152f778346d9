//! Breakwater chain applier module for Caryatid
//! Drives fork choice and block application over the owned ledger

pub mod applier;
pub mod applier_error;
pub mod applier_observer;

use applier::Applier;
use applier_observer::ApplierObserver;
use breakwater_common::{
    messages::{
        BlockAppliedMessage, Message, ProducerMessage, RolledBackMessage, ScoreUpdatedMessage,
    },
    Block, Height, Ledger, MemoryLedger, Score,
};
use anyhow::Result;
use caryatid_sdk::{module, Context};
use config::Config;
use std::sync::Arc;
use tracing::{error, info, info_span, warn, Instrument};

const DEFAULT_SUBSCRIBE_BATCHES_TOPIC: &str = "breakwater.sync.batch";
const DEFAULT_SUBSCRIBE_BLOCKS_TOPIC: &str = "breakwater.block.received";
const DEFAULT_PUBLISH_CHAIN_TOPIC: &str = "breakwater.chain.events";
const DEFAULT_PUBLISH_SCORE_TOPIC: &str = "breakwater.score.updated";
const DEFAULT_PUBLISH_PRODUCER_TOPIC: &str = "breakwater.producer";
const DEFAULT_MAX_ROLLBACK_DEPTH: u64 = 100;

/// Scores emitted by the applier observer, queued for async publishing.
///
/// Shared between the observer and the main loop.
type ScoreQueue = Arc<std::sync::Mutex<Vec<(Height, Score)>>>;

/// Observer that queues score events for later async publishing.
///
/// The production interrupt is deliberately not queued: a queued event
/// would only reach the bus after the commit, too late to stop anything.
/// The module publishes the interrupt itself before invoking the applier.
struct QueueObserver {
    scores: ScoreQueue,
}

impl ApplierObserver for QueueObserver {
    fn production_interrupt(&self) {}

    fn score_updated(&self, height: Height, score: &Score) {
        self.scores.lock().unwrap().push((height, score.clone()));
    }
}

/// Chain applier module
/// Parameterised by the outer message enum used on the bus
#[module(
    message_type(Message),
    name = "chain-applier",
    description = "Fork choice and block application"
)]
pub struct ChainApplier;

impl ChainApplier {
    /// Main init function
    pub async fn init(&self, context: Arc<Context<Message>>, config: Arc<Config>) -> Result<()> {
        // Get configuration
        let subscribe_batches_topic = config
            .get_string("subscribe-batches-topic")
            .unwrap_or(DEFAULT_SUBSCRIBE_BATCHES_TOPIC.to_string());
        info!("Creating batch subscriber on '{subscribe_batches_topic}'");

        let subscribe_blocks_topic = config
            .get_string("subscribe-blocks-topic")
            .unwrap_or(DEFAULT_SUBSCRIBE_BLOCKS_TOPIC.to_string());
        info!("Creating single-block subscriber on '{subscribe_blocks_topic}'");

        let publish_chain_topic = config
            .get_string("publish-chain-topic")
            .unwrap_or(DEFAULT_PUBLISH_CHAIN_TOPIC.to_string());
        info!("Publishing chain events on '{publish_chain_topic}'");

        let publish_score_topic = config
            .get_string("publish-score-topic")
            .unwrap_or(DEFAULT_PUBLISH_SCORE_TOPIC.to_string());

        let publish_producer_topic = config
            .get_string("publish-producer-topic")
            .unwrap_or(DEFAULT_PUBLISH_PRODUCER_TOPIC.to_string());

        let max_rollback_depth = config
            .get_int("max-rollback-depth")
            .unwrap_or(DEFAULT_MAX_ROLLBACK_DEPTH as i64) as u64;
        info!("Max rollback depth {max_rollback_depth}");

        // Subscribe for reassembled sync batches
        let mut batch_subscription = context.subscribe(&subscribe_batches_topic).await?;

        // Subscribe for single forged/relayed blocks
        let mut block_subscription = context.subscribe(&subscribe_blocks_topic).await?;

        // Create the applier with a queue-based observer. Single owner,
        // single loop: no lock around the applier itself.
        let score_queue: ScoreQueue = Arc::new(std::sync::Mutex::new(Vec::new()));
        let observer = Box::new(QueueObserver {
            scores: score_queue.clone(),
        });
        let mut applier = Applier::new(MemoryLedger::new(), max_rollback_depth, observer);

        context.clone().run(async move {
            loop {
                tokio::select! {
                    result = batch_subscription.read() => {
                        let Ok((_, message)) = result else {
                            error!("Batch message read failed");
                            return;
                        };

                        match message.as_ref() {
                            Message::CandidateBatch(batch) => {
                                let span = info_span!("apply_batch", blocks = batch.blocks.len());
                                let fatal = async {
                                    handle_batch(
                                        &context,
                                        &mut applier,
                                        &batch.blocks,
                                        &publish_chain_topic,
                                        &publish_score_topic,
                                    ).await
                                }
                                .instrument(span)
                                .await;
                                if fatal {
                                    return;
                                }
                            }

                            _ => warn!("Ignoring unexpected message on batch topic"),
                        }
                    }

                    result = block_subscription.read() => {
                        let Ok((_, message)) = result else {
                            error!("Block message read failed");
                            return;
                        };

                        match message.as_ref() {
                            Message::BlockReceived(received) => {
                                let span = info_span!("apply_block", id = %received.block.id);
                                let fatal = async {
                                    handle_single_block(
                                        &context,
                                        &mut applier,
                                        &received.block,
                                        &score_queue,
                                        &publish_chain_topic,
                                        &publish_score_topic,
                                        &publish_producer_topic,
                                    ).await
                                }
                                .instrument(span)
                                .await;
                                if fatal {
                                    return;
                                }
                            }

                            _ => warn!("Ignoring unexpected message on block topic"),
                        }
                    }
                }
            }
        });

        Ok(())
    }
}

/// Apply a reassembled sync batch and publish the resulting chain events.
///
/// Returns true on a fatal applier error; the caller must stop the loop.
async fn handle_batch(
    context: &Arc<Context<Message>>,
    applier: &mut Applier<MemoryLedger>,
    blocks: &[Block],
    publish_chain_topic: &str,
    publish_score_topic: &str,
) -> bool {
    let prior_height = match applier.ledger().height() {
        Ok(h) => h,
        Err(e) => {
            error!("Ledger height read failed: {e}");
            return true;
        }
    };

    match applier.apply(blocks) {
        Ok((tip, height)) => {
            let mut messages =
                chain_event_messages(blocks, height, prior_height, publish_chain_topic);
            match applier.ledger().score_at_height(height) {
                Ok(score) => messages.push((
                    publish_score_topic.to_string(),
                    Arc::new(Message::ScoreUpdated(ScoreUpdatedMessage { height, score })),
                )),
                Err(e) => error!("Score read failed after apply: {e}"),
            }
            publish_messages(context, messages).await;
            info!(height, tip = %tip.id, "batch applied");
            false
        }
        Err(e) if e.is_fatal() => {
            error!("Unrecoverable applier failure: {e}");
            true
        }
        Err(e) => {
            warn!("Batch rejected: {e}");
            false
        }
    }
}

/// Apply a single forged or relayed block and publish producer control,
/// chain events and the score announcement in order.
///
/// The interrupt goes out on the bus, awaited, before the applier runs:
/// in-progress local production must stop before the ledger commit, not
/// after it.
///
/// Returns true on a fatal applier error; the caller must stop the loop.
async fn handle_single_block(
    context: &Arc<Context<Message>>,
    applier: &mut Applier<MemoryLedger>,
    block: &Block,
    score_queue: &ScoreQueue,
    publish_chain_topic: &str,
    publish_score_topic: &str,
    publish_producer_topic: &str,
) -> bool {
    let prior_height = match applier.ledger().height() {
        Ok(h) => h,
        Err(e) => {
            error!("Ledger height read failed: {e}");
            return true;
        }
    };

    publish_messages(
        context,
        vec![(
            publish_producer_topic.to_string(),
            Arc::new(Message::Producer(ProducerMessage::Interrupt)),
        )],
    )
    .await;

    match applier.apply_block(block) {
        Ok((tip, height)) => {
            let scores: Vec<(Height, Score)> = score_queue.lock().unwrap().drain(..).collect();
            let messages = single_block_messages(
                block,
                height,
                prior_height,
                scores,
                publish_chain_topic,
                publish_score_topic,
                publish_producer_topic,
            );
            publish_messages(context, messages).await;
            info!(height, tip = %tip.id, "block applied");
            false
        }
        Err(e) if e.is_fatal() => {
            error!("Unrecoverable applier failure: {e}");
            true
        }
        Err(e) => {
            warn!("Block rejected: {e}");
            // Production was interrupted before the attempt; restart it
            // against the unchanged tip
            publish_messages(
                context,
                vec![(
                    publish_producer_topic.to_string(),
                    Arc::new(Message::Producer(ProducerMessage::Reschedule {
                        height: prior_height,
                    })),
                )],
            )
            .await;
            false
        }
    }
}

/// Post-commit messages for a single-block apply: chain events first
/// (rollback notice before applied events), then the score
/// announcements, then the producer reschedule. The interrupt is not
/// among them; it was published before the commit.
fn single_block_messages(
    block: &Block,
    height: Height,
    prior_height: Height,
    scores: Vec<(Height, Score)>,
    publish_chain_topic: &str,
    publish_score_topic: &str,
    publish_producer_topic: &str,
) -> Vec<(String, Arc<Message>)> {
    let mut messages = chain_event_messages(
        std::slice::from_ref(block),
        height,
        prior_height,
        publish_chain_topic,
    );
    for (at_height, score) in scores {
        messages.push((
            publish_score_topic.to_string(),
            Arc::new(Message::ScoreUpdated(ScoreUpdatedMessage {
                height: at_height,
                score,
            })),
        ));
    }
    messages.push((
        publish_producer_topic.to_string(),
        Arc::new(Message::Producer(ProducerMessage::Reschedule { height })),
    ));
    messages
}

/// Build the chain event messages for a committed batch: a rollback
/// notice first when a suffix was replaced, then one applied event per
/// block in height order.
fn chain_event_messages(
    blocks: &[Block],
    new_height: Height,
    prior_height: Height,
    publish_chain_topic: &str,
) -> Vec<(String, Arc<Message>)> {
    let fork_point = new_height - blocks.len() as Height;
    let mut messages = Vec::new();

    if fork_point < prior_height {
        messages.push((
            publish_chain_topic.to_string(),
            Arc::new(Message::RolledBack(RolledBackMessage {
                to_height: fork_point,
            })),
        ));
    }

    for (i, block) in blocks.iter().enumerate() {
        messages.push((
            publish_chain_topic.to_string(),
            Arc::new(Message::BlockApplied(BlockAppliedMessage {
                height: fork_point + 1 + i as Height,
                block: block.clone(),
            })),
        ));
    }

    messages
}

/// Publish a batch of collected messages to the bus.
async fn publish_messages(context: &Arc<Context<Message>>, messages: Vec<(String, Arc<Message>)>) {
    for (topic, msg) in messages {
        context
            .message_bus
            .publish(&topic, msg)
            .await
            .unwrap_or_else(|e| error!("Failed to publish to {topic}: {e}"));
    }
}
