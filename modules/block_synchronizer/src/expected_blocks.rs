//! Ordered reassembly buffer: accepts raw blocks in arbitrary arrival
//! order and releases them to the outbound queue strictly in the
//! originally requested order.

use breakwater_common::{Block, BlockId};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

#[derive(Debug, thiserror::Error)]
pub enum ReassemblyError {
    /// The block's identifier is not among the expected set.
    #[error("unexpected block: {id}")]
    UnexpectedBlock { id: BlockId },

    /// The bytes matched an expected identifier but did not decode.
    #[error("undecodable block {id}: {reason}")]
    BadBlock { id: BlockId, reason: String },

    /// The outbound queue could not take a released block. Cannot happen
    /// when the queue capacity covers the batch size.
    #[error("outbound queue rejected block {id}")]
    QueueFull { id: BlockId },
}

struct Inner {
    /// One slot per expected identifier, in request order
    slots: Vec<Option<Block>>,
    /// Identifier to slot position
    index: HashMap<BlockId, usize>,
    /// Next slot awaited; everything before it is filled and forwarded
    cursor: usize,
}

/// Reassembly buffer for one batch request.
///
/// `add` is called from the network-receive side and `has_next` from the
/// consumer; a single lock guards the slot array and cursor together, as
/// filling a slot and advancing the cursor must be atomic with respect
/// to each other.
pub struct ExpectedBlocks {
    inner: Mutex<Inner>,
    queue: mpsc::Sender<Block>,
}

impl ExpectedBlocks {
    /// Buffer expecting the given distinct identifiers, releasing to
    /// `queue` in that order.
    ///
    /// The queue capacity must cover the whole batch, so that a release
    /// never blocks on a consumer that is also the code draining
    /// [`has_next`](Self::has_next).
    pub fn new(expected: &[BlockId], queue: mpsc::Sender<Block>) -> Self {
        assert!(
            queue.max_capacity() >= expected.len(),
            "queue capacity must cover the batch"
        );
        let index = expected.iter().enumerate().map(|(i, id)| (*id, i)).collect();
        Self {
            inner: Mutex::new(Inner {
                slots: vec![None; expected.len()],
                index,
                cursor: 0,
            }),
            queue,
        }
    }

    /// Accept one raw block.
    ///
    /// The identifier is extracted from the bytes without decoding;
    /// unsolicited blocks are rejected before any decode work. After the
    /// slot is filled, every already-filled slot starting at the cursor
    /// is forwarded to the queue and the cursor advanced past it, so
    /// delivery order equals request order regardless of arrival order.
    /// Redelivery of a block already slotted is ignored.
    pub fn add(&self, bytes: &[u8]) -> Result<(), ReassemblyError> {
        let id = Block::id_of(bytes);

        let mut inner = self.inner.lock().unwrap();
        let Some(&position) = inner.index.get(&id) else {
            return Err(ReassemblyError::UnexpectedBlock { id });
        };

        // A slot behind the cursor was already released; re-storing the
        // block there would strand it in the buffer for its lifetime
        if position < inner.cursor {
            return Ok(());
        }

        if inner.slots[position].is_none() {
            let block = Block::from_bytes(bytes).map_err(|e| ReassemblyError::BadBlock {
                id,
                reason: e.to_string(),
            })?;
            inner.slots[position] = Some(block);
        }

        while inner.cursor < inner.slots.len() {
            let cursor = inner.cursor;
            let Some(block) = inner.slots[cursor].take() else {
                break;
            };
            self.queue
                .try_send(block)
                .map_err(|_| ReassemblyError::QueueFull { id })?;
            inner.cursor += 1;
        }

        Ok(())
    }

    /// True while the cursor has not reached the end of the batch.
    pub fn has_next(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.cursor < inner.slots.len()
    }
}
