//! Core type definitions for Breakwater

use crate::hash::BlockId;
use anyhow::{bail, Result};
use blake2::{digest::consts::U32, Blake2b, Digest};

/// Chain height. Genesis is at height 0.
pub type Height = u64;

/// Initial base target assigned to the genesis block.
pub const GENESIS_BASE_TARGET: u64 = 153_722_867;

/// A block, immutable once constructed.
///
/// The identifier is the blake2b-256 digest of the block's wire bytes,
/// so it can be extracted from a raw block before full decoding.
#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Block {
    /// Content-derived identifier
    pub id: BlockId,

    /// Identifier of the parent block
    pub parent: BlockId,

    /// Consensus field used to compute this block's score contribution
    pub base_target: u64,

    /// Generation timestamp, milliseconds since the epoch
    pub timestamp: u64,

    /// Public key of the generating account
    pub generator: Vec<u8>,

    /// Opaque transaction payload
    pub payload: Vec<u8>,
}

/// Wire representation. The identifier is never encoded; it is always
/// recomputed from the encoded bytes.
#[derive(minicbor::Encode, minicbor::Decode)]
struct WireBlock {
    #[n(0)]
    parent: BlockId,
    #[n(1)]
    base_target: u64,
    #[n(2)]
    timestamp: u64,
    #[cbor(n(3), with = "minicbor::bytes")]
    generator: Vec<u8>,
    #[cbor(n(4), with = "minicbor::bytes")]
    payload: Vec<u8>,
}

impl Block {
    /// Construct a block, deriving its identifier from its content.
    pub fn new(
        parent: BlockId,
        base_target: u64,
        timestamp: u64,
        generator: Vec<u8>,
        payload: Vec<u8>,
    ) -> Result<Self> {
        if base_target == 0 {
            bail!("base target must be non-zero");
        }
        let mut block = Block {
            id: BlockId::default(),
            parent,
            base_target,
            timestamp,
            generator,
            payload,
        };
        block.id = Self::id_of(&block.to_bytes()?);
        Ok(block)
    }

    /// The fixed genesis block every Breakwater chain starts from.
    pub fn genesis() -> Self {
        Self::new(BlockId::default(), GENESIS_BASE_TARGET, 0, Vec::new(), Vec::new())
            .expect("genesis block is always encodable")
    }

    /// Extract the identifier from raw block bytes without decoding them.
    pub fn id_of(bytes: &[u8]) -> BlockId {
        let mut hasher = Blake2b::<U32>::new();
        hasher.update(bytes);
        BlockId::new(hasher.finalize().into())
    }

    /// Decode a block from its wire bytes, deriving the identifier.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let wire: WireBlock = minicbor::decode(bytes)?;
        if wire.base_target == 0 {
            bail!("base target must be non-zero");
        }
        Ok(Block {
            id: Self::id_of(bytes),
            parent: wire.parent,
            base_target: wire.base_target,
            timestamp: wire.timestamp,
            generator: wire.generator,
            payload: wire.payload,
        })
    }

    /// Encode the block's content to wire bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let wire = WireBlock {
            parent: self.parent,
            base_target: self.base_target,
            timestamp: self.timestamp,
            generator: self.generator.clone(),
            payload: self.payload.clone(),
        };
        Ok(minicbor::to_vec(&wire)?)
    }

    /// This block's score contribution.
    pub fn score(&self) -> crate::score::Score {
        crate::score::block_score(self.base_target)
    }
}
