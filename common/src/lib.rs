// Breakwater common library - main library exports

pub mod hash;
pub mod ledger;
pub mod messages;
pub mod score;
pub mod types;

// Flattened re-exports
pub use self::hash::{BlockId, Hash};
pub use self::ledger::{Ledger, LedgerError, MemoryLedger};
pub use self::score::{block_score, Score};
pub use self::types::*;
