//! Sub-word models which convert words into sequences of token IDs.

mod wordpiece;

pub use wordpiece::{WordPiece, WordPieceOptions};
