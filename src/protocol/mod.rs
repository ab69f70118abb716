//! Claude's stream-json wire format: typed events, line framing, and the
//! lines we write back to its stdin.

pub mod emit;
pub mod parse;
pub mod types;
