//! A general inverted index: keys map to sorted, mergeable itemsets that are
//! paged to a blob file in bounded chunks and cached in memory.

pub mod blob;
pub mod cache;
pub mod config;
pub mod encoding;
pub mod error;
pub mod expr;
pub mod fs;
pub mod gix;
pub mod itemset;
pub mod merger;
pub mod root;

pub use config::{Access, GixConfig};
pub use error::GixError;
pub use expr::GixExpr;
pub use gix::{Gix, GixStats};
pub use itemset::ItemSet;
pub use merger::{CountMerger, Merger, Posting, SetMerger};
