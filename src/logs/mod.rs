//! Log retrieval: head parsing, windowed file iteration, merging and search.

pub mod descriptor;
pub mod item;
pub mod iterator;
pub mod merge;
pub mod parser;
pub mod searcher;
pub mod timefmt;
