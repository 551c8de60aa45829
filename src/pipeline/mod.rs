//! # Pipeline Builder
//!
//! Turns a resolved handler and a dispatch kind into the ordered list of
//! processing units that run in front of it. The table of candidate
//! entries is fixed when the application starts; building a pipeline is a
//! filter over that table.

mod builder;
mod chain;

pub use builder::{Binding, PipelineEntry, PipelineTable, ANY_HANDLER};
pub use chain::{Next, Pipeline};
