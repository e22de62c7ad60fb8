//! Sharding
//!
//! A sharded table is a directory of per-shard XML files, each owned by its
//! own cached-document engine. The sharded engine routes every operation to
//! the child engine for the interval containing the row's sharding value,
//! creating children lazily and retiring idle ones in the background.

pub mod interval;
pub mod sharded;

pub use interval::{FixedWidthIntervalProvider, Interval, IntervalProvider};
pub use sharded::ShardedEngine;
