#![warn(missing_docs)]

//! WeldFS lock subsystem: POSIX byte-range advisory locks, conflict resolution, mandatory-mode enforcement, lock migration

pub mod engine;
pub mod metrics;
pub mod migrate;
pub mod range;
pub mod record;
pub mod table;
pub mod types;
