//! Drive log processing and engagement statistics.
//!
//! Each drive flows through [`segment`] decoding, [`signals`] extraction,
//! the [`engagement`] tracker, the [`intervention`] classifier and
//! [`stats`] aggregation before [`store`] merges it into the database.

pub mod config;
pub mod discovery;
pub mod engagement;
pub mod error;
pub mod intervention;
pub mod pipeline;
pub mod runner;
pub mod segment;
pub mod signals;
pub mod smoothing;
pub mod stats;
pub mod store;

pub use config::EngineConfig;
pub use error::{EngineError, EngineResult, ErrorKind, SignalDecodeError};
pub use pipeline::{DriveOptions, DriveOutput, DriveProcessor};
pub use runner::{DriveReport, DriveStatus, RunOptions, RunReport, Runner};
pub use stats::DriveStats;
pub use store::{MergeEngine, MergeOutcome, StorePaths};
