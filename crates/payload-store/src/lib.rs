#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

//! # `payload-store`
//!
//! The interchange format between every stage of the benchmark pipeline:
//! an ordered, append-only, immutable-once-written stream of
//! [`PayloadRecord`]s. The source adapter and the compression engine write
//! streams; the driver consumes them read-only.

pub mod record;
pub mod store;

pub use record::{
    EngineVersion,
    PayloadRecord,
};
pub use store::{
    StoreError,
    StoreReader,
    StoreWriter,
};
