#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]

//! Test doubles shared by the harness integration tests: a scriptable
//! mock engine/eth JSON-RPC server and record-chain fixtures.

mod engine_mock_server;
mod fixtures;

pub use engine_mock_server::{
    EngineCall,
    MockEngineServer,
};
pub use fixtures::{
    chain_records,
    mock_block,
};
