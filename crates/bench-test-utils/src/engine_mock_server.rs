//! Scriptable mock of an execution client's engine/eth JSON-RPC surface.
//!
//! Supports the calls the harness makes: payload submission with scripted
//! verdicts, forkchoice updates, the oracle build call, readiness polling,
//! and block retrieval for the source adapter. Every request lands in a
//! journal so tests can assert exact call ordering.

use alloy_primitives::{
    B256,
    U256,
};
use axum::{
    Json,
    Router,
    extract::State,
    http::{
        HeaderMap,
        StatusCode,
    },
    response::{
        IntoResponse,
        Response,
    },
    routing::post,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{
    Value,
    json,
};
use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{
            AtomicU64,
            Ordering,
        },
    },
};
use tokio::net::TcpListener;

/// One observed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineCall {
    pub method: String,
    pub block_number: Option<u64>,
    pub head_block_hash: Option<String>,
    pub authorized: bool,
}

#[derive(Debug)]
struct OracleState {
    number: u64,
    parent: B256,
    gas_limit: u64,
    gas_limit_step: u64,
}

#[derive(Debug)]
struct Inner {
    journal: Mutex<Vec<EngineCall>>,
    /// Per-block verdict scripts for `engine_newPayload*`. The last entry
    /// is sticky; an unscripted block answers VALID.
    payload_scripts: DashMap<u64, VecDeque<String>>,
    /// `eth_blockNumber` answers 503 this many times before succeeding.
    ready_failures: AtomicU64,
    /// Blocks served by `eth_getBlockByNumber`.
    chain: DashMap<u64, Value>,
    latest_block: AtomicU64,
    oracle: Mutex<OracleState>,
    /// Raw transactions the oracle build call silently excludes.
    rejected_raw: DashMap<String, ()>,
}

/// Mock engine endpoint bound to an ephemeral local port.
#[derive(Debug, Clone)]
pub struct MockEngineServer {
    inner: Arc<Inner>,
    port: u16,
}

fn number_hash(number: u64) -> B256 {
    B256::from(U256::from(number))
}

fn hex_to_u64(value: &Value) -> Option<u64> {
    let s = value.as_str()?;
    u64::from_str_radix(s.trim_start_matches("0x"), 16).ok()
}

fn rpc_result(id: Value, result: Value) -> Json<Value> {
    Json(json!({"jsonrpc": "2.0", "id": id, "result": result}))
}

impl MockEngineServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock server");
        let port = listener.local_addr().expect("local addr").port();

        let inner = Arc::new(Inner {
            journal: Mutex::new(Vec::new()),
            payload_scripts: DashMap::new(),
            ready_failures: AtomicU64::new(0),
            chain: DashMap::new(),
            latest_block: AtomicU64::new(0),
            oracle: Mutex::new(OracleState {
                number: 0,
                parent: number_hash(0),
                gas_limit: 30_000_000,
                gas_limit_step: 0,
            }),
            rejected_raw: DashMap::new(),
        });

        let app = Router::new()
            .route("/", post(handle_request))
            .with_state(Arc::clone(&inner));
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                eprintln!("mock engine server error: {e}");
            }
        });

        Self { inner, port }
    }

    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    /// Scripts the verdicts for one block's submissions, in order. The
    /// last verdict repeats for any further submissions of that block.
    pub fn script_payload_status(&self, block_number: u64, statuses: &[&str]) {
        self.inner.payload_scripts.insert(
            block_number,
            statuses.iter().map(ToString::to_string).collect(),
        );
    }

    /// Makes the readiness probe fail with 503 this many times first.
    pub fn set_ready_failures(&self, failures: u64) {
        self.inner.ready_failures.store(failures, Ordering::SeqCst);
    }

    /// Serves these blocks from `eth_getBlockByNumber`.
    pub fn seed_chain(&self, from: u64, to: u64) {
        for number in from..=to {
            self.inner
                .chain
                .insert(number, crate::fixtures::mock_block(number));
        }
        self.inner.latest_block.store(to, Ordering::SeqCst);
    }

    /// The oracle build call will exclude this raw transaction.
    pub fn reject_raw_tx(&self, raw: &str) {
        self.inner.rejected_raw.insert(raw.to_string(), ());
    }

    /// Seeds the oracle chain's gas limit and its per-block growth.
    pub fn set_oracle_gas(&self, gas_limit: u64, step: u64) {
        let mut oracle = self.inner.oracle.lock();
        oracle.gas_limit = gas_limit;
        oracle.gas_limit_step = step;
    }

    /// Everything observed so far, in arrival order.
    pub fn calls(&self) -> Vec<EngineCall> {
        self.inner.journal.lock().clone()
    }

    /// Just the method names, in arrival order.
    pub fn methods(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.method).collect()
    }
}

impl Inner {
    fn next_status(&self, block_number: u64) -> String {
        if let Some(mut script) = self.payload_scripts.get_mut(&block_number) {
            if script.len() > 1 {
                return script.pop_front().expect("len checked");
            }
            if let Some(last) = script.front() {
                return last.clone();
            }
        }
        "VALID".to_string()
    }

    fn record(&self, call: EngineCall) {
        self.journal.lock().push(call);
    }
}

async fn handle_request(
    State(inner): State<Arc<Inner>>,
    headers: HeaderMap,
    Json(request): Json<Value>,
) -> Response {
    let method = request
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let id = request.get("id").cloned().unwrap_or(json!(1));
    let params = request.get("params").cloned().unwrap_or(json!([]));
    let authorized = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("Bearer "));

    if method == "eth_blockNumber" {
        if inner
            .ready_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
        inner.record(EngineCall {
            method,
            block_number: None,
            head_block_hash: None,
            authorized,
        });
        let latest = inner.latest_block.load(Ordering::SeqCst);
        return rpc_result(id, json!(format!("0x{latest:x}"))).into_response();
    }

    if method.starts_with("engine_newPayload") {
        let block_number = params
            .get(0)
            .and_then(|p| p.get("blockNumber"))
            .and_then(hex_to_u64);
        inner.record(EngineCall {
            method,
            block_number,
            head_block_hash: None,
            authorized,
        });
        let status = inner.next_status(block_number.unwrap_or_default());
        let validation_error = (status == "INVALID").then_some("scripted invalidation");
        return rpc_result(
            id,
            json!({
                "status": status,
                "latestValidHash": null,
                "validationError": validation_error,
            }),
        )
        .into_response();
    }

    if method.starts_with("engine_forkchoiceUpdated") {
        let head = params
            .get(0)
            .and_then(|p| p.get("headBlockHash"))
            .and_then(Value::as_str)
            .map(ToString::to_string);
        inner.record(EngineCall {
            method,
            block_number: None,
            head_block_hash: head,
            authorized,
        });
        return rpc_result(
            id,
            json!({
                "payloadStatus": {
                    "status": "VALID",
                    "latestValidHash": null,
                    "validationError": null,
                },
                "payloadId": null,
            }),
        )
        .into_response();
    }

    if method.starts_with("engine_buildPayload") {
        let submitted: Vec<String> = params
            .get(0)
            .and_then(Value::as_array)
            .map(|txs| {
                txs.iter()
                    .filter_map(Value::as_str)
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let included: Vec<String> = submitted
            .into_iter()
            .filter(|raw| !inner.rejected_raw.contains_key(raw))
            .collect();

        let payload = {
            let mut oracle = inner.oracle.lock();
            oracle.gas_limit += oracle.gas_limit_step;
            oracle.number += 1;
            let hash = number_hash(oracle.number);
            let payload = json!({
                "parentHash": oracle.parent,
                "feeRecipient": "0x0000000000000000000000000000000000000000",
                "stateRoot": "0x0000000000000000000000000000000000000000000000000000000000000000",
                "receiptsRoot": "0x0000000000000000000000000000000000000000000000000000000000000000",
                "logsBloom": format!("0x{:0512}", 0),
                "prevRandao": "0x0000000000000000000000000000000000000000000000000000000000000000",
                "blockNumber": format!("0x{:x}", oracle.number),
                "gasLimit": format!("0x{:x}", oracle.gas_limit),
                "gasUsed": format!("0x{:x}", 21_000 * included.len() as u64),
                "timestamp": format!("0x{:x}", oracle.number * 12),
                "extraData": "0x",
                "baseFeePerGas": "0x7",
                "blockHash": hash,
                "transactions": included,
            });
            oracle.parent = hash;
            payload
        };
        inner.record(EngineCall {
            method,
            block_number: None,
            head_block_hash: None,
            authorized,
        });
        return rpc_result(id, json!({"executionPayload": payload})).into_response();
    }

    if method == "eth_getBlockByNumber" {
        inner.record(EngineCall {
            method,
            block_number: params.get(0).and_then(hex_to_u64),
            head_block_hash: None,
            authorized,
        });
        let tag = params.get(0).and_then(Value::as_str).unwrap_or_default();
        if tag == "latest" {
            // Summary of the oracle chain head; enough for readiness and
            // the gas-limit ramp.
            let oracle = inner.oracle.lock();
            return rpc_result(
                id,
                json!({
                    "number": format!("0x{:x}", oracle.number),
                    "hash": oracle.parent,
                    "gasLimit": format!("0x{:x}", oracle.gas_limit),
                    "gasUsed": "0x0",
                }),
            )
            .into_response();
        }
        let block = params
            .get(0)
            .and_then(hex_to_u64)
            .and_then(|number| inner.chain.get(&number).map(|b| b.clone()));
        return rpc_result(id, block.unwrap_or(Value::Null)).into_response();
    }

    rpc_result(id, Value::Null).into_response()
}
