//! Authenticated JSON-RPC session against one engine endpoint.

use crate::{
    auth::JwtProvider,
    error::{
        EngineApiError,
        Result,
    },
};
use alloy_primitives::{
    B256,
    Bytes,
    U64,
};
use alloy_rpc_types_engine::{
    ExecutionPayload,
    ForkchoiceState,
    ForkchoiceUpdated,
    PayloadStatus,
};
use payload_store::{
    EngineVersion,
    PayloadRecord,
};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{
    Value,
    json,
};
use std::{
    sync::atomic::{
        AtomicU64,
        Ordering,
    },
    time::Duration,
};
use tracing::{
    debug,
    trace,
    warn,
};
use url::Url;

/// Default per-call timeout. Payload processing on a loaded client can take
/// a long time, so this is deliberately generous; callers enforce their own
/// deadlines on top.
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(3600);

/// How many times a rejected bearer token is refreshed before giving up.
const DEFAULT_AUTH_RETRIES: u32 = 10;

/// Configuration for one engine session.
#[derive(Debug, Clone)]
pub struct EngineClientConfig {
    pub engine_url: Url,
    pub call_timeout: Duration,
    pub auth_retries: u32,
}

impl EngineClientConfig {
    pub fn new(engine_url: Url) -> Self {
        Self {
            engine_url,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            auth_retries: DEFAULT_AUTH_RETRIES,
        }
    }
}

/// Header fields of the endpoint's latest block, as the harness needs them
/// for readiness checks and the compression gas-limit ramp.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatestBlock {
    pub number: U64,
    pub hash: B256,
    pub gas_limit: U64,
    pub gas_used: U64,
}

#[derive(Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BuildPayloadResult {
    execution_payload: ExecutionPayload,
}

/// An authenticated session against one execution-engine endpoint.
///
/// The session owns its credential provider; every call attaches a bearer
/// token and transparently refreshes it when the endpoint rejects it.
pub struct EngineClient {
    http: reqwest::Client,
    url: Url,
    auth: JwtProvider,
    auth_retries: u32,
    next_id: AtomicU64,
}

impl EngineClient {
    pub fn new(config: EngineClientConfig, auth: JwtProvider) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.call_timeout)
            .build()?;
        Ok(Self {
            http,
            url: config.engine_url,
            auth,
            auth_retries: config.auth_retries,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn engine_url(&self) -> &Url {
        &self.url
    }

    /// One JSON-RPC round trip with bearer auth. A 401/403 invalidates the
    /// cached token, widens its validity window, and retries up to the
    /// configured attempt budget.
    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let body = json!({
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });

        let mut attempts = self.auth_retries;
        loop {
            let token = self.auth.bearer()?;
            trace!(method, "sending engine request");
            let response = self
                .http
                .post(self.url.clone())
                .bearer_auth(token)
                .json(&body)
                .send()
                .await?;

            let status = response.status();
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                attempts = attempts.saturating_sub(1);
                if attempts == 0 {
                    return Err(EngineApiError::AuthExhausted);
                }
                warn!(method, %status, "bearer token rejected, refreshing");
                self.auth.invalidate();
                continue;
            }
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(EngineApiError::HttpStatus {
                    status: status.as_u16(),
                    body,
                });
            }

            let parsed: RpcResponse = response.json().await?;
            if let Some(error) = parsed.error {
                return Err(EngineApiError::Rpc {
                    code: error.code,
                    message: error.message,
                });
            }
            return parsed.result.ok_or(EngineApiError::MissingResult);
        }
    }

    /// Submits a payload and returns the client's verdict.
    pub async fn new_payload(&self, record: &PayloadRecord) -> Result<PayloadStatus> {
        let version = record.version();
        let params = match version {
            EngineVersion::V1 | EngineVersion::V2 => json!([record.payload]),
            EngineVersion::V3 => {
                let root = record
                    .parent_beacon_block_root
                    .ok_or(EngineApiError::MissingParentBeaconRoot(record.sequence))?;
                json!([record.payload, record.blob_versioned_hashes, root])
            }
        };
        let result = self.request(version.new_payload_method(), params).await?;
        let status: PayloadStatus = serde_json::from_value(result)?;
        debug!(
            number = record.block_number(),
            hash = %record.block_hash(),
            status = ?status.status,
            "newPayload"
        );
        Ok(status)
    }

    /// Declares a new canonical head.
    pub async fn forkchoice_updated(
        &self,
        version: EngineVersion,
        state: &ForkchoiceState,
    ) -> Result<ForkchoiceUpdated> {
        let result = self
            .request(version.forkchoice_method(), json!([state]))
            .await?;
        let updated: ForkchoiceUpdated = serde_json::from_value(result)?;
        debug!(
            head = %state.head_block_hash,
            status = ?updated.payload_status.status,
            "forkchoiceUpdated"
        );
        Ok(updated)
    }

    /// Oracle-only: asks the patched re-execution client to build a block
    /// from the given raw transactions on top of its current head. Invalid
    /// transactions are silently excluded by the client; the caller diffs
    /// the returned payload against its input to find them.
    pub async fn build_payload(
        &self,
        version: EngineVersion,
        transactions: &[Bytes],
    ) -> Result<ExecutionPayload> {
        let result = self
            .request(version.build_payload_method(), json!([transactions]))
            .await?;
        let built: BuildPayloadResult = serde_json::from_value(result)?;
        Ok(built.execution_payload)
    }

    /// `eth_blockNumber`, the readiness probe every client answers once its
    /// RPC surface is up.
    pub async fn block_number(&self) -> Result<u64> {
        let result = self.request("eth_blockNumber", json!([])).await?;
        let number: U64 = serde_json::from_value(result)?;
        Ok(number.to::<u64>())
    }

    /// Header fields of the latest block.
    pub async fn latest_block(&self) -> Result<LatestBlock> {
        let result = self
            .request("eth_getBlockByNumber", json!(["latest", false]))
            .await?;
        Ok(serde_json::from_value(result)?)
    }
}
