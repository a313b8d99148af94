use serde::{Deserialize, Serialize};

/// A single result row, as returned by the work executor.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// Status string reported for a successfully executed query.
pub const STATUS_OK: &str = "True";

/// Inbound query as seen by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Affinity key used for shard selection; echoed back on the response.
    pub query_id: String,
    /// Query signature/text. Also the cache and coalescing key when non-empty.
    pub query_sql: String,
    /// Opaque payload handed to the executor.
    #[serde(default)]
    pub payload: Vec<u8>,
}

impl QueryRequest {
    pub fn new(query_id: impl Into<String>, query_sql: impl Into<String>) -> Self {
        Self {
            query_id: query_id.into(),
            query_sql: query_sql.into(),
            payload: Vec::new(),
        }
    }

    /// Attach a payload to the request.
    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Key used for result caching and request coalescing.
    ///
    /// The query signature when present, otherwise the query identifier.
    pub fn coalescing_key(&self) -> &str {
        if self.query_sql.is_empty() {
            &self.query_id
        } else {
            &self.query_sql
        }
    }
}

/// Result of a dispatched query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub status: String,
    pub query_id: String,
    pub records: Vec<Record>,
    pub received_size: usize,
}

impl QueryResponse {
    /// Copy of this response re-addressed to another caller.
    ///
    /// Cached and coalesced responses are shared between requests that
    /// differ only in their `query_id`.
    pub fn echo_for(&self, query_id: &str) -> Self {
        Self {
            query_id: query_id.to_string(),
            ..self.clone()
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
