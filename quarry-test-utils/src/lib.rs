//! Quarry Test Utilities
//!
//! Centralized test infrastructure for the quarry workspace:
//! - A scripted mock transport (with optional upload support)
//! - A stub normalizer for root-field operations
//! - Operation fixtures
//! - Proptest generators for keys and records

// Re-export core types for convenience
pub use quarry_core::{
    CacheKey, CachePolicy, DispatchError, GraphError, GraphResponse, Normalizer, Operation,
    OperationKind, OperationRequest, QuarryError, QuarryResult, Record, RecordSet, Resolution,
    StorageError, StoredRow, Transport, TransportError, TransportRequest, UploadFile,
    UploadTransport,
};

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

// ============================================================================
// TRACING
// ============================================================================

/// Install a test-friendly tracing subscriber once per process.
///
/// Honours `RUST_LOG`; output goes through the test harness writer.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

// ============================================================================
// STUB NORMALIZER
// ============================================================================

/// Root record key for queries.
pub const QUERY_ROOT: &str = "QUERY_ROOT";
/// Root record key for mutations.
pub const MUTATION_ROOT: &str = "MUTATION_ROOT";
/// Root record key for subscriptions.
pub const SUBSCRIPTION_ROOT: &str = "SUBSCRIPTION_ROOT";
/// Field marking a reference from one record to another.
pub const REF_FIELD: &str = "__ref";

/// Minimal normalizer for tests.
///
/// The operation document is a whitespace-separated list of root field
/// names. Normalizing a payload stores each root field on the root record;
/// object values carrying an `id` become their own record (keyed by that id)
/// and are replaced on the root by `{"__ref": id}`.
#[derive(Debug, Clone, Default)]
pub struct RootFieldNormalizer;

impl RootFieldNormalizer {
    pub fn new() -> Self {
        Self
    }

    pub fn root_key(kind: OperationKind) -> CacheKey {
        match kind {
            OperationKind::Query => CacheKey::from(QUERY_ROOT),
            OperationKind::Mutation => CacheKey::from(MUTATION_ROOT),
            OperationKind::Subscription => CacheKey::from(SUBSCRIPTION_ROOT),
        }
    }

    fn entity_key(value: &Value) -> Option<CacheKey> {
        match value.get("id")? {
            Value::String(id) => Some(CacheKey::from(id.as_str())),
            Value::Number(id) => Some(CacheKey::new(id.to_string())),
            _ => None,
        }
    }
}

impl Normalizer for RootFieldNormalizer {
    fn entry_keys(&self, operation: &dyn Operation) -> HashSet<CacheKey> {
        [Self::root_key(operation.kind())].into_iter().collect()
    }

    fn normalize(&self, operation: &dyn Operation, data: &Value) -> RecordSet {
        let mut records = RecordSet::new();
        let Some(fields) = data.as_object() else {
            return records;
        };

        let mut root = Map::new();
        for (field, value) in fields {
            match Self::entity_key(value) {
                Some(key) => {
                    root.insert(field.clone(), serde_json::json!({ REF_FIELD: key.as_str() }));
                    records.insert(key, value.clone());
                }
                None => {
                    root.insert(field.clone(), value.clone());
                }
            }
        }
        records.insert(Self::root_key(operation.kind()), Value::Object(root));
        records
    }

    fn resolve(&self, operation: &dyn Operation, records: &RecordSet) -> Resolution {
        let root_key = Self::root_key(operation.kind());
        let Some(root) = records.get(&root_key).and_then(Value::as_object) else {
            return Resolution::Miss;
        };

        let mut data = Map::new();
        let mut dependent_keys: HashSet<CacheKey> = [root_key].into_iter().collect();
        let mut missing = HashSet::new();

        for field in operation.document().split_whitespace() {
            let Some(value) = root.get(field) else {
                return Resolution::Miss;
            };
            match value.get(REF_FIELD).and_then(Value::as_str) {
                Some(reference) => {
                    let key = CacheKey::from(reference);
                    match records.get(&key) {
                        Some(record) => {
                            data.insert(field.to_string(), record.clone());
                            dependent_keys.insert(key);
                        }
                        None => {
                            missing.insert(key);
                        }
                    }
                }
                None => {
                    data.insert(field.to_string(), value.clone());
                }
            }
        }

        if missing.is_empty() {
            Resolution::Resolved {
                data: Value::Object(data),
                dependent_keys,
            }
        } else {
            Resolution::Incomplete { missing }
        }
    }
}

// ============================================================================
// OPERATION FIXTURES
// ============================================================================

pub mod fixtures {
    //! Ready-made operations and payloads.

    use super::*;
    use serde_json::json;

    /// Query selecting the `hero` root field.
    pub fn hero_query() -> Arc<dyn Operation> {
        Arc::new(OperationRequest::query("HeroName", "hero"))
    }

    /// Query selecting the `droid` root field.
    pub fn droid_query() -> Arc<dyn Operation> {
        Arc::new(OperationRequest::query("DroidName", "droid"))
    }

    /// Mutation selecting the `renameHero` root field.
    pub fn rename_mutation(name: &str) -> Arc<dyn Operation> {
        Arc::new(
            OperationRequest::mutation("RenameHero", "renameHero")
                .with_variables(json!({ "name": name })),
        )
    }

    /// Mutation carrying one file.
    pub fn upload_mutation() -> Arc<dyn Operation> {
        Arc::new(
            OperationRequest::mutation("UploadAvatar", "uploadAvatar").with_upload(
                UploadFile::new("variables.file", "avatar.png", "image/png", vec![0x89, 0x50]),
            ),
        )
    }

    pub fn hero_payload(name: &str) -> Value {
        json!({ "hero": { "id": "Hero:1", "name": name } })
    }

    pub fn droid_payload(name: &str) -> Value {
        json!({ "droid": { "id": "Droid:2", "name": name } })
    }

    pub fn hero_response(name: &str) -> GraphResponse {
        GraphResponse::data(hero_payload(name))
    }
}

// ============================================================================
// MOCK TRANSPORT
// ============================================================================

/// One scripted transport outcome.
pub type Scripted = Result<GraphResponse, TransportError>;

/// Scripted transport for tests.
///
/// Responses are served in FIFO order. Once the script is exhausted the
/// `repeat` response (if set) is served; otherwise the call fails.
#[derive(Debug, Default)]
pub struct MockTransport {
    script: Mutex<VecDeque<Scripted>>,
    repeat: Mutex<Option<Scripted>>,
    requests: Mutex<Vec<String>>,
    calls: AtomicUsize,
    uploads: AtomicUsize,
    delay: Option<Duration>,
    upload_enabled: bool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful response.
    pub fn with_response(self, response: GraphResponse) -> Self {
        self.push(Ok(response));
        self
    }

    /// Queue a failure.
    pub fn with_failure(self, message: &str) -> Self {
        self.push(Err(TransportError::new(message)));
        self
    }

    /// Serve `response` whenever the script is empty.
    pub fn with_repeat(self, response: Scripted) -> Self {
        if let Ok(mut repeat) = self.repeat.lock() {
            *repeat = Some(response);
        }
        self
    }

    /// Sleep before answering every request.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Expose the upload capability.
    pub fn with_upload_support(mut self) -> Self {
        self.upload_enabled = true;
        self
    }

    /// Queue a result after construction.
    pub fn push(&self, result: Scripted) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(result);
        }
    }

    /// Number of `send` calls (including abandoned ones).
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of `upload` calls.
    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    /// Names of the operations sent, in order.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    async fn answer(&self, request: &TransportRequest) -> Scripted {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.operation.name().to_string());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        match next {
            Some(result) => result,
            None => self
                .repeat
                .lock()
                .ok()
                .and_then(|r| r.clone())
                .unwrap_or_else(|| Err(TransportError::new("no scripted response"))),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: TransportRequest) -> Result<GraphResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answer(&request).await
    }

    fn upload_capability(&self) -> Option<&dyn UploadTransport> {
        if self.upload_enabled {
            Some(self)
        } else {
            None
        }
    }
}

#[async_trait]
impl UploadTransport for MockTransport {
    async fn upload(
        &self,
        request: TransportRequest,
        files: Vec<UploadFile>,
    ) -> Result<GraphResponse, TransportError> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        if files.is_empty() {
            return Err(TransportError::new("upload without files"));
        }
        self.answer(&request).await
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for keys and records.

    use super::*;
    use proptest::prelude::*;

    /// Generate a cache key shaped like `Typename:id`.
    pub fn arb_cache_key() -> impl Strategy<Value = CacheKey> {
        "[A-Z][a-z]{1,7}:[0-9]{1,4}".prop_map(CacheKey::from)
    }

    /// Generate a scalar JSON value.
    pub fn arb_scalar() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::from),
            "[a-zA-Z0-9 ]{0,16}".prop_map(Value::String),
            Just(Value::Null),
        ]
    }

    /// Generate an object record with one to four scalar fields.
    pub fn arb_record() -> impl Strategy<Value = Record> {
        prop::collection::btree_map("[a-z]{1,6}", arb_scalar(), 1..4)
            .prop_map(|fields| Value::Object(fields.into_iter().collect()))
    }

    /// Generate a small record set.
    pub fn arb_record_set() -> impl Strategy<Value = RecordSet> {
        prop::collection::hash_map(arb_cache_key(), arb_record(), 1..6)
    }
}
