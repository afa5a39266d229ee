use crate::infrastructure::error::{InfraError, RemoteError};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use url::Url;

const HEALTH_SEGMENT: &str = "health";

/// Keyed upsert document store. The only component that performs network I/O.
#[async_trait]
pub trait RemoteStore<D: Send + Sync>: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<D>, RemoteError>;

    /// Creates the document if absent, otherwise replaces it entirely.
    async fn put(&self, key: &str, document: &D) -> Result<(), RemoteError>;

    async fn list(&self) -> Result<Vec<D>, RemoteError>;

    async fn health(&self) -> Result<(), RemoteError>;
}

/// Whether a remote endpoint exists at all for this deployment.
pub enum RemoteTarget<D> {
    Configured(Arc<dyn RemoteStore<D>>),
    Unconfigured,
}

impl<D> Clone for RemoteTarget<D> {
    fn clone(&self) -> Self {
        match self {
            Self::Configured(store) => Self::Configured(Arc::clone(store)),
            Self::Unconfigured => Self::Unconfigured,
        }
    }
}

impl<D> RemoteTarget<D> {
    pub fn configured(store: Arc<dyn RemoteStore<D>>) -> Self {
        Self::Configured(store)
    }

    pub fn is_configured(&self) -> bool {
        matches!(self, Self::Configured(_))
    }
}

impl<D: Send + Sync + 'static> RemoteTarget<D> {
    /// Bounds every call on the configured store by `timeout`.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        match self {
            Self::Configured(inner) => Self::Configured(Arc::new(TimeoutRemoteStore { inner, timeout })),
            Self::Unconfigured => Self::Unconfigured,
        }
    }
}

/// Gives up waiting after `timeout` and reports the call as unreachable. The
/// abandoned call is dropped; its result is never observed.
struct TimeoutRemoteStore<D> {
    inner: Arc<dyn RemoteStore<D>>,
    timeout: Duration,
}

async fn bounded<T>(
    operation: &str,
    timeout: Duration,
    call: impl Future<Output = Result<T, RemoteError>>,
) -> Result<T, RemoteError> {
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| RemoteError::timed_out(operation))?
}

#[async_trait]
impl<D: Send + Sync + 'static> RemoteStore<D> for TimeoutRemoteStore<D> {
    async fn get(&self, key: &str) -> Result<Option<D>, RemoteError> {
        bounded("remote get", self.timeout, self.inner.get(key)).await
    }

    async fn put(&self, key: &str, document: &D) -> Result<(), RemoteError> {
        bounded("remote put", self.timeout, self.inner.put(key, document)).await
    }

    async fn list(&self) -> Result<Vec<D>, RemoteError> {
        bounded("remote list", self.timeout, self.inner.list()).await
    }

    async fn health(&self) -> Result<(), RemoteError> {
        bounded("remote health probe", self.timeout, self.inner.health()).await
    }
}

/// REST document store:
/// `GET|PUT {endpoint}/{collection}/{key}`, `GET {endpoint}/{collection}`,
/// `GET {endpoint}/health`.
#[derive(Debug, Clone)]
pub struct HttpRemoteStore<D> {
    client: Client,
    collection_url: Url,
    health_url: Url,
    token: Option<String>,
    _document: PhantomData<fn() -> D>,
}

impl<D> HttpRemoteStore<D> {
    pub fn new(
        endpoint: &Url,
        collection: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, InfraError> {
        if collection.trim().is_empty() {
            return Err(InfraError::InvalidConfig(
                "remote collection must not be empty".to_string(),
            ));
        }
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|error| InfraError::InvalidConfig(format!("failed to build http client: {error}")))?;

        Ok(Self {
            client,
            collection_url: Self::join_segments(endpoint, &[collection.trim()])?,
            health_url: Self::join_segments(endpoint, &[HEALTH_SEGMENT])?,
            token: token.filter(|value| !value.trim().is_empty()),
            _document: PhantomData,
        })
    }

    fn join_segments(base: &Url, segments: &[&str]) -> Result<Url, InfraError> {
        let mut url = base.clone();
        {
            let mut path = url.path_segments_mut().map_err(|_| {
                InfraError::InvalidConfig("remote endpoint cannot be a base URL".to_string())
            })?;
            path.pop_if_empty();
            for segment in segments {
                path.push(segment);
            }
        }
        Ok(url)
    }

    fn document_url(&self, key: &str) -> Result<Url, RemoteError> {
        if key.trim().is_empty() {
            return Err(RemoteError::Unknown("document key must not be empty".to_string()));
        }
        let mut url = self.collection_url.clone();
        url.path_segments_mut()
            .map_err(|_| RemoteError::Unknown("collection URL cannot be a base".to_string()))?
            .push(key);
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.token.as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn transport_error(operation: &str, error: reqwest::Error) -> RemoteError {
        if error.is_timeout() || error.is_connect() || error.is_request() {
            RemoteError::Unreachable(format!("network error while {operation}: {error}"))
        } else {
            RemoteError::Unknown(format!("failed while {operation}: {error}"))
        }
    }

    fn status_error(operation: &str, status: StatusCode, body: &str) -> RemoteError {
        let message = if body.trim().is_empty() {
            format!("{operation}: http {}", status.as_u16())
        } else {
            format!("{operation}: http {}; body={body}", status.as_u16())
        };
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteError::Unauthorized(message),
            StatusCode::REQUEST_TIMEOUT | StatusCode::BAD_GATEWAY | StatusCode::GATEWAY_TIMEOUT => {
                RemoteError::Unreachable(message)
            }
            _ => RemoteError::Unknown(message),
        }
    }

    async fn read_body(operation: &str, response: reqwest::Response) -> Result<(StatusCode, String), RemoteError> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|error| Self::transport_error(operation, error))?;
        Ok((status, body))
    }
}

#[async_trait]
impl<D> RemoteStore<D> for HttpRemoteStore<D>
where
    D: Serialize + DeserializeOwned + Send + Sync,
{
    async fn get(&self, key: &str) -> Result<Option<D>, RemoteError> {
        let operation = "fetching remote document";
        let url = self.document_url(key)?;
        let response = self
            .authorize(self.client.get(url))
            .send()
            .await
            .map_err(|error| Self::transport_error(operation, error))?;
        let (status, body) = Self::read_body(operation, response).await?;

        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(Self::status_error(operation, status, &body));
        }
        if body.trim().is_empty() || body.trim() == "null" {
            return Ok(None);
        }
        serde_json::from_str(&body)
            .map(Some)
            .map_err(|error| RemoteError::Unknown(format!("invalid remote document: {error}")))
    }

    async fn put(&self, key: &str, document: &D) -> Result<(), RemoteError> {
        let operation = "storing remote document";
        let url = self.document_url(key)?;
        let response = self
            .authorize(self.client.put(url))
            .json(document)
            .send()
            .await
            .map_err(|error| Self::transport_error(operation, error))?;
        let (status, body) = Self::read_body(operation, response).await?;

        if !status.is_success() {
            return Err(Self::status_error(operation, status, &body));
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<D>, RemoteError> {
        let operation = "listing remote documents";
        let response = self
            .authorize(self.client.get(self.collection_url.clone()))
            .send()
            .await
            .map_err(|error| Self::transport_error(operation, error))?;
        let (status, body) = Self::read_body(operation, response).await?;

        if !status.is_success() {
            return Err(Self::status_error(operation, status, &body));
        }
        serde_json::from_str(&body)
            .map_err(|error| RemoteError::Unknown(format!("invalid remote document list: {error}")))
    }

    async fn health(&self) -> Result<(), RemoteError> {
        let operation = "probing remote store";
        let response = self
            .authorize(self.client.get(self.health_url.clone()))
            .send()
            .await
            .map_err(|error| Self::transport_error(operation, error))?;
        let (status, body) = Self::read_body(operation, response).await?;

        if !status.is_success() {
            return Err(Self::status_error(operation, status, &body));
        }
        Ok(())
    }
}

/// Process-local store with scriptable failures.
#[derive(Debug)]
pub struct InMemoryRemoteStore<D> {
    documents: Mutex<BTreeMap<String, D>>,
    scripted_failures: Mutex<VecDeque<RemoteError>>,
    offline: AtomicBool,
    latency: Mutex<Option<Duration>>,
    get_calls: AtomicUsize,
    put_calls: AtomicUsize,
}

impl<D> Default for InMemoryRemoteStore<D> {
    fn default() -> Self {
        Self {
            documents: Mutex::new(BTreeMap::new()),
            scripted_failures: Mutex::new(VecDeque::new()),
            offline: AtomicBool::new(false),
            latency: Mutex::new(None),
            get_calls: AtomicUsize::new(0),
            put_calls: AtomicUsize::new(0),
        }
    }
}

impl<D: Clone> InMemoryRemoteStore<D> {
    pub fn insert(&self, key: impl Into<String>, document: D) {
        if let Ok(mut documents) = self.documents.lock() {
            documents.insert(key.into(), document);
        }
    }

    pub fn document(&self, key: &str) -> Option<D> {
        self.documents
            .lock()
            .ok()
            .and_then(|documents| documents.get(key).cloned())
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        if let Ok(mut current) = self.latency.lock() {
            *current = latency;
        }
    }

    /// The next call, of any kind, fails with `error`.
    pub fn fail_next(&self, error: RemoteError) {
        if let Ok(mut failures) = self.scripted_failures.lock() {
            failures.push_back(error);
        }
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn put_calls(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }

    async fn check_available(&self) -> Result<(), RemoteError> {
        let latency = self.latency.lock().ok().and_then(|latency| *latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if let Some(error) = self
            .scripted_failures
            .lock()
            .ok()
            .and_then(|mut failures| failures.pop_front())
        {
            return Err(error);
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::Unreachable("in-memory remote is offline".to_string()));
        }
        Ok(())
    }

    fn lock_documents(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, D>>, RemoteError> {
        self.documents
            .lock()
            .map_err(|error| RemoteError::Unknown(format!("in-memory remote lock poisoned: {error}")))
    }
}

#[async_trait]
impl<D> RemoteStore<D> for InMemoryRemoteStore<D>
where
    D: Clone + Send + Sync,
{
    async fn get(&self, key: &str) -> Result<Option<D>, RemoteError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available().await?;
        Ok(self.lock_documents()?.get(key).cloned())
    }

    async fn put(&self, key: &str, document: &D) -> Result<(), RemoteError> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available().await?;
        self.lock_documents()?.insert(key.to_string(), document.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<D>, RemoteError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available().await?;
        Ok(self.lock_documents()?.values().cloned().collect())
    }

    async fn health(&self) -> Result<(), RemoteError> {
        self.check_available().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::Ledger;
    use crate::infrastructure::error::RemoteErrorKind;

    fn http_store(endpoint: &str) -> HttpRemoteStore<Ledger> {
        HttpRemoteStore::new(
            &Url::parse(endpoint).expect("endpoint"),
            "user_data",
            Some("token".to_string()),
            Duration::from_millis(500),
        )
        .expect("store")
    }

    #[test]
    fn urls_are_built_from_segments() {
        let store = http_store("https://sync.example.com/api/");
        assert_eq!(store.collection_url.as_str(), "https://sync.example.com/api/user_data");
        assert_eq!(store.health_url.as_str(), "https://sync.example.com/api/health");
        assert_eq!(
            store.document_url("ali ce/1").expect("url").as_str(),
            "https://sync.example.com/api/user_data/ali%20ce%2F1"
        );
        assert!(store.document_url("  ").is_err());
    }

    #[test]
    fn status_codes_map_to_error_kinds() {
        let unauthorized = HttpRemoteStore::<Ledger>::status_error("op", StatusCode::UNAUTHORIZED, "");
        assert_eq!(unauthorized.kind(), RemoteErrorKind::Unauthorized);
        let gateway = HttpRemoteStore::<Ledger>::status_error("op", StatusCode::GATEWAY_TIMEOUT, "");
        assert_eq!(gateway.kind(), RemoteErrorKind::Unreachable);
        let server = HttpRemoteStore::<Ledger>::status_error("op", StatusCode::INTERNAL_SERVER_ERROR, "boom");
        assert_eq!(server.kind(), RemoteErrorKind::Unknown);
        assert!(server.to_string().contains("body=boom"));
    }

    #[tokio::test]
    async fn refused_connection_is_unreachable() {
        let store = http_store("http://127.0.0.1:9/");
        let error = store.health().await.expect_err("nothing listens on the discard port");
        assert_eq!(error.kind(), RemoteErrorKind::Unreachable);
    }

    #[tokio::test]
    async fn in_memory_store_scripts_failures() {
        let store = InMemoryRemoteStore::<u32>::default();
        store.put("a", &1).await.expect("put");
        store.fail_next(RemoteError::Unauthorized("expired".to_string()));

        let error = store.get("a").await.expect_err("scripted failure");
        assert_eq!(error.kind(), RemoteErrorKind::Unauthorized);
        assert_eq!(store.get("a").await.expect("get"), Some(1));

        store.set_offline(true);
        assert!(store.health().await.is_err());
        assert_eq!(store.put_calls(), 1);
        assert_eq!(store.get_calls(), 2);
    }

    #[tokio::test]
    async fn slow_calls_time_out_as_unreachable() {
        let store = Arc::new(InMemoryRemoteStore::<u32>::default());
        store.set_latency(Some(Duration::from_millis(500)));
        let target = RemoteTarget::configured(store.clone()).with_timeout(Duration::from_millis(20));
        let RemoteTarget::Configured(bounded_store) = target else {
            panic!("expected configured target");
        };

        let error = bounded_store.put("a", &1).await.expect_err("timeout");
        assert_eq!(error, RemoteError::timed_out("remote put"));

        store.set_latency(None);
        bounded_store.put("a", &2).await.expect("fast put");
        assert_eq!(store.document("a"), Some(2));
    }
}
