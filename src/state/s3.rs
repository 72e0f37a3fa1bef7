//! S3-based state storage backend.
//!
//! The state document and the lock are two objects under a common prefix.
//! Writes are conditional: the state object is only replaced if its ETag
//! is still the one this store last read, and a lock object is only
//! created if none exists. A lost race surfaces as a conflict instead of
//! silently overwriting another writer.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::ProvideErrorMetadata;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{CairnError, Result, StateError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, holder_or_generated};
use super::store::StateStore;
use super::types::StateDocument;

const STATE_KEY: &str = "state.json";
const LOCK_KEY: &str = "state.lock";

/// Error codes S3 returns when a conditional write loses.
const PRECONDITION_CODES: [&str; 2] = ["PreconditionFailed", "ConditionalRequestConflict"];

/// What this store last saw of an object.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Seen {
    /// Never read; writes are unconditional.
    Unknown,
    /// Read and found missing; writes must create it.
    Absent,
    /// Read with this ETag; writes must replace exactly that version.
    Version(String),
}

/// Precondition attached to a put.
#[derive(Debug, PartialEq, Eq)]
enum Precondition<'a> {
    None,
    IfNoneMatch,
    IfMatch(&'a str),
}

impl Seen {
    fn from_etag(etag: Option<&str>) -> Self {
        etag.map_or(Self::Unknown, |e| Self::Version(e.to_string()))
    }

    fn precondition(&self) -> Precondition<'_> {
        match self {
            Self::Unknown => Precondition::None,
            Self::Absent => Precondition::IfNoneMatch,
            Self::Version(etag) => Precondition::IfMatch(etag),
        }
    }
}

/// An object body together with its ETag.
struct Fetched {
    body: String,
    etag: Option<String>,
}

/// Failure of a conditional put.
enum PutFailure {
    Precondition,
    Other(String),
}

/// S3-based state store.
#[derive(Debug)]
pub struct S3StateStore {
    client: Client,
    bucket: String,
    prefix: String,
    state_seen: Mutex<Seen>,
}

impl S3StateStore {
    /// Creates a store using credentials and region from the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the S3 client cannot be initialized.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Result<Self> {
        let mut loader = aws_config::from_env();
        if let Some(region) = region {
            loader = loader.region(aws_config::Region::new(region.to_string()));
        }
        let client = Client::new(&loader.load().await);

        Ok(Self::with_client(client, bucket, prefix))
    }

    /// Creates a store with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix),
            state_seen: Mutex::new(Seen::Unknown),
        }
    }

    fn key(&self, file: &str) -> String {
        format!("{}{file}", self.prefix)
    }

    fn url(&self, key: &str) -> String {
        format!("s3://{}/{key}", self.bucket)
    }

    async fn fetch(&self, key: &str) -> Result<Option<Fetched>> {
        let response = match self.client.get_object().bucket(&self.bucket).key(key).send().await {
            Ok(response) => response,
            Err(e) => {
                let e = e.into_service_error();
                if e.is_no_such_key() {
                    return Ok(None);
                }
                return Err(StateError::s3(format!("get {}: {e}", self.url(key))).into());
            }
        };

        let etag = response.e_tag().map(String::from);
        let bytes = response
            .body
            .collect()
            .await
            .map_err(|e| StateError::s3(format!("read {}: {e}", self.url(key))))?;
        let body = String::from_utf8(bytes.to_vec()).map_err(|e| StateError::Corrupted {
            message: format!("{} is not UTF-8: {e}", self.url(key)),
        })?;

        Ok(Some(Fetched { body, etag }))
    }

    /// Puts `body` under `key`, returning the new ETag.
    async fn put(
        &self,
        key: &str,
        body: String,
        precondition: Precondition<'_>,
    ) -> std::result::Result<Option<String>, PutFailure> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type("application/json")
            .body(body.into_bytes().into());

        request = match precondition {
            Precondition::None => request,
            Precondition::IfNoneMatch => request.if_none_match("*"),
            Precondition::IfMatch(etag) => request.if_match(etag),
        };

        match request.send().await {
            Ok(output) => Ok(output.e_tag().map(String::from)),
            Err(e) if is_precondition_failure(e.code()) => Err(PutFailure::Precondition),
            Err(e) => Err(PutFailure::Other(format!(
                "put {}: {}",
                self.url(key),
                e.into_service_error()
            ))),
        }
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                StateError::s3(format!("delete {}: {}", self.url(key), e.into_service_error()))
            })?;
        Ok(())
    }

    async fn read_lock(&self) -> Result<Option<(LockInfo, Option<String>)>> {
        let Some(fetched) = self.fetch(&self.key(LOCK_KEY)).await? else {
            return Ok(None);
        };
        let lock = serde_json::from_str(&fetched.body).map_err(|e| StateError::Corrupted {
            message: format!("unreadable lock: {e}"),
        })?;
        Ok(Some((lock, fetched.etag)))
    }
}

#[async_trait]
impl StateStore for S3StateStore {
    async fn load(&self) -> Result<Option<StateDocument>> {
        let key = self.key(STATE_KEY);
        let fetched = self.fetch(&key).await?;
        let mut seen = self.state_seen.lock().await;

        let Some(fetched) = fetched else {
            debug!("No state at {}", self.url(&key));
            *seen = Seen::Absent;
            return Ok(None);
        };

        let document: StateDocument =
            serde_json::from_str(&fetched.body).map_err(|e| StateError::Corrupted {
                message: format!("unreadable state at {}: {e}", self.url(&key)),
            })?;
        *seen = Seen::from_etag(fetched.etag.as_deref());

        debug!("Loaded state serial {} from {}", document.serial, self.url(&key));
        Ok(Some(document))
    }

    async fn save(&self, state: &StateDocument) -> Result<()> {
        let key = self.key(STATE_KEY);
        let body = serde_json::to_string_pretty(state)
            .map_err(|e| StateError::serialization(format!("state: {e}")))?;

        let mut seen = self.state_seen.lock().await;
        match self.put(&key, body, seen.precondition()).await {
            Ok(etag) => {
                *seen = Seen::from_etag(etag.as_deref());
                debug!("Saved state serial {} to {}", state.serial, self.url(&key));
                Ok(())
            }
            Err(PutFailure::Precondition) => {
                *seen = Seen::Unknown;
                Err(StateError::conflict(format!(
                    "{} was written by someone else before serial {} could be saved",
                    self.url(&key),
                    state.serial
                ))
                .into())
            }
            Err(PutFailure::Other(message)) => Err(StateError::s3(message).into()),
        }
    }

    async fn delete(&self) -> Result<()> {
        info!("Deleting state at {}", self.location());
        self.remove(&self.key(STATE_KEY)).await?;
        self.remove(&self.key(LOCK_KEY)).await?;
        *self.state_seen.lock().await = Seen::Absent;
        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        let key = self.key(STATE_KEY);
        match self.client.head_object().bucket(&self.bucket).key(&key).send().await {
            Ok(_) => Ok(true),
            Err(e) => {
                let e = e.into_service_error();
                if e.is_not_found() {
                    Ok(false)
                } else {
                    Err(StateError::s3(format!("head {}: {e}", self.url(&key))).into())
                }
            }
        }
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        let seen = match self.read_lock().await? {
            Some((existing, _)) if !existing.is_expired() => {
                return Err(StateError::LockedByOther {
                    holder: existing.holder,
                    since: existing.acquired_at.to_rfc3339(),
                }
                .into());
            }
            Some((existing, etag)) => {
                warn!("Taking over expired lock held by {}", existing.holder);
                Seen::from_etag(etag.as_deref())
            }
            None => Seen::Absent,
        };

        let lock = LockInfo::new(&holder_or_generated(holder), operation);
        let body = serde_json::to_string_pretty(&lock)
            .map_err(|e| StateError::serialization(format!("lock: {e}")))?;

        match self.put(&self.key(LOCK_KEY), body, seen.precondition()).await {
            Ok(_) => {
                info!("Acquired state lock {} (expires in {LOCK_EXPIRY_SECS}s)", lock.lock_id);
                Ok(lock)
            }
            Err(PutFailure::Precondition) => Err(StateError::LockFailed {
                message: String::from("another process took the lock concurrently"),
            }
            .into()),
            Err(PutFailure::Other(message)) => Err(CairnError::State(StateError::s3(message))),
        }
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        match self.read_lock().await? {
            Some((existing, _)) if existing.lock_id == lock_id => {
                self.remove(&self.key(LOCK_KEY)).await?;
                info!("Released state lock {lock_id}");
            }
            Some((existing, _)) => {
                debug!("Lock {lock_id} already replaced by {}", existing.lock_id);
            }
            None => {}
        }
        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        Ok(self.read_lock().await?.map(|(lock, _)| lock))
    }

    async fn force_unlock(&self) -> Result<()> {
        let key = self.key(LOCK_KEY);
        info!("Force-removing state lock at {}", self.url(&key));
        self.remove(&key).await
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }

    fn location(&self) -> String {
        self.url(&self.key(STATE_KEY))
    }
}

fn is_precondition_failure(code: Option<&str>) -> bool {
    code.is_some_and(|c| PRECONDITION_CODES.contains(&c))
}

/// Normalizes a key prefix to either empty or `segment/`.
fn normalize_prefix(prefix: Option<&str>) -> String {
    prefix
        .map(|p| p.trim_matches('/'))
        .filter(|p| !p.is_empty())
        .map(|p| format!("{p}/"))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(prefix: Option<&str>) -> S3StateStore {
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new("us-east-1"))
            .build();
        S3StateStore::with_client(Client::from_conf(config), "tfstate", prefix)
    }

    #[test]
    fn test_prefix_normalization() {
        assert_eq!(normalize_prefix(None), "");
        assert_eq!(normalize_prefix(Some("/")), "");
        assert_eq!(normalize_prefix(Some("site/prod/")), "site/prod/");
        assert_eq!(normalize_prefix(Some("/site")), "site/");
    }

    #[test]
    fn test_location() {
        assert_eq!(store(Some("site")).location(), "s3://tfstate/site/state.json");
        assert_eq!(store(None).key(LOCK_KEY), "state.lock");
        assert_eq!(store(None).backend_type(), "s3");
    }

    #[test]
    fn test_writes_are_conditional_on_last_read() {
        assert_eq!(Seen::Unknown.precondition(), Precondition::None);
        assert_eq!(Seen::Absent.precondition(), Precondition::IfNoneMatch);

        let seen = Seen::from_etag(Some("\"abc\""));
        assert_eq!(seen.precondition(), Precondition::IfMatch("\"abc\""));
        assert_eq!(Seen::from_etag(None), Seen::Unknown);
    }

    #[test]
    fn test_precondition_failure_codes() {
        assert!(is_precondition_failure(Some("PreconditionFailed")));
        assert!(is_precondition_failure(Some("ConditionalRequestConflict")));
        assert!(!is_precondition_failure(Some("AccessDenied")));
        assert!(!is_precondition_failure(None));
    }
}
