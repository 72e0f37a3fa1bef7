//! Sandbox providers.
//!
//! Every resource kind is backed by a [`SandboxRemote`]: a simulated
//! remote side that assigns external ids, fills in computed attributes and
//! optionally persists itself to a JSON file. Tests use it to inject faults
//! and to mutate objects behind the engine's back (drift).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::error::{ProviderError, Result};
use crate::resource::{Attributes, ResourceId, ResourceKind};

use super::{Created, Operation, Provider, ProviderResult, ResourceSchema};

/// Region assumed when a bucket does not name one.
const DEFAULT_REGION: &str = "us-east-1";

/// An object held by the simulated remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteObject {
    /// Resource that created the object.
    pub resource: ResourceId,
    /// Current attributes, including computed ones.
    pub attributes: Attributes,
}

/// A provider call observed by the remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Call {
    /// Operation performed.
    pub operation: Operation,
    /// Resource the call was made for.
    pub resource: ResourceId,
}

/// An injected failure.
#[derive(Debug, Clone, PartialEq)]
pub struct Fault {
    error: ProviderError,
    /// Remaining failures; `None` fails forever.
    remaining: Option<u32>,
}

impl Fault {
    /// Fails every call with a permanent error.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            error: ProviderError::permanent(message),
            remaining: None,
        }
    }

    /// Fails the next `times` calls (at least one) with a transient error.
    #[must_use]
    pub fn transient(message: impl Into<String>, times: u32) -> Self {
        Self {
            error: ProviderError::transient(message),
            remaining: Some(times.max(1)),
        }
    }

    /// Fails every call with a transient error.
    #[must_use]
    pub fn always_transient(message: impl Into<String>) -> Self {
        Self {
            error: ProviderError::transient(message),
            remaining: None,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RemoteState {
    next_id: u64,
    objects: BTreeMap<String, RemoteObject>,
    #[serde(skip)]
    faults: BTreeMap<(ResourceId, Operation), Fault>,
    #[serde(skip)]
    calls: Vec<Call>,
}

impl RemoteState {
    fn find(&self, id: &ResourceId) -> Option<&str> {
        self.objects
            .iter()
            .find(|(_, object)| object.resource == *id)
            .map(|(external_id, _)| external_id.as_str())
    }

    /// Records the call and returns the injected error, if any.
    fn observe(&mut self, operation: Operation, resource: &ResourceId) -> ProviderResult<()> {
        self.calls.push(Call {
            operation,
            resource: resource.clone(),
        });

        let key = (resource.clone(), operation);
        let Some(fault) = self.faults.get_mut(&key) else {
            return Ok(());
        };

        let error = fault.error.clone();
        let exhausted = match fault.remaining.as_mut() {
            None => false,
            Some(n) => {
                *n = n.saturating_sub(1);
                *n == 0
            }
        };
        if exhausted {
            self.faults.remove(&key);
        }

        debug!("Injected {operation} failure for {resource}: {}", error.message());
        Err(error)
    }
}

/// Decrements the in-flight counter when a call completes.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Simulated remote shared by the sandbox providers.
#[derive(Debug, Clone)]
pub struct SandboxRemote {
    state: Arc<Mutex<RemoteState>>,
    path: Option<Arc<PathBuf>>,
    latency: Duration,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl SandboxRemote {
    /// Creates a remote that lives only in memory.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            state: Arc::new(Mutex::new(RemoteState::default())),
            path: None,
            latency: Duration::ZERO,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Opens a remote persisted at `path`, creating it on first write.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let state = if tokio::fs::try_exists(&path).await? {
            let content = tokio::fs::read_to_string(&path).await?;
            serde_json::from_str(&content).map_err(|e| {
                ProviderError::permanent(format!(
                    "sandbox remote {} is unreadable: {e}",
                    path.display()
                ))
            })?
        } else {
            RemoteState::default()
        };

        debug!(
            "Opened sandbox remote at {} ({} objects)",
            path.display(),
            state.objects.len()
        );

        Ok(Self {
            state: Arc::new(Mutex::new(state)),
            path: Some(Arc::new(path)),
            ..Self::in_memory()
        })
    }

    /// Adds a fixed delay to every provider call.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Injects a fault for an operation on a resource.
    pub async fn inject(&self, resource: &ResourceId, operation: Operation, fault: Fault) {
        self.state
            .lock()
            .await
            .faults
            .insert((resource.clone(), operation), fault);
    }

    /// Changes an attribute of a resource's object out of band.
    ///
    /// Returns false if the resource has no object.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote cannot be persisted.
    pub async fn tamper(&self, resource: &ResourceId, attribute: &str, value: Value) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(external_id) = state.find(resource).map(String::from) else {
            return Ok(false);
        };

        if let Some(object) = state.objects.get_mut(&external_id) {
            object.attributes.insert(attribute.to_string(), value);
        }
        self.persist(&state).await?;
        Ok(true)
    }

    /// Deletes a resource's object out of band.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote cannot be persisted.
    pub async fn remove(&self, resource: &ResourceId) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(external_id) = state.find(resource).map(String::from) else {
            return Ok(false);
        };

        state.objects.remove(&external_id);
        self.persist(&state).await?;
        Ok(true)
    }

    /// Returns every object keyed by external id.
    pub async fn objects(&self) -> BTreeMap<String, RemoteObject> {
        self.state.lock().await.objects.clone()
    }

    /// Returns the object created for a resource.
    pub async fn object_for(&self, resource: &ResourceId) -> Option<(String, RemoteObject)> {
        let state = self.state.lock().await;
        let external_id = state.find(resource)?;
        state
            .objects
            .get(external_id)
            .map(|object| (external_id.to_string(), object.clone()))
    }

    /// Returns the calls observed so far, in order.
    pub async fn calls(&self) -> Vec<Call> {
        self.state.lock().await.calls.clone()
    }

    /// Highest number of simultaneous calls observed.
    #[must_use]
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> InFlight<'_> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        InFlight(&self.in_flight)
    }

    async fn persist(&self, state: &RemoteState) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let content = serde_json::to_string_pretty(state).map_err(|e| {
            ProviderError::permanent(format!("failed to serialize sandbox remote: {e}"))
        })?;

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let temp = path.with_extension("json.tmp");
        tokio::fs::write(&temp, content).await?;
        tokio::fs::rename(&temp, path.as_ref()).await?;

        trace!("Persisted sandbox remote to {}", path.display());
        Ok(())
    }

    async fn persist_for_provider(&self, state: &RemoteState) -> ProviderResult<()> {
        self.persist(state)
            .await
            .map_err(|e| ProviderError::transient(format!("sandbox remote write failed: {e}")))
    }
}

/// Sandbox provider for one resource kind.
#[derive(Debug, Clone)]
pub struct SandboxProvider {
    kind: ResourceKind,
    schema: ResourceSchema,
    remote: SandboxRemote,
}

impl SandboxProvider {
    /// Creates a sandbox provider for `kind` backed by `remote`.
    #[must_use]
    pub fn new(kind: ResourceKind, remote: SandboxRemote) -> Self {
        Self {
            kind,
            schema: schema_for(kind),
            remote,
        }
    }

    fn computed(&self, resource: &ResourceId, external_id: &str, desired: &Attributes) -> Attributes {
        let text = |name: &str| desired.get(name).and_then(Value::as_str).map(String::from);
        let mut out = Attributes::new();

        match self.kind {
            ResourceKind::Bucket => {
                let bucket = text("bucket_name").unwrap_or_else(|| resource.name.clone());
                let region = text("region").unwrap_or_else(|| DEFAULT_REGION.to_string());
                out.insert("id".into(), Value::String(bucket.clone()));
                out.insert("arn".into(), Value::String(format!("arn:sandbox:s3:::{bucket}")));
                out.insert(
                    "domain_name".into(),
                    Value::String(format!("{bucket}.s3.sandbox.local")),
                );
                out.insert(
                    "regional_domain_name".into(),
                    Value::String(format!("{bucket}.s3.{region}.sandbox.local")),
                );
            }
            ResourceKind::CdnDistribution => {
                out.insert("id".into(), Value::String(external_id.to_uppercase()));
                out.insert(
                    "arn".into(),
                    Value::String(format!("arn:sandbox:cdn::distribution/{}", external_id.to_uppercase())),
                );
                out.insert(
                    "domain_name".into(),
                    Value::String(format!("{external_id}.cdn.sandbox.local")),
                );
            }
            ResourceKind::Certificate => {
                out.insert(
                    "arn".into(),
                    Value::String(format!("arn:sandbox:acm:certificate/{external_id}")),
                );
                out.insert("status".into(), Value::String("ISSUED".into()));
            }
            ResourceKind::DnsRecord => {
                let name = text("name").unwrap_or_else(|| resource.name.clone());
                let fqdn = match text("zone") {
                    Some(zone) if !name.ends_with(&zone) => format!("{name}.{zone}"),
                    _ => name,
                };
                out.insert("fqdn".into(), Value::String(fqdn));
            }
            ResourceKind::AccessPolicy => {
                out.insert("id".into(), Value::String(external_id.to_string()));
            }
        }

        out
    }

    fn actual(&self, resource: &ResourceId, external_id: &str, desired: &Attributes) -> Attributes {
        let mut attributes = desired.clone();
        attributes.extend(self.computed(resource, external_id, desired));
        attributes
    }
}

#[async_trait]
impl Provider for SandboxProvider {
    fn kind(&self) -> ResourceKind {
        self.kind
    }

    fn schema(&self) -> &ResourceSchema {
        &self.schema
    }

    async fn read(&self, external_id: &str) -> ProviderResult<Option<Attributes>> {
        let _guard = self.remote.enter().await;
        let mut state = self.remote.state.lock().await;

        let Some(object) = state.objects.get(external_id).cloned() else {
            return Ok(None);
        };
        state.observe(Operation::Read, &object.resource)?;

        Ok(Some(object.attributes))
    }

    async fn create(&self, id: &ResourceId, desired: &Attributes) -> ProviderResult<Created> {
        let _guard = self.remote.enter().await;
        let mut state = self.remote.state.lock().await;
        state.observe(Operation::Create, id)?;

        state.next_id += 1;
        let external_id = format!("{}-{:06x}", external_prefix(self.kind), state.next_id);
        let attributes = self.actual(id, &external_id, desired);

        state.objects.insert(
            external_id.clone(),
            RemoteObject {
                resource: id.clone(),
                attributes: attributes.clone(),
            },
        );
        self.remote.persist_for_provider(&state).await?;

        debug!("Sandbox created {id} as {external_id}");
        Ok(Created {
            external_id,
            attributes,
        })
    }

    async fn update(&self, external_id: &str, desired: &Attributes) -> ProviderResult<Attributes> {
        let _guard = self.remote.enter().await;
        let mut state = self.remote.state.lock().await;

        let Some(object) = state.objects.get(external_id).cloned() else {
            return Err(ProviderError::permanent(format!(
                "{} {external_id} does not exist",
                self.kind
            )));
        };
        state.observe(Operation::Update, &object.resource)?;

        if let Some(attribute) = self
            .schema
            .force_new
            .iter()
            .find(|name| object.attributes.get(*name) != desired.get(*name))
        {
            return Err(ProviderError::permanent(format!(
                "attribute '{attribute}' of {} cannot be changed in place",
                object.resource
            )));
        }

        let attributes = self.actual(&object.resource, external_id, desired);
        if let Some(stored) = state.objects.get_mut(external_id) {
            stored.attributes.clone_from(&attributes);
        }
        self.remote.persist_for_provider(&state).await?;

        debug!("Sandbox updated {} ({external_id})", object.resource);
        Ok(attributes)
    }

    async fn delete(&self, external_id: &str) -> ProviderResult<()> {
        let _guard = self.remote.enter().await;
        let mut state = self.remote.state.lock().await;

        let Some(object) = state.objects.get(external_id).cloned() else {
            return Ok(());
        };
        state.observe(Operation::Delete, &object.resource)?;

        state.objects.remove(external_id);
        self.remote.persist_for_provider(&state).await?;

        debug!("Sandbox deleted {} ({external_id})", object.resource);
        Ok(())
    }
}

/// Attribute metadata of the sandbox provider for a kind.
#[must_use]
pub fn schema_for(kind: ResourceKind) -> ResourceSchema {
    match kind {
        ResourceKind::Bucket => ResourceSchema::new()
            .force_new(["bucket_name", "region"])
            .computed(["id", "arn", "domain_name", "regional_domain_name"]),
        ResourceKind::CdnDistribution => {
            ResourceSchema::new().computed(["id", "arn", "domain_name"])
        }
        ResourceKind::Certificate => ResourceSchema::new()
            .force_new(["domain_name", "subject_alternative_names", "validation_method"])
            .computed(["arn", "status"]),
        ResourceKind::DnsRecord => ResourceSchema::new()
            .force_new(["name", "zone", "type"])
            .computed(["fqdn"]),
        ResourceKind::AccessPolicy => ResourceSchema::new().force_new(["bucket"]).computed(["id"]),
    }
}

const fn external_prefix(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::Bucket => "bkt",
        ResourceKind::CdnDistribution => "dist",
        ResourceKind::Certificate => "cert",
        ResourceKind::DnsRecord => "rec",
        ResourceKind::AccessPolicy => "pol",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn attrs(value: Value) -> Attributes {
        serde_json::from_value(value).unwrap()
    }

    fn id(s: &str) -> ResourceId {
        ResourceId::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_create_fills_computed_attributes() {
        let remote = SandboxRemote::in_memory();
        let provider = SandboxProvider::new(ResourceKind::Bucket, remote.clone());

        let created = provider
            .create(&id("bucket.site"), &attrs(json!({"bucket_name": "site-content"})))
            .await
            .unwrap();

        assert!(created.external_id.starts_with("bkt-"));
        assert_eq!(created.attributes["bucket_name"], json!("site-content"));
        assert_eq!(created.attributes["domain_name"], json!("site-content.s3.sandbox.local"));
        assert_eq!(remote.objects().await.len(), 1);

        let read = provider.read(&created.external_id).await.unwrap();
        assert_eq!(read, Some(created.attributes));
    }

    #[tokio::test]
    async fn test_delete_absent_is_ok() {
        let provider = SandboxProvider::new(ResourceKind::DnsRecord, SandboxRemote::in_memory());
        provider.delete("rec-000999").await.unwrap();
        assert_eq!(provider.read("rec-000999").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_update_rejects_force_new_change() {
        let provider = SandboxProvider::new(ResourceKind::Certificate, SandboxRemote::in_memory());
        let created = provider
            .create(&id("certificate.site"), &attrs(json!({"domain_name": "example.com"})))
            .await
            .unwrap();

        let err = provider
            .update(&created.external_id, &attrs(json!({"domain_name": "example.org"})))
            .await
            .unwrap_err();
        assert!(!err.is_transient());

        let updated = provider
            .update(
                &created.external_id,
                &attrs(json!({"domain_name": "example.com", "key_algorithm": "EC_prime256v1"})),
            )
            .await
            .unwrap();
        assert_eq!(updated["status"], json!("ISSUED"));
        assert_eq!(updated["key_algorithm"], json!("EC_prime256v1"));
    }

    #[tokio::test]
    async fn test_transient_fault_clears() {
        let remote = SandboxRemote::in_memory();
        let provider = SandboxProvider::new(ResourceKind::Bucket, remote.clone());
        let bucket = id("bucket.site");

        remote
            .inject(&bucket, Operation::Create, Fault::transient("throttled", 1))
            .await;

        let first = provider.create(&bucket, &Attributes::new()).await;
        assert!(first.unwrap_err().is_transient());
        provider.create(&bucket, &Attributes::new()).await.unwrap();

        assert_eq!(remote.calls().await.len(), 2);
    }

    #[tokio::test]
    async fn test_tamper_is_visible_to_read() {
        let remote = SandboxRemote::in_memory();
        let provider = SandboxProvider::new(ResourceKind::Bucket, remote.clone());
        let bucket = id("bucket.site");

        let created = provider
            .create(&bucket, &attrs(json!({"versioning": true})))
            .await
            .unwrap();
        assert!(remote.tamper(&bucket, "versioning", json!(false)).await.unwrap());

        let read = provider.read(&created.external_id).await.unwrap().unwrap();
        assert_eq!(read["versioning"], json!(false));

        assert!(remote.remove(&bucket).await.unwrap());
        assert_eq!(provider.read(&created.external_id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_persisted_remote_reopens() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("remote.json");

        let remote = SandboxRemote::open(&path).await.unwrap();
        let provider = SandboxProvider::new(ResourceKind::AccessPolicy, remote);
        let created = provider
            .create(&id("access_policy.read"), &attrs(json!({"bucket": "site"})))
            .await
            .unwrap();

        let reopened = SandboxRemote::open(&path).await.unwrap();
        let objects = reopened.objects().await;
        assert_eq!(objects[&created.external_id].resource, id("access_policy.read"));

        // ids keep increasing across sessions
        let again = SandboxProvider::new(ResourceKind::AccessPolicy, reopened)
            .create(&id("access_policy.write"), &Attributes::new())
            .await
            .unwrap();
        assert_ne!(again.external_id, created.external_id);
    }
}
