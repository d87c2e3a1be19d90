//! In-memory [`ClusterClient`] for unit tests. It keeps objects as JSON,
//! bumps resource versions on every write, rejects stale writes and counts
//! the writes it accepted.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use kube::ResourceExt;
use kube::core::ErrorResponse;
use serde_json::{Value, json};

use super::{ClusterClient, ClusterObject};
use crate::error::{Error, Result};

type Key = (String, String, String);

#[derive(Default)]
pub struct FakeClient {
    objects: Mutex<BTreeMap<Key, Value>>,
    versions: AtomicU64,
    writes: AtomicUsize,
    failing: Mutex<BTreeSet<(String, String)>>,
}

fn type_key<K: ClusterObject>() -> String {
    format!("{}/{}", K::api_version(&()), K::kind(&()))
}

fn key<K: ClusterObject>(namespace: Option<&str>, name: &str) -> Key {
    (
        type_key::<K>(),
        namespace.unwrap_or_default().to_string(),
        name.to_string(),
    )
}

fn api_error(code: u16, reason: &str, message: String) -> Error {
    Error::Kube(kube::Error::Api(ErrorResponse {
        status: "Failure".into(),
        message,
        reason: reason.into(),
        code,
    }))
}

fn not_found<K: ClusterObject>(name: &str) -> Error {
    api_error(404, "NotFound", format!("{} {name} not found", K::kind(&())))
}

fn decode<K: ClusterObject>(value: &Value) -> Result<K> {
    let mut value = value.clone();
    value["apiVersion"] = json!(K::api_version(&()));
    value["kind"] = json!(K::kind(&()));
    Ok(serde_json::from_value(value)?)
}

impl FakeClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes accepted so far. Seeding does not count.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Stores an object as if it already existed in the cluster.
    pub fn seed<K: ClusterObject>(&self, obj: K) -> K {
        let mut obj = obj;
        let version = self.next_version();
        let meta = obj.meta_mut();
        meta.resource_version = Some(version.clone());
        if meta.uid.is_none() {
            meta.uid = Some(format!("fake-uid-{version}"));
        }
        let key = key::<K>(obj.namespace().as_deref(), &obj.name_any());
        let value = serde_json::to_value(&obj).expect("serializable object");
        self.objects.lock().expect("fake lock").insert(key, value);
        obj
    }

    /// Synchronous read for assertions.
    pub fn stored<K: ClusterObject>(&self, namespace: Option<&str>, name: &str) -> Option<K> {
        let objects = self.objects.lock().expect("fake lock");
        objects
            .get(&key::<K>(namespace, name))
            .map(|v| decode(v).expect("decodable object"))
    }

    pub fn names<K: ClusterObject>(&self) -> Vec<String> {
        let kind = type_key::<K>();
        let objects = self.objects.lock().expect("fake lock");
        objects
            .keys()
            .filter(|(k, _, _)| *k == kind)
            .map(|(_, _, name)| name.clone())
            .collect()
    }

    /// Every later write to this object fails with a server error.
    pub fn fail_writes_to<K: ClusterObject>(&self, name: &str) {
        self.failing
            .lock()
            .expect("fake lock")
            .insert((type_key::<K>(), name.to_string()));
    }

    fn next_version(&self) -> String {
        (self.versions.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn check_failing<K: ClusterObject>(&self, name: &str) -> Result<()> {
        let failing = self.failing.lock().expect("fake lock");
        if failing.contains(&(type_key::<K>(), name.to_string())) {
            return Err(api_error(500, "InternalError", format!("injected failure for {name}")));
        }
        Ok(())
    }

    fn accept_write(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

fn labels_match(value: &Value, selector: Option<&str>) -> bool {
    let Some(selector) = selector else {
        return true;
    };
    let labels = &value["metadata"]["labels"];
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels[k.trim()].as_str() == Some(v.trim()),
            None => !labels[term.trim()].is_null(),
        })
}

fn stale(stored: &Value, incoming: Option<&str>) -> bool {
    match incoming {
        Some(rv) => stored["metadata"]["resourceVersion"].as_str() != Some(rv),
        None => false,
    }
}

#[async_trait]
impl ClusterClient for FakeClient {
    async fn get<K: ClusterObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<K>> {
        let objects = self.objects.lock().expect("fake lock");
        objects
            .get(&key::<K>(namespace, name))
            .map(decode::<K>)
            .transpose()
    }

    async fn list<K: ClusterObject>(
        &self,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<K>> {
        let kind = type_key::<K>();
        let objects = self.objects.lock().expect("fake lock");
        objects
            .iter()
            .filter(|((k, ns, _), _)| *k == kind && namespace.is_none_or(|want| want == ns))
            .filter(|(_, value)| labels_match(value, label_selector))
            .map(|(_, value)| decode::<K>(value))
            .collect()
    }

    async fn create<K: ClusterObject>(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        self.check_failing::<K>(&name)?;
        let key = key::<K>(obj.namespace().as_deref(), &name);
        let mut objects = self.objects.lock().expect("fake lock");
        if objects.contains_key(&key) {
            return Err(Error::Conflict {
                kind: K::kind(&()).into_owned(),
                name,
            });
        }
        let mut created = obj.clone();
        let version = self.next_version();
        let meta = created.meta_mut();
        meta.resource_version = Some(version.clone());
        if meta.uid.is_none() {
            meta.uid = Some(format!("fake-uid-{version}"));
        }
        objects.insert(key, serde_json::to_value(&created)?);
        self.accept_write();
        Ok(created)
    }

    async fn replace<K: ClusterObject>(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        self.check_failing::<K>(&name)?;
        let key = key::<K>(obj.namespace().as_deref(), &name);
        let mut objects = self.objects.lock().expect("fake lock");
        let stored = objects.get(&key).ok_or_else(|| not_found::<K>(&name))?;
        if stale(stored, obj.resource_version().as_deref()) {
            return Err(Error::Conflict {
                kind: K::kind(&()).into_owned(),
                name,
            });
        }
        let mut replaced = obj.clone();
        replaced.meta_mut().resource_version = Some(self.next_version());
        objects.insert(key, serde_json::to_value(&replaced)?);
        self.accept_write();
        Ok(replaced)
    }

    async fn delete<K: ClusterObject>(&self, namespace: Option<&str>, name: &str) -> Result<()> {
        self.check_failing::<K>(name)?;
        let key = key::<K>(namespace, name);
        let mut objects = self.objects.lock().expect("fake lock");
        let Some(stored) = objects.get_mut(&key) else {
            return Ok(());
        };
        let has_finalizers = stored["metadata"]["finalizers"]
            .as_array()
            .is_some_and(|f| !f.is_empty());
        if has_finalizers {
            stored["metadata"]["deletionTimestamp"] = json!("2024-01-01T00:00:00Z");
            stored["metadata"]["resourceVersion"] = json!(self.next_version());
        } else {
            objects.remove(&key);
        }
        self.accept_write();
        Ok(())
    }

    async fn patch_status<K: ClusterObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
        status: Value,
    ) -> Result<()> {
        self.check_failing::<K>(name)?;
        let mut objects = self.objects.lock().expect("fake lock");
        let stored = objects
            .get_mut(&key::<K>(namespace, name))
            .ok_or_else(|| not_found::<K>(name))?;
        match status {
            Value::Object(patch) if stored["status"].is_object() => {
                if let Some(current) = stored["status"].as_object_mut() {
                    current.extend(patch);
                }
            }
            status => stored["status"] = status,
        }
        stored["metadata"]["resourceVersion"] = json!(self.next_version());
        self.accept_write();
        Ok(())
    }

    async fn patch_finalizers<K: ClusterObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
        finalizers: Vec<String>,
        resource_version: Option<String>,
    ) -> Result<()> {
        self.check_failing::<K>(name)?;
        let key = key::<K>(namespace, name);
        let mut objects = self.objects.lock().expect("fake lock");
        let stored = objects.get_mut(&key).ok_or_else(|| not_found::<K>(name))?;
        if stale(stored, resource_version.as_deref()) {
            return Err(Error::Conflict {
                kind: K::kind(&()).into_owned(),
                name: name.to_string(),
            });
        }
        let terminating = !stored["metadata"]["deletionTimestamp"].is_null();
        if finalizers.is_empty() && terminating {
            objects.remove(&key);
        } else {
            stored["metadata"]["finalizers"] = json!(finalizers);
            stored["metadata"]["resourceVersion"] = json!(self.next_version());
        }
        self.accept_write();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Namespace;
    use kube::api::ObjectMeta;

    fn namespace(name: &str) -> Namespace {
        Namespace {
            metadata: ObjectMeta {
                name: Some(name.into()),
                labels: Some([("team".to_string(), "a".to_string())].into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_stale_replace_conflicts() {
        let fake = FakeClient::new();
        let created = fake.create(&namespace("p")).await.unwrap();
        let mut first = created.clone();
        first.labels_mut().insert("x".into(), "1".into());
        fake.replace(&first).await.unwrap();

        let mut second = created;
        second.labels_mut().insert("x".into(), "2".into());
        let err = fake.replace(&second).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(fake.writes(), 2);
    }

    #[tokio::test]
    async fn test_list_filters_on_labels() {
        let fake = FakeClient::new();
        fake.seed(namespace("p"));
        fake.seed(Namespace {
            metadata: ObjectMeta {
                name: Some("other".into()),
                ..Default::default()
            },
            ..Default::default()
        });
        let all: Vec<Namespace> = fake.list(None, None).await.unwrap();
        assert_eq!(all.len(), 2);
        let team: Vec<Namespace> = fake.list(None, Some("team=a")).await.unwrap();
        assert_eq!(team.len(), 1);
        assert_eq!(fake.writes(), 0);
    }

    #[tokio::test]
    async fn test_delete_waits_for_finalizers() {
        let fake = FakeClient::new();
        let mut ns = namespace("p");
        ns.metadata.finalizers = Some(vec!["keep".into()]);
        fake.seed(ns);

        fake.delete::<Namespace>(None, "p").await.unwrap();
        let stored: Namespace = fake.stored(None, "p").unwrap();
        assert!(stored.metadata.deletion_timestamp.is_some());

        fake.patch_finalizers::<Namespace>(None, "p", vec![], None)
            .await
            .unwrap();
        assert!(fake.stored::<Namespace>(None, "p").is_none());
    }
}
