//! The one seam between the reconcilers and the API server.
//!
//! Every read and write the operator performs goes through [`ClusterClient`],
//! keyed by the resource's natural key (`namespace`, `name`). Writes carry
//! the resource version they were computed from, so a stale write comes back
//! as [`Error::Conflict`] instead of silently overwriting someone else.

#[cfg(test)]
pub mod fake;

use std::fmt::Debug;

use async_trait::async_trait;
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams,
};
use kube::core::TypeMeta;
use kube::{Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::debug;

use crate::error::{Error, Result};

pub trait ClusterObject:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<K> ClusterObject for K where
    K: Resource<DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

#[async_trait]
pub trait ClusterClient: Send + Sync + 'static {
    /// `Ok(None)` when the object does not exist.
    async fn get<K: ClusterObject>(&self, namespace: Option<&str>, name: &str)
    -> Result<Option<K>>;

    /// `namespace = None` lists across all namespaces (or the cluster scope).
    async fn list<K: ClusterObject>(
        &self,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<K>>;

    async fn create<K: ClusterObject>(&self, obj: &K) -> Result<K>;

    /// Full replace guarded by the object's resource version.
    async fn replace<K: ClusterObject>(&self, obj: &K) -> Result<K>;

    /// Deleting an object that is already gone succeeds.
    async fn delete<K: ClusterObject>(&self, namespace: Option<&str>, name: &str) -> Result<()>;

    async fn patch_status<K: ClusterObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
        status: Value,
    ) -> Result<()>;

    async fn patch_finalizers<K: ClusterObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
        finalizers: Vec<String>,
        resource_version: Option<String>,
    ) -> Result<()>;
}

/// Human-readable `Kind/namespace/name` used in logs and status messages.
pub fn describe<K: ClusterObject>(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) => format!("{}/{}/{}", K::kind(&()), ns, name),
        None => format!("{}/{}", K::kind(&()), name),
    }
}

#[derive(Clone)]
pub struct KubeClient {
    client: Client,
    field_manager: String,
}

impl KubeClient {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    pub fn inner(&self) -> &Client {
        &self.client
    }

    fn api<K: ClusterObject>(&self, namespace: Option<&str>) -> Api<DynamicObject> {
        let resource = ApiResource::erase::<K>(&());
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &resource),
            None => Api::all_with(self.client.clone(), &resource),
        }
    }

    fn post_params(&self) -> PostParams {
        PostParams {
            dry_run: false,
            field_manager: Some(self.field_manager.clone()),
        }
    }

    fn patch_params(&self) -> PatchParams {
        PatchParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        }
    }
}

fn type_meta<K: ClusterObject>() -> TypeMeta {
    TypeMeta {
        api_version: K::api_version(&()).into_owned(),
        kind: K::kind(&()).into_owned(),
    }
}

fn to_dynamic<K: ClusterObject>(obj: &K) -> Result<DynamicObject> {
    let mut dynamic: DynamicObject = serde_json::from_value(serde_json::to_value(obj)?)?;
    dynamic.types = Some(type_meta::<K>());
    Ok(dynamic)
}

fn from_dynamic<K: ClusterObject>(mut dynamic: DynamicObject) -> Result<K> {
    dynamic.types = Some(type_meta::<K>());
    Ok(serde_json::from_value(serde_json::to_value(dynamic)?)?)
}

fn map_write_error<K: ClusterObject>(err: kube::Error, name: &str) -> Error {
    match err {
        kube::Error::Api(ref response) if response.code == 409 => Error::Conflict {
            kind: K::kind(&()).into_owned(),
            name: name.to_string(),
        },
        other => Error::Kube(other),
    }
}

#[async_trait]
impl ClusterClient for KubeClient {
    async fn get<K: ClusterObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<K>> {
        let found = self
            .api::<K>(namespace)
            .get_opt(name)
            .await
            .map_err(Error::Kube)?;
        found.map(from_dynamic).transpose()
    }

    async fn list<K: ClusterObject>(
        &self,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<K>> {
        let mut params = ListParams::default();
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }
        let list = self
            .api::<K>(namespace)
            .list(&params)
            .await
            .map_err(Error::Kube)?;
        list.items.into_iter().map(from_dynamic).collect()
    }

    async fn create<K: ClusterObject>(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        debug!(object = %describe::<K>(obj.namespace().as_deref(), &name), "creating");
        let created = self
            .api::<K>(obj.namespace().as_deref())
            .create(&self.post_params(), &to_dynamic(obj)?)
            .await
            .map_err(|e| map_write_error::<K>(e, &name))?;
        from_dynamic(created)
    }

    async fn replace<K: ClusterObject>(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        debug!(object = %describe::<K>(obj.namespace().as_deref(), &name), "replacing");
        let replaced = self
            .api::<K>(obj.namespace().as_deref())
            .replace(&name, &self.post_params(), &to_dynamic(obj)?)
            .await
            .map_err(|e| map_write_error::<K>(e, &name))?;
        from_dynamic(replaced)
    }

    async fn delete<K: ClusterObject>(&self, namespace: Option<&str>, name: &str) -> Result<()> {
        match self
            .api::<K>(namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(e) => Err(map_write_error::<K>(e, name)),
        }
    }

    async fn patch_status<K: ClusterObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
        status: Value,
    ) -> Result<()> {
        self.api::<K>(namespace)
            .patch_status(name, &self.patch_params(), &Patch::Merge(json!({ "status": status })))
            .await
            .map_err(|e| map_write_error::<K>(e, name))?;
        Ok(())
    }

    async fn patch_finalizers<K: ClusterObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
        finalizers: Vec<String>,
        resource_version: Option<String>,
    ) -> Result<()> {
        let patch = json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": resource_version,
            }
        });
        self.api::<K>(namespace)
            .patch(name, &self.patch_params(), &Patch::Merge(patch))
            .await
            .map_err(|e| map_write_error::<K>(e, name))?;
        Ok(())
    }
}
