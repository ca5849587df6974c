//! Typed access to the objects of one cluster.
//!
//! Reconcile logic only talks to clusters through [`ObjectStore`], so the same code drives
//! the seed and the shoot, and tests can swap in an in-memory store.

use std::fmt::Debug;
use std::future::Future;

use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::api::{Api, DynamicObject};
use kube::{Resource, ResourceExt as _};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{info, instrument};

use crate::api::comparable::ResourceDiff;

mod client;
#[cfg(test)]
pub(crate) mod fake;

pub use client::KubeStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid object: {0}")]
    InvalidObject(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Kube Error: {0}")]
    Kube(#[source] kube::Error),
}

impl From<kube::Error> for StoreError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(r) if r.code == 404 => StoreError::NotFound(r.message),
            kube::Error::Api(r) if r.code == 409 && r.reason == "AlreadyExists" => {
                StoreError::AlreadyExists(r.message)
            }
            kube::Error::Api(r) if r.code == 409 => StoreError::Conflict(r.message),
            e => StoreError::Kube(e),
        }
    }
}

impl StoreError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists(_))
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Objects that can be read and written through an [`ObjectStore`].
pub trait StoreObject:
    Resource<DynamicType = ()>
    + GetApi<Namespace: Sync>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> StoreObject for K where
    K: Resource<DynamicType = ()>
        + GetApi<Namespace: Sync>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Remote object store operations used by the reconciler.
///
/// `get` reports a missing object as `Ok(None)`; every other operation reports it as
/// [`StoreError::NotFound`]. `update` and `patch_status` carry the object's resource version,
/// so a concurrent modification surfaces as [`StoreError::Conflict`].
pub trait ObjectStore: Send + Sync {
    fn get<K: StoreObject>(
        &self,
        namespace: &K::Namespace,
        name: &str,
    ) -> impl Future<Output = StoreResult<Option<K>>> + Send;

    fn create<K: StoreObject>(&self, obj: &K) -> impl Future<Output = StoreResult<K>> + Send;

    fn update<K: StoreObject>(&self, obj: &K) -> impl Future<Output = StoreResult<K>> + Send;

    fn list<K: StoreObject>(
        &self,
        namespace: &K::Namespace,
        label_selector: &str,
    ) -> impl Future<Output = StoreResult<Vec<K>>> + Send;

    fn delete<K: StoreObject>(
        &self,
        namespace: &K::Namespace,
        name: &str,
    ) -> impl Future<Output = StoreResult<()>> + Send;

    /// JSON merge patch against the status subresource.
    fn patch_status<K: StoreObject>(
        &self,
        namespace: &K::Namespace,
        name: &str,
        patch: &serde_json::Value,
    ) -> impl Future<Output = StoreResult<K>> + Send;

    /// Server-side apply of an untyped manifest object.
    fn apply(&self, obj: &DynamicObject) -> impl Future<Output = StoreResult<()>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Created,
    Updated,
    Unchanged,
}

/// Create `template` if it does not exist, otherwise run `mutate` against the live object and
/// write it back when it [differs](ResourceDiff).
///
/// On creation `mutate` runs against a copy of the template, so it must produce the same result
/// whether it is handed the template or a live object.
#[instrument(skip_all, fields(name = template.name_any(), kind = K::kind(&()).to_string()), err)]
pub async fn create_or_update<S, K, F>(
    store: &S,
    template: &K,
    mutate: F,
) -> StoreResult<Operation>
where
    S: ObjectStore,
    K: StoreObject + ResourceDiff,
    F: FnOnce(&mut K) + Send,
{
    let name = template.name_any();
    match store.get::<K>(template.get_namespace(), &name).await? {
        None => {
            let mut obj = template.clone();
            mutate(&mut obj);
            store.create(&obj).await?;
            info!("Created object");
            Ok(Operation::Created)
        }
        Some(existing) => {
            let mut obj = existing.clone();
            mutate(&mut obj);
            if !obj.diff(&existing) {
                return Ok(Operation::Unchanged);
            }
            store.update(&obj).await?;
            info!("Updated object");
            Ok(Operation::Updated)
        }
    }
}

/// Helper trait for getting [`kube::Api`] instances for a Kubernetes resource's scope
///
/// Not intended to be implemented manually, it is blanket-implemented for all types that implement [`Resource`]
/// for either the [namespace](`NamespaceResourceScope`) or [cluster](`ClusterResourceScope`) scopes.
///
/// Source: <https://github.com/stackabletech/operator-rs/blob/61c8a4f5a0c152dbcafadea6e0d0b82b59c02a32/crates/stackable-operator/src/client.rs#L559C1-L643C1>
/// Implemented locally to avoid a dependency on the external crate
pub trait GetApi: Resource + Sized {
    /// The namespace type for `Self`'s scope.
    ///
    /// This will be [`str`] for namespaced resource, and [`()`] for cluster-scoped resources.
    type Namespace: ?Sized;
    /// Get a [`kube::Api`] for `Self`'s native scope..
    fn get_api(client: kube::Client, ns: &Self::Namespace) -> kube::Api<Self>
    where
        Self::DynamicType: Default;
    /// Get the namespace of `Self`.
    fn get_namespace(&self) -> &Self::Namespace;
    /// The namespace as an optional name, `None` for cluster-scoped resources.
    fn namespace_name(ns: &Self::Namespace) -> Option<&str>;
}

impl<K> GetApi for K
where
    K: Resource,
    (K, K::Scope): GetApiImpl<Resource = K>,
{
    type Namespace = <(K, K::Scope) as GetApiImpl>::Namespace;

    fn get_api(client: kube::Client, ns: &Self::Namespace) -> kube::Api<Self>
    where
        Self::DynamicType: Default,
    {
        <(K, K::Scope) as GetApiImpl>::get_api(client, ns)
    }

    fn get_namespace(&self) -> &Self::Namespace {
        <(K, K::Scope) as GetApiImpl>::get_namespace(self)
    }

    fn namespace_name(ns: &Self::Namespace) -> Option<&str> {
        <(K, K::Scope) as GetApiImpl>::namespace_name(ns)
    }
}

#[doc(hidden)]
// Workaround for https://github.com/rust-lang/rust/issues/20400
pub trait GetApiImpl {
    type Resource: Resource;
    type Namespace: ?Sized;
    fn get_api(client: kube::Client, ns: &Self::Namespace) -> kube::Api<Self::Resource>
    where
        <Self::Resource as Resource>::DynamicType: Default;
    fn get_namespace(res: &Self::Resource) -> &Self::Namespace;
    fn namespace_name(ns: &Self::Namespace) -> Option<&str>;
}

impl<K> GetApiImpl for (K, NamespaceResourceScope)
where
    K: Resource<Scope = NamespaceResourceScope>,
{
    type Namespace = str;
    type Resource = K;

    fn get_api(client: kube::Client, ns: &Self::Namespace) -> kube::Api<K>
    where
        <Self::Resource as Resource>::DynamicType: Default,
    {
        Api::namespaced(client, ns)
    }

    fn get_namespace(res: &Self::Resource) -> &Self::Namespace {
        res.meta().namespace.as_deref().unwrap_or("default")
    }

    fn namespace_name(ns: &Self::Namespace) -> Option<&str> {
        Some(ns)
    }
}

impl<K> GetApiImpl for (K, ClusterResourceScope)
where
    K: Resource<Scope = ClusterResourceScope>,
{
    type Namespace = ();
    type Resource = K;

    fn get_api(client: kube::Client, (): &Self::Namespace) -> kube::Api<K>
    where
        <Self::Resource as Resource>::DynamicType: Default,
    {
        Api::all(client)
    }

    fn get_namespace(_res: &Self::Resource) -> &Self::Namespace {
        &()
    }

    fn namespace_name((): &Self::Namespace) -> Option<&str> {
        None
    }
}
