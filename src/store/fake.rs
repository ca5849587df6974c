//! In-memory [`ObjectStore`] for tests.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use kube::ResourceExt as _;
use kube::api::DynamicObject;
use kube::core::ErrorResponse;
use serde_json::Value;

use super::{ObjectStore, StoreError, StoreObject, StoreResult};

type Key = (String, String, Option<String>, String);
type Reactor = Box<dyn Fn(&mut Value) + Send + Sync>;

/// A mutating call observed by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Create { kind: String, name: String },
    Update { kind: String, name: String },
    Delete { kind: String, name: String },
    PatchStatus { kind: String, name: String },
    Apply { kind: String, name: String },
}

#[derive(Default)]
pub(crate) struct FakeStore {
    objects: Mutex<BTreeMap<Key, Value>>,
    calls: Mutex<Vec<Call>>,
    reactors: Mutex<Vec<(String, Reactor)>>,
    removed_after_list: Mutex<Vec<Key>>,
    reads: AtomicUsize,
    unavailable: AtomicBool,
    version: AtomicU64,
}

fn key_for<K: StoreObject>(namespace: &K::Namespace, name: &str) -> Key {
    (
        K::api_version(&()).into_owned(),
        K::kind(&()).into_owned(),
        K::namespace_name(namespace).map(str::to_string),
        name.to_string(),
    )
}

fn matches_selector(value: &Value, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|s| !s.is_empty())
        .all(|requirement| match requirement.split_once('=') {
            Some((k, v)) => value["metadata"]["labels"][k].as_str() == Some(v),
            None => false,
        })
}

/// Objects with a spec get a generation that moves whenever the spec changes.
fn bump_generation(existing: Option<&Value>, value: &mut Value) {
    if value.get("spec").is_none() {
        return;
    }
    let generation = match existing {
        None => 1,
        Some(existing) => {
            let current = existing["metadata"]["generation"].as_i64().unwrap_or(1);
            if existing.get("spec") == value.get("spec") {
                current
            } else {
                current + 1
            }
        }
    };
    value["metadata"]["generation"] = generation.into();
}

/// `value` without the fields the server owns.
fn desired_content(value: &Value) -> Value {
    let mut value = value.clone();
    if let Some(map) = value.as_object_mut() {
        map.remove("status");
    }
    if let Some(metadata) = value.get_mut("metadata").and_then(Value::as_object_mut) {
        metadata.remove("resourceVersion");
        metadata.remove("generation");
    }
    value
}

fn merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (k, v) in patch {
                if v.is_null() {
                    target.remove(k);
                } else {
                    merge(target.entry(k.clone()).or_insert(Value::Null), v);
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

impl FakeStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Seed an object without recording a call.
    pub(crate) fn insert<K: StoreObject>(&self, obj: &K) {
        let mut value = serde_json::to_value(obj).unwrap();
        self.stamp(&mut value);
        self.objects
            .lock()
            .unwrap()
            .insert(key_for::<K>(obj.get_namespace(), &obj.name_any()), value);
    }

    /// Read an object without counting it as a read.
    pub(crate) fn fetch<K: StoreObject>(&self, namespace: &K::Namespace, name: &str) -> Option<K> {
        self.objects
            .lock()
            .unwrap()
            .get(&key_for::<K>(namespace, name))
            .map(|v| serde_json::from_value(v.clone()).unwrap())
    }

    pub(crate) fn names<K: StoreObject>(&self, namespace: &K::Namespace) -> Vec<String> {
        let (api_version, kind, ns, _) = key_for::<K>(namespace, "");
        self.objects
            .lock()
            .unwrap()
            .keys()
            .filter(|(a, k, n, _)| *a == api_version && *k == kind && *n == ns)
            .map(|(_, _, _, name)| name.clone())
            .collect()
    }

    /// Run `reactor` on every object of `kind` after it is written, like a controller would.
    pub(crate) fn react(&self, kind: &str, reactor: impl Fn(&mut Value) + Send + Sync + 'static) {
        self.reactors
            .lock()
            .unwrap()
            .push((kind.to_string(), Box::new(reactor)));
    }

    /// Remove `name` right after the next list of its kind, like a concurrent deletion would.
    pub(crate) fn remove_after_list<K: StoreObject>(&self, namespace: &K::Namespace, name: &str) {
        self.removed_after_list
            .lock()
            .unwrap()
            .push(key_for::<K>(namespace, name));
    }

    /// Fail every subsequent read with a server error.
    pub(crate) fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn stamp(&self, value: &mut Value) {
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        value["metadata"]["resourceVersion"] = Value::String(version.to_string());
    }

    fn write(&self, key: Key, mut value: Value) -> Value {
        let existing = self.objects.lock().unwrap().get(&key).cloned();
        bump_generation(existing.as_ref(), &mut value);
        self.stamp(&mut value);
        for (kind, reactor) in self.reactors.lock().unwrap().iter() {
            if *kind == key.1 {
                reactor(&mut value);
            }
        }
        self.objects.lock().unwrap().insert(key, value.clone());
        value
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn check_available(&self) -> StoreResult<()> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Kube(kube::Error::Api(
                ErrorResponse {
                    status: "Failure".into(),
                    message: "the server is currently unable to handle the request".into(),
                    reason: "ServiceUnavailable".into(),
                    code: 503,
                }
                .into(),
            )));
        }
        Ok(())
    }
}

impl ObjectStore for FakeStore {
    async fn get<K: StoreObject>(&self, namespace: &K::Namespace, name: &str) -> StoreResult<Option<K>> {
        self.check_available()?;
        let value = self
            .objects
            .lock()
            .unwrap()
            .get(&key_for::<K>(namespace, name))
            .cloned();
        Ok(value.map(serde_json::from_value).transpose()?)
    }

    async fn create<K: StoreObject>(&self, obj: &K) -> StoreResult<K> {
        let name = obj.name_any();
        self.record(Call::Create {
            kind: K::kind(&()).into_owned(),
            name: name.clone(),
        });
        let key = key_for::<K>(obj.get_namespace(), &name);
        if self.objects.lock().unwrap().contains_key(&key) {
            return Err(StoreError::AlreadyExists(name));
        }
        let value = self.write(key, serde_json::to_value(obj)?);
        Ok(serde_json::from_value(value)?)
    }

    async fn update<K: StoreObject>(&self, obj: &K) -> StoreResult<K> {
        let name = obj.name_any();
        self.record(Call::Update {
            kind: K::kind(&()).into_owned(),
            name: name.clone(),
        });
        let key = key_for::<K>(obj.get_namespace(), &name);
        let existing = self.objects.lock().unwrap().get(&key).cloned();
        let Some(existing) = existing else {
            return Err(StoreError::NotFound(name));
        };
        if let Some(version) = obj.resource_version() {
            if existing["metadata"]["resourceVersion"].as_str() != Some(version.as_str()) {
                return Err(StoreError::Conflict(name));
            }
        }
        let mut value = serde_json::to_value(obj)?;
        // status is a subresource and survives a plain update
        match existing.get("status") {
            Some(status) => value["status"] = status.clone(),
            None => {
                if let Some(map) = value.as_object_mut() {
                    map.remove("status");
                }
            }
        }
        let value = self.write(key, value);
        Ok(serde_json::from_value(value)?)
    }

    async fn list<K: StoreObject>(
        &self,
        namespace: &K::Namespace,
        label_selector: &str,
    ) -> StoreResult<Vec<K>> {
        self.check_available()?;
        let (api_version, kind, ns, _) = key_for::<K>(namespace, "");
        let mut objects = self.objects.lock().unwrap();
        let listed: StoreResult<Vec<K>> = objects
            .iter()
            .filter(|((a, k, n, _), v)| {
                *a == api_version && *k == kind && *n == ns && matches_selector(v, label_selector)
            })
            .map(|(_, v)| serde_json::from_value(v.clone()).map_err(StoreError::from))
            .collect();

        let mut removed = self.removed_after_list.lock().unwrap();
        removed.retain(|key| {
            if key.0 == api_version && key.1 == kind && key.2 == ns {
                objects.remove(key);
                false
            } else {
                true
            }
        });
        listed
    }

    async fn delete<K: StoreObject>(&self, namespace: &K::Namespace, name: &str) -> StoreResult<()> {
        self.record(Call::Delete {
            kind: K::kind(&()).into_owned(),
            name: name.to_string(),
        });
        match self
            .objects
            .lock()
            .unwrap()
            .remove(&key_for::<K>(namespace, name))
        {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound(name.to_string())),
        }
    }

    async fn patch_status<K: StoreObject>(
        &self,
        namespace: &K::Namespace,
        name: &str,
        patch: &Value,
    ) -> StoreResult<K> {
        self.record(Call::PatchStatus {
            kind: K::kind(&()).into_owned(),
            name: name.to_string(),
        });
        let key = key_for::<K>(namespace, name);
        let existing = self.objects.lock().unwrap().get(&key).cloned();
        let Some(mut value) = existing else {
            return Err(StoreError::NotFound(name.to_string()));
        };
        if let Some(expected) = patch["metadata"]["resourceVersion"].as_str() {
            if value["metadata"]["resourceVersion"].as_str() != Some(expected) {
                return Err(StoreError::Conflict(name.to_string()));
            }
        }
        if let Some(status) = patch.get("status") {
            if value.get("status").is_none() {
                value["status"] = Value::Object(serde_json::Map::new());
            }
            merge(&mut value["status"], status);
        }
        self.stamp(&mut value);
        self.objects.lock().unwrap().insert(key, value.clone());
        Ok(serde_json::from_value(value)?)
    }

    async fn apply(&self, obj: &DynamicObject) -> StoreResult<()> {
        let types = obj
            .types
            .clone()
            .ok_or_else(|| StoreError::InvalidObject(obj.name_any()))?;
        self.record(Call::Apply {
            kind: types.kind.clone(),
            name: obj.name_any(),
        });
        let key = (types.api_version, types.kind, obj.namespace(), obj.name_any());
        let mut value = serde_json::to_value(obj)?;
        let existing = self.objects.lock().unwrap().get(&key).cloned();
        if let Some(existing) = existing {
            // an apply that changes nothing leaves the object untouched
            if desired_content(&existing) == desired_content(&value) {
                return Ok(());
            }
            if let Some(status) = existing.get("status") {
                value["status"] = status.clone();
            }
        }
        self.write(key, value);
        Ok(())
    }
}
