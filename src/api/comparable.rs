use std::collections::HashSet;

use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret};
use kube::ResourceExt as _;

use super::flux::{GitRepository, Kustomization, OCIRepository};

/// Labels, annotations and owner references of `desired` that are missing or different in `live`.
fn metadata_diff(
    desired: &(impl kube::ResourceExt + ?Sized),
    live: &(impl kube::ResourceExt + ?Sized),
) -> bool {
    let annotations_equal = desired
        .annotations()
        .iter()
        .all(|(k, v)| live.annotations().get(k) == Some(v));
    let labels_equal = desired
        .labels()
        .iter()
        .all(|(k, v)| live.labels().get(k) == Some(v));

    let owner_uids: HashSet<String> = live
        .owner_references()
        .iter()
        .map(|r| &r.uid)
        .cloned()
        .collect();
    let owner_references_equal = desired
        .owner_references()
        .iter()
        .all(|self_ref| owner_uids.contains(&self_ref.uid));

    !annotations_equal || !labels_equal || !owner_references_equal
}

// Trait for resources that can be compared
pub trait ResourceDiff: kube::ResourceExt {
    /// Whether writing `self` over `other` would change anything.
    fn diff(&self, other: &Self) -> bool {
        metadata_diff(self, other)
    }
}

impl ResourceDiff for Namespace {}

impl ResourceDiff for GitRepository {
    fn diff(&self, other: &Self) -> bool {
        self.spec != other.spec || metadata_diff(self, other)
    }
}

impl ResourceDiff for OCIRepository {
    fn diff(&self, other: &Self) -> bool {
        self.spec != other.spec || metadata_diff(self, other)
    }
}

impl ResourceDiff for Kustomization {
    fn diff(&self, other: &Self) -> bool {
        self.spec != other.spec || metadata_diff(self, other)
    }
}

impl ResourceDiff for Secret {
    fn diff(&self, other: &Self) -> bool {
        // Secret labels are owned by the sync, so removals count as well
        self.data != other.data
            || self.type_ != other.type_
            || self.labels() != other.labels()
            || metadata_diff(self, other)
    }
}

impl ResourceDiff for ConfigMap {
    fn diff(&self, other: &Self) -> bool {
        self.data != other.data || metadata_diff(self, other)
    }
}
