use kube::api::{
    ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch, PatchParams,
    PostParams,
};
use kube::discovery::{self, Scope};
use kube::{Api, Client, ResourceExt as _};
use tracing::debug;

use super::{GetApi, ObjectStore, StoreError, StoreObject, StoreResult};

/// [`ObjectStore`] backed by a Kubernetes API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    field_manager: String,
}

impl KubeStore {
    #[must_use]
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    async fn dynamic_api(&self, obj: &DynamicObject) -> StoreResult<Api<DynamicObject>> {
        let types = obj
            .types
            .as_ref()
            .ok_or_else(|| StoreError::InvalidObject(format!("{} has no type", obj.name_any())))?;
        let (group, version) = types
            .api_version
            .split_once('/')
            .unwrap_or(("", &types.api_version));
        let gvk = GroupVersionKind::gvk(group, version, &types.kind);

        let (resource, capabilities): (ApiResource, _) =
            discovery::pinned_kind(&self.client, &gvk).await?;

        Ok(match capabilities.scope {
            Scope::Namespaced => {
                let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
                Api::namespaced_with(self.client.clone(), &namespace, &resource)
            }
            Scope::Cluster => Api::all_with(self.client.clone(), &resource),
        })
    }
}

impl ObjectStore for KubeStore {
    async fn get<K: StoreObject>(&self, namespace: &K::Namespace, name: &str) -> StoreResult<Option<K>> {
        Ok(K::get_api(self.client.clone(), namespace)
            .get_opt(name)
            .await?)
    }

    async fn create<K: StoreObject>(&self, obj: &K) -> StoreResult<K> {
        Ok(K::get_api(self.client.clone(), obj.get_namespace())
            .create(&PostParams::default(), obj)
            .await?)
    }

    async fn update<K: StoreObject>(&self, obj: &K) -> StoreResult<K> {
        Ok(K::get_api(self.client.clone(), obj.get_namespace())
            .replace(&obj.name_any(), &PostParams::default(), obj)
            .await?)
    }

    async fn list<K: StoreObject>(
        &self,
        namespace: &K::Namespace,
        label_selector: &str,
    ) -> StoreResult<Vec<K>> {
        Ok(K::get_api(self.client.clone(), namespace)
            .list(&ListParams::default().labels(label_selector))
            .await?
            .items)
    }

    async fn delete<K: StoreObject>(&self, namespace: &K::Namespace, name: &str) -> StoreResult<()> {
        K::get_api(self.client.clone(), namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn patch_status<K: StoreObject>(
        &self,
        namespace: &K::Namespace,
        name: &str,
        patch: &serde_json::Value,
    ) -> StoreResult<K> {
        Ok(K::get_api(self.client.clone(), namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?)
    }

    async fn apply(&self, obj: &DynamicObject) -> StoreResult<()> {
        let api = self.dynamic_api(obj).await?;
        let mut obj = obj.clone();
        obj.metadata.managed_fields = None;
        api.patch(
            &obj.name_any(),
            &PatchParams::apply(&self.field_manager).force(),
            &Patch::Apply(&obj),
        )
        .await?;
        debug!(name = obj.name_any(), "Applied manifest object");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use http::{Request, Response};
    use k8s_openapi::api::core::v1::Secret;
    use kube::client::Body;
    use serde_json::json;

    use super::*;

    fn mock_client(
        status: u16,
        body: serde_json::Value,
        expected_path: &'static str,
    ) -> (Client, tokio::task::JoinHandle<()>) {
        let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let server = tokio::spawn(async move {
            let mut handle = std::pin::pin!(handle);
            let (request, send) = handle.next_request().await.expect("service not called");
            assert_eq!(request.uri().path(), expected_path);
            let response = serde_json::to_vec(&body).unwrap();
            send.send_response(
                Response::builder()
                    .status(status)
                    .body(Body::from(response))
                    .unwrap(),
            );
        });
        (Client::new(mock_service, "default"), server)
    }

    fn status(code: u16, reason: &str) -> serde_json::Value {
        json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": format!("secrets \"flux-system\" {reason}"),
            "reason": reason,
            "code": code,
        })
    }

    #[tokio::test]
    async fn get_maps_not_found_to_none() {
        let (client, server) = mock_client(
            404,
            status(404, "NotFound"),
            "/api/v1/namespaces/flux-system/secrets/flux-system",
        );
        let store = KubeStore::new(client, "test");

        let secret = store
            .get::<Secret>("flux-system", "flux-system")
            .await
            .unwrap();
        assert!(secret.is_none());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn delete_reports_not_found() {
        let (client, server) = mock_client(
            404,
            status(404, "NotFound"),
            "/api/v1/namespaces/flux-system/secrets/flux-system",
        );
        let store = KubeStore::new(client, "test");

        let err = store
            .delete::<Secret>("flux-system", "flux-system")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn create_reports_already_exists() {
        let (client, server) = mock_client(
            409,
            status(409, "AlreadyExists"),
            "/api/v1/namespaces/flux-system/secrets",
        );
        let store = KubeStore::new(client, "test");

        let secret = Secret {
            metadata: kube::api::ObjectMeta {
                name: Some("flux-system".into()),
                namespace: Some("flux-system".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        let err = store.create(&secret).await.unwrap_err();
        assert!(err.is_already_exists());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn update_reports_conflict() {
        let (client, server) = mock_client(
            409,
            status(409, "Conflict"),
            "/api/v1/namespaces/flux-system/secrets/flux-system",
        );
        let store = KubeStore::new(client, "test");

        let secret = Secret {
            metadata: kube::api::ObjectMeta {
                name: Some("flux-system".into()),
                namespace: Some("flux-system".into()),
                resource_version: Some("1".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        let err = store.update(&secret).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        server.await.unwrap();
    }
}
