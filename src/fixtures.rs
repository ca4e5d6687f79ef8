//! Helper methods only available for tests: a primitive mock apiserver built on
//! tower-test and builders for the objects the controllers operate on

use crate::{
    config::PodSafeToEvictAnnotatorConfig,
    manager::Diagnostics,
    pod_safe_to_evict_annotator::{Context, POD_SAFE_TO_EVICT_ANNOTATION_KEY},
    Metrics,
};
use http::{Request, Response};
use hyper::{body::to_bytes, Body};
use k8s_openapi::api::core::v1::{Container, Namespace, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{client::Client, ResourceExt};
use prometheus::Registry;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

pub fn namespace(name: &str, labels: &[(&str, &str)]) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(
                labels
                    .iter()
                    .map(|(key, value)| (key.to_string(), value.to_string()))
                    .collect::<BTreeMap<String, String>>(),
            ),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn pod(namespace: &str, name: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "app".to_string(),
                image: Some("registry.k8s.io/pause:3.9".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn annotated_pod(namespace: &str, name: &str, value: &str) -> Pod {
    let mut pod = pod(namespace, name);
    pod.metadata.annotations = Some(
        [(POD_SAFE_TO_EVICT_ANNOTATION_KEY.to_string(), value.to_string())]
            .into_iter()
            .collect(),
    );
    pod
}

pub type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;
pub struct ApiServerVerifier(ApiServerHandle);

/// Create a client backed by a mock apiserver for tests that drive the request
/// verification themselves
pub fn mock_client() -> (Client, ApiServerHandle) {
    let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
    (Client::new(mock_service, "default"), handle)
}

/// A Status response the apiserver would return for a failed request
pub fn status_response(code: u16, reason: &str, message: &str) -> Response<Body> {
    let status = serde_json::json!({
        "kind": "Status",
        "apiVersion": "v1",
        "metadata": {},
        "status": "Failure",
        "message": message,
        "reason": reason,
        "code": code
    });
    Response::builder()
        .status(code)
        .body(Body::from(serde_json::to_vec(&status).unwrap()))
        .unwrap()
}

/// Scenarios the mock apiserver verifies against the annotator reconciler
pub enum Scenario {
    /// The Namespace is served and the Pod is expected to be patched
    AnnotatePod(Namespace, Pod),
    /// The Namespace is served and the Pod patch is answered with a conflict
    AnnotatePodConflict(Namespace, Pod),
    /// The Namespace is served and no further requests are expected
    NamespaceGetOnly(Namespace),
    /// The Namespace does not exist
    NamespaceNotFound,
    /// No requests are answered
    RadioSilence,
}

pub async fn timeout_after_1s(handle: tokio::task::JoinHandle<()>) {
    tokio::time::timeout(std::time::Duration::from_secs(1), handle)
        .await
        .expect("timeout on mock apiserver")
        .expect("scenario succeeded")
}

impl ApiServerVerifier {
    /// Runs the verifier for a scenario in a background task.
    ///
    /// The verifier is moved into the task so that the channel to the mock client is
    /// dropped (and any further requests fail) once the scenario completes.
    pub fn run(self, scenario: Scenario) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            match scenario {
                Scenario::AnnotatePod(namespace, pod) => {
                    self.handle_namespace_get(namespace)
                        .await
                        .handle_pod_patch(pod)
                        .await;
                }
                Scenario::AnnotatePodConflict(namespace, _pod) => {
                    self.handle_namespace_get(namespace)
                        .await
                        .handle_pod_patch_conflict()
                        .await;
                }
                Scenario::NamespaceGetOnly(namespace) => {
                    self.handle_namespace_get(namespace).await;
                }
                Scenario::NamespaceNotFound => {
                    self.handle_namespace_get_not_found().await;
                }
                Scenario::RadioSilence => {}
            }
        })
    }

    async fn handle_namespace_get(mut self, namespace: Namespace) -> Self {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::GET);
        assert_eq!(
            request.uri().path(),
            format!("/api/v1/namespaces/{}", namespace.name_any())
        );
        let response = serde_json::to_vec(&namespace).unwrap();
        send.send_response(Response::builder().body(Body::from(response)).unwrap());
        self
    }

    async fn handle_namespace_get_not_found(mut self) -> Self {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::GET);
        send.send_response(status_response(404, "NotFound", "namespaces not found"));
        self
    }

    async fn handle_pod_patch_conflict(mut self) -> Self {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::PATCH);
        send.send_response(status_response(
            409,
            "Conflict",
            "the object has been modified",
        ));
        self
    }

    async fn handle_pod_patch(mut self, pod: Pod) -> Self {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::PATCH);
        assert_eq!(
            request.uri().path(),
            format!(
                "/api/v1/namespaces/{}/pods/{}",
                pod.namespace().unwrap(),
                pod.name_any()
            )
        );
        let request_body = to_bytes(request.into_body()).await.unwrap();
        let patch: serde_json::Value =
            serde_json::from_slice(&request_body).expect("patch object is json");
        assert_eq!(
            patch["metadata"]["annotations"][POD_SAFE_TO_EVICT_ANNOTATION_KEY],
            "true"
        );
        let mut annotated = pod;
        annotated
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(POD_SAFE_TO_EVICT_ANNOTATION_KEY.to_string(), "true".to_string());
        let response = serde_json::to_vec(&annotated).unwrap();
        send.send_response(Response::builder().body(Body::from(response)).unwrap());
        self
    }
}

impl Context {
    /// Create a test context paired with a mock apiserver handle and a fresh metrics
    /// registry
    pub fn test(
        config: Option<PodSafeToEvictAnnotatorConfig>,
    ) -> (Arc<Self>, ApiServerVerifier, Registry) {
        let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let mock_client = Client::new(mock_service, "default");
        let registry = Registry::default();
        let metrics = Metrics::default().register(&registry).unwrap();
        let context = Self {
            client: mock_client,
            config,
            diagnostics: Arc::new(RwLock::new(Diagnostics::default())),
            metrics,
        };
        (Arc::new(context), ApiServerVerifier(handle), registry)
    }
}
