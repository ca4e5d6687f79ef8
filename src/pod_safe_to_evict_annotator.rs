use crate::{
    config::PodSafeToEvictAnnotatorConfig,
    kubernetes::labels::selector_matches_labels,
    manager::Diagnostics,
    Error, Metrics, Result,
};
use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::{
    api::{Api, Patch, PatchParams},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        watcher::Config,
    },
    ResourceExt,
};
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tokio::sync::RwLock;
use tracing::*;

/// Annotation that ensures Pods do not prevent cluster scale down:
/// https://github.com/kubernetes/autoscaler/blob/master/cluster-autoscaler/FAQ.md#what-types-of-pods-can-prevent-ca-from-removing-a-node
pub const POD_SAFE_TO_EVICT_ANNOTATION_KEY: &str =
    "cluster-autoscaler.kubernetes.io/safe-to-evict";

// Context for the reconciler
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Controller configuration
    pub config: Option<PodSafeToEvictAnnotatorConfig>,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
}

#[instrument(skip(ctx, pod))]
async fn reconcile(pod: Arc<Pod>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = ctx.metrics.count_and_measure();
    ctx.diagnostics.write().await.last_event = Utc::now();

    let namespace = pod.namespace().unwrap(); // Pods are namespace scoped

    // We do nothing if the Namespace does not match the Namespace selector
    let namespaces: Api<Namespace> = Api::all(ctx.client.clone());
    let Some(namespace_object) = namespaces
        .get_opt(&namespace)
        .await
        .map_err(Error::KubeError)?
    else {
        return Ok(Action::await_change());
    };
    let namespace_selector = ctx
        .config
        .as_ref()
        .and_then(|config| config.namespace_selector.as_ref());
    if !selector_matches_labels(namespace_selector, namespace_object.labels())? {
        return Ok(Action::await_change());
    }

    // If the annotation is already present then we leave it alone, even if it is
    // explicitly set to "false"
    if pod
        .annotations()
        .contains_key(POD_SAFE_TO_EVICT_ANNOTATION_KEY)
    {
        return Ok(Action::await_change());
    }

    let name = pod.name_any();
    info!("Annotating Pod \"{name}\" in {namespace}");
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &namespace);
    let patch = json!({
        "metadata": {
            "annotations": {
                POD_SAFE_TO_EVICT_ANNOTATION_KEY: "true",
            }
        }
    });
    match pods
        .patch(&name, &PatchParams::default(), &Patch::Strategic(patch))
        .await
    {
        Ok(_) => {}
        // If the Pod has been deleted or there was a conflict then another event must
        // already be queued for reconciliation
        Err(kube::Error::Api(err)) if err.code == 404 || err.code == 409 => {}
        Err(err) => return Err(Error::KubeError(err)),
    }

    Ok(Action::await_change())
}

fn error_policy(pod: Arc<Pod>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile failed: {:?}", error);
    ctx.metrics.reconcile_failure(&pod, error);
    Action::requeue(Duration::from_secs(30))
}

/// Initialize the Pod controller and run it until shutdown
pub async fn run(
    client: Client,
    config: Option<PodSafeToEvictAnnotatorConfig>,
    metrics: Metrics,
    diagnostics: Arc<RwLock<Diagnostics>>,
) -> Result<()> {
    let pods = Api::<Pod>::all(client.clone());
    let context = Arc::new(Context {
        client,
        config,
        diagnostics,
        metrics,
    });
    Controller::new(pods, Config::default().any_semantic())
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .filter_map(|result| async move { result.ok() })
        .for_each(|_| futures::future::ready(()))
        .await;
    Ok(())
}
