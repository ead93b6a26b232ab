//! Operator actions
//!
//! Actions run beside the reconciliation cycle: they never touch the
//! record, and their failures are reported as action results rather than
//! failing the invocation.

use tracing::{info, warn};

use pdcsi_common::Error;
use pdcsi_manifests::{ActionResults, Filter};

use crate::reconciler::{Context, Reconciler};
use crate::status::ActionOutcome;
use crate::trigger::{ActionKind, Trigger};

/// Parameter selecting manifest sets by name
pub const CONTROLLER_PARAM: &str = "controller";
/// Parameter selecting resources by kind
pub const RESOURCES_PARAM: &str = "resources";

const SYNC_UNAVAILABLE: &str = "Failed to apply missing resources. API Server unavailable.";

/// Run an action and report its outcome
pub async fn run(ctx: &Context, kind: ActionKind, trigger: &Trigger) -> Result<(), Error> {
    let manifests = Filter::parse(trigger.param(CONTROLLER_PARAM));
    let kinds = Filter::parse(trigger.param(RESOURCES_PARAM));
    info!(action = ?kind, "running action");

    let outcome = match execute(ctx, kind, &manifests, &kinds).await {
        Ok(results) => ActionOutcome::Results(results),
        Err(e) if kind == ActionKind::SyncResources && e.is_transient() => {
            warn!(error = %e, "cannot sync resources");
            ActionOutcome::Results(ActionResults::from([(
                "result".to_string(),
                SYNC_UNAVAILABLE.to_string(),
            )]))
        }
        Err(e) => {
            warn!(action = ?kind, error = %e, "action failed");
            ActionOutcome::Failed(e.to_string())
        }
    };
    ctx.status.action(outcome)
}

async fn execute(
    ctx: &Context,
    kind: ActionKind,
    manifests: &Filter,
    kinds: &Filter,
) -> Result<ActionResults, Error> {
    let collector = &ctx.collector;
    let cluster = ctx.cluster.as_ref();
    match kind {
        ActionKind::ListVersions => collector.list_versions(),
        ActionKind::ListResources => {
            let config = Reconciler::current_config(ctx).await?;
            collector
                .list_resources(cluster, &config, manifests, kinds)
                .await
        }
        ActionKind::ScrubResources => {
            let config = Reconciler::current_config(ctx).await?;
            collector
                .scrub_resources(cluster, &config, manifests, kinds)
                .await
        }
        ActionKind::SyncResources => {
            let config = Reconciler::current_config(ctx).await?;
            collector
                .apply_missing_resources(cluster, &config, manifests, kinds)
                .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;
    use serde_json::json;

    fn action(name: &str) -> Trigger {
        Trigger::new(name)
            .with_param(CONTROLLER_PARAM, "gce-pd-csi-driver")
            .with_param(RESOURCES_PARAM, "StorageClass")
    }

    fn results(h: &Harness) -> ActionResults {
        match h.status.take_action() {
            Some(ActionOutcome::Results(results)) => results,
            other => panic!("expected results, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_list_versions_needs_no_relations() {
        let h = Harness::new();
        h.run("list-versions").await;
        assert_eq!(results(&h)["gce-pd-csi-driver-versions"], "v1.10.1");
    }

    #[tokio::test]
    async fn test_list_resources_after_deploy() {
        let h = Harness::ready();
        h.run("config-changed").await;
        h.try_run(action("list-resources")).await.unwrap();
        let results = results(&h);
        assert_eq!(results["gce-pd-csi-driver-correct"], "StorageClass/csi-gce-pd-default");
        assert!(!results.contains_key("gce-pd-csi-driver-missing"));
    }

    /// Story: a storage class left behind by an older release is scrubbed
    #[tokio::test]
    async fn story_scrub_removes_leftovers() {
        let h = Harness::ready();
        h.run("config-changed").await;
        h.cluster.insert(json!({
            "apiVersion": "storage.k8s.io/v1",
            "kind": "StorageClass",
            "metadata": {
                "name": "csi-gce-pd-legacy",
                "labels": {"juju.io/manifest": "gce-pd-csi-driver"}
            }
        }));

        h.try_run(action("list-resources")).await.unwrap();
        assert_eq!(results(&h)["gce-pd-csi-driver-extra"], "StorageClass/csi-gce-pd-legacy");

        h.try_run(action("scrub-resources")).await.unwrap();
        let results = results(&h);
        assert!(!results.contains_key("gce-pd-csi-driver-extra"));
        assert_eq!(h.cluster.delete_calls(), 1);
    }

    /// Story: a storage class deleted by hand is synced back
    #[tokio::test]
    async fn story_sync_restores_missing_resources() {
        let h = Harness::ready();
        h.run("config-changed").await;
        h.cluster.remove("StorageClass", "csi-gce-pd-default");
        let applied = h.cluster.apply_calls();

        h.try_run(action("sync-resources")).await.unwrap();
        assert_eq!(results(&h)["gce-pd-csi-driver-correct"], "StorageClass/csi-gce-pd-default");
        assert_eq!(h.cluster.apply_calls(), applied + 1);
    }

    #[tokio::test]
    async fn test_sync_reports_unavailable_api_server() {
        let h = Harness::ready();
        h.run("config-changed").await;
        h.cluster.remove("StorageClass", "csi-gce-pd-default");
        h.cluster.fail_next_applies(1, || Error::unavailable("apply", "connection refused"));

        h.try_run(action("sync-resources")).await.unwrap();
        assert_eq!(
            results(&h),
            ActionResults::from([(
                "result".to_string(),
                "Failed to apply missing resources. API Server unavailable.".to_string()
            )])
        );
    }

    #[tokio::test]
    async fn test_action_failure_is_reported_not_raised() {
        let h = Harness::ready();
        h.set_trust(crate::testing::Trust::Broken);
        h.try_run(action("list-resources")).await.unwrap();
        assert!(matches!(h.status.take_action(), Some(ActionOutcome::Failed(_))));
        assert!(h.record().deferred.is_empty());
    }
}
