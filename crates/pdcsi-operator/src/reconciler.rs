//! Readiness-gated reconciliation of the CSI driver deployment
//!
//! Every merge walks the gates in a fixed order: credential broker,
//! certificate authority, cluster authentication, operator configuration,
//! then each manifest set's own validation. The first gate that does not
//! pass sets the status and ends the cycle. Once all gates pass the merged
//! configuration is fingerprinted and applied only if the fingerprint
//! differs from the last successful apply.
//!
//! Transient cluster failures re-arm the trigger instead of blocking; any
//! other apply failure blocks until the operator intervenes.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};

use pdcsi_common::config::{CharmConfig, ConfigSnapshot};
use pdcsi_common::{ConfigFingerprint, Configuration, Credential, Error, Readiness};
use pdcsi_manifests::{desired, ClusterApi, Collector};
use pdcsi_relations::{
    certificates, integrator, kube_control, CertificatesRequires, IntegratorRequires,
    KubeControlRequires, KubeconfigTarget,
};

use crate::record::ReconciliationRecord;
use crate::status::{StatusSink, UnitStatus};
use crate::trigger::{EntryPoint, Trigger};

/// Group the control plane grants the unit's credentials
pub const AUTH_GROUP: &str = "system:masters";

const WAITING_FOR_APISERVER: &str = "Waiting for kube-apiserver";
const WAITING_FOR_CREDENTIALS: &str = "Waiting for kube-control: unit credentials";

/// Where the trust anchor and kubeconfigs are written
#[derive(Clone, Debug)]
pub struct Paths {
    /// CA certificate file
    pub ca_cert: PathBuf,
    /// Kubeconfigs rendered once cluster credentials arrive; the first one
    /// is the kubeconfig the operator itself uses
    pub kubeconfigs: Vec<KubeconfigTarget>,
}

impl Paths {
    /// Standard machine locations
    pub fn system() -> Self {
        Self {
            ca_cert: PathBuf::from("/srv/kubernetes/ca.crt"),
            kubeconfigs: vec![KubeconfigTarget::root(), KubeconfigTarget::ubuntu()],
        }
    }

    /// Kubeconfig the operator connects with
    pub fn operator_kubeconfig(&self) -> Option<&PathBuf> {
        self.kubeconfigs.first().map(|target| &target.path)
    }
}

/// Identity of the unit being reconciled
#[derive(Clone, Debug)]
pub struct UnitInfo {
    /// Unit name, e.g. `gcp-k8s-storage/0`
    pub unit: String,
    /// Model UUID
    pub model_uuid: String,
}

impl UnitInfo {
    /// Application name: the unit name without its number
    pub fn app(&self) -> &str {
        self.unit.split('/').next().unwrap_or(&self.unit)
    }
}

/// Collaborators of one invocation
pub struct Context {
    /// Unit identity
    pub unit: UnitInfo,
    /// File locations
    pub paths: Paths,
    /// Operator options and credentials
    pub config: CharmConfig,
    /// Credential broker client
    pub integrator: IntegratorRequires,
    /// Certificate authority client
    pub certificates: CertificatesRequires,
    /// Control plane client
    pub kube_control: KubeControlRequires,
    /// Manifest sets
    pub collector: Collector,
    /// Cluster access
    pub cluster: Arc<dyn ClusterApi>,
    /// Status destination
    pub status: Arc<dyn StatusSink>,
}

/// Whether a trigger finished or must be redelivered
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing more to do for this trigger
    Done,
    /// Redeliver this trigger later
    Deferred,
}

/// Result of the apply step
enum Applied {
    Success,
    Retry,
    Failed,
}

/// The reconciliation core
pub struct Reconciler {
    ctx: Context,
}

impl Reconciler {
    /// Create a reconciler over `ctx`
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// The collaborators
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Process one trigger to completion
    #[instrument(skip(self, record), fields(trigger = %trigger))]
    pub async fn handle(
        &self,
        trigger: &Trigger,
        record: &mut ReconciliationRecord,
    ) -> Result<Outcome, Error> {
        let Some(entry) = trigger.entry_point() else {
            debug!("no handler for trigger");
            return Ok(Outcome::Done);
        };
        debug!(entry = ?entry, "dispatching");

        match entry {
            EntryPoint::Merge { broken } => self.merge(record, broken, false).await,
            EntryPoint::RequestClusterAuth => {
                self.ctx
                    .kube_control
                    .set_auth_request(&self.ctx.unit.unit, AUTH_GROUP)?;
                self.merge(record, None, false).await
            }
            EntryPoint::RequestCapabilities => {
                self.ctx
                    .integrator
                    .joined(self.ctx.unit.app(), &self.ctx.unit.model_uuid)
                    .await?;
                self.ctx.integrator.enable_block_storage_management()?;
                self.ctx.integrator.enable_instance_inspection()?;
                self.merge(record, None, false).await
            }
            EntryPoint::Install => self.merge(record, None, false).await,
            EntryPoint::Upgrade => {
                info!("new operator revision, re-applying manifests");
                self.merge(record, None, true).await
            }
            EntryPoint::Cleanup => self.cleanup(record).await,
            EntryPoint::StatusCheck => {
                self.update_status(record).await?;
                Ok(Outcome::Done)
            }
            EntryPoint::Action(kind) => {
                crate::actions::run(&self.ctx, kind, trigger).await?;
                Ok(Outcome::Done)
            }
        }
    }

    fn set_status(&self, status: UnitStatus) -> Result<(), Error> {
        self.ctx.status.unit_status(status)
    }

    /// Report a gate verdict; `true` when the gate passed
    fn gate(&self, verdict: Readiness) -> Result<bool, Error> {
        match UnitStatus::from_readiness(&verdict) {
            None => Ok(true),
            Some(status) => {
                info!(reason = %status.message(), "gate not passed");
                self.set_status(status)?;
                Ok(false)
            }
        }
    }

    async fn check_integrator(&self, broken: Option<&str>) -> Result<bool, Error> {
        self.set_status(UnitStatus::Maintenance("Evaluating GCP relation.".into()))?;
        let verdict = self
            .ctx
            .integrator
            .evaluate(broken == Some(integrator::ENDPOINT))
            .await?;
        self.gate(verdict)
    }

    /// Resolve the CA, preferring the one the control plane supplies
    fn check_certificates(&self, broken: Option<&str>) -> Result<Option<String>, Error> {
        let from_control_plane = if broken == Some(kube_control::ENDPOINT) {
            None
        } else {
            self.ctx.kube_control.get_ca_certificate()?
        };
        let ca = match from_control_plane {
            Some(ca) => {
                info!("CA certificate is available from kube-control");
                ca
            }
            None => {
                self.set_status(UnitStatus::Maintenance("Evaluating certificates.".into()))?;
                let verdict = self
                    .ctx
                    .certificates
                    .evaluate(broken == Some(certificates::ENDPOINT))?;
                if !self.gate(verdict)? {
                    return Ok(None);
                }
                self.ctx.certificates.ca()?.ok_or_else(|| {
                    Error::internal_with_context("certificates", "ready without a CA")
                })?
            }
        };
        pdcsi_common::fs::write_atomic(&self.ctx.paths.ca_cert, ca.as_bytes(), Some(0o644))?;
        Ok(Some(ca))
    }

    fn check_kube_control(&self, ca: &str, broken: Option<&str>) -> Result<bool, Error> {
        self.set_status(UnitStatus::Maintenance(
            "Evaluating kubernetes authentication.".into(),
        ))?;
        let verdict = self
            .ctx
            .kube_control
            .evaluate(broken == Some(kube_control::ENDPOINT))?;
        if !self.gate(verdict)? {
            return Ok(false);
        }
        let unit = &self.ctx.unit.unit;
        if self.ctx.kube_control.get_auth_credentials(unit)?.is_none() {
            self.set_status(UnitStatus::Waiting(WAITING_FOR_CREDENTIALS.into()))?;
            return Ok(false);
        }
        for target in &self.ctx.paths.kubeconfigs {
            self.ctx.kube_control.create_kubeconfig(ca, target, unit)?;
        }
        Ok(true)
    }

    /// Validate operator configuration, returning the broker credential
    async fn check_config(&self) -> Result<Option<Option<Credential>>, Error> {
        self.set_status(UnitStatus::Maintenance("Evaluating charm config.".into()))?;
        let broker = self.ctx.integrator.credentials().await?;
        match self.ctx.config.evaluate(broker.as_ref()).await? {
            Some(reason) => {
                self.set_status(UnitStatus::Blocked(reason))?;
                Ok(None)
            }
            None => Ok(Some(broker)),
        }
    }

    /// Validate each manifest set, combining their fingerprints
    fn check_manifests(&self, config: &Configuration) -> Result<Option<ConfigFingerprint>, Error> {
        let mut fingerprints = Vec::new();
        for manifest in self.ctx.collector.manifests() {
            if let Some(reason) = manifest.evaluate(config)? {
                self.set_status(UnitStatus::Blocked(reason))?;
                return Ok(None);
            }
            fingerprints.push(manifest.hash(config));
        }
        Ok(ConfigFingerprint::combine(fingerprints))
    }

    fn merged_config(
        &self,
        snapshot: &ConfigSnapshot,
        broker: Option<&Credential>,
    ) -> Result<Configuration, Error> {
        let registry = self.ctx.kube_control.get_registry_location()?;
        Ok(desired::build(snapshot, broker, registry.as_deref()))
    }

    /// Configuration for work outside the gated cycle: status checks,
    /// cleanup and actions. Unusable operator credentials are left out
    /// instead of failing.
    pub(crate) async fn current_config(ctx: &Context) -> Result<Configuration, Error> {
        let broker = ctx.integrator.credentials().await?;
        let snapshot = match ctx.config.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(Error::Credentials { message }) => {
                debug!(reason = %message, "operator credentials unusable");
                ConfigSnapshot {
                    data: ctx.config.available_data(),
                    credential: None,
                }
            }
            Err(e) => return Err(e),
        };
        let registry = ctx.kube_control.get_registry_location()?;
        Ok(desired::build(&snapshot, broker.as_ref(), registry.as_deref()))
    }

    /// The gated merge-and-apply cycle; `force` applies even when the
    /// fingerprint is unchanged
    async fn merge(
        &self,
        record: &mut ReconciliationRecord,
        broken: Option<&'static str>,
        force: bool,
    ) -> Result<Outcome, Error> {
        if !self.check_integrator(broken).await? {
            return Ok(Outcome::Done);
        }
        let Some(ca) = self.check_certificates(broken)? else {
            return Ok(Outcome::Done);
        };
        if !self.check_kube_control(&ca, broken)? {
            return Ok(Outcome::Done);
        }
        let Some(broker) = self.check_config().await? else {
            return Ok(Outcome::Done);
        };

        self.set_status(UnitStatus::Maintenance("Evaluating Manifests".into()))?;
        let snapshot = self.ctx.config.snapshot().await?;
        let config = self.merged_config(&snapshot, broker.as_ref())?;
        let Some(fingerprint) = self.check_manifests(&config)? else {
            return Ok(Outcome::Done);
        };

        if !force && record.last_applied_fingerprint == Some(fingerprint) {
            info!(fingerprint = %fingerprint, "configuration unchanged, skipping apply");
        } else {
            record.deployed = false;
            match self.apply(&config).await? {
                Applied::Success => {
                    info!(fingerprint = %fingerprint, "applied configuration");
                    record.last_applied_fingerprint = Some(fingerprint);
                    record.deployed = true;
                }
                Applied::Retry => return Ok(Outcome::Deferred),
                Applied::Failed => return Ok(Outcome::Done),
            }
        }

        self.settle(record, &config).await?;
        Ok(Outcome::Done)
    }

    async fn apply(&self, config: &Configuration) -> Result<Applied, Error> {
        self.set_status(UnitStatus::Maintenance("Deploying GCP Storage".into()))?;
        self.ctx.status.workload_version("")?;
        for manifest in self.ctx.collector.manifests() {
            match manifest.apply(self.ctx.cluster.as_ref(), config).await {
                Ok(()) => {}
                Err(e) if e.is_transient() => {
                    warn!(manifest = %manifest.name(), error = %e, "encountered retryable installation error");
                    self.set_status(UnitStatus::Waiting(WAITING_FOR_APISERVER.into()))?;
                    return Ok(Applied::Retry);
                }
                Err(e) => {
                    error!(manifest = %manifest.name(), error = %e, "failed to apply manifests");
                    self.set_status(UnitStatus::Blocked(format!(
                        "Failed to apply {}: {}",
                        manifest.name(),
                        e
                    )))?;
                    return Ok(Applied::Failed);
                }
            }
        }
        Ok(Applied::Success)
    }

    /// Publish readiness and versions of the deployed manifest sets
    async fn settle(
        &self,
        record: &ReconciliationRecord,
        config: &Configuration,
    ) -> Result<(), Error> {
        if !record.deployed {
            return Ok(());
        }
        let collector = &self.ctx.collector;
        let unready = match collector.unready(self.ctx.cluster.as_ref(), config).await {
            Ok(unready) => unready,
            Err(e) if e.is_transient() => {
                warn!(error = %e, "cannot read resource status");
                return self.set_status(UnitStatus::Waiting(WAITING_FOR_APISERVER.into()));
            }
            Err(e) => return Err(e),
        };
        if !unready.is_empty() {
            return self.set_status(UnitStatus::Waiting(unready.join(", ")));
        }
        self.set_status(UnitStatus::Active("Ready".into()))?;
        self.ctx
            .status
            .workload_version(&collector.short_version(config)?)?;
        self.ctx
            .status
            .app_status(UnitStatus::Active(collector.long_version(config)?))
    }

    async fn update_status(&self, record: &ReconciliationRecord) -> Result<(), Error> {
        if !record.deployed {
            return Ok(());
        }
        let config = Self::current_config(&self.ctx).await?;
        self.settle(record, &config).await
    }

    /// Delete everything that was applied
    async fn cleanup(&self, record: &mut ReconciliationRecord) -> Result<Outcome, Error> {
        if record.last_applied_fingerprint.is_some() {
            self.set_status(UnitStatus::Maintenance("Cleaning up GCP Storage".into()))?;
            let config = Self::current_config(&self.ctx).await?;
            for manifest in self.ctx.collector.manifests() {
                match manifest.delete(self.ctx.cluster.as_ref(), &config, true).await {
                    Ok(()) => {}
                    Err(e) if e.is_transient() => {
                        warn!(manifest = %manifest.name(), error = %e, "cleanup interrupted");
                        self.set_status(UnitStatus::Waiting(WAITING_FOR_APISERVER.into()))?;
                        return Ok(Outcome::Deferred);
                    }
                    Err(e) => return Err(e),
                }
            }
            record.last_applied_fingerprint = None;
            record.deployed = false;
        }
        self.set_status(UnitStatus::Maintenance("Shutting down".into()))?;
        Ok(Outcome::Done)
    }
}
