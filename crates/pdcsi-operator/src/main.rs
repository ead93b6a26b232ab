//! GCE PD CSI storage operator - one invocation per trigger

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use pdcsi_common::config::{CharmConfig, CredentialGetTool};
use pdcsi_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use pdcsi_manifests::{Collector, KubeClusterApi, ManifestSet};
use pdcsi_operator::{
    dispatch, Context, FileStateStore, FileStatusSink, Paths, Reconciler, StateStore, Trigger,
    UnitInfo,
};
use pdcsi_relations::metadata::METADATA_URL;
use pdcsi_relations::{
    CertificatesRequires, FileRelationChannel, GceMetadataClient, IntegratorRequires,
    KubeControlRequires, RelationChannel,
};

/// Deploys and maintains the GCE Persistent Disk CSI driver on a cluster
#[derive(Parser, Debug)]
#[command(name = "pdcsi-operator", version, about, long_about = None)]
struct Cli {
    /// Trigger to handle; defaults to the last segment of the dispatch path
    #[arg(long)]
    trigger: Option<String>,

    /// Hook or action path this process was dispatched for
    #[arg(long, env = "JUJU_DISPATCH_PATH")]
    dispatch_path: Option<String>,

    /// Action parameter as `key=value`, may be repeated
    #[arg(long = "param", value_parser = parse_param)]
    params: Vec<(String, String)>,

    /// Unit name (e.g. `gcp-k8s-storage/0`)
    #[arg(long, env = "JUJU_UNIT_NAME")]
    unit: String,

    /// Model UUID published to the credential broker
    #[arg(long, env = "JUJU_MODEL_UUID")]
    model_uuid: String,

    /// Directory holding the reconciliation record, status and relation data
    #[arg(long, env = "PDCSI_STATE_DIR", default_value = "/var/lib/pdcsi-operator")]
    state_dir: PathBuf,

    /// Operator package directory containing `upstream/`
    #[arg(long, env = "PDCSI_CHARM_DIR", default_value = ".")]
    charm_dir: PathBuf,

    /// Operator options file (JSON or YAML); defaults to `<state-dir>/options.yaml`
    #[arg(long, env = "PDCSI_OPTIONS_FILE")]
    options_file: Option<PathBuf>,

    /// Relation data file; defaults to `<state-dir>/relations.json`
    #[arg(long, env = "PDCSI_RELATIONS_FILE")]
    relations_file: Option<PathBuf>,

    /// Cloud metadata server base URL
    #[arg(long, env = "PDCSI_METADATA_URL", default_value = METADATA_URL)]
    metadata_url: String,

    /// Log output format (text or json)
    #[arg(long, env = "PDCSI_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,
}

impl Cli {
    fn trigger(&self) -> anyhow::Result<Trigger> {
        let base = match (&self.trigger, &self.dispatch_path) {
            (Some(name), _) => Trigger::new(name.as_str()),
            (None, Some(path)) => Trigger::from_dispatch_path(path),
            (None, None) => anyhow::bail!("no trigger given and JUJU_DISPATCH_PATH is unset"),
        };
        Ok(self
            .params
            .iter()
            .fold(base, |trigger, (k, v)| trigger.with_param(k, v)))
    }
}

fn parse_param(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("invalid parameter '{}' (expected key=value)", s))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();
    init_telemetry(TelemetryConfig {
        format: cli.log_format,
        ..Default::default()
    })?;

    let trigger = cli.trigger()?;
    info!(trigger = %trigger, unit = %cli.unit, "handling trigger");

    if let Err(e) = run(&cli, trigger).await {
        error!(error = %e, "invocation failed");
        return Err(e);
    }
    Ok(())
}

async fn run(cli: &Cli, trigger: Trigger) -> anyhow::Result<()> {
    let store = FileStateStore::new(cli.state_dir.join("record.json"));
    let record = store.load()?;

    let unit = UnitInfo {
        unit: cli.unit.clone(),
        model_uuid: cli.model_uuid.clone(),
    };
    let paths = Paths::system();
    let kubeconfig = paths
        .operator_kubeconfig()
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("no kubeconfig target configured"))?;

    let options_file = cli
        .options_file
        .clone()
        .unwrap_or_else(|| cli.state_dir.join("options.yaml"));
    let relations_file = cli
        .relations_file
        .clone()
        .unwrap_or_else(|| cli.state_dir.join("relations.json"));

    let relations: Arc<dyn RelationChannel> = Arc::new(FileRelationChannel::new(relations_file));
    let metadata = Arc::new(GceMetadataClient::new(cli.metadata_url.as_str())?);
    let collector = Collector::new(vec![ManifestSet::gce_pd_csi_driver(
        unit.app(),
        &cli.charm_dir,
    )]);

    let ctx = Context {
        config: CharmConfig::new(
            CharmConfig::load_options(&options_file)?,
            Box::new(CredentialGetTool::default()),
        ),
        integrator: IntegratorRequires::new(relations.clone(), metadata, record.identity.clone()),
        certificates: CertificatesRequires::new(relations.clone()),
        kube_control: KubeControlRequires::new(relations),
        collector,
        cluster: Arc::new(KubeClusterApi::new(kubeconfig)),
        status: Arc::new(FileStatusSink::new(cli.state_dir.join("status.json"))),
        unit,
        paths,
    };

    dispatch(&Reconciler::new(ctx), &store, record, trigger).await?;
    Ok(())
}
