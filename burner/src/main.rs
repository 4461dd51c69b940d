//! kube-burner is a tool for stressing a Kubernetes cluster by creating or
//! deleting lots of objects while measuring control-plane latencies.
#![deny(missing_docs)]
use std::{collections::BTreeMap, process::exit, sync::Arc, time::Duration};

use anyhow::{Context as _, Result};
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use k8s_openapi::chrono::{DateTime, Utc};
use kube::Client;
use kube_burner::{
    alerting::AlertManager,
    config::{self, IndexerConfig, IndexerType, MetricsProfileEntry, Spec},
    indexers::{local, Indexer},
    measurements::Measurements,
    prometheus,
    run::{self, codes, ScrapeTarget},
};
use kube_burner_common::telemetry;
use serde_json::Value;
use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook_tokio::Signals;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(author, version, about = "Burn a Kubernetes cluster", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Allowed values: trace, debug, info, warn, error
    #[arg(long, env = "KUBE_BURNER_LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,
}

/// Available Subcommands
#[derive(Subcommand, Debug)]
enum Command {
    /// Launch benchmark
    Init(InitOpts),
    /// Destroy old namespaces labeled with the given UUID
    Destroy(DestroyOpts),
    /// Take measurements for a given set of resources without running workload
    Measure(MeasureOpts),
    /// Scrape and index metrics for a given time range
    Index(IndexOpts),
    /// Import a metrics tarball into a sink
    Import(ImportOpts),
    /// Evaluate alerts for the given time range
    CheckAlerts(CheckAlertsOpts),
}

/// Prometheus connection flags shared by several subcommands.
#[derive(Args, Debug, Clone)]
struct PrometheusOpts {
    /// Prometheus URL
    #[arg(long = "prometheus-url", short = 'u', env = "PROMETHEUS_URL")]
    url: Option<String>,

    /// Prometheus bearer token
    #[arg(long, short = 't', env = "PROMETHEUS_TOKEN")]
    token: Option<String>,

    /// Prometheus username for basic authentication
    #[arg(long)]
    username: Option<String>,

    /// Prometheus password for basic authentication
    #[arg(long, short = 'p')]
    password: Option<String>,

    /// Skip TLS verification towards Prometheus
    #[arg(long, default_value_t = true)]
    skip_tls_verify: bool,

    /// Prometheus step size
    #[arg(long, short = 's', default_value = "30s", value_parser = parse_duration_arg)]
    step: Duration,

    /// YAML file with a list of metric endpoints
    #[arg(long, short = 'e')]
    metrics_endpoint: Option<String>,
}

#[derive(Args, Debug)]
struct InitOpts {
    /// Benchmark UUID
    #[arg(long, default_value_t = Uuid::new_v4().to_string())]
    uuid: String,

    /// Config file path or URL
    #[arg(long, short = 'c')]
    config: String,

    /// Metrics profile file or URL
    #[arg(long, short = 'm')]
    metrics_profile: Option<String>,

    /// Alert profile file or URL
    #[arg(long, short = 'a')]
    alert_profile: Option<String>,

    /// User provided metadata file, in YAML format
    #[arg(long)]
    user_metadata: Option<String>,

    /// Benchmark timeout
    #[arg(long, default_value = "4h", value_parser = parse_duration_arg)]
    timeout: Duration,

    #[command(flatten)]
    prometheus: PrometheusOpts,
}

#[derive(Args, Debug)]
struct DestroyOpts {
    /// UUID of the run to destroy
    #[arg(long)]
    uuid: String,

    /// Deletion timeout
    #[arg(long, default_value = "4h", value_parser = parse_duration_arg)]
    timeout: Duration,
}

#[derive(Args, Debug)]
struct MeasureOpts {
    /// UUID scoping the measured objects
    #[arg(long)]
    uuid: String,

    /// Config file path or URL
    #[arg(long, short = 'c', default_value = "config.yml")]
    config: String,

    /// Job name stamped on measurements of objects without a job label
    #[arg(long, short = 'j', default_value = "kube-burner-measure")]
    job_name: String,

    /// User provided metadata file, in YAML format
    #[arg(long)]
    user_metadata: Option<String>,
}

#[derive(Args, Debug)]
struct IndexOpts {
    /// Benchmark UUID
    #[arg(long, default_value_t = Uuid::new_v4().to_string())]
    uuid: String,

    /// Metrics profile file or URL
    #[arg(long, short = 'm', default_value = "metrics.yml")]
    metrics_profile: String,

    /// Epoch start time
    #[arg(long, default_value_t = Utc::now().timestamp() - 3600)]
    start: i64,

    /// Epoch end time
    #[arg(long, default_value_t = Utc::now().timestamp())]
    end: i64,

    /// Indexing job name
    #[arg(long, short = 'j', default_value = "kube-burner-indexing")]
    job_name: String,

    /// User provided metadata file, in YAML format
    #[arg(long)]
    user_metadata: Option<String>,

    /// Directory to dump the metrics files in, when using local indexing
    #[arg(long, default_value = "collected-metrics")]
    metrics_directory: String,

    /// Elastic Search endpoint
    #[arg(long)]
    es_server: Option<String>,

    /// Elastic Search index
    #[arg(long)]
    es_index: Option<String>,

    /// Dump collected metrics into a tarball with the given name, requires local indexing
    #[arg(long)]
    tarball_name: Option<String>,

    #[command(flatten)]
    prometheus: PrometheusOpts,
}

#[derive(Args, Debug)]
struct ImportOpts {
    /// Metrics tarball file
    #[arg(long)]
    tarball: String,

    /// Directory to restore the metrics files into, when using local indexing
    #[arg(long, default_value = "collected-metrics")]
    metrics_directory: String,

    /// Elastic Search endpoint
    #[arg(long)]
    es_server: Option<String>,

    /// Elastic Search index
    #[arg(long)]
    es_index: Option<String>,
}

#[derive(Args, Debug)]
struct CheckAlertsOpts {
    /// Benchmark UUID
    #[arg(long, default_value_t = Uuid::new_v4().to_string())]
    uuid: String,

    /// Alert profile file or URL
    #[arg(long, short = 'a', default_value = "alerts.yaml")]
    alert_profile: String,

    /// Epoch start time
    #[arg(long, default_value_t = Utc::now().timestamp() - 3600)]
    start: i64,

    /// Epoch end time
    #[arg(long, default_value_t = Utc::now().timestamp())]
    end: i64,

    /// Directory to dump the alert files in, enables local indexing when specified
    #[arg(long)]
    metrics_directory: Option<String>,

    /// Elastic Search endpoint
    #[arg(long)]
    es_server: Option<String>,

    /// Elastic Search index
    #[arg(long)]
    es_index: Option<String>,

    #[command(flatten)]
    prometheus: PrometheusOpts,
}

fn parse_duration_arg(raw: &str) -> Result<Duration, String> {
    config::parse_duration(raw)
}

fn epoch(seconds: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(seconds, 0).unwrap_or_else(Utc::now)
}

fn prom_auth(opts: &PrometheusOpts) -> prometheus::Auth {
    prometheus::Auth {
        token: opts.token.clone(),
        username: opts.username.clone(),
        password: opts.password.clone(),
        skip_tls_verify: opts.skip_tls_verify,
    }
}

/// Indexer from the es-server/es-index pair, falling back to a local
/// directory sink.
fn sink_from_flags(
    es_server: Option<&str>,
    es_index: Option<&str>,
    metrics_directory: Option<&str>,
) -> Result<Option<Indexer>> {
    let config = match (es_server, es_index) {
        (Some(server), Some(index)) => IndexerConfig {
            indexer_type: IndexerType::Elastic,
            servers: vec![server.to_owned()],
            index: index.to_owned(),
            ..Default::default()
        },
        _ => match metrics_directory {
            Some(directory) => IndexerConfig {
                indexer_type: IndexerType::Local,
                metrics_directory: directory.to_owned(),
                ..Default::default()
            },
            None => return Ok(None),
        },
    };
    info!(indexer = ?config.indexer_type, "creating indexer");
    Ok(Indexer::new(&config)?)
}

async fn load_metadata(path: Option<&str>) -> Result<BTreeMap<String, Value>> {
    match path {
        Some(path) => {
            let raw = config::read_to_string(path).await?;
            Ok(config::parse_user_metadata(&raw)?)
        }
        None => Ok(BTreeMap::new()),
    }
}

async fn load_metrics_profile(path: &str) -> Result<Vec<MetricsProfileEntry>> {
    let raw = config::read_to_string(path).await?;
    config::parse_metrics_profile(&raw)
        .with_context(|| format!("error parsing metrics profile {path}"))
}

/// Assemble one scrape target per configured endpoint.
///
/// An endpoints file wins over the single-URL flags; per-endpoint profile
/// overrides win over the defaults passed on the command line.
async fn scrape_targets(
    prometheus: &PrometheusOpts,
    default_metrics_profile: Option<&str>,
    default_alert_profile: Option<&str>,
    uuid: &str,
    metadata: &BTreeMap<String, Value>,
) -> Result<Vec<ScrapeTarget>> {
    let mut endpoints = Vec::new();
    if let Some(path) = &prometheus.metrics_endpoint {
        let raw = config::read_to_string(path).await?;
        endpoints = config::parse_metrics_endpoints(&raw)?;
    } else if let Some(url) = &prometheus.url {
        endpoints.push(config::MetricsEndpoint {
            endpoint: url.clone(),
            token: prometheus.token.clone(),
            username: prometheus.username.clone(),
            password: prometheus.password.clone(),
            step: prometheus.step,
            skip_tls_verify: prometheus.skip_tls_verify,
            metrics_profile: None,
            alert_profile: None,
        });
    }

    let mut targets = Vec::new();
    for endpoint in endpoints {
        let auth = prometheus::Auth {
            token: endpoint.token.clone(),
            username: endpoint.username.clone(),
            password: endpoint.password.clone(),
            skip_tls_verify: endpoint.skip_tls_verify,
        };
        let client = prometheus::Client::new(&endpoint.endpoint, auth, endpoint.step)?;
        let profile = match endpoint
            .metrics_profile
            .as_deref()
            .or(default_metrics_profile)
        {
            Some(path) => load_metrics_profile(path).await?,
            None => Vec::new(),
        };
        let alerts = match endpoint.alert_profile.as_deref().or(default_alert_profile) {
            Some(path) => {
                let raw = config::read_to_string(path).await?;
                let entries = config::parse_alert_profile(&raw)?;
                Some(AlertManager::new(entries, uuid, metadata.clone()))
            }
            None => None,
        };
        targets.push(ScrapeTarget {
            client,
            profile,
            alerts,
        });
    }
    Ok(targets)
}

/// Cancel the run on the usual termination signals.
fn install_signal_handler(cancel: CancellationToken) -> Result<()> {
    let mut signals = Signals::new([SIGHUP, SIGTERM, SIGINT, SIGQUIT])?;
    tokio::spawn(async move {
        if let Some(signal) = signals.next().await {
            info!(?signal, "signal received, cancelling");
            cancel.cancel();
        }
    });
    Ok(())
}

async fn init(opts: InitOpts) -> Result<i32> {
    let raw = config::read_to_string(&opts.config)
        .await
        .with_context(|| format!("error reading configuration file {}", opts.config))?;
    let spec: Spec = match config::parse(&opts.uuid, &raw) {
        Ok(spec) => spec,
        Err(err) => {
            error!(%err, "config error");
            return Ok(codes::CONFIG);
        }
    };
    let metadata = load_metadata(opts.user_metadata.as_deref()).await?;
    let indexer = Indexer::new(&spec.global.indexer_config)?.map(Arc::new);
    let targets = scrape_targets(
        &opts.prometheus,
        opts.metrics_profile.as_deref(),
        opts.alert_profile.as_deref(),
        &opts.uuid,
        &metadata,
    )
    .await?;

    let client = Client::try_default().await?;
    let cancel = CancellationToken::new();
    install_signal_handler(cancel.clone())?;

    let rc = run::run(
        &spec,
        client,
        targets,
        indexer,
        opts.timeout,
        metadata,
        cancel,
    )
    .await;
    info!("exiting kube-burner {}", opts.uuid);
    Ok(rc)
}

async fn destroy(opts: DestroyOpts) -> Result<i32> {
    let client = Client::try_default().await?;
    let deleted = run::destroy(&client, &opts.uuid, opts.timeout).await?;
    info!(deleted, "exiting kube-burner {}", opts.uuid);
    Ok(codes::SUCCESS)
}

async fn measure(opts: MeasureOpts) -> Result<i32> {
    let raw = config::read_to_string(&opts.config)
        .await
        .with_context(|| format!("error reading configuration file {}", opts.config))?;
    let spec = match config::parse(&opts.uuid, &raw) {
        Ok(spec) => spec,
        Err(err) => {
            error!(%err, "config error");
            return Ok(codes::CONFIG);
        }
    };
    if !spec.jobs.is_empty() {
        error!("no jobs are allowed in a measure subcommand config file");
        return Ok(codes::CONFIG);
    }
    let metadata = load_metadata(opts.user_metadata.as_deref()).await?;
    let indexer = Indexer::new(&spec.global.indexer_config)?.map(Arc::new);

    let client = Client::try_default().await?;
    let cancel = CancellationToken::new();
    install_signal_handler(cancel.clone())?;

    let measurements = Measurements::start(
        &client,
        &opts.uuid,
        &opts.job_name,
        &metadata,
        indexer.clone(),
        &spec.global.measurements,
    );
    if !measurements.is_active() {
        error!("no measurements configured");
        return Ok(codes::CONFIG);
    }
    info!(uuid = opts.uuid, "measuring until interrupted");
    cancel.cancelled().await;
    let rc = match measurements.stop().await {
        Ok(()) => codes::SUCCESS,
        Err(err) => {
            error!(%err, "measurement failed");
            codes::MEASUREMENT
        }
    };
    if let Some(indexer) = &indexer {
        if let Err(err) = indexer.close().await {
            error!(%err, "failed to close indexer");
        }
    }
    info!("exiting kube-burner {}", opts.uuid);
    Ok(rc)
}

async fn index(opts: IndexOpts) -> Result<i32> {
    let indexer = sink_from_flags(
        opts.es_server.as_deref(),
        opts.es_index.as_deref(),
        Some(opts.metrics_directory.as_str()),
    )?
    .context("index subcommand requires a sink")?;
    let metadata = load_metadata(opts.user_metadata.as_deref()).await?;
    let targets = scrape_targets(
        &opts.prometheus,
        Some(&opts.metrics_profile),
        None,
        &opts.uuid,
        &metadata,
    )
    .await?;
    if targets.is_empty() {
        error!("no prometheus endpoint given, use --prometheus-url or --metrics-endpoint");
        return Ok(codes::CONFIG);
    }

    info!(uuid = opts.uuid, "indexing metrics");
    for target in &targets {
        let scraped = prometheus::scrape(
            &target.client,
            &target.profile,
            &opts.uuid,
            &opts.job_name,
            epoch(opts.start),
            epoch(opts.end),
            &metadata,
            Some(&indexer),
        )
        .await;
        match scraped {
            Ok(count) => info!(endpoint = target.client.endpoint(), count, "scraped"),
            Err(err) => error!(endpoint = target.client.endpoint(), %err, "endpoint failed"),
        }
    }
    if let Err(err) = indexer.close().await {
        error!(%err, "failed to close indexer");
    }
    if let (Indexer::Local(sink), Some(tarball)) = (&indexer, &opts.tarball_name) {
        local::create_tarball(sink.directory(), std::path::Path::new(tarball))?;
    }
    info!("exiting kube-burner {}", opts.uuid);
    Ok(codes::SUCCESS)
}

async fn import(opts: ImportOpts) -> Result<i32> {
    let indexer = sink_from_flags(
        opts.es_server.as_deref(),
        opts.es_index.as_deref(),
        Some(opts.metrics_directory.as_str()),
    )?
    .context("import subcommand requires a sink")?;
    local::import_tarball(std::path::Path::new(&opts.tarball), &indexer).await?;
    if let Err(err) = indexer.close().await {
        error!(%err, "failed to close indexer");
    }
    Ok(codes::SUCCESS)
}

async fn check_alerts(opts: CheckAlertsOpts) -> Result<i32> {
    let url = opts
        .prometheus
        .url
        .clone()
        .context("check-alerts requires --prometheus-url")?;
    let indexer = sink_from_flags(
        opts.es_server.as_deref(),
        opts.es_index.as_deref(),
        opts.metrics_directory.as_deref(),
    )?;
    let client = prometheus::Client::new(&url, prom_auth(&opts.prometheus), opts.prometheus.step)?;
    let raw = config::read_to_string(&opts.alert_profile).await?;
    let entries = config::parse_alert_profile(&raw)?;
    let manager = AlertManager::new(entries, &opts.uuid, BTreeMap::new());
    let critical = manager
        .evaluate(&client, epoch(opts.start), epoch(opts.end), indexer.as_ref())
        .await;
    if let Some(indexer) = &indexer {
        if let Err(err) = indexer.close().await {
            error!(%err, "failed to close indexer");
        }
    }
    info!("exiting kube-burner {}", opts.uuid);
    Ok(if critical {
        codes::ALERT_CRITICAL
    } else {
        codes::SUCCESS
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init_tracing(telemetry::parse_level(&cli.log_level)?)?;

    let rc = match cli.command {
        Command::Init(opts) => init(opts).await,
        Command::Destroy(opts) => destroy(opts).await,
        Command::Measure(opts) => measure(opts).await,
        Command::Index(opts) => index(opts).await,
        Command::Import(opts) => import(opts).await,
        Command::CheckAlerts(opts) => check_alerts(opts).await,
    };
    match rc {
        Ok(rc) => exit(rc),
        Err(err) => {
            error!("{err:#}");
            exit(codes::GENERIC)
        }
    }
}
