mod config;

use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use adminscope_collect::{
    AdminClient, CONTROLLER_CONFIG_KEY, CONTROLLER_CONFIG_MAP, Collector, encode,
    rate_limit_enabled,
};
use adminscope_k8s::{ClusterApi, KubeClient, TargetResolver, TunnelSession, TunnelState};
use adminscope_types::{
    AdminResource, CollectionRequest, CollectionResult, ControllerResourceType, Error,
    LabelSelector, OutputFormat, ProxyResourceType, Scope, StatsFormat, StatsType, TargetRole,
};

use crate::config::Settings;

/// Adminscope - retrieve admin API state from Envoy Gateway pods
#[derive(Parser, Debug)]
#[command(name = "adminscope")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Kubernetes context name (defaults to the current context)
    #[arg(long, global = true)]
    context: Option<String>,

    /// Settings file
    #[arg(long, global = true, env = "ADMINSCOPE_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Retrieve configuration
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Retrieve statistics
    #[command(subcommand)]
    Stats(StatsCommand),

    /// Open a local tunnel to an admin dashboard
    #[command(subcommand)]
    Dashboard(DashboardCommand),
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Retrieve the xDS config dump of Envoy proxy pods
    EnvoyProxy {
        /// all, bootstrap, cluster, endpoint, listener or route
        #[arg(value_name = "TYPE")]
        resource: ProxyResourceType,

        #[command(flatten)]
        targets: TargetArgs,

        /// Output format: json or yaml
        #[arg(short, long, default_value = "json")]
        output: OutputFormat,

        /// Include endpoint (EDS) config
        #[arg(long)]
        include_eds: bool,
    },

    /// Retrieve resources known to the Envoy Gateway controller
    EnvoyGateway {
        /// Resource kind, e.g. all, gateway, httproute
        #[arg(value_name = "TYPE")]
        resource: ControllerResourceType,

        #[command(flatten)]
        targets: TargetArgs,

        /// Output format: json or yaml
        #[arg(short, long, default_value = "json")]
        output: OutputFormat,
    },

    /// Retrieve the configuration loaded by the global rate limit service
    EnvoyRatelimit {
        /// Namespace of the rate limit deployment
        #[arg(short, long)]
        namespace: Option<String>,

        /// Output format: json or yaml (raw text when omitted)
        #[arg(short, long)]
        output: Option<OutputFormat>,
    },
}

#[derive(Subcommand, Debug)]
enum StatsCommand {
    /// Retrieve statistics of Envoy proxy pods
    EnvoyProxy {
        #[command(flatten)]
        targets: TargetArgs,

        /// server or clusters
        #[arg(long = "type", default_value = "server")]
        kind: StatsType,

        /// Output format: json, yaml or prom (the admin API's own text)
        #[arg(short, long, default_value = "prom")]
        output: StatsOutput,
    },
}

/// Stats are printed as a document or passed through as text
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StatsOutput {
    Json,
    Yaml,
    Prom,
}

impl StatsOutput {
    fn stats_format(self) -> StatsFormat {
        match self {
            Self::Prom => StatsFormat::Text,
            Self::Json | Self::Yaml => StatsFormat::Json,
        }
    }

    fn document(self) -> OutputFormat {
        match self {
            Self::Yaml => OutputFormat::Yaml,
            Self::Json | Self::Prom => OutputFormat::Json,
        }
    }
}

impl FromStr for StatsOutput {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "prom" | "prometheus" | "text" => Ok(Self::Prom),
            other => match other.parse::<OutputFormat>() {
                Ok(OutputFormat::Json) => Ok(Self::Json),
                Ok(OutputFormat::Yaml) => Ok(Self::Yaml),
                Err(_) => Err(format!(
                    "unknown output format '{}', expected json, yaml or prom",
                    s
                )),
            },
        }
    }
}

#[derive(Subcommand, Debug)]
enum DashboardCommand {
    /// Forward the admin dashboard of an Envoy proxy pod
    EnvoyProxy {
        #[arg(value_name = "POD")]
        pod: String,

        #[arg(short, long)]
        namespace: Option<String>,

        /// Local port; 0 picks a free one
        #[arg(long, default_value_t = 19000)]
        port: u16,
    },
}

/// Flags selecting which pods a command talks to
#[derive(clap::Args, Debug)]
struct TargetArgs {
    /// Pod name (optional, selects by label when omitted)
    #[arg(value_name = "POD")]
    pod: Option<String>,

    #[arg(short, long)]
    namespace: Option<String>,

    /// Label selector; may be repeated
    #[arg(short = 'l', long = "labels", value_name = "SELECTOR", conflicts_with = "pod")]
    labels: Vec<String>,

    /// Query matching pods in every namespace
    #[arg(short = 'A', long, conflicts_with_all = ["pod", "namespace"])]
    all_namespaces: bool,
}

impl TargetArgs {
    /// Selector scopes aggregate every match, however many there are
    fn scope(&self, default_namespace: &str) -> Result<Scope> {
        let selector = LabelSelector::parse(self.labels.as_slice())?;
        let namespace = self
            .namespace
            .clone()
            .unwrap_or_else(|| default_namespace.to_string());

        Ok(match (&self.pod, self.all_namespaces) {
            (Some(name), _) => Scope::Pod {
                namespace,
                name: name.clone(),
            },
            (None, true) => Scope::AllNamespaces { selector },
            (None, false) => Scope::Selector {
                namespace,
                selector,
                expect_one: false,
            },
        })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    // Ctrl-C cancels everything hanging off the root token
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::debug!("interrupt received, shutting down");
            on_interrupt.cancel();
        }
    });

    match run(args, cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Everything a command needs once the cluster is reachable
struct App {
    settings: Settings,
    cluster: Arc<ClusterApi>,
    cancel: CancellationToken,
}

impl App {
    fn collector(&self) -> Result<Collector<ClusterApi, ClusterApi>> {
        let admin = AdminClient::new(self.settings.request_timeout())?;
        Ok(Collector::new(
            TargetResolver::new(Arc::clone(&self.cluster)),
            Arc::clone(&self.cluster),
            admin,
            self.settings.collector_settings(),
        ))
    }

    fn default_namespace(&self) -> &str {
        &self.settings.controller_namespace
    }
}

async fn run(args: Args, cancel: CancellationToken) -> Result<()> {
    let settings = Settings::load(args.config.as_deref())?;
    let context = args.context.or_else(|| settings.kube_context.clone());

    let kube_client = KubeClient::new();
    let cluster = kube_client
        .connect(context.as_deref())
        .await
        .context("Failed to connect to the cluster")?;

    let app = App {
        settings,
        cluster: Arc::new(cluster),
        cancel,
    };

    match args.command {
        Command::Config(ConfigCommand::EnvoyProxy {
            resource,
            targets,
            output,
            include_eds,
        }) => {
            let request = CollectionRequest::new(
                AdminResource::ProxyConfig {
                    resource,
                    include_eds,
                },
                targets.scope(app.default_namespace())?,
                output,
            );
            collect_and_print(&app, &request, false).await
        }
        Command::Config(ConfigCommand::EnvoyGateway {
            resource,
            targets,
            output,
        }) => {
            // every controller replica answers, keyed by pod
            let request = CollectionRequest::new(
                AdminResource::ControllerConfig { resource },
                targets.scope(app.default_namespace())?,
                output,
            );
            collect_and_print(&app, &request, false).await
        }
        Command::Config(ConfigCommand::EnvoyRatelimit { namespace, output }) => {
            let namespace = namespace.unwrap_or_else(|| app.default_namespace().to_string());
            rate_limit_config(&app, &namespace, output).await
        }
        Command::Stats(StatsCommand::EnvoyProxy {
            targets,
            kind,
            output,
        }) => {
            let request = CollectionRequest::new(
                AdminResource::ProxyStats {
                    kind,
                    format: output.stats_format(),
                },
                targets.scope(app.default_namespace())?,
                output.document(),
            );
            collect_and_print(&app, &request, output == StatsOutput::Prom).await
        }
        Command::Dashboard(DashboardCommand::EnvoyProxy {
            pod,
            namespace,
            port,
        }) => {
            let namespace = namespace.unwrap_or_else(|| app.default_namespace().to_string());
            dashboard(&app, namespace, pod, port).await
        }
    }
}

/// Collect, print whatever succeeded, then report failures
async fn collect_and_print(app: &App, request: &CollectionRequest, raw: bool) -> Result<()> {
    let collection = app.collector()?.collect(request, &app.cancel).await?;

    if !collection.result.is_empty() {
        print_result(&collection.result, request.output, raw)?;
    }

    match collection.failure {
        Some(failure) => Err(Error::Aggregation(failure).into()),
        None => Ok(()),
    }
}

fn print_result(result: &CollectionResult, format: OutputFormat, raw: bool) -> Result<()> {
    let mut out = std::io::stdout().lock();
    if raw {
        write_text(result, &mut out)?;
    } else {
        out.write_all(&encode(result, format)?)?;
    }
    out.flush()?;
    Ok(())
}

/// Text payloads as-is, with a header per pod when there are several
fn write_text(result: &CollectionResult, out: &mut impl Write) -> std::io::Result<()> {
    let headers = result.len() > 1;
    for (namespace, pod, payload) in result.iter() {
        if headers {
            writeln!(out, "# {}/{}", namespace, pod)?;
        }
        match payload.as_str() {
            Some(text) => out.write_all(text.as_bytes())?,
            None => writeln!(out, "{}", payload)?,
        }
    }
    Ok(())
}

async fn rate_limit_config(app: &App, namespace: &str, output: Option<OutputFormat>) -> Result<()> {
    let document = app
        .cluster
        .config_map_value(
            &app.settings.controller_namespace,
            CONTROLLER_CONFIG_MAP,
            CONTROLLER_CONFIG_KEY,
        )
        .await?
        .ok_or_else(|| {
            Error::NotFound(format!(
                "configmap {}/{} key {}",
                app.settings.controller_namespace, CONTROLLER_CONFIG_MAP, CONTROLLER_CONFIG_KEY
            ))
        })?;

    if !rate_limit_enabled(&document)? {
        anyhow::bail!("global rate limit feature is not enabled");
    }

    let collector = app.collector()?;
    let ready = collector
        .resolver()
        .resolve_ready(namespace, &LabelSelector::default(), TargetRole::RateLimit)
        .await?;
    let Some(target) = ready.into_iter().next() else {
        anyhow::bail!("no ready rate limit pods in namespace {}", namespace);
    };

    let request = CollectionRequest::new(
        AdminResource::RateLimitConfig,
        Scope::Pod {
            namespace: target.namespace.clone(),
            name: target.name.clone(),
        },
        output.unwrap_or_default(),
    );
    let result = collector
        .collect_targets(vec![target], &request, &app.cancel)
        .await?
        .into_result()?;

    print_result(&result, request.output, output.is_none())
}

async fn dashboard(app: &App, namespace: String, pod: String, port: u16) -> Result<()> {
    let resolver = TargetResolver::new(Arc::clone(&app.cluster));
    let scope = Scope::Pod {
        namespace,
        name: pod,
    };
    let target = resolver
        .resolve(&scope, TargetRole::Proxy)
        .await?
        .into_iter()
        .next()
        .context("pod resolved to no target")?;

    let session = TunnelSession::new(
        Arc::clone(&app.cluster),
        target,
        app.settings.ports.proxy,
        app.settings.tunnel_options(port),
        &app.cancel,
    )?;
    session.start().await?;

    let mut states = session.watch_state();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = states.borrow_and_update().state.clone();
            match state {
                TunnelState::Reconnecting { attempt } => {
                    eprintln!("Connection to the pod lost, reconnecting (attempt {})", attempt)
                }
                TunnelState::Ready => eprintln!("Connection to the pod restored"),
                TunnelState::Stopped => break,
                TunnelState::Pending => {}
            }
        }
    });

    println!("Go to http://{} to view the dashboard", session.address());
    println!("Press Ctrl-C to stop");

    session.wait_for_stop().await;
    session.shutdown().await;
    Ok(())
}
