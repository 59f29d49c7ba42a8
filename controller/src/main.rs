use std::{net::SocketAddr, sync::Arc, time::Duration};

use is_terminal::IsTerminal;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use controller::*;

fn main() {
    use clap::{
        Arg, ArgAction, Command, crate_authors, crate_description, crate_name, crate_version,
    };
    use std::process;
    let cmd = Command::new(crate_name!())
        .version(crate_version!())
        .author(crate_authors!())
        .about(crate_description!())
        .subcommand_required(true)
        .subcommands([Command::new("run").about("run controllers").args([
            Arg::new("metrics_address")
                .long("metrics-bind-address")
                .help("address to bind for the Prometheus metrics endpoint")
                .default_value(":8078"),
            Arg::new("health_address")
                .long("health-probe-bind-address")
                .help("address to bind for the liveness/readiness probes")
                .default_value(":8079"),
            Arg::new("allow_crd_deletion")
                .long("allow-crd-deletion")
                .help("allow deleting a synthesized CRD while instances of it exist")
                .action(ArgAction::SetTrue),
            Arg::new("client_qps")
                .long("client-qps")
                .help("sustained request rate to the API server, per second")
                .default_value("100"),
            Arg::new("client_burst")
                .long("client-burst")
                .help("request burst allowance to the API server")
                .default_value("150"),
            Arg::new("leader_elect")
                .long("leader-elect")
                .help("Flag for if leader election is needed. Currently does nothing.")
                .hide(true)
                .action(ArgAction::SetTrue),
            Arg::new("rgd_workers")
                .long("resource-graph-definition-concurrent-reconciles")
                .help("worker count for the ResourceGraphDefinition controller")
                .default_value("1"),
            Arg::new("dynamic_workers")
                .long("dynamic-controller-concurrent-reconciles")
                .help("worker count for each dynamic controller")
                .default_value("1"),
            Arg::new("resync_period")
                .long("dynamic-controller-default-resync-period")
                .help("seconds between full re-walks of every instance")
                .default_value("36000"),
            Arg::new("queue_max_retries")
                .long("dynamic-controller-default-queue-max-retries")
                .help("requeue attempts before an instance is parked as degraded")
                .default_value("20"),
            Arg::new("shutdown_timeout")
                .long("dynamic-controller-default-shutdown-timeout")
                .help("seconds to drain work queues before force-exit")
                .default_value("60"),
            Arg::new("log_level")
                .long("log-level")
                .help("verbosity, 0 (quietest) to 5 (loudest); RUST_LOG overrides")
                .default_value("3"),
        ])]);

    if let Err(e) = match cmd.get_matches().subcommand() {
        Some(("run", m)) => match Args::try_from(m) {
            Ok(args) => startup(args),
            Err(e) => Err(Error::from(e)),
        },
        _ => unreachable!(),
    } {
        eprintln!("{e}");
        process::exit(1);
    }
}

struct Args {
    _leader_elect: bool,
    health_address: SocketAddr,
    log_level: u8,
    metrics_address: SocketAddr,
    settings: Settings,
}

impl TryFrom<&clap::ArgMatches> for Args {
    type Error = anyhow::Error;

    fn try_from(m: &clap::ArgMatches) -> std::result::Result<Self, Self::Error> {
        let addr = |name: &str| -> anyhow::Result<SocketAddr> {
            let raw = m.get_one::<String>(name).map(String::as_str).unwrap_or("");
            Ok(parse_bind(raw)?)
        };
        let num = |name: &str| -> anyhow::Result<u64> {
            let raw = m.get_one::<String>(name).map(String::as_str).unwrap_or("");
            Ok(raw.parse()?)
        };
        Ok(Self {
            _leader_elect: m.get_flag("leader_elect"),
            metrics_address: addr("metrics_address")?,
            health_address: addr("health_address")?,
            log_level: u8::try_from(num("log_level")?.min(5))?,
            settings: Settings {
                allow_crd_deletion: m.get_flag("allow_crd_deletion"),
                client_qps: u32::try_from(num("client_qps")?)?,
                client_burst: u32::try_from(num("client_burst")?)?,
                enable_leader_election: m.get_flag("leader_elect"),
                rgd_concurrent_reconciles: u16::try_from(num("rgd_workers")?)?,
                dynamic_concurrent_reconciles: u16::try_from(num("dynamic_workers")?)?,
                resync_period: Duration::from_secs(num("resync_period")?),
                queue_max_retries: u32::try_from(num("queue_max_retries")?)?,
                shutdown_timeout: Duration::from_secs(num("shutdown_timeout")?),
            },
        })
    }
}

/// Accept Go-style ":8078" bind strings alongside full socket addresses.
fn parse_bind(s: &str) -> std::result::Result<SocketAddr, std::net::AddrParseError> {
    if s.starts_with(':') {
        format!("[::]{s}").parse()
    } else {
        s.parse()
    }
}

fn level_str(level: u8) -> &'static str {
    match level {
        0 => "error",
        1 => "warn",
        2 | 3 => "info",
        4 => "debug",
        _ => "trace",
    }
}

fn startup(args: Args) -> controller::Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tokio::{runtime, signal};
    use tracing_subscriber::{filter::EnvFilter, prelude::*};

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level_str(args.log_level)))?;
    let collector = tracing_subscriber::Registry::default()
        .with(env_filter)
        .with(if std::io::stdout().is_terminal() {
            Some(tracing_subscriber::fmt::layer())
        } else {
            None
        })
        .with(if std::io::stdout().is_terminal() {
            None
        } else {
            Some(tracing_subscriber::fmt::layer().json())
        });
    tracing::subscriber::set_global_default(collector)?;
    let prom = PrometheusBuilder::new().with_http_listener(args.metrics_address);

    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    let token = CancellationToken::new();
    rt.handle().spawn(async move {
        if let Err(e) = prom.install() {
            error!("error setting up prometheus endpoint: {e}");
        }
    });
    rt.handle()
        .spawn(health(args.health_address, token.clone()));
    let ctlstop = token.clone();
    rt.handle().spawn(async move {
        if let Err(err) = signal::ctrl_c().await {
            error!("error reading SIGTERM: {err}");
        }
        token.cancel();
    });
    rt.block_on(run(args, ctlstop))
}

async fn run(args: Args, token: CancellationToken) -> controller::Result<()> {
    use tokio::task;
    use tower::{buffer::BufferLayer, limit::RateLimitLayer};

    let config = kube::Config::infer().await?;
    let qps = u64::from(args.settings.client_qps);
    let burst = usize::try_from(args.settings.client_burst).unwrap_or(usize::MAX);
    let client = kube::client::ClientBuilder::try_from(config.clone())?
        .with_layer(&RateLimitLayer::new(qps, std::time::Duration::from_secs(1)))
        .with_layer(&BufferLayer::new(burst))
        .build();

    if args.settings.enable_leader_election {
        warn!("leader election requested but not wired up; running unconditionally");
    }
    info!("setup done, starting controllers");
    let shutdown_timeout = args.settings.shutdown_timeout;
    let ctx = Arc::new(Context::new(client, config, args.settings));

    let mut ctrls = task::JoinSet::new();
    ctrls.spawn(rgds::controller(token.clone(), ctx.clone())?);
    while let Some(res) = ctrls.join_next().await {
        match res {
            Err(e) => error!("error starting controller: {e}"),
            Ok(res) => {
                if let Err(e) = res {
                    error!("error from controller: {e}");
                    token.cancel();
                }
            }
        };
    }

    // The definition controller is down; drain the dynamic controllers within the budget.
    if tokio::time::timeout(shutdown_timeout, ctx.registry.shutdown())
        .await
        .is_err()
    {
        warn!("shutdown timeout reached; abandoning queue drain");
    }
    Ok(())
}

async fn health(addr: SocketAddr, cancel: CancellationToken) -> controller::Result<()> {
    use axum::{Router, routing::get};

    let app = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(|| async { "ok" }));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "started health probe server");
    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    Ok(())
}
