use std::{sync::Arc, time::Duration};

use anyhow::{bail, Context};
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_util::apis::Cluster;
use kube::{
    runtime::{watcher, WatchStreamExt},
    Api, Client, CustomResourceExt,
};
use log::{debug, error, info, warn};
use tokio::{
    select,
    signal::unix::{signal, SignalKind},
    time::{interval_at, timeout, Instant, MissedTickBehavior},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use cleanup_operator::{
    config::{OperatorConfig, CONFIG_MAP_NAME, DEFAULT_CONFIG_NAMESPACE},
    crd::Cleanup,
    scheduler::{
        cleanup_watch_events, config_watch_events, next_period, CycleTrigger, Scheduler,
        SchedulerEvent,
    },
    store::KubeBackend,
};

const SHUTDOWN_GRACE_SECS: u64 = 30;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
    /// Kubeconfig context; in-cluster config or the current context when unset
    #[arg(short, long, global = true)]
    context: Option<String>,
    /// Namespace holding the operator's configuration ConfigMap
    #[arg(
        long,
        global = true,
        env = "CLEANUP_CONFIG_NAMESPACE",
        default_value = DEFAULT_CONFIG_NAMESPACE
    )]
    config_namespace: String,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the operator until terminated (default)
    Run,
    /// Run a single cleanup cycle and exit
    Once {
        /// Only log what would be deleted
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the Cleanup CustomResourceDefinition as YAML
    Crd,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    env_logger::Builder::new()
        .filter_level(args.verbose.log_level_filter())
        .parse_default_env()
        .init();

    let command = args.command.unwrap_or(Commands::Run);
    if let Commands::Crd = command {
        let crd = serde_yaml::to_string(&Cleanup::crd()).context("when rendering the CRD")?;
        print!("{}", crd);
        return Ok(());
    }

    let client = k8s_util::create_client(args.context.as_deref()).await?;
    let backend = Arc::new(KubeBackend::new(
        Cluster::new(client.clone()),
        &args.config_namespace,
    ));

    match command {
        Commands::Once { dry_run } => {
            let scheduler = Scheduler::new(backend, CancellationToken::new());
            let config = scheduler.load_initial().await;
            if dry_run && !config.dry_run {
                scheduler.config().replace(OperatorConfig {
                    dry_run: true,
                    ..(*config).clone()
                });
            }
            let report = scheduler.run_cycle(CycleTrigger::Once).await;
            if report.failed_count() > 0 {
                bail!("{} namespaces failed", report.failed_count());
            }
            Ok(())
        }
        Commands::Run | Commands::Crd => run(client, backend, &args.config_namespace).await,
    }
}

fn spawn_events(tracker: &TaskTracker, scheduler: &Arc<Scheduler>, events: Vec<SchedulerEvent>) {
    if events.is_empty() {
        return;
    }
    let scheduler = scheduler.clone();
    tracker.spawn(async move {
        // Events from one observation are handled in order.
        for event in events {
            scheduler.dispatch(event).await;
        }
    });
}

async fn run(
    client: Client,
    backend: Arc<KubeBackend>,
    config_namespace: &str,
) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    let scheduler = Arc::new(Scheduler::new(backend, shutdown.clone()));
    let config = scheduler.load_initial().await;
    info!("Operator starting with config: {:?}", config);

    let mut config_updates = scheduler.config().subscribe();
    let mut period = config.interval();
    let mut timer = interval_at(Instant::now(), period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut cleanups = watcher(Api::<Cleanup>::all(client.clone()), watcher::Config::default())
        .default_backoff()
        .boxed();
    let mut config_maps = watcher(
        Api::<ConfigMap>::namespaced(client, config_namespace),
        watcher::Config::default().fields(&format!("metadata.name={}", CONFIG_MAP_NAME)),
    )
    .default_backoff()
    .boxed();

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to setup SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to setup SIGINT handler")?;

    let tracker = TaskTracker::new();
    info!("Cleanup operator started successfully");

    loop {
        select! {
            _ = timer.tick() => {
                spawn_events(&tracker, &scheduler, vec![SchedulerEvent::TimerTick]);
            }
            Ok(()) = config_updates.changed() => {
                let next = next_period(period, &config_updates.borrow_and_update());
                if let Some(next) = next {
                    info!("Cleanup interval changed from {:?} to {:?}", period, next);
                    period = next;
                    timer = interval_at(Instant::now() + period, period);
                    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
                }
            }
            event = cleanups.try_next() => match event {
                Ok(Some(event)) => spawn_events(&tracker, &scheduler, cleanup_watch_events(event)),
                Ok(None) => bail!("Cleanup watch ended unexpectedly"),
                Err(err) => warn!("Cleanup watch error: {}", err),
            },
            event = config_maps.try_next() => match event {
                Ok(Some(event)) => spawn_events(&tracker, &scheduler, config_watch_events(event)),
                Ok(None) => bail!("ConfigMap watch ended unexpectedly"),
                Err(err) => warn!("ConfigMap watch error: {}", err),
            },
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully");
                break;
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down gracefully");
                break;
            }
        }
    }

    shutdown.cancel();
    tracker.close();
    debug!("Waiting for {} running handlers", tracker.len());
    if timeout(Duration::from_secs(SHUTDOWN_GRACE_SECS), tracker.wait())
        .await
        .is_err()
    {
        error!(
            "Handlers still running after {}s, exiting anyway",
            SHUTDOWN_GRACE_SECS
        );
    }
    info!("Shutdown complete");

    Ok(())
}
