use clap::Parser;
use mesh_lb::config::{Cli, Commands};
use mesh_lb::{Result, agent, bpf, dump, http};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_subscriber();
    match cli.command {
        Commands::Agent(agent_args) => {
            let cancel = tokio_util::sync::CancellationToken::new();
            // cancelled once the maps are restored and the reconciler runs
            let ready = tokio_util::sync::CancellationToken::new();

            let mut metrics_handle = tokio::spawn(http::serve_metrics(
                agent_args.metrics_address,
                ready.child_token(),
                cancel.child_token(),
            ));
            let mut agent_handle =
                tokio::spawn(agent::start(agent_args, ready, cancel.child_token()));
            let mut shutdown_handle = tokio::spawn(shutdown_signal());
            // watch for shutdown and errors
            let result = tokio::select! {
                h = &mut metrics_handle => agent::exited("metrics", h),
                h = &mut agent_handle => agent::exited("agent", h),
                s = &mut shutdown_handle => {
                    if let Ok(Err(e)) = s {
                        error!("signal handling failed: {e}");
                    }
                    cancel.cancel();
                    let (metrics, agent) = tokio::join!(metrics_handle, agent_handle);
                    let metrics = agent::exited("metrics", metrics);
                    metrics.and(agent::exited("agent", agent))
                },
            };
            info!("Exiting...");
            result?;
        }
        Commands::Dump(dump_args) => {
            let maps = bpf::lbmap::load_pinned(&dump_args.bpf_fs)?;
            dump::dump(&maps, &mut std::io::stdout().lock())?;
        }
    }
    Ok(())
}

fn setup_subscriber() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mesh_lb=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn shutdown_signal() -> Result<()> {
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        r = tokio::signal::ctrl_c() => {
            r?;
            info!("captured ctrl_c signal");
        },
        _ = terminate.recv() => {
            info!("captured terminate signal");
        },
    }
    Ok(())
}
