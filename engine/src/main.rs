use std::sync::Arc;

use tracing::{info, warn};

use channelmix::admin::AdminSender;
use channelmix::config::EngineConfig;
use channelmix::distributor::Distributor;
use channelmix::ingest;
use channelmix::server::{build_router, AppState};

// ChannelMix engine
//
// Kept deliberately small:
//   - join the ten RTP multicast groups and strip the RTP header
//   - fan every payload out to connected WebSocket sessions
//   - relay start/stop commands to the stream generator
//   - run behind a reverse proxy (nginx) for HTTPS, auth and the UI

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let version = env!("CARGO_PKG_VERSION").to_string();
    let cfg = EngineConfig::from_env()?;

    let distributor = Distributor::new(cfg.broadcast_capacity);
    let stats = ingest::new_stats(cfg.plan.channels);

    // A channel that cannot bind is logged and skipped; the rest still serve.
    let listeners = ingest::spawn_listeners(&cfg.plan, &distributor, &stats).await;
    if listeners.is_empty() {
        warn!("no ingest channel could bind; sessions will only see silence");
    } else {
        info!("{} of {} ingest channels listening", listeners.len(), cfg.plan.channels);
    }

    let state = AppState {
        version: version.clone(),
        plan: cfg.plan.clone(),
        distributor,
        stats: Arc::clone(&stats),
        admin: AdminSender::new(cfg.admin_target),
    };

    let app = build_router(state);

    // Bind loopback only by default; put Nginx/Caddy in front for LAN/Internet.
    let addr = cfg.bind;
    info!("ChannelMix engine v{version} starting on http://{addr} (admin -> {})", cfg.admin_target);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    for task in listeners {
        task.abort();
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let term = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("cannot install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let term = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = term => {},
    }

    warn!("Shutdown signal received.");
}
