use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use channelmix::client::run_session;
use channelmix::config::{ClientConfig, OutputKind};
use channelmix::controller::{ChannelController, ControlCommand, ControllerSettings};
use channelmix::playout::{NullSink, OutputSink, PcmWriterSink, PlayoutEngine, RenderThread};

// ChannelMix headless client
//
// Connects to the engine's /ws session, keeps one ring per channel, and
// renders the operator's mix on a dedicated thread. Operator commands come
// in on stdin, one per line:
//
//   on 3 | off 3 | toggle 3 | mute 3 | muteall | unmuteall
//   vol 3 0.8 | pan 3 -0.5 | master 0.6 | clear | status
//
// Logs go to stderr so stdout can carry PCM (CHANNELMIX_OUTPUT=stdout):
//
//   channelmix-client | aplay -f S16_LE -c 2 -r 48000

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cfg = ClientConfig::from_env()?;

    let engine = Arc::new(PlayoutEngine::new(cfg.channels, cfg.ring_capacity));
    let controller = ChannelController::new(
        engine.clone(),
        ControllerSettings {
            watchdog: cfg.watchdog,
            traffic_highlight: cfg.traffic_highlight,
        },
    );

    let sink: Box<dyn OutputSink> = match cfg.output {
        OutputKind::Null => Box::new(NullSink),
        OutputKind::Stdout => Box::new(PcmWriterSink::new(std::io::stdout(), cfg.block_frames)),
    };
    let mut render = RenderThread::spawn(engine, sink, cfg.block_frames, cfg.sample_rate)?;

    for n in &cfg.auto_on {
        match n.checked_sub(1).filter(|ch| *ch < controller.channels()) {
            Some(ch) => controller.turn_on(ch),
            None => warn!("CHANNELMIX_AUTO_ON: no channel {n}"),
        }
    }

    // Channel state changes, for whoever is watching the log.
    {
        let mut events = controller.subscribe_events();
        tokio::spawn(async move {
            while let Ok(ev) = events.recv().await {
                if let Ok(json) = serde_json::to_string(&ev) {
                    info!("event: {json}");
                }
            }
        });
    }

    // Operator commands.
    {
        let controller = controller.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                match ControlCommand::parse(&line) {
                    Ok(cmd) => {
                        if let Some(out) = cmd.apply(&controller) {
                            info!("status:\n{out}");
                        }
                    }
                    Err(e) => warn!("{e}"),
                }
            }
        });
    }

    let sessions = {
        let controller = controller.clone();
        let url = cfg.url.clone();
        async move {
            loop {
                match run_session(&url, &controller).await {
                    Ok(()) => info!("session ended"),
                    Err(e) => warn!("session: {e}"),
                }
                // Small jitter so a restarted engine isn't hit by every client at once.
                let jitter = Duration::from_millis(fastrand::u64(0..500));
                tokio::time::sleep(RECONNECT_DELAY + jitter).await;
            }
        }
    };

    tokio::select! {
        _ = sessions => {},
        _ = tokio::signal::ctrl_c() => warn!("Shutdown signal received."),
    }

    controller.clear_configuration();
    render.stop();
    info!("rendered {} blocks", render.blocks_rendered());
    Ok(())
}
