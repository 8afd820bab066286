// LinkMesh Linux: one mesh node over a UDP multicast radio emulation.

mod config;
mod radio;

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::Context;
use linkmesh_core::ap::{ApController, ApRole};
use linkmesh_core::{
    mesh_name_filter, Callbacks, MeshCore, MeshEvent, MessageContext, Millis, Radio, Recipients,
    TransmissionOptions,
};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::{fmt, EnvFilter};

use radio::{Neighbours, UdpRadio};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const RX_CHANNEL_DEPTH: usize = 64;

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("linkmesh-linux {}", VERSION);
            return Ok(());
        }
    }

    let cfg = config::load();
    init_logging(cfg.log_filter.as_deref());

    // The engine is single-threaded; it runs on the block_on task itself.
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg))
}

/// RUST_LOG wins over the config file's `log_filter`; default is `info`.
fn init_logging(configured: Option<&str>) {
    let builder = EnvFilter::builder().with_default_directive(Level::INFO.into());
    let filter = match (std::env::var_os("RUST_LOG"), configured) {
        (None, Some(directives)) => builder.parse_lossy(directives),
        _ => builder.from_env_lossy(),
    };
    fmt().with_env_filter(filter).init();
}

async fn run(cfg: config::Config) -> anyhow::Result<()> {
    let station = cfg.station_mac().context("invalid station_mac")?;
    let socket = radio::make_multicast_socket(cfg.multicast_group, cfg.port)
        .with_context(|| format!("joining {}:{}", cfg.multicast_group, cfg.port))?;
    let recv_socket = tokio::net::UdpSocket::from_std(socket.try_clone()?)?;
    let neighbours = Neighbours::default();

    let (frame_tx, mut frame_rx) = mpsc::channel(RX_CHANNEL_DEPTH);
    let neighbours_recv = neighbours.clone();
    tokio::spawn(async move {
        if let Err(e) = radio::recv_loop(recv_socket, station, neighbours_recv, frame_tx).await {
            warn!(error = %e, "receive loop stopped");
        }
    });

    let udp = UdpRadio::new(
        socket,
        radio::group_addr(cfg.multicast_group, cfg.port),
        station,
        neighbours,
    );
    let callbacks = Callbacks::new(
        |request: &str, ctx: &MessageContext| {
            info!(peer = %ctx.sender, encrypted = ctx.encrypted, %request, "request");
            format!("echo: {request}")
        },
        |response: &str, ctx: &MessageContext| {
            info!(peer = %ctx.sender, encrypted = ctx.encrypted, %response, "response");
        },
        mesh_name_filter(cfg.mesh.mesh_name.clone()),
    );
    let core = Rc::new(RefCell::new(MeshCore::new(udp, cfg.mesh.clone(), callbacks)?));
    let role: Rc<RefCell<dyn ApRole>> = core.clone();
    let mut ap = ApController::new();
    ap.activate_ap(&role).context("starting access point")?;
    info!(
        %station,
        ap = %core.borrow().radio().ap_mac(),
        ssid = %cfg.mesh.ssid(),
        "linkmesh node up"
    );

    let start = Instant::now();
    // Wraps after ~49 days; the engine's timers are wrap-safe.
    let now = move || start.elapsed().as_millis() as Millis;
    let mut tick = tokio::time::interval(Duration::from_millis(cfg.tick_interval_ms.max(1)));
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut hello = tokio::time::interval(Duration::from_secs(cfg.hello_interval_secs.max(1)));
    hello.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            res = &mut shutdown => {
                if let Err(e) = res {
                    warn!(error = %e, "signal handler failed");
                }
                break;
            }
            Some((sender, bytes)) = frame_rx.recv() => {
                let mut c = core.borrow_mut();
                // Drain right away so the receive ring never fills.
                c.on_frame_received(sender, &bytes);
                log_events(c.perform_maintenance(now()));
            }
            _ = tick.tick() => {
                log_events(core.borrow_mut().perform_maintenance(now()));
            }
            _ = hello.tick() => {
                let mut c = core.borrow_mut();
                c.radio().send_beacon();
                let t = now();
                let greeting = format!("hello from {station}");
                if let Err(e) = c.attempt_transmission(
                    &greeting,
                    Recipients::Broadcast,
                    TransmissionOptions::default(),
                    t,
                ) {
                    warn!(error = %e, "hello not sent");
                }
                let options = TransmissionOptions {
                    scan: true,
                    encrypt: true,
                    ..TransmissionOptions::default()
                };
                if let Err(e) = c.attempt_transmission("ping", Recipients::ConnectionQueue, options, t) {
                    warn!(error = %e, "ping not sent");
                }
                debug!(
                    sessions = c.encrypted_connection_count(),
                    fail_rate = c.stats().transmission_fail_rate(),
                    "hello"
                );
            }
        }
    }

    ap.deactivate_ap(&role);
    info!("shutting down");
    Ok(())
}

fn log_events(events: Vec<MeshEvent>) {
    for event in events {
        match event {
            MeshEvent::ConnectionEstablished { peer, temporary } => {
                debug!(%peer, temporary, "event: connection established")
            }
            MeshEvent::HandshakeFailed { peer, reason } => {
                debug!(%peer, ?reason, "event: handshake failed")
            }
            MeshEvent::ConnectionRemoved { peer, reason } => {
                debug!(%peer, ?reason, "event: connection removed")
            }
            MeshEvent::TransmissionFinished { recipient, status } => {
                debug!(peer = %recipient, ?status, "event: transmission finished")
            }
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
