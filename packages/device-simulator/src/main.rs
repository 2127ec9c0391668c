//! main.rs: Sentry wearable + gateway simulator entry point
//!
//! Stands in for the radio gateway the hub talks to over UDP, with one
//! Sentry wearable in range. Runs four concurrent loops:
//!   1. Gateway loop: answers bridge commands from the hub
//!   2. Telemetry loop: rider physics, motion every 2 s and GPS every 5 s,
//!      fragmented to the negotiated MTU once the hub subscribes
//!   3. Advertiser: announces the wearable while the hub scans
//!   4. WebSocket server: control panel (pause, scenarios, adapter power,
//!      forced link loss) plus a live copy of every document sent

mod gateway;
mod rider;
mod scenarios;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Router,
};
use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Deserialize;
use tokio::sync::{broadcast, RwLock};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

use sentry_types::bridge::{AdapterState, BridgeFrame, BridgeOp};
use sentry_types::Channel;

use gateway::{DeviceProfile, GatewayLink, VirtualWearable};
use rider::{RiderConfig, RiderSim};
use scenarios::{ScenarioConfig, ScenarioType};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "sentry-sim", about = "Sentry wearable + radio gateway simulator")]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,
    /// UDP port the gateway listens on for hub commands
    #[arg(long, default_value = "5561")]
    listen_port: u16,
    /// Hub bridge address for unsolicited frames until the hub speaks first
    #[arg(long, default_value = "127.0.0.1:5560")]
    hub_addr: String,
    /// Control panel WebSocket port
    #[arg(long, default_value = "9091")]
    ctrl_port: u16,
    /// Load a scenario preset on startup (crash, rough_road, flaky_link)
    #[arg(long)]
    preset: Option<String>,
    /// Crash after the configured delay
    #[arg(long)]
    crash: bool,
    #[arg(long)]
    rough_road: bool,
    #[arg(long)]
    fragment_loss: bool,
    #[arg(long)]
    link_drop: bool,
    #[arg(long)]
    no_gps_fix: bool,
}

// ── Config ────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct FullConfig {
    device: DeviceProfile,
    telemetry: TelemetryConfig,
    #[serde(default)]
    rider: RiderConfig,
    #[serde(default)]
    scenarios: ScenarioConfig,
}

#[derive(Debug, Deserialize)]
struct TelemetryConfig {
    motion_interval_s: f64,
    gps_interval_s: f64,
    advertise_interval_ms: u64,
}

// ── Shared state ──────────────────────────────────────────────────────────────

struct SimState {
    wearable: VirtualWearable,
    rider: RiderSim,
    scenario: ScenarioConfig,
    paused: bool,
    rng: StdRng,
    last_link_drop: Instant,
}

type SharedState = Arc<RwLock<SimState>>;

#[derive(Clone)]
struct CtrlState {
    state: SharedState,
    link: Arc<GatewayLink>,
    telem_tx: broadcast::Sender<String>,
}

// ── Main ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "device_simulator=info".into()),
        )
        .init();

    let args = Args::parse();

    let config_str = std::fs::read_to_string(&args.config)
        .unwrap_or_else(|_| include_str!("../config.toml").to_string());
    let cfg: FullConfig = toml::from_str(&config_str).context("invalid config.toml")?;

    let scenario = scenario_from_args(&args, cfg.scenarios.clone())?;
    info!(
        "🏍  Sentry simulator starting: {} ({}) scenarios={:?}",
        cfg.device.name, cfg.device.id, scenario.active
    );

    let hub_addr: SocketAddr = args
        .hub_addr
        .parse()
        .with_context(|| format!("hub address {}", args.hub_addr))?;
    let link = Arc::new(
        GatewayLink::bind(args.listen_port, hub_addr)
            .await
            .with_context(|| format!("binding gateway port {}", args.listen_port))?,
    );
    match link.local_addr() {
        Ok(addr) => info!("📡 Gateway listening on udp://{addr}, hub at {hub_addr}"),
        Err(e) => warn!("gateway socket has no local address: {e}"),
    }

    let shared: SharedState = Arc::new(RwLock::new(SimState {
        wearable: VirtualWearable::new(cfg.device.clone()),
        rider: RiderSim::new(cfg.rider.clone()),
        scenario,
        paused: false,
        rng: StdRng::from_entropy(),
        last_link_drop: Instant::now(),
    }));

    let (telem_tx, _) = broadcast::channel::<String>(64);

    tokio::spawn(gateway_loop(shared.clone(), link.clone(), telem_tx.clone()));
    tokio::spawn(advertise_loop(
        shared.clone(),
        link.clone(),
        Duration::from_millis(cfg.telemetry.advertise_interval_ms.max(50)),
    ));
    tokio::spawn(telemetry_loop(
        shared.clone(),
        link.clone(),
        telem_tx.clone(),
        secs(cfg.telemetry.motion_interval_s),
        secs(cfg.telemetry.gps_interval_s),
    ));

    let ctrl_addr = format!("0.0.0.0:{}", args.ctrl_port);
    info!("🖥  Control panel WebSocket at ws://{ctrl_addr}/ws");

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(|| async { "sentry-sim ok" }))
        .with_state(CtrlState { state: shared, link, telem_tx })
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any));

    let listener = tokio::net::TcpListener::bind(&ctrl_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn scenario_from_args(args: &Args, mut scenario: ScenarioConfig) -> anyhow::Result<ScenarioConfig> {
    if let Some(name) = &args.preset {
        scenario = scenarios::preset(name).with_context(|| format!("unknown preset {name}"))?;
    }
    let flags = [
        (args.crash, ScenarioType::Crash),
        (args.rough_road, ScenarioType::RoughRoad),
        (args.fragment_loss, ScenarioType::FragmentLoss),
        (args.link_drop, ScenarioType::LinkDrop),
        (args.no_gps_fix, ScenarioType::NoGpsFix),
    ];
    for (on, s) in flags {
        if on {
            scenario.enable(s);
        }
    }
    Ok(scenario)
}

fn secs(s: f64) -> Duration {
    Duration::from_secs_f64(s.max(0.05))
}

// ── Gateway loop ──────────────────────────────────────────────────────────────

async fn gateway_loop(state: SharedState, link: Arc<GatewayLink>, telem: broadcast::Sender<String>) {
    let mut buf = vec![0u8; 4096];
    loop {
        let cmd = match link.recv_command(&mut buf).await {
            Ok(Some(cmd)) => cmd,
            Ok(None) => continue,
            Err(e) => {
                warn!("UDP: receive failed: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        debug!("⇐ {:?} #{}", cmd.op, cmd.request_id);

        let (reply, advert) = {
            let mut s = state.write().await;
            let reply = s.wearable.handle(&cmd);
            let advert = (cmd.op == BridgeOp::StartScan && reply.ok && !s.wearable.is_connected())
                .then(|| s.wearable.advertisement());
            (reply, advert)
        };

        if !reply.ok {
            debug!("bridge {:?} refused: {:?}", cmd.op, reply.error);
        }
        if cmd.op == BridgeOp::Connect && reply.ok {
            let _ = telem.send(serde_json::json!({"type": "link", "data": "connected"}).to_string());
        }
        link.send(&BridgeFrame::Reply(reply)).await;
        if let Some(advert) = advert {
            link.send(&advert).await;
        }
    }
}

// ── Advertiser ────────────────────────────────────────────────────────────────

async fn advertise_loop(state: SharedState, link: Arc<GatewayLink>, every: Duration) {
    let mut ticker = interval(every);
    loop {
        ticker.tick().await;
        let advert = {
            let s = state.read().await;
            let w = &s.wearable;
            (w.is_scanning() && !w.is_connected() && w.adapter == AdapterState::PoweredOn)
                .then(|| w.advertisement())
        };
        if let Some(advert) = advert {
            link.send(&advert).await;
        }
    }
}

// ── Rider + telemetry loop ────────────────────────────────────────────────────

async fn telemetry_loop(
    state: SharedState,
    link: Arc<GatewayLink>,
    telem: broadcast::Sender<String>,
    motion_every: Duration,
    gps_every: Duration,
) {
    let mut motion_ticker = interval(motion_every);
    let mut gps_ticker = interval(gps_every);
    motion_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    gps_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut link_ticker = interval(Duration::from_secs(1));
    let dt = motion_every.as_secs_f64();

    info!("⏱ Telemetry: motion every {:?}, GPS every {:?}", motion_every, gps_every);

    loop {
        let frames = tokio::select! {
            _ = motion_ticker.tick() => {
                let mut guard = state.write().await;
                let s = &mut *guard;
                if s.paused { continue; }
                s.rider.tick(dt, &s.scenario);
                let sample = s.rider.sample_motion(&s.scenario, &mut s.rng);
                let doc = s.rider.motion_document(&sample);
                let _ = telem.send(serde_json::json!({"type": "motion", "data": doc}).to_string());
                if sample.tilt_detected {
                    info!("💥 Rider down: roll={:.0}° az={:.1}", sample.roll, sample.az);
                }
                emit(s, Channel::Motion, &doc)
            }
            _ = gps_ticker.tick() => {
                let mut guard = state.write().await;
                let s = &mut *guard;
                if s.paused { continue; }
                let doc = s.rider.gps_document(&s.scenario, &mut s.rng);
                let _ = telem.send(serde_json::json!({"type": "gps", "data": doc}).to_string());
                emit(s, Channel::Gps, &doc)
            }
            _ = link_ticker.tick() => {
                let mut s = state.write().await;
                let due = s
                    .scenario
                    .link_drop_period()
                    .is_some_and(|period| s.last_link_drop.elapsed() >= period);
                if !due { continue; }
                s.last_link_drop = Instant::now();
                match s.wearable.link_lost("supervision timeout") {
                    Some(frame) => {
                        info!("📴 Scenario link drop");
                        let _ = telem.send(serde_json::json!({"type": "link", "data": "dropped"}).to_string());
                        vec![frame]
                    }
                    None => continue,
                }
            }
        };

        for frame in &frames {
            link.send(frame).await;
        }
    }
}

/// Publish one document and apply in-air fragment loss.
fn emit(s: &mut SimState, channel: Channel, doc: &serde_json::Value) -> Vec<BridgeFrame> {
    let bytes = match serde_json::to_vec(doc) {
        Ok(b) => b,
        Err(e) => {
            warn!("{channel} document did not serialize: {e}");
            return Vec::new();
        }
    };
    let frames = s.wearable.publish(channel, bytes);
    let total = frames.len();
    let kept: Vec<_> = frames
        .into_iter()
        .filter(|_| !s.scenario.drop_fragment(&mut s.rng))
        .collect();
    if kept.len() < total {
        debug!("{channel}: lost {} of {total} fragments", total - kept.len());
    }
    kept
}

// ── WebSocket control handler ─────────────────────────────────────────────────

async fn ws_handler(ws: WebSocketUpgrade, State(ctrl): State<CtrlState>) -> Response {
    ws.on_upgrade(move |socket| handle_ws(socket, ctrl))
}

async fn handle_ws(mut socket: WebSocket, ctrl: CtrlState) {
    let mut telem_rx = ctrl.telem_tx.subscribe();

    let scenario_json = {
        let s = ctrl.state.read().await;
        serde_json::to_value(&s.scenario).unwrap_or_default()
    };
    let _ = socket
        .send(Message::Text(serde_json::json!({"type": "scenario", "data": scenario_json}).to_string()))
        .await;

    loop {
        tokio::select! {
            Ok(msg) = telem_rx.recv() => {
                if socket.send(Message::Text(msg)).await.is_err() { break; }
            }
            Some(Ok(Message::Text(cmd))) = socket.recv() => {
                handle_command(&ctrl, &cmd).await;
            }
            else => break,
        }
    }
}

/// Handle commands from the control panel.
/// Commands are JSON: { "cmd": "...", "args": {...} }
async fn handle_command(ctrl: &CtrlState, raw: &str) {
    let v: serde_json::Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(_) => return,
    };
    let cmd = v["cmd"].as_str().unwrap_or("");
    match cmd {
        "pause" => {
            ctrl.state.write().await.paused = true;
            info!("⏸ Sim paused");
        }
        "resume" => {
            ctrl.state.write().await.paused = false;
            info!("▶ Sim resumed");
        }
        "reset" => {
            ctrl.state.write().await.rider.reset();
            info!("↺ Rider reset");
        }
        "crash_now" => {
            let mut s = ctrl.state.write().await;
            let now = s.rider.elapsed_s;
            s.scenario.crash_after_s = now;
            s.scenario.enable(ScenarioType::Crash);
            info!("💥 Crash armed");
        }
        "set_scenario" => match serde_json::from_value::<ScenarioConfig>(v["args"].clone()) {
            Ok(sc) => {
                ctrl.state.write().await.scenario = sc;
                info!("🎭 Scenario updated");
            }
            Err(e) => warn!("Bad scenario: {e}"),
        },
        "preset" => {
            let name = v["args"]["name"].as_str().unwrap_or("");
            match scenarios::preset(name) {
                Some(sc) => {
                    ctrl.state.write().await.scenario = sc;
                    info!("🎭 Preset '{name}' loaded");
                }
                None => warn!("Unknown preset: {name}"),
            }
        }
        "set_adapter" => {
            match serde_json::from_value::<AdapterState>(v["args"]["state"].clone()) {
                Ok(adapter) => {
                    let frame = {
                        let mut s = ctrl.state.write().await;
                        s.wearable.adapter = adapter;
                        if adapter == AdapterState::PoweredOn {
                            None
                        } else {
                            s.wearable.link_lost("adapter powered off")
                        }
                    };
                    if let Some(frame) = frame {
                        ctrl.link.send(&frame).await;
                    }
                    info!("🔌 Adapter {adapter:?}");
                }
                Err(e) => warn!("Bad adapter state: {e}"),
            }
        }
        "drop_link" => {
            let frame = ctrl.state.write().await.wearable.link_lost("connection timeout");
            match frame {
                Some(frame) => {
                    ctrl.link.send(&frame).await;
                    info!("📴 Link dropped from control panel");
                }
                None => warn!("drop_link: nothing connected"),
            }
        }
        _ => warn!("Unknown control command: {cmd}"),
    }
}
