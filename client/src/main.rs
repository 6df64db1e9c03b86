use anyhow::{anyhow, Context, Result};
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use burrow_shared::config::Config;
use burrow_shared::protocol::{Frame, FrameType};
use burrow_shared::Error;

mod proxy;
mod sse;
mod tcp;
mod tunnel;
mod ws;

use proxy::LocalProxy;
use tunnel::TunnelHandle;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "burrow-client")]
#[command(about = "Private-side client for the burrow reverse tunnel", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the client configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .or_else(|| std::env::var_os("BURROW_CLIENT_CONFIG").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("./configs/client.yaml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("loading configuration from {}", config_path.display()))?;
    config
        .validate_client()
        .context("invalid client configuration")?;

    init_tracing(&config);
    info!(
        "{} v{} starting ({})",
        config.app.name, config.app.version, config.app.env
    );
    info!("server: {}", config.tunnel_client.server_url);
    info!("local target: {}", config.tunnel_client.target_url);
    if let Some(tcp_target) = &config.tunnel_client.tcp_target {
        info!("local tcp target: {}", tcp_target);
    }

    let proxy = Arc::new(LocalProxy::new(
        config.tunnel_client.target_url.clone(),
        config.tunnel_client.tcp_target.clone(),
    )?);

    loop {
        tokio::select! {
            result = run_tunnel(&config, proxy.clone()) => match result {
                Ok(()) => {
                    info!("tunnel closed");
                    break;
                }
                Err(e) => {
                    error!("tunnel error: {:#}. Reconnecting in {:?}", e, RECONNECT_DELAY);
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }

    Ok(())
}

/// Dial the control endpoint, register, then service frames until the
/// connection drops.
async fn run_tunnel(config: &Config, proxy: Arc<LocalProxy>) -> Result<()> {
    let server_url = &config.tunnel_client.server_url;

    let (socket, _) = tokio::time::timeout(DIAL_TIMEOUT, connect_async(server_url))
        .await
        .map_err(|_| Error::Timeout("control channel dial"))
        .with_context(|| format!("dialing {server_url}"))?
        .context("connecting to tunnel server")?;
    let (mut sink, mut stream) = socket.split();
    info!("connected to tunnel server");

    // register, then adopt whichever id the server acks
    let proposed = config.tunnel_client.tunnel_id.clone();
    let register = Frame::register(proposed.as_deref());
    sink.send(Message::Text(register.encode()?.into())).await?;

    let tunnel_id = wait_for_ack(&mut stream)
        .await?
        .or(proposed)
        .ok_or_else(|| anyhow!("server did not assign a tunnel id"))?;
    info!("tunnel registered: {}", tunnel_id);

    let (handle, mut outbox) = TunnelHandle::new(tunnel_id.clone());
    let mut heartbeat = tokio::time::interval_at(
        tokio::time::Instant::now() + HEARTBEAT_INTERVAL,
        HEARTBEAT_INTERVAL,
    );

    loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => match Frame::decode(&text) {
                    Ok(frame) => handle_frame(frame, &handle, &proxy, &mut sink).await?,
                    Err(e) => warn!("dropping malformed frame: {}", e),
                },
                Some(Ok(Message::Ping(data))) => {
                    sink.send(Message::Pong(data)).await?;
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!("control connection closed by server");
                    return Ok(());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e).context("control connection failed"),
            },
            frame = outbox.recv() => match frame {
                // adapters queue their frames here; this loop is the only writer
                Some(frame) => {
                    sink.send(Message::Text(frame.encode()?.into())).await
                        .context("writing to control connection")?;
                }
                None => return Ok(()),
            },
            _ = heartbeat.tick() => {
                // client-originated keepalive; the server probes with ping
                sink.send(Message::Text(Frame::pong(&tunnel_id).encode()?.into())).await
                    .context("sending keepalive")?;
            }
        }
    }
}

type ControlStream = futures_util::stream::SplitStream<
    tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
>;
type ControlSink = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    Message,
>;

/// Read the registration ack and return the assigned tunnel id
async fn wait_for_ack(stream: &mut ControlStream) -> Result<Option<String>> {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                let frame = Frame::decode(&text).context("parsing registration ack")?;
                if frame.frame_type == FrameType::Error {
                    return Err(anyhow!(
                        "registration failed: {}",
                        frame.error.unwrap_or_default()
                    ));
                }
                return Ok(frame.tunnel_id);
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err(anyhow!("connection closed during registration"))
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e).context("reading registration ack"),
        }
    }
}

/// Route one inbound frame. Request, tcp_init, and websocket frames are
/// serviced on their own tasks; tcp_data must stay on this loop so local
/// writes keep frame order.
async fn handle_frame(
    frame: Frame,
    handle: &Arc<TunnelHandle>,
    proxy: &Arc<LocalProxy>,
    sink: &mut ControlSink,
) -> Result<()> {
    match frame.frame_type {
        FrameType::Ping => {
            let pong = Frame::pong(&handle.tunnel_id);
            sink.send(Message::Text(pong.encode()?.into())).await?;
        }
        FrameType::Request => {
            let proxy = proxy.clone();
            let handle = handle.clone();
            tokio::spawn(async move {
                proxy.handle_request(handle, frame).await;
            });
        }
        FrameType::TcpInit => {
            let handle = handle.clone();
            let tcp_target = proxy.tcp_target.clone();
            tokio::spawn(async move {
                tcp::handle_init(handle, tcp_target, frame).await;
            });
        }
        FrameType::TcpData => {
            tcp::handle_data(handle, &frame).await;
        }
        FrameType::TcpClose => {
            tcp::handle_close(handle, &frame);
        }
        FrameType::Websocket => {
            let handle = handle.clone();
            let target_url = proxy.target_url.clone();
            tokio::spawn(async move {
                ws::handle_upgrade(handle, target_url, frame).await;
            });
        }
        FrameType::WebsocketData | FrameType::Error => {
            handle.dispatch(frame).await;
        }
        FrameType::Unknown => {
            warn!("unhandled frame type, dropping");
        }
        _ => {
            debug!("ignoring unexpected {:?} frame", frame.frame_type);
        }
    }
    Ok(())
}

fn init_tracing(config: &Config) {
    let default_level = if config.app.is_production() { "info" } else { "debug" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
