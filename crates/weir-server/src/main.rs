use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;

use weir_server::bridge::KurentoConnector;
use weir_server::config::{Config, RecorderPorts};
use weir_server::signal::AppState;

#[derive(Parser, Debug)]
#[command(name = "weir-server", about = "Media orchestration demo server")]
struct Args {
    /// HTTP/WebSocket listen address.
    #[arg(long, env = "WEIR_LISTEN_ADDR", default_value = "0.0.0.0:3000")]
    listen_addr: SocketAddr,

    /// Directory with the static demo page.
    #[arg(long, env = "WEIR_PUBLIC_DIR", default_value = "public")]
    public_dir: PathBuf,

    /// Address media sockets bind to and announce in bridge offers.
    #[arg(long, env = "WEIR_MEDIA_IP", default_value = "127.0.0.1")]
    media_ip: IpAddr,

    /// WebSocket URL of the peer pipeline engine.
    #[arg(long, env = "WEIR_PIPELINE_URL", default_value = "ws://127.0.0.1:8888/pipeline")]
    pipeline_url: String,

    /// Directory for recordings and generated SDP files.
    #[arg(long, env = "WEIR_RECORDING_DIR", default_value = "recording")]
    recording_dir: PathBuf,

    /// Destination RTP port for recorded audio (RTCP on port + 1).
    #[arg(long, default_value_t = 5004)]
    recorder_audio_port: u16,

    /// Destination RTP port for recorded video (RTCP on port + 1).
    #[arg(long, default_value_t = 5006)]
    recorder_video_port: u16,

    /// Offer H264 alongside VP8.
    #[arg(long, env = "WEIR_ENABLE_H264", default_value_t = false)]
    enable_h264: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    weir_common::init_tracing_with_default("weir_server=info,weir_core=info,tower_http=info");

    let args = Args::parse();
    let recorder_ports =
        RecorderPorts::from_rtp_ports(args.recorder_audio_port, args.recorder_video_port)
            .context("invalid recorder ports")?;
    let config = Config {
        listen_addr: args.listen_addr,
        public_dir: args.public_dir,
        media_ip: args.media_ip,
        pipeline_url: args.pipeline_url,
        recording_dir: args.recording_dir,
        recorder_ports,
        enable_h264: args.enable_h264,
    };
    config.validate().context("invalid configuration")?;

    let connector = Arc::new(KurentoConnector::new(config.pipeline_url.clone()));
    let public_dir = config.public_dir.clone();
    let listen_addr = config.listen_addr;
    let state = AppState::new(Arc::new(config), connector);
    let app = weir_server::app(state, &public_dir);

    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind {listen_addr}"))?;
    tracing::info!("listening on {listen_addr}");
    axum::serve(listener, app).await.context("server crashed")?;
    Ok(())
}
