//! Recorder process supervision.
//!
//! A recording is an external process (ffmpeg or gst-launch) fed over the
//! session's plain transports. This module owns the process lifecycle:
//! the generated receiver SDP, the spawn command vector, readiness
//! detection by scanning the child's output, SIGINT-based stop, and exit
//! classification. The `external` recorder is the escape hatch for a
//! hand-started receiver; it only gets a countdown so the operator can
//! launch it in time.

use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::config::Config;
use weir_common::{Error, LogSink, Result};
use weir_core::media::MediaKind;
use weir_core::rtp::RtpCodecCapability;
use weir_core::sdp::{build_sdp, MediaSection};

/// How long the operator gets to start a hand-launched receiver.
const EXTERNAL_COUNTDOWN_SECS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecorderKind {
    Ffmpeg,
    Gstreamer,
    External,
}

impl std::fmt::Display for RecorderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecorderKind::Ffmpeg => write!(f, "ffmpeg"),
            RecorderKind::Gstreamer => write!(f, "gstreamer"),
            RecorderKind::External => write!(f, "external"),
        }
    }
}

/// How the recorder process ended.
#[derive(Debug, Clone)]
pub enum RecorderExit {
    /// Clean exit or stopped by our SIGINT; the output file is complete.
    Stopped,
    /// Killed some other way or nonzero exit; the output may be corrupt.
    Corrupt(String),
}

pub struct RecorderHandle {
    kind: RecorderKind,
    pid: Option<Pid>,
    ready_rx: mpsc::Receiver<()>,
    /// `None` for the external recorder, which we never supervise.
    exit_rx: Option<oneshot::Receiver<RecorderExit>>,
    pub output_path: Option<PathBuf>,
}

impl RecorderHandle {
    pub fn kind(&self) -> RecorderKind {
        self.kind
    }

    /// Block until the recorder announced readiness on its output (or the
    /// external countdown expired), bounded by `timeout`.
    pub async fn wait_ready(&mut self, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, self.ready_rx.recv())
            .await
            .map_err(|_| Error::timeout(format!("{} readiness", self.kind)))?
            .ok_or_else(|| Error::process(format!("{} exited before becoming ready", self.kind)))
    }

    /// Take the exit notification channel; the caller supervises from
    /// here on.
    pub fn take_exit(&mut self) -> Option<oneshot::Receiver<RecorderExit>> {
        self.exit_rx.take()
    }

    pub fn is_supervised(&self) -> bool {
        self.pid.is_some()
    }

    /// Ask the process to finalize its output and exit.
    pub fn request_stop(&self) -> Result<()> {
        match self.pid {
            Some(pid) => {
                kill(pid, Signal::SIGINT)
                    .map_err(|e| Error::process(format!("SIGINT to {} failed: {e}", self.kind)))
            }
            None => Ok(()),
        }
    }
}

/// Start a recorder for the media kinds the session actually has.
pub async fn spawn(
    kind: RecorderKind,
    config: &Config,
    log: &LogSink,
    audio: Option<&RtpCodecCapability>,
    video: Option<&RtpCodecCapability>,
) -> Result<RecorderHandle> {
    if audio.is_none() && video.is_none() {
        return Err(Error::ordering("nothing to record: no producers exist"));
    }

    tokio::fs::create_dir_all(&config.recording_dir).await?;
    let video_name = video.map(|c| c.encoding_name().to_ascii_lowercase());
    let sdp_path = config.recording_dir.join(format!(
        "input-{}.sdp",
        video_name.as_deref().unwrap_or("audio")
    ));
    let sdp = receiver_sdp(config, audio, video);
    tokio::fs::write(&sdp_path, &sdp).await?;
    debug!(path = %sdp_path.display(), "receiver SDP written");

    match kind {
        RecorderKind::Ffmpeg => {
            check_ffmpeg().await?;
            let h264 = video_name.as_deref() == Some("h264");
            let output_path = config.recording_dir.join(format!(
                "output-ffmpeg.{}",
                if h264 { "mp4" } else { "webm" }
            ));
            let args = ffmpeg_args(&sdp_path, &output_path, audio.is_some(), video.is_some(), h264);
            spawn_supervised(kind, "ffmpeg", &args, log, output_path).await
        }
        RecorderKind::Gstreamer => {
            let h264 = video_name.as_deref() == Some("h264");
            let output_path = config.recording_dir.join(format!(
                "output-gstreamer.{}",
                if h264 { "mp4" } else { "webm" }
            ));
            let args =
                gstreamer_args(&sdp_path, &output_path, audio.is_some(), video.is_some(), h264);
            spawn_supervised(kind, "gst-launch-1.0", &args, log, output_path).await
        }
        RecorderKind::External => Ok(spawn_external(config, log)),
    }
}

fn receiver_sdp(
    config: &Config,
    audio: Option<&RtpCodecCapability>,
    video: Option<&RtpCodecCapability>,
) -> String {
    let ports = &config.recorder_ports;
    let mut sections = Vec::new();
    if let Some(codec) = audio {
        sections.push(MediaSection {
            kind: MediaKind::Audio,
            port: ports.audio_port,
            rtcp_port: Some(ports.audio_rtcp_port),
            payload_type: codec.preferred_payload_type.unwrap_or(111),
            encoding_name: codec.encoding_name().to_string(),
            clock_rate: codec.clock_rate,
            channels: codec.channels,
            rtcp_feedback: Vec::new(),
            direction: None,
            abs_send_time_id: 0,
            srtp: None,
            ssrc_cname: None,
        });
    }
    if let Some(codec) = video {
        sections.push(MediaSection {
            kind: MediaKind::Video,
            port: ports.video_port,
            rtcp_port: Some(ports.video_rtcp_port),
            payload_type: codec.preferred_payload_type.unwrap_or(96),
            encoding_name: codec.encoding_name().to_string(),
            clock_rate: codec.clock_rate,
            channels: None,
            rtcp_feedback: Vec::new(),
            direction: None,
            abs_send_time_id: 0,
            srtp: None,
            ssrc_cname: None,
        });
    }
    build_sdp(config.media_ip, &sections)
}

fn ffmpeg_args(
    sdp_path: &std::path::Path,
    output_path: &std::path::Path,
    audio: bool,
    video: bool,
    h264: bool,
) -> Vec<String> {
    let mut args: Vec<String> = [
        "-nostdin",
        "-protocol_whitelist",
        "file,rtp,udp",
        "-analyzeduration",
        "5M",
        "-probesize",
        "5M",
        "-fflags",
        "+genpts",
        "-i",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    args.push(sdp_path.display().to_string());
    if audio {
        args.extend(["-map", "0:a:0", "-c:a", "copy"].map(String::from));
    }
    if video {
        args.extend(["-map", "0:v:0", "-c:v", "copy"].map(String::from));
    }
    if h264 {
        args.extend(["-strict", "experimental", "-f", "mp4"].map(String::from));
    } else {
        args.extend(["-f", "webm", "-flags", "+global_header"].map(String::from));
    }
    args.push("-y".into());
    args.push(output_path.display().to_string());
    args
}

fn gstreamer_args(
    sdp_path: &std::path::Path,
    output_path: &std::path::Path,
    audio: bool,
    video: bool,
    h264: bool,
) -> Vec<String> {
    let mut args: Vec<String> = vec!["--eos-on-shutdown".into()];
    args.push(format!("filesrc location={}", sdp_path.display()));
    args.push("!".into());
    args.push("sdpdemux timeout=0 name=demux".into());
    if h264 {
        args.push("mp4mux faststart=true name=mux".into());
    } else {
        args.push("webmmux name=mux".into());
    }
    args.push("!".into());
    args.push(format!("filesink location={}", output_path.display()));
    if audio {
        args.extend(
            ["demux.", "!", "queue", "!", "rtpopusdepay", "!", "opusparse", "!", "mux.audio_0"]
                .map(String::from),
        );
    }
    if video {
        if h264 {
            args.extend(
                ["demux.", "!", "queue", "!", "rtph264depay", "!", "h264parse", "!", "mux.video_0"]
                    .map(String::from),
            );
        } else {
            args.extend(
                ["demux.", "!", "queue", "!", "rtpvp8depay", "!", "mux.video_0"].map(String::from),
            );
        }
    }
    args
}

async fn spawn_supervised(
    kind: RecorderKind,
    program: &str,
    args: &[String],
    log: &LogSink,
    output_path: PathBuf,
) -> Result<RecorderHandle> {
    log.info(format!("starting {kind}: {program} {}", args.join(" ")));

    let mut child = Command::new(program)
        .args(args)
        .env("GST_DEBUG", "3")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::process(format!("failed to spawn {program}: {e}")))?;

    let pid = child
        .id()
        .map(|id| Pid::from_raw(id as i32))
        .ok_or_else(|| Error::process(format!("{program} exited before start completed")))?;

    let (ready_tx, ready_rx) = mpsc::channel(1);
    // ffmpeg reports on stderr, gst-launch on stdout.
    let (stdout_marker, stderr_marker) = match kind {
        RecorderKind::Ffmpeg => (None, Some("ffmpeg version")),
        RecorderKind::Gstreamer => (Some("Setting pipeline to PLAYING"), None),
        RecorderKind::External => (None, None),
    };
    if let Some(stdout) = child.stdout.take() {
        scan_output(kind, "stdout", stdout, stdout_marker, ready_tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        scan_output(kind, "stderr", stderr, stderr_marker, ready_tx);
    }

    let (exit_tx, exit_rx) = oneshot::channel();
    tokio::spawn(async move {
        let outcome = match child.wait().await {
            Ok(status) if status.success() => RecorderExit::Stopped,
            Ok(status) if status.signal() == Some(Signal::SIGINT as i32) => RecorderExit::Stopped,
            Ok(status) => RecorderExit::Corrupt(format!("recorder exited with {status}")),
            Err(e) => RecorderExit::Corrupt(format!("recorder wait failed: {e}")),
        };
        let _ = exit_tx.send(outcome);
    });

    Ok(RecorderHandle {
        kind,
        pid: Some(pid),
        ready_rx,
        exit_rx: Some(exit_rx),
        output_path: Some(output_path),
    })
}

/// Forward one output stream line by line to the debug log, firing the
/// readiness channel on the first line that starts with `marker`.
fn scan_output(
    kind: RecorderKind,
    stream: &'static str,
    source: impl AsyncRead + Unpin + Send + 'static,
    marker: Option<&'static str>,
    ready_tx: mpsc::Sender<()>,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(source).lines();
        let mut ready = false;
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(recorder = %kind, stream, "{line}");
            if !ready && marker.is_some_and(|m| line.starts_with(m)) {
                ready = true;
                let _ = ready_tx.try_send(());
            }
        }
    });
}

/// The hand-started receiver: log where to point it and count down.
fn spawn_external(config: &Config, log: &LogSink) -> RecorderHandle {
    let ports = config.recorder_ports;
    let ip = config.media_ip;
    log.info(format!(
        "external recorder: receive audio at {ip}:{}/{} and video at {ip}:{}/{}",
        ports.audio_port, ports.audio_rtcp_port, ports.video_port, ports.video_rtcp_port
    ));

    let (ready_tx, ready_rx) = mpsc::channel(1);
    let countdown_log = log.clone();
    tokio::spawn(async move {
        for remaining in (1..=EXTERNAL_COUNTDOWN_SECS).rev() {
            countdown_log.info(format!("external recorder starts in {remaining}..."));
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        let _ = ready_tx.send(()).await;
    });

    RecorderHandle {
        kind: RecorderKind::External,
        pid: None,
        ready_rx,
        exit_rx: None,
        output_path: None,
    }
}

/// Recording depends on ffmpeg behavior that stabilized in the 4.x line;
/// git builds are assumed current.
async fn check_ffmpeg() -> Result<()> {
    let output = Command::new("ffmpeg")
        .arg("-version")
        .output()
        .await
        .map_err(|e| Error::config(format!("ffmpeg not runnable: {e}")))?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    let first_line = stdout.lines().next().unwrap_or_default();
    parse_ffmpeg_version(first_line)
}

fn parse_ffmpeg_version(first_line: &str) -> Result<()> {
    let version = first_line
        .strip_prefix("ffmpeg version ")
        .ok_or_else(|| Error::config(format!("unrecognized ffmpeg version output: {first_line}")))?;
    if version.starts_with("git") {
        return Ok(());
    }
    let major: u32 = version
        .trim_start_matches(|c: char| !c.is_ascii_digit())
        .split(|c: char| !c.is_ascii_digit())
        .next()
        .and_then(|m| m.parse().ok())
        .ok_or_else(|| Error::config(format!("cannot parse ffmpeg version: {version}")))?;
    if major >= 4 {
        Ok(())
    } else {
        Err(Error::config(format!(
            "ffmpeg {version} is too old, need a git build or major version >= 4"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn vp8() -> RtpCodecCapability {
        Config::default()
            .codec_catalog()
            .into_iter()
            .find(|c| c.mime_type == "video/VP8")
            .unwrap()
    }

    fn opus() -> RtpCodecCapability {
        Config::default()
            .codec_catalog()
            .into_iter()
            .find(|c| c.mime_type == "audio/opus")
            .unwrap()
    }

    #[test]
    fn ffmpeg_version_gate() {
        assert!(parse_ffmpeg_version("ffmpeg version 4.4.2-0ubuntu0.22.04.1").is_ok());
        assert!(parse_ffmpeg_version("ffmpeg version 6.1").is_ok());
        assert!(parse_ffmpeg_version("ffmpeg version git-2024-01-15-abcdef").is_ok());
        assert!(parse_ffmpeg_version("ffmpeg version n3.4.8").is_err());
        assert!(parse_ffmpeg_version("ffmpeg version 3.4.8").is_err());
        assert!(parse_ffmpeg_version("bash: ffmpeg: command not found").is_err());
    }

    #[test]
    fn receiver_sdp_lists_both_kinds_on_their_ports() {
        let config = Config::default();
        let audio = opus();
        let video = vp8();
        let sdp = receiver_sdp(&config, Some(&audio), Some(&video));
        assert!(sdp.contains("c=IN IP4 127.0.0.1"));
        assert!(sdp.contains("m=audio 5004 RTP/AVPF 111"));
        assert!(sdp.contains("a=rtcp:5005"));
        assert!(sdp.contains("a=rtpmap:111 opus/48000/2"));
        assert!(sdp.contains("m=video 5006 RTP/AVPF 96"));
        assert!(sdp.contains("a=rtcp:5007"));
        assert!(sdp.contains("a=rtpmap:96 VP8/90000"));
    }

    #[test]
    fn ffmpeg_vector_switches_container_by_codec() {
        let sdp = std::path::Path::new("/tmp/input-vp8.sdp");
        let out = std::path::Path::new("/tmp/out.webm");
        let args = ffmpeg_args(sdp, out, true, true, false);
        assert!(args.windows(2).any(|w| w == ["-c:v", "copy"]));
        assert!(args.windows(2).any(|w| w == ["-f", "webm"]));
        assert!(!args.contains(&"experimental".to_string()));

        let args = ffmpeg_args(sdp, out, false, true, true);
        assert!(args.windows(2).any(|w| w == ["-strict", "experimental"]));
        assert!(args.windows(2).any(|w| w == ["-f", "mp4"]));
        // Audio absent: no audio mapping.
        assert!(!args.contains(&"0:a:0".to_string()));
    }

    #[test]
    fn gstreamer_vector_is_audio_video_aware() {
        let sdp = std::path::Path::new("/tmp/input-vp8.sdp");
        let out = std::path::Path::new("/tmp/out.webm");
        let args = gstreamer_args(sdp, out, true, true, false);
        assert_eq!(args[0], "--eos-on-shutdown");
        assert!(args.contains(&"rtpopusdepay".to_string()));
        assert!(args.contains(&"rtpvp8depay".to_string()));

        let args = gstreamer_args(sdp, out, false, true, false);
        assert!(!args.contains(&"rtpopusdepay".to_string()));
    }

    #[test]
    fn gstreamer_vector_switches_depay_and_mux_for_h264() {
        let sdp = std::path::Path::new("/tmp/input-h264.sdp");
        let out = std::path::Path::new("/tmp/out.mp4");
        let args = gstreamer_args(sdp, out, true, true, true);
        assert!(args.contains(&"mp4mux faststart=true name=mux".to_string()));
        assert!(args.contains(&"rtph264depay".to_string()));
        assert!(args.contains(&"h264parse".to_string()));
        assert!(!args.contains(&"rtpvp8depay".to_string()));
        assert!(!args.contains(&"webmmux name=mux".to_string()));
    }
}
