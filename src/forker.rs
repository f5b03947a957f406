// src/forker.rs
//
// Plain-RTP forking: for a live producer, attach a side-car consumer on a
// plain transport, point the engine at a loopback UDP port, and feed that
// port's RTP into an external format-converter process (ffmpeg contract:
// SDP file in, PCM stream or container file out).
//
//   producer ──(plain transport)──> 127.0.0.1:<port> ──> converter child
//                                                            │ stdout
//                                                            ▼
//                                                       sink handler

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{CoreError, CoreResult};
use crate::ports::{PortArena, PortLease};
use crate::sfu::{
    payload_type_of, ssrc_of, PlainTransportOptions, SfuConsumer, SfuPlainTransport, SfuRouter,
};

const TERM_GRACE: Duration = Duration::from_secs(1);

// ─── SDP synthesis ──────────────────────────────────────────────────────────

/// Build the SDP the converter reads. CRLF line endings with a trailing
/// CRLF; the `a=ssrc` line is present only when the engine reported one.
pub fn synthesize_sdp(port: u16, payload_type: u8, ssrc: Option<u32>) -> String {
    let mut lines = vec![
        "v=0".to_string(),
        "o=- 0 0 IN IP4 127.0.0.1".to_string(),
        "s=Soundcast".to_string(),
        "c=IN IP4 127.0.0.1".to_string(),
        "t=0 0".to_string(),
        format!("m=audio {port} RTP/AVP {payload_type}"),
        format!("a=rtpmap:{payload_type} opus/48000/2"),
        format!("a=fmtp:{payload_type} sprop-stereo=1; stereo=1; useinbandfec=1"),
    ];
    if let Some(ssrc) = ssrc {
        lines.push(format!("a=ssrc:{ssrc} cname:recording"));
    }
    let mut sdp = lines.join("\r\n");
    sdp.push_str("\r\n");
    sdp
}

// ─── Converter subprocess spec ──────────────────────────────────────────────

/// How to launch the external format converter. Args may contain the
/// `{sdp}` placeholder, substituted with the SDP file path at spawn time.
#[derive(Debug, Clone)]
pub struct ConverterSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl ConverterSpec {
    /// Raw mono 16 kHz Float32-LE PCM on stdout — the transcription feed.
    pub fn pcm_stream() -> Self {
        Self {
            program: "ffmpeg".into(),
            args: vec![
                "-hide_banner".into(),
                "-loglevel".into(),
                "error".into(),
                "-protocol_whitelist".into(),
                "file,udp,rtp".into(),
                "-i".into(),
                "{sdp}".into(),
                "-f".into(),
                "f32le".into(),
                "-acodec".into(),
                "pcm_f32le".into(),
                "-ar".into(),
                "16000".into(),
                "-ac".into(),
                "1".into(),
                "pipe:1".into(),
            ],
        }
    }

    /// Opus passthrough into a per-track Ogg container file.
    pub fn ogg_file(output: &Path) -> Self {
        Self {
            program: "ffmpeg".into(),
            args: vec![
                "-hide_banner".into(),
                "-loglevel".into(),
                "error".into(),
                "-protocol_whitelist".into(),
                "file,udp,rtp".into(),
                "-i".into(),
                "{sdp}".into(),
                "-c:a".into(),
                "copy".into(),
                "-f".into(),
                "ogg".into(),
                "-y".into(),
                output.to_string_lossy().into_owned(),
            ],
        }
    }

    pub fn custom(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    fn resolved_args(&self, sdp_path: &Path) -> Vec<String> {
        let sdp = sdp_path.to_string_lossy();
        self.args
            .iter()
            .map(|a| a.replace("{sdp}", &sdp))
            .collect()
    }
}

// ─── RtpFork ────────────────────────────────────────────────────────────────

pub struct RtpFork {
    plain: Arc<dyn SfuPlainTransport>,
    consumer: Arc<dyn SfuConsumer>,
    lease: PortLease,
    arena: Arc<PortArena>,
    sdp_path: PathBuf,
    child: Mutex<Option<Child>>,
    child_pid: Option<u32>,
    cancel: CancellationToken,
    torn_down: AtomicBool,
}

impl std::fmt::Debug for RtpFork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtpFork").finish_non_exhaustive()
    }
}

impl RtpFork {
    /// Stand up the whole side-car: port lease → plain transport → consumer
    /// → SDP file → converter child → stdout pump (when `sink` is given).
    ///
    /// Any failure mid-way unwinds the parts already created.
    pub async fn start(
        router: &Arc<dyn SfuRouter>,
        arena: &Arc<PortArena>,
        sfu_producer_id: &str,
        converter: &ConverterSpec,
        sink: Option<mpsc::Sender<Bytes>>,
    ) -> CoreResult<Self> {
        let lease = arena.allocate(true)?;

        match Self::start_with_lease(router, arena, lease, sfu_producer_id, converter, sink).await
        {
            Ok(fork) => Ok(fork),
            Err(e) => {
                arena.release(lease);
                Err(e)
            }
        }
    }

    async fn start_with_lease(
        router: &Arc<dyn SfuRouter>,
        arena: &Arc<PortArena>,
        lease: PortLease,
        sfu_producer_id: &str,
        converter: &ConverterSpec,
        sink: Option<mpsc::Sender<Bytes>>,
    ) -> CoreResult<Self> {
        let plain = router
            .create_plain_transport(PlainTransportOptions {
                listen_ip: "127.0.0.1".into(),
                rtcp_mux: true,
                comedia: false,
            })
            .await?;

        // Tell the engine to send to loopback:<port>.
        if let Err(e) = plain.connect("127.0.0.1", lease.rtp).await {
            plain.close().await;
            return Err(e);
        }

        let consumer = match plain.consume(sfu_producer_id).await {
            Ok(consumer) => consumer,
            Err(e) => {
                plain.close().await;
                return Err(e);
            }
        };
        if consumer.paused() {
            consumer.resume().await?;
        }

        let rtp_parameters = consumer.rtp_parameters();
        let sdp = synthesize_sdp(
            lease.rtp,
            payload_type_of(&rtp_parameters),
            ssrc_of(&rtp_parameters),
        );
        let sdp_path = std::env::temp_dir().join(format!("fork-{}.sdp", uuid::Uuid::new_v4()));
        if let Err(e) = tokio::fs::write(&sdp_path, &sdp).await {
            consumer.close().await;
            plain.close().await;
            return Err(CoreError::Sink(format!("failed to write SDP file: {e}")));
        }

        let mut command = Command::new(&converter.program);
        command
            .args(converter.resolved_args(&sdp_path))
            .stdin(Stdio::null())
            .stdout(if sink.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let _ = tokio::fs::remove_file(&sdp_path).await;
                consumer.close().await;
                plain.close().await;
                return Err(CoreError::Sink(format!(
                    "failed to spawn converter '{}': {e}",
                    converter.program
                )));
            }
        };
        let child_pid = child.id();

        let cancel = CancellationToken::new();
        if let Some(sink_tx) = sink {
            let stdout = child.stdout.take().ok_or_else(|| {
                CoreError::Sink("converter stdout was not captured".into())
            })?;
            spawn_stdout_pump(stdout, sink_tx, cancel.clone());
        }

        info!(
            port = lease.rtp,
            pid = child_pid,
            producer = sfu_producer_id,
            "rtp fork started"
        );

        Ok(Self {
            plain,
            consumer,
            lease,
            arena: arena.clone(),
            sdp_path,
            child: Mutex::new(Some(child)),
            child_pid,
            cancel,
            torn_down: AtomicBool::new(false),
        })
    }

    pub fn port(&self) -> u16 {
        self.lease.rtp
    }

    /// Tear the fork down: SIGTERM the converter, give it a second, then
    /// SIGKILL; close the consumer and transport; release the port; unlink
    /// the SDP file. Safe to call more than once.
    pub async fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();

        if let Some(mut child) = self.child.lock().await.take() {
            if let Some(pid) = self.child_pid {
                // Graceful first. SIGKILL only if still alive after the grace.
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGTERM);
                }
                match tokio::time::timeout(TERM_GRACE, child.wait()).await {
                    Ok(Ok(status)) => {
                        debug!(pid, ?status, "converter exited after SIGTERM")
                    }
                    Ok(Err(e)) => warn!(pid, "converter wait failed: {e}"),
                    Err(_) => {
                        warn!(pid, "converter ignored SIGTERM, killing");
                        let _ = child.kill().await;
                        let _ = child.wait().await;
                    }
                }
            } else {
                let _ = child.kill().await;
                let _ = child.wait().await;
            }
        }

        self.consumer.close().await;
        self.plain.close().await;
        self.arena.release(self.lease);
        if let Err(e) = tokio::fs::remove_file(&self.sdp_path).await {
            debug!("sdp file cleanup: {e}");
        }
    }
}

fn spawn_stdout_pump(
    stdout: tokio::process::ChildStdout,
    sink_tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut stdout = stdout;
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                read = stdout.read(&mut buf) => {
                    match read {
                        Ok(0) => break,
                        Ok(n) => {
                            if sink_tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("converter stdout read error: {e}");
                            break;
                        }
                    }
                }
            }
        }
        debug!("converter stdout pump ended");
    });
}

// ─── Tests ──────────────────────────────────────────────────────────────────
