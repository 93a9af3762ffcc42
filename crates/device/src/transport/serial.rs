//! Local line-oriented fallback channel (USB serial, UART tty or a FIFO).
//!
//! Inbound: one command per line, same vocabulary as MQTT. Outbound: one
//! JSON object per line, telemetry and state changes alike. A FIFO is
//! input-only: commands can be written into it, nothing is written back.
//!
//! All I/O is readiness-driven (epoll), never parked on the blocking pool,
//! so an idle port cannot hold up runtime shutdown. A lost port is reopened
//! after the retry interval.

use anyhow::{bail, Context, Result};
use std::future::Future;
use std::os::unix::fs::FileTypeExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::unix::pipe;
use tokio::sync::{mpsc, Notify};
use tokio::time::sleep;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

use super::Channel;
use crate::telemetry::{encode, StateChange, TelemetrySample};

/// Queued outbound lines before new ones are dropped.
const OUTBOUND_CAPACITY: usize = 16;
const INBOUND_CAPACITY: usize = 32;

type PortReader = Box<dyn AsyncRead + Unpin + Send>;
type PortWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// One opened port. `writer` is `None` for input-only ports.
pub struct Port {
    reader: PortReader,
    writer: Option<PortWriter>,
}

impl Port {
    pub fn new<R, W>(reader: R, writer: Option<W>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: writer.map(|w| Box::new(w) as PortWriter),
        }
    }
}

/// Open `path` as a tty at `baud`, or as an input-only FIFO.
pub async fn open_port(path: String, baud: u32) -> Result<Port> {
    let kind = tokio::fs::metadata(&path)
        .await
        .with_context(|| format!("serial path unavailable: {path}"))?
        .file_type();

    if kind.is_fifo() {
        // read_write keeps the open from waiting for a writer and from
        // seeing EOF every time one goes away.
        let rx = pipe::OpenOptions::new()
            .read_write(true)
            .open_receiver(&path)
            .with_context(|| format!("failed to open fifo: {path}"))?;
        return Ok(Port::new(rx, None::<PortWriter>));
    }

    if kind.is_char_device() {
        let stream = tokio_serial::new(&path, baud)
            .open_native_async()
            .with_context(|| format!("failed to open serial port {path} at {baud} baud"))?;
        let (reader, writer) = tokio::io::split(stream);
        return Ok(Port::new(reader, Some(writer)));
    }

    bail!("{path} is neither a tty nor a fifo");
}

pub struct SerialLink {
    lines: mpsc::Receiver<String>,
    out: mpsc::Sender<Vec<u8>>,
    writable: Arc<AtomicBool>,
}

impl SerialLink {
    /// Spawn the port supervisor for `path`. Never waits for the device;
    /// opening and reopening happen in the background.
    pub fn start(path: &str, baud: u32, retry: Duration, inbound: Arc<Notify>) -> Self {
        info!(path, baud, "serial: starting local channel");
        let path = path.to_string();
        Self::with_opener(move || open_port(path.clone(), baud), retry, inbound)
    }

    /// Same as [`SerialLink::start`] with a custom way of (re)opening the port.
    pub fn with_opener<F, Fut>(open: F, retry: Duration, inbound: Arc<Notify>) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Port>> + Send + 'static,
    {
        let (line_tx, line_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let writable = Arc::new(AtomicBool::new(false));

        tokio::spawn(supervise(open, retry, line_tx, out_rx, writable.clone(), inbound));

        Self {
            lines: line_rx,
            out: out_tx,
            writable,
        }
    }

    fn send_line(&self, mut payload: Vec<u8>) {
        payload.push(b'\n');
        if let Err(e) = self.out.try_send(payload) {
            debug!("serial: outbound line dropped: {e}");
        }
    }
}

impl Channel for SerialLink {
    fn name(&self) -> &'static str {
        "serial"
    }

    /// True while a port with an output side is open.
    fn is_available(&self) -> bool {
        self.writable.load(Ordering::Relaxed)
    }

    fn drain_commands(&mut self) -> Vec<Vec<u8>> {
        let mut commands = Vec::new();
        while let Ok(line) = self.lines.try_recv() {
            let line = line.trim();
            if !line.is_empty() {
                commands.push(line.as_bytes().to_vec());
            }
        }
        commands
    }

    fn send_telemetry(&mut self, sample: &TelemetrySample) {
        if let Some(payload) = encode(sample) {
            self.send_line(payload);
        }
    }

    fn send_state(&mut self, change: &StateChange) {
        if let Some(payload) = encode(change) {
            self.send_line(payload);
        }
    }
}

/// Why a session stopped.
enum SessionEnd {
    /// The `SerialLink` was dropped; stop for good.
    Closed,
    /// The port failed; reopen after the retry interval.
    Lost(String),
}

/// Open, run and reopen the port until the link is dropped.
async fn supervise<F, Fut>(
    mut open: F,
    retry: Duration,
    lines: mpsc::Sender<String>,
    mut out: mpsc::Receiver<Vec<u8>>,
    writable: Arc<AtomicBool>,
    inbound: Arc<Notify>,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Port>>,
{
    loop {
        match open().await {
            Ok(port) => {
                info!(output = port.writer.is_some(), "serial: port open");
                writable.store(port.writer.is_some(), Ordering::Relaxed);
                let end = run_session(port, &lines, &mut out, &inbound).await;
                writable.store(false, Ordering::Relaxed);
                match end {
                    SessionEnd::Closed => return,
                    SessionEnd::Lost(reason) => {
                        warn!(retry_secs = retry.as_secs_f32(), "serial: {reason}, reopening");
                    }
                }
            }
            Err(e) => {
                warn!(retry_secs = retry.as_secs_f32(), "serial: open failed: {e:#}");
            }
        }

        if lines.is_closed() {
            return;
        }
        sleep(retry).await;
    }
}

async fn run_session(
    port: Port,
    lines: &mpsc::Sender<String>,
    out: &mut mpsc::Receiver<Vec<u8>>,
    inbound: &Notify,
) -> SessionEnd {
    let mut reader = BufReader::new(port.reader).lines();
    let mut writer = port.writer;

    loop {
        tokio::select! {
            line = reader.next_line() => match line {
                Ok(Some(line)) => {
                    if lines.send(line).await.is_err() {
                        return SessionEnd::Closed;
                    }
                    inbound.notify_one();
                }
                Ok(None) => return SessionEnd::Lost("input closed".to_string()),
                Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                    // Non-UTF-8 noise on the line; skip it and keep reading.
                    debug!("serial: discarded undecodable line: {e}");
                }
                Err(e) => return SessionEnd::Lost(format!("read failed: {e}")),
            },
            msg = out.recv() => {
                let Some(msg) = msg else {
                    return SessionEnd::Closed;
                };
                let Some(w) = writer.as_mut() else {
                    debug!("serial: input-only port, outbound line dropped");
                    continue;
                };
                let result = async {
                    w.write_all(&msg).await?;
                    w.flush().await
                }
                .await;
                if let Err(e) = result {
                    return SessionEnd::Lost(format!("write failed: {e}"));
                }
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
