//! HTTP MJPEG (`multipart/x-mixed-replace`) frame source.
//!
//! Multipart headers are not parsed; JPEG images are cut out of the byte
//! stream by their SOI (`FF D8`) and EOI (`FF D9`) markers, which works for
//! every boundary format cameras emit in practice.

use crate::camera::{CameraError, FrameSource};
use crate::frame::Frame;
use std::io::{self, Read};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::time::Duration;

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];
const READ_CHUNK: usize = 16 * 1024;
/// Drop buffered bytes beyond this size when no complete image is found.
const MAX_BUFFERED: usize = 8 * 1024 * 1024;
/// A stream that delivers no bytes for this long counts as dead.
const STALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Incremental splitter extracting JPEG images from a byte stream.
#[derive(Debug, Default)]
pub struct JpegSplitter {
    buf: Vec<u8>,
}

impl JpegSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete JPEG, discarding any bytes before it.
    pub fn next_jpeg(&mut self) -> Option<Vec<u8>> {
        let Some(start) = find(&self.buf, &SOI, 0) else {
            // Keep a trailing 0xFF in case it begins a marker split across reads.
            let keep = usize::from(self.buf.last() == Some(&0xFF));
            self.buf.drain(..self.buf.len() - keep);
            return None;
        };
        let Some(end) = find(&self.buf, &EOI, start + SOI.len()) else {
            if start > 0 {
                self.buf.drain(..start);
            }
            if self.buf.len() > MAX_BUFFERED {
                tracing::warn!(buffered = self.buf.len(), "no image end marker; discarding buffered stream data");
                self.buf.clear();
            }
            return None;
        };
        let end = end + EOI.len();
        let jpeg = self.buf[start..end].to_vec();
        self.buf.drain(..end);
        Some(jpeg)
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

fn find(haystack: &[u8], needle: &[u8; 2], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(2)
        .position(|w| w == needle)
        .map(|i| i + from)
}

/// Frame source reading an MJPEG stream.
///
/// Bytes are read on a helper thread so that a stream which stops sending
/// without closing surfaces as a `TimedOut` error instead of blocking.
pub struct MjpegStream {
    chunks: Receiver<io::Result<Vec<u8>>>,
    splitter: JpegSplitter,
    sequence: u32,
    origin: String,
    stall_timeout: Duration,
}

impl MjpegStream {
    /// Open `url` and start reading its multipart body.
    pub fn connect(url: &str) -> Result<Self, CameraError> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(None)
            .build()?;
        let response = client.get(url).send()?.error_for_status()?;
        tracing::info!(
            url,
            content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("-"),
            "connected to MJPEG stream"
        );
        Self::from_reader(response, url)
    }

    /// Read frames from any byte stream.
    pub fn from_reader(reader: impl Read + Send + 'static, origin: &str) -> Result<Self, CameraError> {
        let (tx, rx) = mpsc::sync_channel(4);
        std::thread::Builder::new()
            .name("vigil-mjpeg".into())
            .spawn(move || pump(reader, tx))?;
        Ok(Self {
            chunks: rx,
            splitter: JpegSplitter::new(),
            sequence: 0,
            origin: origin.to_string(),
            stall_timeout: STALL_TIMEOUT,
        })
    }

    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }
}

/// Forward chunks until EOF (sent as an empty chunk), an error, or the
/// receiving side going away.
fn pump(mut reader: impl Read, tx: SyncSender<io::Result<Vec<u8>>>) {
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let msg = match reader.read(&mut chunk) {
            Ok(n) => Ok(chunk[..n].to_vec()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => Err(e),
        };
        let last = !matches!(&msg, Ok(bytes) if !bytes.is_empty());
        if tx.send(msg).is_err() || last {
            return;
        }
    }
}

impl FrameSource for MjpegStream {
    fn next_frame(&mut self) -> Result<Option<Frame>, CameraError> {
        loop {
            if let Some(jpeg) = self.splitter.next_jpeg() {
                let sequence = self.sequence;
                self.sequence = self.sequence.wrapping_add(1);
                match Frame::from_jpeg(&jpeg, sequence) {
                    Ok(frame) => return Ok(Some(frame)),
                    Err(e) => {
                        tracing::debug!(error = %e, bytes = jpeg.len(), "skipping undecodable stream image");
                        continue;
                    }
                }
            }

            match self.chunks.recv_timeout(self.stall_timeout) {
                Ok(Ok(bytes)) if !bytes.is_empty() => self.splitter.push(&bytes),
                Ok(Ok(_)) | Err(RecvTimeoutError::Disconnected) => {
                    tracing::info!(origin = %self.origin, "MJPEG stream ended");
                    return Ok(None);
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(RecvTimeoutError::Timeout) => {
                    tracing::warn!(origin = %self.origin, timeout_secs = self.stall_timeout.as_secs_f32(), "MJPEG stream stalled");
                    return Err(CameraError::Io(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("no stream data for {:?}", self.stall_timeout),
                    )));
                }
            }
        }
    }

    fn describe(&self) -> String {
        format!("mjpeg:{}", self.origin)
    }
}
