use crate::dispatcher::{IdentificationDispatcher, SubmitOutcome};
use crate::identify::CaptureJob;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use vigil_core::debounce::{CaptureDebouncer, DebounceConfig, Decision};
use vigil_core::detector::PresenceDetector;
use vigil_core::types::{CaptureEvent, PresenceSample};
use vigil_hw::frame::encode_jpeg;
use vigil_hw::{CameraError, Frame, FrameSource};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Latest annotated JPEG for the live feed.
pub type FeedSender = watch::Sender<Option<Bytes>>;

pub struct EngineOptions {
    /// Frame source string, opened on the engine thread.
    pub source: String,
    pub debounce: DebounceConfig,
    pub captured_dir: PathBuf,
    pub box_padding: u32,
}

/// Handle to the running frame loop.
pub struct EngineHandle {
    stop: Arc<AtomicBool>,
    done: oneshot::Receiver<Result<(), EngineError>>,
}

impl EngineHandle {
    /// Ask the loop to exit after the current frame.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Wait for the frame loop to end.
    pub async fn wait(&mut self) -> Result<(), EngineError> {
        (&mut self.done).await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Spawn the frame loop on a dedicated OS thread.
///
/// The frame source is opened on that thread; an open failure is returned
/// here so the daemon fails fast.
pub async fn spawn_engine<J: CaptureJob>(
    options: EngineOptions,
    detector: Box<dyn PresenceDetector>,
    dispatcher: Arc<IdentificationDispatcher<J>>,
    feed: FeedSender,
) -> Result<EngineHandle, EngineError> {
    let (ready_tx, ready_rx) = oneshot::channel::<Result<String, CameraError>>();
    let (done_tx, done_rx) = oneshot::channel();
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = stop.clone();

    std::thread::Builder::new()
        .name("vigil-engine".into())
        .spawn(move || {
            let mut source = match vigil_hw::open_source(&options.source) {
                Ok(source) => source,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(source.describe()));

            let mut frame_loop = FrameLoop {
                detector,
                debouncer: CaptureDebouncer::new(options.debounce),
                dispatcher,
                feed,
                captured_dir: options.captured_dir,
                box_padding: options.box_padding,
            };
            tracing::info!("engine thread started");
            let result = frame_loop.run(source.as_mut(), &stop_flag);
            if let Err(e) = &result {
                tracing::error!(error = %e, "frame loop failed");
            }
            tracing::info!("engine thread exiting");
            let _ = done_tx.send(result);
        })
        .map_err(EngineError::Spawn)?;

    let origin = ready_rx.await.map_err(|_| EngineError::ChannelClosed)??;
    tracing::info!(source = %origin, "frame source opened");

    Ok(EngineHandle { stop, done: done_rx })
}

struct FrameLoop<J> {
    detector: Box<dyn PresenceDetector>,
    debouncer: CaptureDebouncer,
    dispatcher: Arc<IdentificationDispatcher<J>>,
    feed: FeedSender,
    captured_dir: PathBuf,
    box_padding: u32,
}

impl<J: CaptureJob> FrameLoop<J> {
    /// Process frames until the source ends, fails, or a stop is requested.
    fn run(&mut self, source: &mut dyn FrameSource, stop: &AtomicBool) -> Result<(), EngineError> {
        while !stop.load(Ordering::SeqCst) {
            let Some(frame) = source.next_frame()? else {
                tracing::info!("frame source ended");
                return Ok(());
            };
            self.process(&frame);
        }
        Ok(())
    }

    fn process(&mut self, frame: &Frame) {
        let faces = match self.detector.detect(&frame.image) {
            Ok(faces) => faces,
            Err(e) => {
                tracing::warn!(error = %e, seq = frame.sequence, "face detection failed");
                Vec::new()
            }
        };

        let sample = PresenceSample::new(!faces.is_empty(), frame.captured_at);
        if self.debouncer.observe(sample) == Decision::Capture {
            self.capture(frame);
        }

        if self.feed.receiver_count() > 0 {
            match encode_jpeg(&frame.annotated(&faces, self.box_padding)) {
                Ok(jpeg) => {
                    self.feed.send_replace(Some(Bytes::from(jpeg)));
                }
                Err(e) => tracing::debug!(error = %e, "feed frame encoding failed"),
            }
        }
    }

    fn capture(&self, frame: &Frame) {
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
        let image_path = capture_path(&self.captured_dir, &timestamp);
        if let Err(e) = frame.save_jpeg(&image_path) {
            tracing::warn!(path = %image_path.display(), error = %e, "failed to save capture");
            return;
        }
        tracing::info!(path = %image_path.display(), "capture saved");

        if self.dispatcher.submit(CaptureEvent { image_path, timestamp }) == SubmitOutcome::Dropped {
            tracing::debug!("capture not identified; previous job still running");
        }
    }
}

fn capture_path(dir: &Path, timestamp: &str) -> PathBuf {
    dir.join(format!("captured_{timestamp}.jpg"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identify::JobOutcome;
    use async_trait::async_trait;
    use image::{Rgb, RgbImage};
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::time::{Duration, Instant};
    use tokio::runtime::Handle;
    use vigil_core::detector::DetectorError;
    use vigil_core::types::BoundingBox;

    /// Replays frames with scripted face presence at fixed timestamps.
    struct ScriptedSource {
        frames: VecDeque<(bool, Instant)>,
    }

    impl FrameSource for ScriptedSource {
        fn next_frame(&mut self) -> Result<Option<Frame>, CameraError> {
            Ok(self.frames.pop_front().map(|(face, at)| {
                let shade = if face { 200 } else { 0 };
                Frame {
                    image: RgbImage::from_pixel(32, 32, Rgb([shade, shade, shade])),
                    captured_at: at,
                    sequence: 0,
                }
            }))
        }

        fn describe(&self) -> String {
            "scripted".into()
        }
    }

    /// Reports a face on bright frames.
    struct BrightnessDetector;

    impl PresenceDetector for BrightnessDetector {
        fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
            if image.get_pixel(0, 0).0[0] > 100 {
                Ok(vec![BoundingBox { x: 8.0, y: 8.0, width: 16.0, height: 16.0, confidence: 0.9 }])
            } else {
                Ok(Vec::new())
            }
        }
    }

    #[derive(Default)]
    struct RecordingJob {
        events: Mutex<Vec<CaptureEvent>>,
    }

    #[async_trait]
    impl CaptureJob for RecordingJob {
        async fn run(&self, event: CaptureEvent) -> JobOutcome {
            self.events.lock().push(event);
            JobOutcome::NoFace
        }
    }

    fn frame_loop(job: Arc<RecordingJob>, dir: &Path, feed: FeedSender) -> FrameLoop<RecordingJob> {
        FrameLoop {
            detector: Box::new(BrightnessDetector),
            debouncer: CaptureDebouncer::default(),
            dispatcher: Arc::new(IdentificationDispatcher::new(job, Handle::current(), Duration::from_secs(5))),
            feed,
            captured_dir: dir.to_path_buf(),
            box_padding: 30,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stable_face_saves_and_submits_one_capture() {
        let dir = tempfile::tempdir().unwrap();
        let job = Arc::new(RecordingJob::default());
        let (feed, _rx) = watch::channel(None);
        let mut frames = frame_loop(job.clone(), dir.path(), feed);

        let t0 = Instant::now();
        let mut source = ScriptedSource {
            frames: (0..=40).map(|i| (true, t0 + Duration::from_millis(i * 100))).collect(),
        };
        frames.run(&mut source, &AtomicBool::new(false)).unwrap();

        for _ in 0..200 {
            if !job.events.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let events = job.events.lock();
        assert_eq!(events.len(), 1);
        assert!(events[0].image_path.exists());
        let name = events[0].image_path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("captured_") && name.ends_with(".jpg"), "{name}");
        assert_eq!(events[0].timestamp.len(), "YYYYMMDD_HHMMSS".len());
    }

    #[tokio::test]
    async fn test_interrupted_presence_never_captures() {
        let dir = tempfile::tempdir().unwrap();
        let job = Arc::new(RecordingJob::default());
        let (feed, _rx) = watch::channel(None);
        let mut frames = frame_loop(job.clone(), dir.path(), feed);

        let t0 = Instant::now();
        let at = |ms: u64| t0 + Duration::from_millis(ms);
        let mut script: VecDeque<(bool, Instant)> = (0..=20).map(|i| (true, at(i * 100))).collect();
        script.push_back((false, at(2050)));
        script.extend((0..=29).map(|i| (true, at(2100 + i * 100))));
        let mut source = ScriptedSource { frames: script };

        frames.run(&mut source, &AtomicBool::new(false)).unwrap();
        assert!(!frames.dispatcher.is_busy());
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn test_feed_receives_annotated_frames() {
        let dir = tempfile::tempdir().unwrap();
        let (feed, rx) = watch::channel(None);
        let mut frames = frame_loop(Arc::new(RecordingJob::default()), dir.path(), feed);

        let mut source = ScriptedSource {
            frames: VecDeque::from([(true, Instant::now())]),
        };
        frames.run(&mut source, &AtomicBool::new(false)).unwrap();

        let jpeg = rx.borrow().clone().expect("feed frame");
        let decoded = Frame::from_jpeg(&jpeg, 0).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 32));
    }

    #[test]
    fn test_stop_flag_ends_loop() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let (feed, _rx) = watch::channel(None);
        let mut frames = runtime.block_on(async { frame_loop(Arc::new(RecordingJob::default()), dir.path(), feed) });

        let mut source = ScriptedSource {
            frames: VecDeque::from([(true, Instant::now()); 5]),
        };
        frames.run(&mut source, &AtomicBool::new(true)).unwrap();
        assert_eq!(source.frames.len(), 5);
    }

    #[test]
    fn test_capture_path_format() {
        assert_eq!(
            capture_path(Path::new("captured_folder"), "20240101_120000"),
            PathBuf::from("captured_folder/captured_20240101_120000.jpg")
        );
    }
}
