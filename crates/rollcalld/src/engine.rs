use crate::feedback::{Annotation, Feedback, PreviewWriter};
use chrono::{Local, NaiveDateTime};
use rollcall_core::{
    Config, CsvStore, DownscaleFactor, ExtractorError, FaceExtractor, Gallery, GalleryBuilder,
    GalleryError, Identity, Ledger, LedgerError, LedgerStore, Matcher, NearestNeighborMatcher,
    OnnxExtractor, Tolerance,
};
use rollcall_hw::{frame, Camera, CameraError, FrameSource};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;

const RETRY_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("extractor error: {0}")]
    Extractor(#[from] ExtractorError),
    #[error("gallery error: {0}")]
    Gallery(#[from] GalleryError),
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("frame acquisition failed {attempts} times in a row: {source}")]
    CaptureExhausted {
        attempts: u32,
        #[source]
        source: CameraError,
    },
}

/// Wall-clock source for sighting timestamps.
pub trait Clock {
    fn now(&self) -> NaiveDateTime;
}

/// Local wall-clock time, as written to the attendance table.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// Lifecycle of the capture loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Init,
    Running,
    Stopped,
}

/// Counters logged when the loop stops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub frames: u64,
    /// Frames dropped because the extractor failed on them.
    pub skipped: u64,
    pub detections: u64,
    pub unknown: u64,
    pub created: u64,
    pub updated: u64,
    pub persist_failures: u64,
}

/// Loop tuning taken from [`Config`].
#[derive(Debug, Clone, Copy)]
pub struct LoopSettings {
    pub tolerance: Tolerance,
    pub resize: DownscaleFactor,
    pub capture_retries: u32,
    pub retry_backoff: Duration,
}

impl LoopSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            tolerance: config.tolerance,
            resize: config.resize,
            capture_retries: config.capture_retries,
            retry_backoff: RETRY_BACKOFF,
        }
    }
}

/// The capture loop: frames in, attendance out.
///
/// Runs on a single thread; the ledger is owned here, so sightings are
/// serialized by construction.
pub struct Engine<F, E, S, C, B> {
    source: F,
    extractor: E,
    gallery: Gallery,
    matcher: NearestNeighborMatcher,
    ledger: Ledger<S>,
    clock: C,
    feedback: B,
    settings: LoopSettings,
    state: State,
    summary: RunSummary,
}

/// Engine wired to real hardware and files.
pub type DaemonEngine = Engine<Camera, OnnxExtractor, CsvStore, SystemClock, PreviewWriter>;

/// Perform INIT: models, gallery, camera and ledger, failing fast on any of them.
pub fn init(config: &Config) -> Result<DaemonEngine, EngineError> {
    let extractor = OnnxExtractor::load(&config.model_dir, config.model, config.upsample)?;

    let mut builder = GalleryBuilder::new(extractor, config.multi_face);
    let (gallery, report) = builder.build(&config.known_faces)?;
    tracing::info!(
        entries = gallery.len(),
        labels = gallery.labels().len(),
        skipped = report.skipped.len(),
        "gallery ready"
    );

    let camera = Camera::open(&config.camera, config.capture_timeout)?;
    tracing::info!(
        device = %camera.device_path,
        width = camera.width,
        height = camera.height,
        "camera opened"
    );

    let ledger = Ledger::open(CsvStore::new(&config.attendance_file))?;
    tracing::info!(
        path = %config.attendance_file.display(),
        records = ledger.len(),
        "attendance ledger loaded"
    );

    Ok(Engine::new(
        camera,
        builder.into_extractor(),
        gallery,
        ledger,
        SystemClock,
        PreviewWriter::new(config.preview_path.clone()),
        LoopSettings::from_config(config),
    ))
}

impl<F, E, S, C, B> Engine<F, E, S, C, B>
where
    F: FrameSource,
    E: FaceExtractor,
    S: LedgerStore,
    C: Clock,
    B: Feedback,
{
    pub fn new(
        source: F,
        extractor: E,
        gallery: Gallery,
        ledger: Ledger<S>,
        clock: C,
        feedback: B,
        settings: LoopSettings,
    ) -> Self {
        Self {
            source,
            extractor,
            gallery,
            matcher: NearestNeighborMatcher,
            ledger,
            clock,
            feedback,
            settings,
            state: State::Init,
            summary: RunSummary::default(),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    pub fn ledger(&self) -> &Ledger<S> {
        &self.ledger
    }

    /// Run until `stop` is set or frame acquisition fails for good.
    ///
    /// `stop` is checked once per cycle, before a frame is acquired. On the
    /// way out the ledger is flushed; a fatal loop error takes precedence
    /// over a flush error in the return value.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<RunSummary, EngineError> {
        if self.state != State::Init {
            return Ok(self.summary.clone());
        }
        self.state = State::Running;
        tracing::info!(
            tolerance = self.settings.tolerance.get(),
            resize = self.settings.resize.get(),
            gallery = self.gallery.len(),
            "capture loop running"
        );

        let mut outcome = Ok(());
        while !stop.load(Ordering::Relaxed) {
            if let Err(e) = self.cycle() {
                tracing::error!(error = %e, "capture loop failed");
                outcome = Err(e);
                break;
            }
        }

        self.state = State::Stopped;
        let flushed = self.ledger.flush();
        if let Err(e) = &flushed {
            tracing::error!(error = %e, "final attendance flush failed");
        }

        let s = &self.summary;
        tracing::info!(
            frames = s.frames,
            skipped = s.skipped,
            detections = s.detections,
            unknown = s.unknown,
            created = s.created,
            updated = s.updated,
            persist_failures = s.persist_failures,
            "capture loop stopped"
        );

        outcome?;
        flushed?;
        Ok(self.summary.clone())
    }

    /// One frame: acquire, downscale, extract, match, record, render.
    fn cycle(&mut self) -> Result<(), EngineError> {
        let frame = self.acquire()?;
        self.summary.frames += 1;

        let factor = self.settings.resize.get();
        let small = frame::downscale(&frame.image, factor);
        let detections = match self.extractor.extract(&small) {
            Ok(d) => d,
            Err(e) => {
                self.summary.skipped += 1;
                tracing::warn!(sequence = frame.sequence, error = %e, "extraction failed; frame skipped");
                return Ok(());
            }
        };

        let mut annotations = Vec::with_capacity(detections.len());
        for detection in detections {
            self.summary.detections += 1;
            let result = self
                .matcher
                .compare(&detection.embedding, &self.gallery, self.settings.tolerance);

            match &result.identity {
                Identity::Known(label) => self.record(label),
                Identity::Unknown => self.summary.unknown += 1,
            }

            annotations.push(Annotation {
                bbox: detection.bbox.scaled(1.0 / factor),
                identity: result.identity,
                distance: result.distance,
            });
        }

        if let Err(e) = self.feedback.render(&frame.image, &annotations) {
            tracing::warn!(error = %e, "failed to render feedback");
        }
        tracing::trace!(
            sequence = frame.sequence,
            faces = annotations.len(),
            latency_ms = frame.captured_at.elapsed().as_millis() as u64,
            "frame processed"
        );
        Ok(())
    }

    /// Record a sighting; a persistence failure is logged and the loop carries on.
    fn record(&mut self, label: &str) {
        match self.ledger.record_sighting(label, self.clock.now()) {
            Ok(sighting) if sighting.created => self.summary.created += 1,
            Ok(_) => self.summary.updated += 1,
            Err(e) => {
                self.summary.persist_failures += 1;
                tracing::error!(identity = label, error = %e, "attendance not persisted");
            }
        }
    }

    /// Acquire one frame, retrying transient failures up to the configured bound.
    fn acquire(&mut self) -> Result<rollcall_hw::Frame, EngineError> {
        let mut failures = 0u32;
        loop {
            match self.source.next_frame() {
                Ok(frame) => return Ok(frame),
                Err(e) if failures < self.settings.capture_retries => {
                    failures += 1;
                    tracing::warn!(
                        attempt = failures,
                        max = self.settings.capture_retries,
                        error = %e,
                        "frame acquisition failed; retrying"
                    );
                    std::thread::sleep(self.settings.retry_backoff * failures);
                }
                Err(e) => {
                    return Err(EngineError::CaptureExhausted {
                        attempts: failures + 1,
                        source: e,
                    })
                }
            }
        }
    }
}
