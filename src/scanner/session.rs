//! Scan Session Controller.
//!
//! One controller owns one camera for the lifetime of a scan session:
//!
//! ```text
//! Idle -> Acquiring -> Scanning -> Decoded -> Cooldown -> Scanning ...
//!            |            |
//!            +-> Error <--+        (retry goes back to Acquiring)
//! any state -> Closed
//! ```
//!
//! Sampling only happens in `Scanning`. The first decode of a scanning epoch
//! moves the controller out of `Scanning`, so later frames of that epoch are
//! never looked at.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{self, Instant, MissedTickBehavior};

use super::camera::{
    acquire, default_profiles, CameraErrorKind, CameraLease, CaptureDevice, VideoStream,
};
use super::decoder::QrDecoder;
use super::sampler::{sample_frame, RasterBuffer};
use crate::config::ScanTiming;
use crate::payload::{interpret, ScannedPayload};

const EVENT_CAPACITY: usize = 32;
const CONTROL_CAPACITY: usize = 8;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ScanState {
    Idle,
    Acquiring,
    Scanning,
    Decoded { payload: ScannedPayload },
    Cooldown,
    Error { kind: CameraErrorKind, message: String },
    Closed,
}

impl ScanState {
    fn error(kind: CameraErrorKind) -> Self {
        ScanState::Error {
            kind,
            message: kind.message().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ScanEvent {
    Started,
    Detected { payload: ScannedPayload },
    Recorded { student_id: String, message: String },
    RecordFailed { student_id: String, message: String },
    Resumed,
    Failed { kind: CameraErrorKind, message: String },
    Closed,
}

/// What the receiving end made of a detected payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanReport {
    pub accepted: bool,
    pub message: String,
    pub payload: ScannedPayload,
}

/// Receives every payload the controller detects.
#[async_trait]
pub trait ScanSink: Send + Sync {
    async fn deliver(&self, payload: ScannedPayload) -> ScanReport;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanCommand {
    Retry,
    Close,
}

pub struct ScanController<D: CaptureDevice> {
    device: D,
    decoder: Arc<dyn QrDecoder>,
    sink: Arc<dyn ScanSink>,
    timing: ScanTiming,
    lease: CameraLease<D::Stream>,
    buffer: RasterBuffer,
    state: ScanState,
    epoch: u64,
    decoded_epoch: Option<u64>,
    cooldown_until: Option<Instant>,
    state_tx: watch::Sender<ScanState>,
    events: broadcast::Sender<ScanEvent>,
}

impl<D: CaptureDevice> ScanController<D> {
    pub fn new(
        device: D,
        decoder: Arc<dyn QrDecoder>,
        sink: Arc<dyn ScanSink>,
        timing: ScanTiming,
    ) -> Self {
        let (state_tx, _) = watch::channel(ScanState::Idle);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            device,
            decoder,
            sink,
            timing,
            lease: CameraLease::default(),
            buffer: RasterBuffer::new(),
            state: ScanState::Idle,
            epoch: 0,
            decoded_epoch: None,
            cooldown_until: None,
            state_tx,
            events,
        }
    }

    pub fn state(&self) -> &ScanState {
        &self.state
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn watch_state(&self) -> watch::Receiver<ScanState> {
        self.state_tx.subscribe()
    }

    pub fn events(&self) -> broadcast::Sender<ScanEvent> {
        self.events.clone()
    }

    fn set_state(&mut self, state: ScanState) {
        log::debug!("Scan session {:?} -> {:?}", self.state, state);
        self.state_tx.send_replace(state.clone());
        self.state = state;
    }

    fn emit(&self, event: ScanEvent) {
        let _ = self.events.send(event);
    }

    fn fail(&mut self, kind: CameraErrorKind) {
        log::warn!("Scan session failed: {:?}", kind);
        self.lease.release();
        self.buffer.clear();
        self.cooldown_until = None;
        self.set_state(ScanState::error(kind));
        self.emit(ScanEvent::Failed {
            kind,
            message: kind.message().to_string(),
        });
    }

    /// `Idle` or `Error` -> `Acquiring` -> `Scanning`, or `Error` when the
    /// camera cannot be opened or never delivers a frame.
    pub async fn start(&mut self) {
        if !matches!(self.state, ScanState::Idle | ScanState::Error { .. }) {
            return;
        }
        self.set_state(ScanState::Acquiring);

        let stream = match acquire(&mut self.device, &default_profiles()).await {
            Ok(stream) => stream,
            Err(kind) => return self.fail(kind),
        };
        self.lease = CameraLease::new(stream);

        if let Err(kind) = self.prepare_stream().await {
            return self.fail(kind);
        }

        self.epoch += 1;
        self.set_state(ScanState::Scanning);
        self.emit(ScanEvent::Started);
    }

    async fn prepare_stream(&mut self) -> Result<(), CameraErrorKind> {
        let ready_timeout = self.timing.ready_timeout;
        let stream = self
            .lease
            .stream_mut()
            .ok_or(CameraErrorKind::Unknown)?;
        match time::timeout(ready_timeout, stream.ready()).await {
            Ok(ready) => ready?,
            Err(_) => {
                log::warn!("Camera did not report a resolution within {:?}", ready_timeout);
                return Err(CameraErrorKind::Unknown);
            }
        }
        stream.play().await
    }

    /// One sampling tick. Returns the payload when this tick produced the
    /// first decode of the current epoch, leaving the controller in `Decoded`.
    pub fn sample(&mut self) -> Option<ScannedPayload> {
        if self.state != ScanState::Scanning || self.decoded_epoch == Some(self.epoch) {
            return None;
        }
        let stream = self.lease.stream_mut()?;
        match sample_frame(stream, &mut self.buffer) {
            Ok(true) => {}
            Ok(false) => return None,
            Err(kind) => {
                self.fail(kind);
                return None;
            }
        }

        let text = self.decoder.decode(&self.buffer)?;
        let payload = interpret(&text);
        if payload.student_id.is_empty() {
            return None;
        }

        self.decoded_epoch = Some(self.epoch);
        log::info!("Decoded QR for student {}", payload.student_id);
        self.set_state(ScanState::Decoded {
            payload: payload.clone(),
        });
        self.emit(ScanEvent::Detected {
            payload: payload.clone(),
        });
        Some(payload)
    }

    /// `Decoded` -> `Cooldown`; returns when sampling may resume.
    pub fn begin_cooldown(&mut self) -> Option<Instant> {
        if !matches!(self.state, ScanState::Decoded { .. }) {
            return None;
        }
        let until = Instant::now() + self.timing.cooldown;
        self.cooldown_until = Some(until);
        self.set_state(ScanState::Cooldown);
        Some(until)
    }

    /// `Cooldown` -> `Scanning`, opening a new epoch.
    pub fn resume(&mut self) -> bool {
        self.cooldown_until = None;
        if self.state != ScanState::Cooldown {
            return false;
        }
        self.epoch += 1;
        self.set_state(ScanState::Scanning);
        self.emit(ScanEvent::Resumed);
        true
    }

    pub fn report(&mut self, report: ScanReport) {
        if self.state == ScanState::Closed {
            log::debug!("Dropping scan report for {}, session closed", report.payload.student_id);
            return;
        }
        let student_id = report.payload.student_id;
        self.emit(if report.accepted {
            ScanEvent::Recorded {
                student_id,
                message: report.message,
            }
        } else {
            ScanEvent::RecordFailed {
                student_id,
                message: report.message,
            }
        });
    }

    /// Explicit retry; only leaves `Error`.
    pub async fn retry(&mut self) {
        if matches!(self.state, ScanState::Error { .. }) {
            self.start().await;
        }
    }

    /// Terminal. Cancels the cooldown and releases the camera, from any state.
    pub fn close(&mut self) {
        self.cooldown_until = None;
        self.lease.release();
        self.buffer.clear();
        if self.state != ScanState::Closed {
            self.set_state(ScanState::Closed);
            self.emit(ScanEvent::Closed);
        }
    }

    /// Drives the session until closed or every command sender is gone.
    pub async fn run(mut self, mut control: mpsc::Receiver<ScanCommand>) {
        self.start().await;

        let mut ticker = time::interval(self.timing.sample_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let (report_tx, mut reports) = mpsc::channel::<ScanReport>(CONTROL_CAPACITY);

        loop {
            let cooldown = self.cooldown_until;
            let scanning = self.state == ScanState::Scanning;

            tokio::select! {
                command = control.recv() => match command {
                    Some(ScanCommand::Retry) => self.retry().await,
                    Some(ScanCommand::Close) | None => break,
                },
                _ = ticker.tick(), if scanning => {
                    if let Some(payload) = self.sample() {
                        self.begin_cooldown();
                        let sink = self.sink.clone();
                        let report_tx = report_tx.clone();
                        tokio::spawn(async move {
                            let report = sink.deliver(payload).await;
                            // the session may be gone by now
                            let _ = report_tx.send(report).await;
                        });
                    }
                },
                _ = time::sleep_until(cooldown.unwrap_or_else(Instant::now)), if cooldown.is_some() => {
                    self.resume();
                },
                Some(report) = reports.recv() => self.report(report),
            }
        }

        self.close();
    }
}

/// Handle kept by whoever spawned a controller.
#[derive(Clone)]
pub struct ScanHandle {
    control: mpsc::Sender<ScanCommand>,
    state: watch::Receiver<ScanState>,
    events: broadcast::Sender<ScanEvent>,
}

impl ScanHandle {
    pub fn state(&self) -> ScanState {
        self.state.borrow().clone()
    }

    pub async fn retry(&self) -> bool {
        self.control.send(ScanCommand::Retry).await.is_ok()
    }

    pub async fn close(&self) -> bool {
        self.control.send(ScanCommand::Close).await.is_ok()
    }

    /// Events from now on; ends after `Closed`.
    pub fn subscribe(&self) -> BoxStream<'static, ScanEvent> {
        stream::unfold(Some(self.events.subscribe()), |rx| async move {
            let mut rx = rx?;
            loop {
                match rx.recv().await {
                    Ok(ScanEvent::Closed) => return Some((ScanEvent::Closed, None)),
                    Ok(event) => return Some((event, Some(rx))),
                    Err(RecvError::Lagged(missed)) => {
                        log::warn!("Scan event subscriber lagged behind by {} events", missed);
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}

/// Starts a controller on its own task.
pub fn spawn<D>(
    device: D,
    decoder: Arc<dyn QrDecoder>,
    sink: Arc<dyn ScanSink>,
    timing: ScanTiming,
) -> ScanHandle
where
    D: CaptureDevice + 'static,
    D::Stream: 'static,
{
    let controller = ScanController::new(device, decoder, sink, timing);
    let (control, commands) = mpsc::channel(CONTROL_CAPACITY);
    let handle = ScanHandle {
        control,
        state: controller.watch_state(),
        events: controller.events(),
    };
    tokio::spawn(controller.run(commands));
    handle
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::camera::tests::FakeDevice;
    use crate::scanner::camera::ConstraintProfile;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    struct FakeDecoder {
        calls: Arc<AtomicUsize>,
        text: Option<&'static str>,
    }

    impl QrDecoder for FakeDecoder {
        fn decode(&self, _frame: &RasterBuffer) -> Option<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.text.map(str::to_string)
        }
    }

    #[derive(Default)]
    struct FakeSink {
        delivered: Mutex<Vec<ScannedPayload>>,
    }

    #[async_trait]
    impl ScanSink for FakeSink {
        async fn deliver(&self, payload: ScannedPayload) -> ScanReport {
            self.delivered.lock().unwrap().push(payload.clone());
            ScanReport {
                accepted: true,
                message: "ok".into(),
                payload,
            }
        }
    }

    fn timing() -> ScanTiming {
        ScanTiming {
            sample_interval: Duration::from_millis(100),
            cooldown: Duration::from_millis(3000),
            ready_timeout: Duration::from_millis(1000),
            idle_timeout: Duration::from_millis(60_000),
        }
    }

    fn works(_: &ConstraintProfile) -> Result<(), CameraErrorKind> {
        Ok(())
    }

    fn decoder(text: Option<&'static str>) -> (Arc<AtomicUsize>, Arc<dyn QrDecoder>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let decoder = FakeDecoder {
            calls: calls.clone(),
            text,
        };
        (calls, Arc::new(decoder))
    }

    #[tokio::test(start_paused = true)]
    async fn only_the_first_decode_of_an_epoch_counts() {
        let (calls, decoder) = decoder(Some("202210042"));
        let sink = Arc::new(FakeSink::default());
        let mut controller = ScanController::new(FakeDevice::new(works), decoder, sink, timing());

        controller.start().await;
        assert_eq!(controller.state(), &ScanState::Scanning);
        let first_epoch = controller.epoch();

        let payload = controller.sample().unwrap();
        assert_eq!(payload.student_id, "202210042");
        assert!(controller.sample().is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(controller.begin_cooldown().is_some());
        assert!(controller.sample().is_none());
        assert!(controller.resume());
        assert_eq!(controller.epoch(), first_epoch + 1);
        assert!(controller.sample().is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_acquisition_never_samples() {
        let (calls, decoder) = decoder(Some("202210042"));
        let device = FakeDevice::new(|_| Err(CameraErrorKind::DeviceNotFound));
        let handle = spawn(device, decoder, Arc::new(FakeSink::default()), timing());

        time::sleep(Duration::from_secs(5)).await;
        assert!(matches!(
            handle.state(),
            ScanState::Error {
                kind: CameraErrorKind::DeviceNotFound,
                ..
            }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn permission_denied_is_reported_as_such() {
        let (_, decoder) = decoder(None);
        let device = FakeDevice::new(|_| Err(CameraErrorKind::PermissionDenied));
        let mut controller =
            ScanController::new(device, decoder, Arc::new(FakeSink::default()), timing());
        controller.start().await;
        assert!(matches!(
            controller.state(),
            ScanState::Error {
                kind: CameraErrorKind::PermissionDenied,
                ..
            }
        ));
        assert!(controller.sample().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn detection_is_delivered_then_scanning_resumes() {
        let (_, decoder) = decoder(Some("202210042"));
        let sink = Arc::new(FakeSink::default());
        let handle = spawn(FakeDevice::new(works), decoder, sink.clone(), timing());
        let mut events = handle.subscribe();

        assert_eq!(events.next().await, Some(ScanEvent::Started));
        assert!(matches!(events.next().await, Some(ScanEvent::Detected { .. })));
        assert!(matches!(events.next().await, Some(ScanEvent::Recorded { .. })));
        assert_eq!(handle.state(), ScanState::Cooldown);
        assert_eq!(sink.delivered.lock().unwrap().len(), 1);
        assert_eq!(events.next().await, Some(ScanEvent::Resumed));

        handle.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn closing_mid_cooldown_stops_sampling_and_releases_camera() {
        let (calls, decoder) = decoder(Some("202210042"));
        let device = FakeDevice::new(works);
        let stops = device.stops.clone();
        let handle = spawn(device, decoder, Arc::new(FakeSink::default()), timing());
        let mut events = handle.subscribe();

        while !matches!(events.next().await, Some(ScanEvent::Detected { .. })) {}
        time::sleep(Duration::from_millis(10)).await;
        assert_eq!(handle.state(), ScanState::Cooldown);
        let decodes = calls.load(Ordering::SeqCst);

        assert!(handle.close().await);
        time::sleep(Duration::from_secs(10)).await;

        assert_eq!(handle.state(), ScanState::Closed);
        assert_eq!(calls.load(Ordering::SeqCst), decodes);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_leaves_error_only() {
        let (_, decoder) = decoder(None);
        let device = FakeDevice::new(|_| Err(CameraErrorKind::DeviceBusy));
        let tried = device.tried.clone();
        let mut controller =
            ScanController::new(device, decoder, Arc::new(FakeSink::default()), timing());

        controller.start().await;
        let attempts = tried.lock().unwrap().len();
        controller.retry().await;
        assert_eq!(tried.lock().unwrap().len(), attempts * 2);

        controller.close();
        controller.retry().await;
        assert_eq!(controller.state(), &ScanState::Closed);
        assert_eq!(tried.lock().unwrap().len(), attempts * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reports_after_close_are_dropped() {
        let (_, decoder) = decoder(None);
        let mut controller = ScanController::new(
            FakeDevice::new(works),
            decoder,
            Arc::new(FakeSink::default()),
            timing(),
        );
        let mut events = controller.events().subscribe();
        controller.close();
        controller.report(ScanReport {
            accepted: true,
            message: "late".into(),
            payload: interpret("202210042"),
        });
        assert_eq!(events.recv().await.unwrap(), ScanEvent::Closed);
        assert!(events.try_recv().is_err());
    }
}
