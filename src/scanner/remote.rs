//! Camera fed over HTTP: the operator's browser reports its capture devices
//! and pushes raw RGBA frames, the server runs the scan loop on them.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::{Path, Query};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::{Extension, Json};
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use uuid::Uuid;

use super::camera::{CameraErrorKind, CaptureDevice, ConstraintProfile, FacingMode, VideoStream};
use super::decoder::QrDecoder;
use super::session::{spawn, ScanHandle, ScanSink, ScanState};
use crate::attendance::RecorderSink;
use crate::auth::AdminAuth;
use crate::config::ScanTiming;
use crate::state::AppState;
use crate::{breaks, proceeds, Error, Payload};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceFacing {
    Environment,
    User,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceReport {
    pub label: String,
    pub facing: Option<DeviceFacing>,
    pub max_width: u32,
    pub max_height: u32,
    #[serde(default)]
    pub busy: bool,
}

#[derive(Debug)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub rgba: Bytes,
}

type FrameSlot = Option<Arc<Frame>>;

pub struct RemoteCamera {
    permission_granted: bool,
    devices: Vec<DeviceReport>,
    frames: watch::Receiver<FrameSlot>,
}

impl RemoteCamera {
    pub fn new(
        permission_granted: bool,
        devices: Vec<DeviceReport>,
        frames: watch::Receiver<FrameSlot>,
    ) -> Self {
        Self {
            permission_granted,
            devices,
            frames,
        }
    }

    fn pick(&self, profile: &ConstraintProfile) -> Result<&DeviceReport, CameraErrorKind> {
        if !self.permission_granted {
            return Err(CameraErrorKind::PermissionDenied);
        }
        if self.devices.is_empty() {
            return Err(CameraErrorKind::DeviceNotFound);
        }

        let rear = |d: &&DeviceReport| d.facing == Some(DeviceFacing::Environment);
        let mut candidates: Vec<&DeviceReport> = match profile.facing {
            FacingMode::ExactEnvironment => self.devices.iter().filter(rear).collect(),
            FacingMode::PreferEnvironment if self.devices.iter().any(|d| rear(&d)) => {
                self.devices.iter().filter(rear).collect()
            }
            _ => self.devices.iter().collect(),
        };
        if let Some(min) = profile.min {
            candidates.retain(|d| min.fits_within(d.max_width, d.max_height));
        }
        if candidates.is_empty() {
            return Err(CameraErrorKind::UnsupportedConstraints);
        }
        candidates
            .into_iter()
            .find(|d| !d.busy)
            .ok_or(CameraErrorKind::DeviceBusy)
    }
}

#[async_trait]
impl CaptureDevice for RemoteCamera {
    type Stream = RemoteStream;

    async fn open(&mut self, profile: &ConstraintProfile) -> Result<RemoteStream, CameraErrorKind> {
        let device = self.pick(profile)?;
        log::debug!("Remote camera `{}` picked for `{}`", device.label, profile.name);
        Ok(RemoteStream {
            frames: self.frames.clone(),
            playing: false,
        })
    }
}

pub struct RemoteStream {
    frames: watch::Receiver<FrameSlot>,
    playing: bool,
}

#[async_trait]
impl VideoStream for RemoteStream {
    async fn ready(&mut self) -> Result<(), CameraErrorKind> {
        loop {
            if self.frames.borrow().is_some() {
                return Ok(());
            }
            if self.frames.changed().await.is_err() {
                return Err(CameraErrorKind::Unknown);
            }
        }
    }

    async fn play(&mut self) -> Result<(), CameraErrorKind> {
        self.playing = true;
        Ok(())
    }

    fn resolution(&self) -> (u32, u32) {
        match &*self.frames.borrow() {
            Some(frame) => (frame.width, frame.height),
            None => (0, 0),
        }
    }

    fn capture(&mut self, pixels: &mut [u8]) -> Result<bool, CameraErrorKind> {
        if !self.playing {
            return Ok(false);
        }
        let frame = self.frames.borrow().clone();
        match frame {
            Some(frame) if frame.rgba.len() == pixels.len() => {
                pixels.copy_from_slice(&frame.rgba);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn stop(&mut self) {
        self.playing = false;
    }
}

/// Upper bound on either side of a pushed frame, whatever the devices report.
pub const MAX_FRAME_SIDE: u32 = 4096;

struct RemoteSession {
    admin_id: Uuid,
    handle: ScanHandle,
    frames: watch::Sender<FrameSlot>,
    max_frame: (u32, u32),
    last_seen_ms: AtomicU64,
}

fn missing(id: Uuid) -> Error {
    Error::not_found(format!("Scan session `{}` does not exist!", id))
}

/// Registry of the remote scan sessions that are currently open.
#[derive(Clone)]
pub struct ScannerHub {
    decoder: Arc<dyn QrDecoder>,
    timing: ScanTiming,
    epoch: Instant,
    sessions: Arc<RwLock<HashMap<Uuid, Arc<RemoteSession>>>>,
}

impl ScannerHub {
    pub fn new(decoder: Arc<dyn QrDecoder>, timing: ScanTiming) -> Self {
        Self {
            decoder,
            timing,
            epoch: Instant::now(),
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub async fn open(
        &self,
        admin_id: Uuid,
        permission_granted: bool,
        devices: Vec<DeviceReport>,
        sink: Arc<dyn ScanSink>,
    ) -> Uuid {
        let max_frame = devices.iter().fold((0, 0), |(w, h), d| {
            (
                w.max(d.max_width.min(MAX_FRAME_SIDE)),
                h.max(d.max_height.min(MAX_FRAME_SIDE)),
            )
        });
        let (frames, frame_rx) = watch::channel(None);
        let camera = RemoteCamera::new(permission_granted, devices, frame_rx);
        let handle = spawn(camera, self.decoder.clone(), sink, self.timing);

        let id = Uuid::new_v4();
        self.sessions.write().await.insert(
            id,
            Arc::new(RemoteSession {
                admin_id,
                handle,
                frames,
                max_frame,
                last_seen_ms: AtomicU64::new(self.now_ms()),
            }),
        );
        log::info!("Opened scan session {} for {}", id, admin_id);
        id
    }

    /// Looks up a session of `owner` and marks it as still in use.
    async fn session(&self, owner: Uuid, id: Uuid) -> Result<Arc<RemoteSession>, Error> {
        let session = self
            .sessions
            .read()
            .await
            .get(&id)
            .filter(|session| session.admin_id == owner)
            .cloned()
            .ok_or_else(|| missing(id))?;
        session.last_seen_ms.store(self.now_ms(), Ordering::Relaxed);
        Ok(session)
    }

    pub async fn push_frame(
        &self,
        owner: Uuid,
        id: Uuid,
        width: u32,
        height: u32,
        rgba: Bytes,
    ) -> Result<(), Error> {
        let session = self.session(owner, id).await?;
        if width == 0 || height == 0 {
            return Err(Error::invalid("`width` and `height` must be positive"));
        }
        let (max_width, max_height) = session.max_frame;
        if width > max_width || height > max_height {
            return Err(Error::invalid(format!(
                "Frame of {}x{} is larger than the reported cameras allow ({}x{})",
                width, height, max_width, max_height
            )));
        }
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|pixels| pixels.checked_mul(4))
            .ok_or_else(|| Error::invalid(format!("Frame of {}x{} is too large", width, height)))?;
        if rgba.len() != expected {
            return Err(Error::invalid(format!(
                "Expected {} bytes of RGBA for {}x{}, got {}",
                expected,
                width,
                height,
                rgba.len()
            )));
        }
        session
            .frames
            .send_replace(Some(Arc::new(Frame { width, height, rgba })));
        Ok(())
    }

    pub async fn state(&self, owner: Uuid, id: Uuid) -> Result<ScanState, Error> {
        Ok(self.session(owner, id).await?.handle.state())
    }

    pub async fn handle(&self, owner: Uuid, id: Uuid) -> Result<ScanHandle, Error> {
        Ok(self.session(owner, id).await?.handle.clone())
    }

    /// Removes every session `which` selects and closes its controller.
    async fn evict<F>(&self, reason: &str, mut which: F) -> usize
    where
        F: FnMut(&Uuid, &RemoteSession) -> bool,
    {
        let evicted: Vec<(Uuid, Arc<RemoteSession>)> = {
            let mut sessions = self.sessions.write().await;
            let ids: Vec<Uuid> = sessions
                .iter()
                .filter(|(id, session)| which(*id, session.as_ref()))
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| sessions.remove(&id).map(|session| (id, session)))
                .collect()
        };
        for (id, session) in &evicted {
            session.handle.close().await;
            log::info!(
                "Closed scan session {} opened by {} ({})",
                id,
                session.admin_id,
                reason
            );
        }
        evicted.len()
    }

    pub async fn close(&self, owner: Uuid, id: Uuid) -> Result<(), Error> {
        let closed = self
            .evict("closed by operator", |sid, session| {
                *sid == id && session.admin_id == owner
            })
            .await;
        if closed == 0 {
            return Err(missing(id));
        }
        Ok(())
    }

    pub async fn close_owned_by(&self, owner: Uuid) -> usize {
        self.evict("operator logged out", |_, session| session.admin_id == owner)
            .await
    }

    /// Closes sessions that saw no frame or request for the idle timeout.
    pub async fn reap_idle(&self) -> usize {
        let now = self.now_ms();
        let idle = self.timing.idle_timeout.as_millis() as u64;
        self.evict("idle", |_, session| {
            now.saturating_sub(session.last_seen_ms.load(Ordering::Relaxed)) >= idle
        })
        .await
    }

    pub fn spawn_reaper(&self) -> JoinHandle<()> {
        let hub = self.clone();
        let period = (self.timing.idle_timeout / 2).max(Duration::from_millis(100));
        tokio::spawn(async move {
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let reaped = hub.reap_idle().await;
                if reaped > 0 {
                    log::info!("Reaped {} idle scan session(s)", reaped);
                }
            }
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenScanner {
    pub permission_granted: bool,
    #[serde(default)]
    pub devices: Vec<DeviceReport>,
    pub event_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScannerStatus {
    pub session_id: Uuid,
    pub state: ScanState,
}

#[derive(Debug, Clone, Serialize)]
pub struct FrameAccepted {
    pub session_id: Uuid,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScannerClosed {
    pub session_id: Uuid,
}

pub async fn open_scanner(
    auth: AdminAuth,
    Json(body): Json<OpenScanner>,
    Extension(state): Extension<Arc<AppState>>,
) -> Payload<ScannerStatus> {
    let sink = Arc::new(RecorderSink {
        recorder: state.recorder.clone(),
        event_name: body.event_name,
    });
    let session_id = state
        .scanners
        .open(auth.admin.id, body.permission_granted, body.devices, sink)
        .await;
    proceeds(ScannerStatus {
        session_id,
        state: state.scanners.state(auth.admin.id, session_id).await?,
    })
}

pub async fn push_frame(
    auth: AdminAuth,
    Path(session_id): Path<Uuid>,
    Query(size): Query<FrameSize>,
    Extension(state): Extension<Arc<AppState>>,
    body: Bytes,
) -> Payload<FrameAccepted> {
    match state
        .scanners
        .push_frame(auth.admin.id, session_id, size.width, size.height, body)
        .await
    {
        Ok(()) => proceeds(FrameAccepted {
            session_id,
            width: size.width,
            height: size.height,
        }),
        Err(err) => breaks(err),
    }
}

pub async fn scanner_state(
    auth: AdminAuth,
    Path(session_id): Path<Uuid>,
    Extension(state): Extension<Arc<AppState>>,
) -> Payload<ScannerStatus> {
    proceeds(ScannerStatus {
        session_id,
        state: state.scanners.state(auth.admin.id, session_id).await?,
    })
}

pub async fn scanner_events(
    auth: AdminAuth,
    Path(session_id): Path<Uuid>,
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, Error> {
    let handle = state.scanners.handle(auth.admin.id, session_id).await?;
    let events = handle.subscribe().map(|event| {
        Ok(Event::default()
            .event("scan")
            .data(serde_json::to_string(&event).unwrap_or_default()))
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

pub async fn retry_scanner(
    auth: AdminAuth,
    Path(session_id): Path<Uuid>,
    Extension(state): Extension<Arc<AppState>>,
) -> Payload<ScannerStatus> {
    let handle = state.scanners.handle(auth.admin.id, session_id).await?;
    if !handle.retry().await {
        return breaks(Error::not_found(format!(
            "Scan session `{}` has already ended",
            session_id
        )));
    }
    proceeds(ScannerStatus {
        session_id,
        state: handle.state(),
    })
}

pub async fn close_scanner(
    auth: AdminAuth,
    Path(session_id): Path<Uuid>,
    Extension(state): Extension<Arc<AppState>>,
) -> Payload<ScannerClosed> {
    state.scanners.close(auth.admin.id, session_id).await?;
    proceeds(ScannerClosed { session_id })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::camera::{acquire, default_profiles};
    use crate::scanner::session::{ScanEvent, ScanReport};
    use crate::scanner::RqrrDecoder;
    use crate::payload::ScannedPayload;
    use futures::stream::BoxStream;
    use std::time::Duration;

    fn device(label: &str, facing: Option<DeviceFacing>, busy: bool) -> DeviceReport {
        DeviceReport {
            label: label.into(),
            facing,
            max_width: 1280,
            max_height: 720,
            busy,
        }
    }

    fn camera(permission: bool, devices: Vec<DeviceReport>) -> RemoteCamera {
        let (_, rx) = watch::channel(None);
        RemoteCamera::new(permission, devices, rx)
    }

    #[tokio::test]
    async fn reported_devices_map_to_camera_errors() {
        let profiles = default_profiles();
        let denied = acquire(&mut camera(false, vec![device("rear", None, false)]), &profiles).await;
        assert_eq!(denied.err(), Some(CameraErrorKind::PermissionDenied));

        let missing = acquire(&mut camera(true, vec![]), &profiles).await;
        assert_eq!(missing.err(), Some(CameraErrorKind::DeviceNotFound));

        let busy = acquire(&mut camera(true, vec![device("front", None, true)]), &profiles).await;
        assert_eq!(busy.err(), Some(CameraErrorKind::DeviceBusy));
    }

    #[test]
    fn rear_camera_is_preferred() {
        let cam = camera(
            true,
            vec![
                device("front", Some(DeviceFacing::User), false),
                device("rear", Some(DeviceFacing::Environment), false),
            ],
        );
        let picked = cam.pick(&default_profiles()[0]).unwrap();
        assert_eq!(picked.label, "rear");

        let front_only = camera(true, vec![device("front", Some(DeviceFacing::User), false)]);
        assert_eq!(
            front_only.pick(&default_profiles()[0]).err(),
            Some(CameraErrorKind::UnsupportedConstraints)
        );
        assert_eq!(front_only.pick(&default_profiles()[1]).unwrap().label, "front");
    }

    #[tokio::test]
    async fn stream_waits_for_first_frame_and_copies_it() {
        let (tx, rx) = watch::channel(None);
        let mut cam = RemoteCamera::new(true, vec![device("rear", None, false)], rx);
        let mut stream = cam.open(&ConstraintProfile::minimal()).await.unwrap();
        assert_eq!(stream.resolution(), (0, 0));

        tx.send_replace(Some(Arc::new(Frame {
            width: 1,
            height: 1,
            rgba: Bytes::from_static(&[1, 2, 3, 4]),
        })));
        stream.ready().await.unwrap();
        stream.play().await.unwrap();
        assert_eq!(stream.resolution(), (1, 1));

        let mut pixels = [0u8; 4];
        assert!(stream.capture(&mut pixels).unwrap());
        assert_eq!(pixels, [1, 2, 3, 4]);
        let mut wrong_size = [0u8; 8];
        assert!(!stream.capture(&mut wrong_size).unwrap());
    }

    struct NullSink;

    #[async_trait]
    impl ScanSink for NullSink {
        async fn deliver(&self, payload: ScannedPayload) -> ScanReport {
            ScanReport {
                accepted: false,
                message: String::new(),
                payload,
            }
        }
    }

    fn hub() -> ScannerHub {
        ScannerHub::new(
            Arc::new(RqrrDecoder),
            ScanTiming {
                sample_interval: Duration::from_millis(100),
                cooldown: Duration::from_millis(3000),
                ready_timeout: Duration::from_millis(1000),
                idle_timeout: Duration::from_secs(5),
            },
        )
    }

    async fn open(hub: &ScannerHub, admin: Uuid) -> Uuid {
        hub.open(admin, true, vec![device("rear", None, false)], Arc::new(NullSink))
            .await
    }

    async fn closed(events: &mut BoxStream<'static, ScanEvent>) -> bool {
        while let Some(event) = events.next().await {
            if event == ScanEvent::Closed {
                return true;
            }
        }
        false
    }

    #[tokio::test(start_paused = true)]
    async fn hub_checks_frames_and_closes_sessions() {
        let hub = hub();
        let admin = Uuid::new_v4();
        let id = open(&hub, admin).await;
        let mut events = hub.handle(admin, id).await.unwrap().subscribe();

        assert!(hub.push_frame(admin, id, 2, 2, Bytes::from(vec![0; 15])).await.is_err());
        hub.push_frame(admin, id, 2, 2, Bytes::from(vec![0xff; 16])).await.unwrap();
        assert_eq!(events.next().await, Some(ScanEvent::Started));
        assert_eq!(hub.state(admin, id).await.unwrap(), ScanState::Scanning);

        hub.close(admin, id).await.unwrap();
        assert_eq!(events.next().await, Some(ScanEvent::Closed));
        assert!(matches!(hub.state(admin, id).await, Err(Error::NotFound { .. })));
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected() {
        let hub = hub();
        let admin = Uuid::new_v4();
        let id = open(&hub, admin).await;

        for (width, height) in [(1 << 31, 1 << 31), (u32::MAX, u32::MAX), (1281, 720), (1280, 721)] {
            assert!(
                matches!(
                    hub.push_frame(admin, id, width, height, Bytes::new()).await,
                    Err(Error::InvalidPayload { .. })
                ),
                "{}x{} was accepted",
                width,
                height
            );
        }
        assert!(hub
            .push_frame(admin, id, 1280, 720, Bytes::from(vec![0; 1280 * 720 * 4]))
            .await
            .is_ok());

        let blind = hub.open(admin, true, vec![], Arc::new(NullSink)).await;
        assert!(hub
            .push_frame(admin, blind, 1, 1, Bytes::from_static(&[0; 4]))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn sessions_belong_to_their_admin() {
        let hub = hub();
        let owner = Uuid::new_v4();
        let other = Uuid::new_v4();
        let id = open(&hub, owner).await;

        assert!(matches!(hub.state(other, id).await, Err(Error::NotFound { .. })));
        assert!(matches!(hub.handle(other, id).await, Err(Error::NotFound { .. })));
        assert!(hub
            .push_frame(other, id, 1, 1, Bytes::from_static(&[0; 4]))
            .await
            .is_err());
        assert!(matches!(hub.close(other, id).await, Err(Error::NotFound { .. })));

        assert!(hub.state(owner, id).await.is_ok());
        hub.close(owner, id).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn logging_out_closes_every_session_of_that_admin() {
        let hub = hub();
        let leaving = Uuid::new_v4();
        let staying = Uuid::new_v4();
        let first = open(&hub, leaving).await;
        let second = open(&hub, leaving).await;
        let kept = open(&hub, staying).await;
        let mut events = hub.handle(leaving, first).await.unwrap().subscribe();

        assert_eq!(hub.close_owned_by(leaving).await, 2);
        assert!(closed(&mut events).await);
        assert!(hub.state(leaving, first).await.is_err());
        assert!(hub.state(leaving, second).await.is_err());
        assert!(hub.state(staying, kept).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_sessions_are_closed_and_evicted() {
        let hub = hub();
        let admin = Uuid::new_v4();
        let id = open(&hub, admin).await;
        let mut events = hub.handle(admin, id).await.unwrap().subscribe();
        let reaper = hub.spawn_reaper();

        hub.push_frame(admin, id, 2, 2, Bytes::from(vec![0xff; 16])).await.unwrap();
        assert_eq!(events.next().await, Some(ScanEvent::Started));

        // frames keep the session alive past the idle timeout
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_secs(3)).await;
            hub.push_frame(admin, id, 2, 2, Bytes::from(vec![0xff; 16])).await.unwrap();
        }

        let ended = tokio::time::timeout(Duration::from_secs(30), closed(&mut events)).await;
        assert_eq!(ended, Ok(true));
        assert!(matches!(hub.state(admin, id).await, Err(Error::NotFound { .. })));
        reaper.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_sessions_are_reaped_too() {
        let hub = hub();
        let admin = Uuid::new_v4();
        let id = hub
            .open(admin, false, vec![device("rear", None, false)], Arc::new(NullSink))
            .await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(matches!(
            hub.state(admin, id).await.unwrap(),
            ScanState::Error {
                kind: CameraErrorKind::PermissionDenied,
                ..
            }
        ));

        assert_eq!(hub.reap_idle().await, 0);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(hub.reap_idle().await, 1);
        assert!(hub.state(admin, id).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn camera_that_never_streams_times_out() {
        let hub = hub();
        let admin = Uuid::new_v4();
        let id = open(&hub, admin).await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(matches!(
            hub.state(admin, id).await.unwrap(),
            ScanState::Error {
                kind: CameraErrorKind::Unknown,
                ..
            }
        ));
    }
}
