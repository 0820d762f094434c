use async_trait::async_trait;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FacingMode {
    /// Rear camera or nothing.
    ExactEnvironment,
    /// Rear camera when there is one, otherwise any.
    PreferEnvironment,
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.width <= width && self.height <= height
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConstraintProfile {
    pub name: &'static str,
    pub facing: FacingMode,
    pub min: Option<Resolution>,
    pub ideal: Option<Resolution>,
}

impl ConstraintProfile {
    /// Last resort when a device rejected every richer profile.
    pub fn minimal() -> Self {
        Self {
            name: "minimal",
            facing: FacingMode::Any,
            min: None,
            ideal: None,
        }
    }
}

pub fn default_profiles() -> Vec<ConstraintProfile> {
    vec![
        ConstraintProfile {
            name: "rear-hd",
            facing: FacingMode::ExactEnvironment,
            min: Some(Resolution::new(640, 480)),
            ideal: Some(Resolution::new(1280, 720)),
        },
        ConstraintProfile {
            name: "rear-standard",
            facing: FacingMode::PreferEnvironment,
            min: None,
            ideal: Some(Resolution::new(640, 480)),
        },
        ConstraintProfile {
            name: "any-camera",
            facing: FacingMode::Any,
            min: None,
            ideal: Some(Resolution::new(640, 480)),
        },
        ConstraintProfile {
            name: "any-video",
            facing: FacingMode::Any,
            min: None,
            ideal: None,
        },
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraErrorKind {
    PermissionDenied,
    DeviceNotFound,
    DeviceBusy,
    UnsupportedConstraints,
    Unknown,
}

impl CameraErrorKind {
    pub fn message(&self) -> &'static str {
        match self {
            CameraErrorKind::PermissionDenied => {
                "Camera permission denied. Please allow camera access and try again."
            }
            CameraErrorKind::DeviceNotFound => {
                "No camera found. Please connect a camera and try again."
            }
            CameraErrorKind::DeviceBusy => {
                "Camera is already in use by another application. Close it and try again."
            }
            CameraErrorKind::UnsupportedConstraints => {
                "Camera does not support the requested settings. Please try again."
            }
            CameraErrorKind::Unknown => "Unable to access the camera. Please try again.",
        }
    }
}

/// A source of live video that can be opened with a constraint profile.
#[async_trait]
pub trait CaptureDevice: Send {
    type Stream: VideoStream;

    async fn open(&mut self, profile: &ConstraintProfile) -> Result<Self::Stream, CameraErrorKind>;
}

#[async_trait]
pub trait VideoStream: Send {
    /// Resolves once the stream knows its resolution.
    async fn ready(&mut self) -> Result<(), CameraErrorKind>;

    async fn play(&mut self) -> Result<(), CameraErrorKind>;

    /// `(0, 0)` while the resolution is not known yet.
    fn resolution(&self) -> (u32, u32);

    /// Copies the current frame as RGBA into `pixels`, which is sized for the
    /// current resolution. `Ok(false)` when no matching frame is available.
    fn capture(&mut self, pixels: &mut [u8]) -> Result<bool, CameraErrorKind>;

    /// Releases the underlying device.
    fn stop(&mut self);
}

/// Tries each profile in order and returns the first stream that opens.
///
/// When the last failure was `UnsupportedConstraints` the device gets one
/// more attempt with [`ConstraintProfile::minimal`]. A permission denial
/// anywhere along the way is what gets reported, since no other profile
/// could have fixed it.
pub async fn acquire<D: CaptureDevice>(
    device: &mut D,
    profiles: &[ConstraintProfile],
) -> Result<D::Stream, CameraErrorKind> {
    let mut last = CameraErrorKind::DeviceNotFound;
    let mut denied = false;

    for profile in profiles {
        match device.open(profile).await {
            Ok(stream) => {
                log::info!("Camera opened with profile `{}`", profile.name);
                return Ok(stream);
            }
            Err(kind) => {
                log::debug!("Camera profile `{}` failed: {:?}", profile.name, kind);
                denied |= kind == CameraErrorKind::PermissionDenied;
                last = kind;
            }
        }
    }

    if denied {
        return Err(CameraErrorKind::PermissionDenied);
    }
    if last == CameraErrorKind::UnsupportedConstraints {
        log::info!("Every camera profile was rejected, retrying with minimal constraints");
        return device.open(&ConstraintProfile::minimal()).await;
    }
    Err(last)
}

/// Exclusive hold on an opened stream. Releasing is idempotent and also
/// happens on drop.
pub struct CameraLease<S: VideoStream> {
    stream: Option<S>,
}

impl<S: VideoStream> Default for CameraLease<S> {
    fn default() -> Self {
        Self { stream: None }
    }
}

impl<S: VideoStream> CameraLease<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream: Some(stream),
        }
    }

    pub fn stream_mut(&mut self) -> Option<&mut S> {
        self.stream.as_mut()
    }

    pub fn is_held(&self) -> bool {
        self.stream.is_some()
    }

    pub fn release(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.stop();
            log::debug!("Camera released");
        }
    }
}

impl<S: VideoStream> Drop for CameraLease<S> {
    fn drop(&mut self) {
        self.release();
    }
}
