//! **PresenceMonitor** - decides, from face landmarks, whether a visitor is
//! standing at the kiosk and paying attention.
//!
//! Each analyzed camera frame yields a distance tier (from the normalized
//! inter-eye distance), an attention flag (from the nose offset against the
//! eye midpoint) and a region-of-interest check. A qualifying frame (near or
//! medium, attending, inside the ROI) (re)starts the hold timer; presence only
//! drops once the timer lapses with no qualifying frame in between. Frames
//! without a face, and failed detections, leave the state untouched.

use crate::config::PresenceSettings;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

/// Distance proxy bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceTier {
    Far,
    Medium,
    Near,
}

/// A landmark position in frame pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

/// Landmarks of the most prominent face in one camera frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceLandmarks {
    pub left_eye: Point,
    pub right_eye: Point,
    pub nose: Point,
    pub frame_width: f32,
    pub frame_height: f32,
    /// Detector score, 0..1.
    #[serde(default = "full_confidence")]
    pub confidence: f32,
}

fn full_confidence() -> f32 {
    1.0
}

/// What the landmark detector reported for one frame.
pub type Detection = Result<Option<FaceLandmarks>, String>;

/// Measurements taken from one face.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameReading {
    pub distance: f32,
    pub tier: DistanceTier,
    pub attention: bool,
    pub in_roi: bool,
}

impl FrameReading {
    pub fn qualifies(&self) -> bool {
        self.tier != DistanceTier::Far && self.attention && self.in_roi
    }
}

/// Debounced presence. Owned by the monitor, read-only everywhere else.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceState {
    pub tier: DistanceTier,
    pub attention: bool,
    pub in_roi: bool,
    pub present: bool,
    /// Presence drops at this instant unless another qualifying frame arrives.
    pub hold_until: Option<Instant>,
}

impl PresenceState {
    pub fn absent() -> Self {
        Self {
            tier: DistanceTier::Far,
            attention: false,
            in_roi: false,
            present: false,
            hold_until: None,
        }
    }

    /// State used when presence detection is disabled or the camera is unavailable.
    pub fn always_present() -> Self {
        Self {
            tier: DistanceTier::Near,
            attention: true,
            in_roi: true,
            present: true,
            hold_until: None,
        }
    }
}

impl Default for PresenceState {
    fn default() -> Self {
        Self::absent()
    }
}

pub struct PresenceMonitor {
    settings: PresenceSettings,
    state: PresenceState,
}

impl PresenceMonitor {
    pub fn new(settings: PresenceSettings) -> Self {
        Self {
            settings,
            state: PresenceState::absent(),
        }
    }

    pub fn state(&self) -> &PresenceState {
        &self.state
    }

    /// Classify a normalized inter-eye distance.
    pub fn tier_for(&self, distance: f32) -> DistanceTier {
        if distance >= self.settings.near_threshold {
            DistanceTier::Near
        } else if distance >= self.settings.medium_threshold {
            DistanceTier::Medium
        } else {
            DistanceTier::Far
        }
    }

    pub fn analyze(&self, face: &FaceLandmarks) -> FrameReading {
        let width = face.frame_width.max(1.0);
        let height = face.frame_height.max(1.0);
        let dx = face.right_eye.x - face.left_eye.x;
        let dy = face.right_eye.y - face.left_eye.y;
        let distance = (dx * dx + dy * dy).sqrt() / width;

        let mid_x = (face.left_eye.x + face.right_eye.x) / 2.0;
        let mid_y = (face.left_eye.y + face.right_eye.y) / 2.0;
        let attention = (face.nose.x - mid_x).abs() <= self.settings.attention_tolerance_px;
        let in_roi = self.settings.roi.contains(mid_x / width, mid_y / height);

        FrameReading {
            distance,
            tier: self.tier_for(distance),
            attention,
            in_roi,
        }
    }

    /// Feed one detector result. Returns true when the published state changed.
    pub fn observe(&mut self, detection: Detection, now: Instant) -> bool {
        let face = match detection {
            Ok(Some(face)) => face,
            Ok(None) => return false,
            Err(e) => {
                debug!("landmark detection failed, frame skipped: {}", e);
                return false;
            }
        };
        if face.confidence < self.settings.sensitivity {
            return false;
        }

        let reading = self.analyze(&face);
        let mut next = self.state.clone();
        next.tier = reading.tier;
        next.attention = reading.attention;
        next.in_roi = reading.in_roi;
        if reading.qualifies() {
            if !next.present {
                info!(tier = ?reading.tier, distance = reading.distance, "👤 visitor present");
            }
            next.present = true;
            next.hold_until = Some(now + self.settings.hold());
        }

        let changed = next != self.state;
        self.state = next;
        changed
    }

    /// Drop presence if the hold window has lapsed. Returns true when it did.
    pub fn expire(&mut self, now: Instant) -> bool {
        match self.state.hold_until {
            Some(deadline) if self.state.present && now >= deadline => {
                info!("👋 visitor left (hold window lapsed)");
                self.state = PresenceState::absent();
                true
            }
            _ => false,
        }
    }

    /// Run until the detector feed closes, publishing every state change.
    /// Newer states overwrite older ones in the watch channel.
    ///
    /// A closed feed means the camera is gone: the monitor then publishes
    /// [`PresenceState::always_present`] so the kiosk keeps serving visitors.
    pub async fn run(mut self, mut detections: mpsc::Receiver<Detection>, tx: watch::Sender<PresenceState>) {
        tx.send_replace(self.state.clone());
        loop {
            let deadline = self.state.hold_until.filter(|_| self.state.present);
            tokio::select! {
                detection = detections.recv() => match detection {
                    Some(d) => {
                        if self.observe(d, Instant::now()) {
                            tx.send_replace(self.state.clone());
                        }
                    }
                    None => break,
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if self.expire(Instant::now()) {
                        tx.send_replace(self.state.clone());
                    }
                }
            }
        }
        warn!("camera feed ended, running presence-disabled");
        tx.send_replace(PresenceState::always_present());
    }
}
