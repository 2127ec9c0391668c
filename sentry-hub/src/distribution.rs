//! # distribution
//!
//! Fans parsed telemetry out to the crash monitor and to display consumers.
//!
//! The monitor gets motion readings over a bounded mpsc and is awaited, so it
//! sees every reading in arrival order. Display consumers subscribe to
//! broadcasts and may lag without slowing detection. GPS fixes are not sent to
//! the monitor; it reads the latest one from a watch when it needs it.
//!
//! The latest fix and the speed tracker belong to one link. They are dropped
//! whenever the connection's session number moves on.

use sentry_types::schema::Telemetry;
use sentry_types::{GpsFix, SensorReading};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Derives `speed_change` from consecutive fixes.
#[derive(Debug, Default)]
pub struct GpsTracker {
    previous_speed: Option<f64>,
}

impl GpsTracker {
    pub fn observe(&mut self, mut fix: GpsFix) -> GpsFix {
        fix.speed_change = match (fix.speed, self.previous_speed) {
            (Some(now), Some(before)) => Some(now - before),
            _ => None,
        };
        if fix.speed.is_some() {
            self.previous_speed = fix.speed;
        }
        fix
    }

    pub fn reset(&mut self) {
        self.previous_speed = None;
    }
}

/// Subscription side of the distribution stage.
#[derive(Clone)]
pub struct Distribution {
    readings: broadcast::Sender<SensorReading>,
    gps: broadcast::Sender<GpsFix>,
    latest_gps: watch::Receiver<Option<GpsFix>>,
}

impl Distribution {
    /// Start distributing `telemetry`. Motion readings go to `detection` first.
    pub fn spawn(
        mut telemetry: mpsc::Receiver<Telemetry>,
        detection: mpsc::Sender<SensorReading>,
        mut session: watch::Receiver<u64>,
    ) -> (Self, JoinHandle<()>) {
        let (readings, _) = broadcast::channel(256);
        let (gps, _) = broadcast::channel(64);
        let (latest_tx, latest_gps) = watch::channel(None);

        let this = Self { readings: readings.clone(), gps: gps.clone(), latest_gps };
        let task = tokio::spawn(async move {
            let mut tracker = GpsTracker::default();
            let mut detection = Some(detection);
            let mut watching = true;
            loop {
                tokio::select! {
                    item = telemetry.recv() => match item {
                        Some(Telemetry::Motion(reading)) => {
                            if let Some(tx) = &detection {
                                if tx.send(reading.clone()).await.is_err() {
                                    debug!("detection stage gone, display only from now on");
                                    detection = None;
                                }
                            }
                            let _ = readings.send(reading);
                        }
                        Some(Telemetry::Gps(fix)) => {
                            let fix = tracker.observe(fix);
                            if fix.fix {
                                debug!("📍 GPS fix ({:?}, {:?})", fix.latitude, fix.longitude);
                            }
                            latest_tx.send_replace(Some(fix.clone()));
                            let _ = gps.send(fix);
                        }
                        None => break,
                    },
                    changed = session.changed(), if watching => {
                        if changed.is_err() {
                            // lifecycle gone; keep draining telemetry
                            watching = false;
                            continue;
                        }
                        let ended = *session.borrow_and_update();
                        debug!("link torn down (session {ended}), dropping GPS state");
                        tracker.reset();
                        if latest_tx.send_replace(None).is_some() {
                            info!("📍 Cleared last GPS fix");
                        }
                    }
                }
            }
        });
        (this, task)
    }

    pub fn subscribe_readings(&self) -> broadcast::Receiver<SensorReading> {
        self.readings.subscribe()
    }

    pub fn subscribe_gps(&self) -> broadcast::Receiver<GpsFix> {
        self.gps.subscribe()
    }

    pub fn latest_gps(&self) -> Option<GpsFix> {
        self.latest_gps.borrow().clone()
    }

    pub fn gps_watch(&self) -> watch::Receiver<Option<GpsFix>> {
        self.latest_gps.clone()
    }
}
