//! Simulated mobile tracking client.
//!
//! Stands in for the driver's phone: it follows its own trajectory, produces
//! geolocation fixes with noisy accuracy, and packages each fix as a
//! `DRIVER_LOCATION_UPDATE` message for the relay. Geolocation can be denied
//! or lost, in which case the client stops tracking and reports the error
//! once, the way a browser `watchPosition` error ends a session.

use fleetsync_core::fleet_motion::Displacement;
use fleetsync_core::fleet_relay::{LocationUpdate, RelayLocation};
use fleetsync_core::LatLng;
use fleetsync_env::{DriverId, RelayFrame, Timestamp};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal, Uniform};
use std::f64::consts::TAU;
use std::time::Duration;

/// Geolocation failures a tracking client can hit.
///
/// Displays the way the client reports it, e.g. `GPS Error: User denied Geolocation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("GPS Error: {}", self.message())]
pub enum GeolocationError {
    PermissionDenied,
    PositionUnavailable,
    Timeout,
}

impl GeolocationError {
    /// The platform's own error message.
    pub fn message(&self) -> &'static str {
        match self {
            Self::PermissionDenied => "User denied Geolocation",
            Self::PositionUnavailable => "Position unavailable",
            Self::Timeout => "Geolocation request timed out",
        }
    }
}

/// Tracking state of the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Tracking,
    /// The next fix attempt fails with this error, then tracking stops
    Failing(GeolocationError),
    Stopped,
}

/// A driver's phone posting live positions.
pub struct SimulatedDevice {
    driver_id: DriverId,
    driver_name: String,
    vehicle_id: String,
    position: LatLng,
    heading_rad: f64,
    speed_mps: f64,
    state: DeviceState,
    rng: ChaCha8Rng,
    fixes: u64,
}

impl SimulatedDevice {
    pub fn new(
        driver_id: DriverId,
        driver_name: impl Into<String>,
        vehicle_id: impl Into<String>,
        start: LatLng,
        mut rng: ChaCha8Rng,
    ) -> Self {
        let heading_rad = rng.gen_range(0.0..TAU);
        let speed_mps = rng.gen_range(3.0..12.0);
        Self {
            driver_id,
            driver_name: driver_name.into(),
            vehicle_id: vehicle_id.into(),
            position: start,
            heading_rad,
            speed_mps,
            state: DeviceState::Tracking,
            rng,
            fixes: 0,
        }
    }

    /// Advance the device along its trajectory and produce a fix stamped
    /// with the device clock.
    ///
    /// A failing device returns its error once and then stops; a stopped
    /// device returns `Ok(None)`.
    pub fn fix(&mut self, dt: Duration, device_clock: Timestamp) -> Result<Option<LocationUpdate>, GeolocationError> {
        match self.state {
            DeviceState::Stopped => return Ok(None),
            DeviceState::Failing(err) => {
                self.state = DeviceState::Stopped;
                return Err(err);
            }
            DeviceState::Tracking => {}
        }

        // Gentle wandering: heading and speed drift a little each fix
        let turn = Normal::new(0.0, 0.3).map(|n| n.sample(&mut self.rng)).unwrap_or(0.0);
        self.heading_rad = (self.heading_rad + turn).rem_euclid(TAU);
        let accel = Normal::new(0.0, 1.0).map(|n| n.sample(&mut self.rng)).unwrap_or(0.0);
        self.speed_mps = (self.speed_mps + accel).clamp(0.0, 25.0);

        let step = Displacement {
            heading_rad: self.heading_rad,
            speed_mps: self.speed_mps,
            distance_m: self.speed_mps * dt.as_secs_f64(),
        };
        self.position = step.apply(self.position);
        self.fixes += 1;

        let accuracy = Uniform::new(4.0, 25.0).sample(&mut self.rng);
        // Browsers often omit speed/heading while stationary or on the first fix
        let has_motion = self.fixes > 1 && self.speed_mps > 0.5;

        Ok(Some(LocationUpdate {
            driver_id: self.driver_id.get(),
            location: RelayLocation {
                lat: self.position.lat,
                lng: self.position.lng,
                timestamp: device_clock.as_millis(),
                accuracy,
                speed: has_motion.then_some(self.speed_mps),
                heading: has_motion.then(|| step.bearing_deg()),
            },
            vehicle_id: self.vehicle_id.clone(),
            driver_name: self.driver_name.clone(),
        }))
    }

    /// Same as [`fix`](Self::fix), packaged as a relay frame.
    pub fn fix_frame(&mut self, dt: Duration, device_clock: Timestamp) -> Result<Option<RelayFrame>, GeolocationError> {
        let origin = self.origin();
        Ok(self
            .fix(dt, device_clock)?
            .map(|update| RelayFrame::new(update.to_message_json()).with_origin(origin)))
    }

    /// Make the next fix attempt fail with `err`.
    pub fn fail(&mut self, err: GeolocationError) {
        if self.state == DeviceState::Tracking {
            self.state = DeviceState::Failing(err);
        }
    }

    /// Start tracking again (driver granted permission / regained signal).
    pub fn restart(&mut self) {
        self.state = DeviceState::Tracking;
    }

    pub fn stop(&mut self) {
        self.state = DeviceState::Stopped;
    }

    pub fn is_tracking(&self) -> bool {
        self.state == DeviceState::Tracking
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn driver_id(&self) -> DriverId {
        self.driver_id
    }

    pub fn position(&self) -> LatLng {
        self.position
    }

    pub fn fix_count(&self) -> u64 {
        self.fixes
    }

    fn origin(&self) -> String {
        format!("mobile:{}", self.driver_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetsync_core::fleet_relay::{parse_relay_message, RelayMessage};
    use rand::SeedableRng;

    fn device(seed: u64) -> SimulatedDevice {
        SimulatedDevice::new(
            DriverId(1),
            "Ahmed Al-Rashid",
            "DXB-A-12345",
            LatLng::new(25.2048, 55.2708),
            ChaCha8Rng::seed_from_u64(seed),
        )
    }

    #[test]
    fn test_fixes_parse_and_advance() {
        let mut dev = device(1);
        let mut last = dev.position();

        for i in 0..20u64 {
            let frame = dev
                .fix_frame(Duration::from_secs(1), Timestamp(1_000 * i))
                .unwrap()
                .unwrap();
            assert_eq!(frame.origin.as_deref(), Some("mobile:D1"));

            let RelayMessage::DriverLocationUpdate(update) = parse_relay_message(&frame.payload).unwrap();
            assert_eq!(update.location.timestamp, 1_000 * i);
            assert!(update.location.accuracy >= 4.0 && update.location.accuracy < 25.0);

            // Never teleports: at most 25 m/s
            assert!(last.distance_m(&dev.position()) <= 25.0 + 1e-6);
            last = dev.position();
        }
        assert_eq!(dev.fix_count(), 20);
    }

    #[test]
    fn test_denied_reports_once_then_stops() {
        let mut dev = device(2);
        dev.fail(GeolocationError::PermissionDenied);

        assert_eq!(
            dev.fix(Duration::from_secs(1), Timestamp(0)),
            Err(GeolocationError::PermissionDenied)
        );
        assert_eq!(dev.fix(Duration::from_secs(1), Timestamp(1)), Ok(None));
        assert!(!dev.is_tracking());

        dev.restart();
        assert!(dev.fix(Duration::from_secs(1), Timestamp(2)).unwrap().is_some());
    }

    #[test]
    fn test_error_text_matches_client() {
        assert_eq!(
            GeolocationError::PermissionDenied.to_string(),
            "GPS Error: User denied Geolocation"
        );
        assert_eq!(GeolocationError::Timeout.message(), "Geolocation request timed out");
    }

    #[test]
    fn test_same_seed_same_trajectory() {
        let mut a = device(9);
        let mut b = device(9);
        for i in 0..10 {
            let fa = a.fix(Duration::from_secs(1), Timestamp(i)).unwrap();
            let fb = b.fix(Duration::from_secs(1), Timestamp(i)).unwrap();
            assert_eq!(fa, fb);
        }
    }
}
