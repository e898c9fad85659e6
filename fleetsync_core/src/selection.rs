//! Selected driver and its detail panel.
//!
//! Only the driver id is held. The panel is rebuilt from the store on every
//! render, so it can never show a record older than the store.

use crate::config::StalenessPolicy;
use crate::fleet_store::{DriverLocationRecord, DriverStatus, DriverStore, LatLng, LocationSource};
use crate::surface::format_earnings;
use fleetsync_env::{DriverId, Timestamp};
use serde::Serialize;
use std::sync::Arc;

/// Callback fired when the selected driver changes.
pub type SelectionListener = Arc<dyn Fn(DriverId) + Send + Sync>;

/// Current selection plus the optional `onDriverSelected` listener.
#[derive(Default)]
pub struct Selection {
    selected: Option<DriverId>,
    listener: Option<SelectionListener>,
}

impl Selection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_listener(&mut self, listener: SelectionListener) {
        self.listener = Some(listener);
    }

    /// Select a driver. The listener fires only when the selection changes.
    pub fn select(&mut self, id: DriverId) -> bool {
        if self.selected == Some(id) {
            return false;
        }
        self.selected = Some(id);
        if let Some(listener) = &self.listener {
            listener(id);
        }
        true
    }

    /// Clear the selection. Returns false if nothing was selected.
    pub fn clear(&mut self) -> bool {
        self.selected.take().is_some()
    }

    pub fn selected(&self) -> Option<DriverId> {
        self.selected
    }

    /// Build the panel for the selected driver from the current store.
    pub fn resolve(
        &self,
        store: &DriverStore,
        staleness: &StalenessPolicy,
        now: Timestamp,
    ) -> Option<DriverDetail> {
        let record = store.get(self.selected?)?;
        Some(DriverDetail::from_record(record, staleness.is_record_stale(record, now)))
    }
}

impl std::fmt::Debug for Selection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Selection")
            .field("selected", &self.selected)
            .field("listener", &self.listener.is_some())
            .finish()
    }
}

// ============================================================================
// DETAIL PANEL
// ============================================================================

/// Everything the detail panel shows for one driver.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriverDetail {
    pub driver_id: DriverId,
    pub driver_name: String,
    pub vehicle_id: String,
    pub status: DriverStatus,
    pub source: LocationSource,
    pub position: LatLng,

    /// Rounded km/h, `None` when the device did not report speed
    pub speed_kmh: Option<u32>,
    pub heading: Option<f64>,

    /// "±12 m"
    pub accuracy_label: Option<String>,

    /// "Live GPS" or "Simulated"
    pub provenance: &'static str,

    /// Live source whose feed is still fresh
    pub live_connected: bool,
    pub stale: bool,

    pub last_update: Timestamp,
    pub distance_km: f64,
    pub performance_score: u32,
    pub trips: u32,
    pub earnings_label: String,
    pub red_flag: bool,

    /// Last geolocation failure reported by the driver's device
    pub fault: Option<String>,
}

impl DriverDetail {
    pub fn from_record(record: &DriverLocationRecord, stale: bool) -> Self {
        let provenance = match record.source {
            LocationSource::Live => "Live GPS",
            LocationSource::Simulated => "Simulated",
        };

        Self {
            driver_id: record.driver_id,
            driver_name: record.driver_name.clone(),
            vehicle_id: record.vehicle_id.clone(),
            status: record.status,
            source: record.source,
            position: record.position,
            speed_kmh: record.speed.map(|mps| (mps * 3.6).round() as u32),
            heading: record.heading,
            accuracy_label: record.accuracy.map(|m| format!("±{} m", m.round() as u64)),
            provenance,
            live_connected: record.is_live() && !stale,
            stale,
            last_update: record.last_update,
            distance_km: record.distance_m / 1000.0,
            performance_score: record.performance_score,
            trips: record.trips,
            earnings_label: format_earnings(record.earnings),
            red_flag: record.red_flag,
            fault: None,
        }
    }

    pub fn with_fault(mut self, fault: Option<String>) -> Self {
        self.fault = fault;
        self
    }

    /// Plain-text rendering, one line per field.
    pub fn render_lines(&self) -> Vec<String> {
        let mut lines = vec![
            format!("{} ({})", self.driver_name, self.vehicle_id),
            format!("Status: {}{}", self.status, if self.stale { " (stale)" } else { "" }),
            format!("Source: {}", self.provenance),
            format!("Position: {}", self.position),
        ];

        lines.push(match self.speed_kmh {
            Some(kmh) => format!("Speed: {kmh} km/h"),
            None => "Speed: N/A".to_string(),
        });
        if let Some(heading) = self.heading {
            lines.push(format!("Heading: {heading:.0}°"));
        }
        if let Some(accuracy) = &self.accuracy_label {
            lines.push(format!("Accuracy: {accuracy}"));
        }
        if self.source == LocationSource::Live {
            let feed = if self.live_connected { "connected" } else { "lost" };
            lines.push(format!("Live feed: {feed}"));
        }

        lines.push(format!("Distance: {:.2} km", self.distance_km));
        lines.push(format!("Score: {}  Trips: {}  Earnings: {}", self.performance_score, self.trips, self.earnings_label));

        if self.red_flag {
            lines.push("⚠️ Requires attention".to_string());
        }
        if let Some(fault) = &self.fault {
            lines.push(format!("Location error: {fault}"));
        }
        lines
    }
}
