//! Map rendering surface contract.
//!
//! The engine never draws anything itself. It drives an external map widget
//! through [`MapSurface`], which mirrors the marker API of the dashboard map:
//! create, move, update content, remove, and a click callback per marker.
//!
//! [`InMemorySurface`] is a headless implementation that keeps the rendered
//! state and an operation log, used by tests and the simulation harness.

use crate::fleet_store::{DriverStatus, LatLng, LocationSource};
use fleetsync_env::DriverId;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Callback invoked when the user clicks a marker.
pub type ClickCallback = Arc<dyn Fn(DriverId) + Send + Sync>;

// ============================================================================
// MARKER CONTENT
// ============================================================================

/// Marker fill colour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerColor {
    /// Active driver
    Green,
    /// Active driver flagged for attention
    Red,
    /// Offline or stale driver
    Grey,
}

impl MarkerColor {
    pub fn hex(&self) -> &'static str {
        match self {
            Self::Green => "#10b981",
            Self::Red => "#ef4444",
            Self::Grey => "#6b7280",
        }
    }
}

/// Everything the surface shows for one driver apart from its position.
///
/// Two contents compare equal exactly when the rendered marker would look the
/// same, which is what lets the reconciler skip redundant updates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarkerContent {
    pub title: String,
    pub vehicle_id: String,
    pub color: MarkerColor,
    /// "active", "offline" or "stale"
    pub status_label: String,
    pub source: LocationSource,
    pub trips: u32,
    pub earnings_label: String,
    /// Driver requires attention
    pub attention: bool,
    pub stale: bool,
}

impl MarkerContent {
    /// Colour rule of the fleet map.
    pub fn color_for(status: DriverStatus, red_flag: bool, stale: bool) -> MarkerColor {
        match (status, stale) {
            (DriverStatus::Offline, _) | (_, true) => MarkerColor::Grey,
            (DriverStatus::Active, false) if red_flag => MarkerColor::Red,
            (DriverStatus::Active, false) => MarkerColor::Green,
        }
    }

    /// Popup markup shown when the marker is opened.
    pub fn popup_html(&self) -> String {
        let mut html = String::from("<div class=\"p-2\">");
        html.push_str(&format!(
            "<h3 class=\"font-semibold text-gray-900\">{}</h3>",
            escape_html(&self.title)
        ));
        html.push_str(&format!(
            "<p class=\"text-sm text-gray-600\">Status: {}</p>",
            self.status_label
        ));
        html.push_str(&format!(
            "<p class=\"text-sm text-gray-600\">Trips: {}</p>",
            self.trips
        ));
        html.push_str(&format!(
            "<p class=\"text-sm text-gray-600\">Earnings: {}</p>",
            self.earnings_label
        ));
        if self.source == LocationSource::Live {
            html.push_str("<p class=\"text-sm text-green-600\">Live GPS</p>");
        }
        if self.attention {
            html.push_str("<p class=\"text-sm text-red-600 font-medium\">⚠️ Requires attention</p>");
        }
        html.push_str("</div>");
        html
    }
}

/// Dollar amount with thousands separators, e.g. `$1,250` or `$980.50`.
pub fn format_earnings(amount: f64) -> String {
    if !amount.is_finite() {
        return "$0".to_string();
    }

    let cents = (amount.abs() * 100.0).round() as u64;
    let whole = cents / 100;
    let frac = cents % 100;

    let digits = whole.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    let sign = if amount < 0.0 && cents > 0 { "-" } else { "" };
    if frac == 0 {
        format!("{sign}${grouped}")
    } else {
        format!("{sign}${grouped}.{frac:02}")
    }
}

fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

// ============================================================================
// SURFACE CONTRACT
// ============================================================================

/// Marker operations the engine issues against the map widget.
///
/// Every call may fail; the reconciler logs the failure and retries the
/// driver on its next pass.
pub trait MapSurface: Send {
    fn create_marker(
        &mut self,
        id: DriverId,
        position: LatLng,
        content: &MarkerContent,
    ) -> Result<(), SurfaceError>;

    fn move_marker(&mut self, id: DriverId, position: LatLng) -> Result<(), SurfaceError>;

    fn update_marker_content(
        &mut self,
        id: DriverId,
        content: &MarkerContent,
    ) -> Result<(), SurfaceError>;

    fn remove_marker(&mut self, id: DriverId) -> Result<(), SurfaceError>;

    /// Register the click handler for an existing marker.
    fn on_marker_click(&mut self, id: DriverId, callback: ClickCallback) -> Result<(), SurfaceError>;
}

/// One operation as seen by the surface, for logs and assertions.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MarkerOp {
    Create { id: DriverId, position: LatLng },
    Move { id: DriverId, position: LatLng },
    UpdateContent { id: DriverId },
    Remove { id: DriverId },
    RegisterClick { id: DriverId },
}

impl MarkerOp {
    pub fn driver_id(&self) -> DriverId {
        match self {
            Self::Create { id, .. }
            | Self::Move { id, .. }
            | Self::UpdateContent { id }
            | Self::Remove { id }
            | Self::RegisterClick { id } => *id,
        }
    }
}

// ============================================================================
// IN-MEMORY SURFACE
// ============================================================================

/// A marker as currently rendered.
#[derive(Clone)]
pub struct RenderedMarker {
    pub position: LatLng,
    pub content: MarkerContent,
    click: Option<ClickCallback>,
}

impl RenderedMarker {
    pub fn has_click_handler(&self) -> bool {
        self.click.is_some()
    }
}

impl std::fmt::Debug for RenderedMarker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderedMarker")
            .field("position", &self.position)
            .field("content", &self.content)
            .field("click", &self.click.is_some())
            .finish()
    }
}

/// Headless surface keeping rendered markers and an operation log.
#[derive(Debug, Default)]
pub struct InMemorySurface {
    markers: BTreeMap<DriverId, RenderedMarker>,
    ops: Vec<MarkerOp>,
}

impl InMemorySurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn marker(&self, id: DriverId) -> Option<&RenderedMarker> {
        self.markers.get(&id)
    }

    pub fn marker_ids(&self) -> Vec<DriverId> {
        self.markers.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    /// Every operation applied so far.
    pub fn ops(&self) -> &[MarkerOp] {
        &self.ops
    }

    /// Drain the operation log.
    pub fn take_ops(&mut self) -> Vec<MarkerOp> {
        std::mem::take(&mut self.ops)
    }

    /// Simulate a user click. Returns false if no handler is registered.
    pub fn click(&self, id: DriverId) -> bool {
        match self.markers.get(&id).and_then(|m| m.click.as_ref()) {
            Some(callback) => {
                callback(id);
                true
            }
            None => false,
        }
    }

    fn existing(&mut self, id: DriverId) -> Result<&mut RenderedMarker, SurfaceError> {
        self.markers
            .get_mut(&id)
            .ok_or(SurfaceError::UnknownMarker(id))
    }
}

impl MapSurface for InMemorySurface {
    fn create_marker(
        &mut self,
        id: DriverId,
        position: LatLng,
        content: &MarkerContent,
    ) -> Result<(), SurfaceError> {
        if self.markers.contains_key(&id) {
            return Err(SurfaceError::DuplicateMarker(id));
        }
        self.markers.insert(
            id,
            RenderedMarker {
                position,
                content: content.clone(),
                click: None,
            },
        );
        self.ops.push(MarkerOp::Create { id, position });
        Ok(())
    }

    fn move_marker(&mut self, id: DriverId, position: LatLng) -> Result<(), SurfaceError> {
        self.existing(id)?.position = position;
        self.ops.push(MarkerOp::Move { id, position });
        Ok(())
    }

    fn update_marker_content(
        &mut self,
        id: DriverId,
        content: &MarkerContent,
    ) -> Result<(), SurfaceError> {
        self.existing(id)?.content = content.clone();
        self.ops.push(MarkerOp::UpdateContent { id });
        Ok(())
    }

    fn remove_marker(&mut self, id: DriverId) -> Result<(), SurfaceError> {
        self.markers
            .remove(&id)
            .ok_or(SurfaceError::UnknownMarker(id))?;
        self.ops.push(MarkerOp::Remove { id });
        Ok(())
    }

    fn on_marker_click(&mut self, id: DriverId, callback: ClickCallback) -> Result<(), SurfaceError> {
        self.existing(id)?.click = Some(callback);
        self.ops.push(MarkerOp::RegisterClick { id });
        Ok(())
    }
}

// ============================================================================
// ERRORS
// ============================================================================

/// Failures reported by a rendering surface.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SurfaceError {
    #[error("No marker for driver {0}")]
    UnknownMarker(DriverId),

    #[error("Marker for driver {0} already exists")]
    DuplicateMarker(DriverId),

    #[error("Surface rejected operation on driver {id}: {reason}")]
    Rejected { id: DriverId, reason: String },

    #[error("Surface unavailable: {0}")]
    Unavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn content(title: &str) -> MarkerContent {
        MarkerContent {
            title: title.to_string(),
            vehicle_id: "DXB-A-12345".to_string(),
            color: MarkerColor::Green,
            status_label: "active".to_string(),
            source: LocationSource::Simulated,
            trips: 24,
            earnings_label: format_earnings(1250.0),
            attention: false,
            stale: false,
        }
    }

    #[test]
    fn test_color_rules() {
        use DriverStatus::*;
        assert_eq!(MarkerContent::color_for(Active, false, false).hex(), "#10b981");
        assert_eq!(MarkerContent::color_for(Active, true, false).hex(), "#ef4444");
        assert_eq!(MarkerContent::color_for(Offline, true, false).hex(), "#6b7280");
        assert_eq!(MarkerContent::color_for(Active, true, true), MarkerColor::Grey);
    }

    #[test]
    fn test_format_earnings() {
        assert_eq!(format_earnings(1250.0), "$1,250");
        assert_eq!(format_earnings(980.0), "$980");
        assert_eq!(format_earnings(1234567.5), "$1,234,567.50");
        assert_eq!(format_earnings(0.0), "$0");
        assert_eq!(format_earnings(f64::NAN), "$0");
    }

    #[test]
    fn test_popup_lists_fields() {
        let mut c = content("Ahmed <Al-Rashid>");
        c.attention = true;
        let html = c.popup_html();
        assert!(html.contains("Ahmed &lt;Al-Rashid&gt;"));
        assert!(html.contains("Status: active"));
        assert!(html.contains("Trips: 24"));
        assert!(html.contains("Earnings: $1,250"));
        assert!(html.contains("Requires attention"));
    }

    #[test]
    fn test_surface_lifecycle_and_log() {
        let mut surface = InMemorySurface::new();
        let id = DriverId(1);

        surface.create_marker(id, LatLng::new(25.2, 55.27), &content("A")).unwrap();
        surface.move_marker(id, LatLng::new(25.21, 55.28)).unwrap();
        surface.update_marker_content(id, &content("B")).unwrap();

        let marker = surface.marker(id).unwrap();
        assert_eq!(marker.position, LatLng::new(25.21, 55.28));
        assert_eq!(marker.content.title, "B");

        surface.remove_marker(id).unwrap();
        assert!(surface.is_empty());
        assert_eq!(surface.take_ops().len(), 4);
        assert!(surface.ops().is_empty());
    }

    #[test]
    fn test_surface_rejects_unknown_and_duplicate() {
        let mut surface = InMemorySurface::new();
        let id = DriverId(7);

        assert_eq!(
            surface.move_marker(id, LatLng::new(0.0, 0.0)),
            Err(SurfaceError::UnknownMarker(id))
        );
        surface.create_marker(id, LatLng::new(0.0, 0.0), &content("A")).unwrap();
        assert_eq!(
            surface.create_marker(id, LatLng::new(0.0, 0.0), &content("A")),
            Err(SurfaceError::DuplicateMarker(id))
        );
    }

    #[test]
    fn test_click_invokes_registered_callback() {
        let mut surface = InMemorySurface::new();
        let clicked = Arc::new(AtomicU64::new(0));
        let sink = clicked.clone();

        surface.create_marker(DriverId(3), LatLng::new(0.0, 0.0), &content("A")).unwrap();
        assert!(!surface.click(DriverId(3)));

        surface
            .on_marker_click(DriverId(3), Arc::new(move |id| sink.store(id.get(), Ordering::SeqCst)))
            .unwrap();
        assert!(surface.click(DriverId(3)));
        assert_eq!(clicked.load(Ordering::SeqCst), 3);
    }
}
