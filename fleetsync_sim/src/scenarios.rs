//! Fault scenarios for deterministic simulation.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// FS-001: phones come online mid-run and take over from the generator
    LiveTakeover,

    /// FS-002: delayed and reordered relay traffic, producer timestamps
    OutOfOrder,

    /// FS-003: heavy relay corruption
    MalformedFlood,

    /// FS-004: tracking paused and resumed while the relay keeps flowing
    PauseResume,

    /// FS-005: the map rejects a share of marker operations
    SurfaceFaults,

    /// FS-006: phones lose geolocation and their records age out
    StaleFeed,

    /// FS-007: 200 drivers, 40 phones, lossy relay
    FleetScale,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::LiveTakeover,
            ScenarioId::OutOfOrder,
            ScenarioId::MalformedFlood,
            ScenarioId::PauseResume,
            ScenarioId::SurfaceFaults,
            ScenarioId::StaleFeed,
            ScenarioId::FleetScale,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::LiveTakeover => "live_takeover",
            ScenarioId::OutOfOrder => "out_of_order",
            ScenarioId::MalformedFlood => "malformed_flood",
            ScenarioId::PauseResume => "pause_resume",
            ScenarioId::SurfaceFaults => "surface_faults",
            ScenarioId::StaleFeed => "stale_feed",
            ScenarioId::FleetScale => "fleet_scale",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::LiveTakeover => "Phones start after 10s, live drivers leave the generator for good",
            ScenarioId::OutOfOrder => "0-1500ms delay and 30% reordering, stale fixes never overwrite newer ones",
            ScenarioId::MalformedFlood => "40% corrupted frames, ignored without touching the store",
            ScenarioId::PauseResume => "Pause for 15s mid-run, store frozen except for live fixes",
            ScenarioId::SurfaceFaults => "30% marker operation failures, map converges once healed",
            ScenarioId::StaleFeed => "Geolocation denied, stale markers evicted after 10s",
            ScenarioId::FleetScale => "200 drivers, 40 phones, 10% relay loss",
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "live_takeover" | "livetakeover" | "fs-001" => Ok(ScenarioId::LiveTakeover),
            "out_of_order" | "outoforder" | "fs-002" => Ok(ScenarioId::OutOfOrder),
            "malformed_flood" | "malformedflood" | "fs-003" => Ok(ScenarioId::MalformedFlood),
            "pause_resume" | "pauseresume" | "fs-004" => Ok(ScenarioId::PauseResume),
            "surface_faults" | "surfacefaults" | "fs-005" => Ok(ScenarioId::SurfaceFaults),
            "stale_feed" | "stalefeed" | "fs-006" => Ok(ScenarioId::StaleFeed),
            "fleet_scale" | "fleetscale" | "fs-007" => Ok(ScenarioId::FleetScale),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_parse_back() {
        for scenario in ScenarioId::all() {
            assert_eq!(scenario.name().parse::<ScenarioId>(), Ok(scenario));
            assert!(!scenario.description().is_empty());
        }
        assert_eq!("FS-003".parse::<ScenarioId>(), Ok(ScenarioId::MalformedFlood));
        assert!("split_brain".parse::<ScenarioId>().is_err());
    }
}
