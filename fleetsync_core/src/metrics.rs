//! Engine Metrics
//! ==============
//!
//! Plain counters kept by the runtime. Nothing here is exported to a
//! collector; hosts read a copy through `FleetEngine::status`.

use crate::fleet_relay::{RelayOutcome, RelayStats};
use crate::fleet_store::MergeOutcome;
use crate::fleet_sync::SyncReport;
use serde::Serialize;

/// Store merge counters, per producer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeCounters {
    pub created: u64,
    pub updated: u64,
    /// Out-of-order events dropped
    pub stale: u64,
    /// Simulated events bounced off a live driver
    pub live_locked: u64,
}

impl MergeCounters {
    pub fn record(&mut self, outcome: &MergeOutcome) {
        match outcome {
            MergeOutcome::Created => self.created += 1,
            MergeOutcome::Updated => self.updated += 1,
            MergeOutcome::Stale { .. } => self.stale += 1,
            MergeOutcome::LiveLocked => self.live_locked += 1,
        }
    }

    /// Merges that changed the store.
    pub fn applied(&self) -> u64 {
        self.created + self.updated
    }

    /// Merges that were no-ops.
    pub fn rejected(&self) -> u64 {
        self.stale + self.live_locked
    }
}

/// Cumulative marker operation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MarkerCounters {
    pub passes: u64,
    pub created: u64,
    pub moved: u64,
    pub updated: u64,
    pub removed: u64,
    pub failed: u64,
}

impl MarkerCounters {
    pub fn record(&mut self, report: &SyncReport) {
        self.passes += 1;
        self.created += report.created as u64;
        self.moved += report.moved as u64;
        self.updated += report.updated as u64;
        self.removed += report.removed as u64;
        self.failed += report.failed as u64;
    }

    pub fn ops(&self) -> u64 {
        self.created + self.moved + self.updated + self.removed
    }
}

/// All engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineMetrics {
    pub ticks: u64,
    pub simulated: MergeCounters,
    pub live: MergeCounters,
    pub relay: RelayStats,
    pub markers: MarkerCounters,
    pub producer_faults: u64,
}

impl EngineMetrics {
    pub fn record_simulated(&mut self, outcome: &MergeOutcome) {
        self.simulated.record(outcome);
    }

    pub fn record_relay(&mut self, outcome: &RelayOutcome, stats: RelayStats) {
        if let RelayOutcome::Merged { outcome, .. } = outcome {
            self.live.record(outcome);
        }
        self.relay = stats;
    }

    pub fn record_sync(&mut self, report: &SyncReport) {
        self.markers.record(report);
    }

    /// Stale plus live-locked drops across both producers.
    pub fn rejected_merges(&self) -> u64 {
        self.simulated.rejected() + self.live.rejected()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetsync_env::{DriverId, Timestamp};

    #[test]
    fn test_merge_counters() {
        let mut counters = MergeCounters::default();
        counters.record(&MergeOutcome::Created);
        counters.record(&MergeOutcome::Updated);
        counters.record(&MergeOutcome::Updated);
        counters.record(&MergeOutcome::LiveLocked);
        counters.record(&MergeOutcome::Stale {
            stored: Timestamp(2),
            incoming: Timestamp(1),
        });

        assert_eq!(counters.applied(), 3);
        assert_eq!(counters.rejected(), 2);
    }

    #[test]
    fn test_marker_counters_accumulate() {
        let mut counters = MarkerCounters::default();
        counters.record(&SyncReport { created: 3, ..Default::default() });
        counters.record(&SyncReport { moved: 2, failed: 1, ..Default::default() });

        assert_eq!(counters.passes, 2);
        assert_eq!(counters.ops(), 5);
        assert_eq!(counters.failed, 1);
    }

    #[test]
    fn test_relay_outcomes_feed_live_counters() {
        let mut metrics = EngineMetrics::default();
        let stats = RelayStats { frames: 2, malformed: 1, merged: 1 };

        metrics.record_relay(
            &RelayOutcome::Merged { driver_id: DriverId(1), outcome: MergeOutcome::Created },
            stats,
        );
        assert_eq!(metrics.live.created, 1);
        assert_eq!(metrics.relay.malformed, 1);
        assert_eq!(metrics.rejected_merges(), 0);
    }
}
