//! Property tests for the store, the generator and the reconciler.

use fleetsync_core::{
    parse_relay_message, DriverStore, FleetConfig, GeoBounds, InMemorySurface, LatLng, LocationEvent,
    LocationSource, MarkerSync, MotionConfig, MotionGenerator, RandomWalk, StalenessPolicy,
};
use fleetsync_env::{DriverId, Timestamp};
use fleetsync_sim::{RelayFaults, SimConfig, SimWorld};
use proptest::prelude::*;

fn dubai() -> impl Strategy<Value = LatLng> {
    (25.15f64..25.26, 55.20f64..55.35).prop_map(|(lat, lng)| LatLng::new(lat, lng))
}

fn event() -> impl Strategy<Value = LocationEvent> {
    (1u64..8, dubai(), 0u64..10_000, any::<bool>()).prop_map(|(id, position, ts, live)| {
        if live {
            LocationEvent::live(DriverId(id), position, Timestamp(ts))
        } else {
            LocationEvent::simulated(DriverId(id), position, Timestamp(ts))
        }
    })
}

proptest! {
    #[test]
    fn merge_is_idempotent(events in prop::collection::vec(event(), 1..40), extra in event()) {
        let mut once = DriverStore::with_defaults();
        let mut twice = DriverStore::with_defaults();
        for e in &events {
            once.upsert(e.clone());
            twice.upsert(e.clone());
        }
        once.upsert(extra.clone());
        twice.upsert(extra.clone());
        twice.upsert(extra);

        prop_assert_eq!(once.all(), twice.all());
    }

    #[test]
    fn older_events_never_change_the_record(
        first in dubai(),
        later in prop::collection::vec((dubai(), any::<bool>()), 1..20),
        start in 1_000u64..100_000,
    ) {
        let id = DriverId(1);
        let mut store = DriverStore::with_defaults();
        store.upsert(LocationEvent::simulated(id, first, Timestamp(start)));
        let expected = store.get(id).cloned();

        for (i, (position, live)) in later.into_iter().enumerate() {
            let ts = Timestamp(start - 1 - i as u64);
            let event = if live {
                LocationEvent::live(id, position, ts)
            } else {
                LocationEvent::simulated(id, position, ts)
            };
            prop_assert!(!store.upsert(event).is_applied());
        }

        prop_assert_eq!(store.get(id).cloned(), expected);
    }

    #[test]
    fn live_drivers_reject_simulated_writes(
        live_at in 0u64..1_000,
        offsets in prop::collection::vec(0u64..10_000, 1..20),
        position in dubai(),
    ) {
        let id = DriverId(2);
        let mut store = DriverStore::with_defaults();
        store.upsert(LocationEvent::live(id, position, Timestamp(live_at)));

        for offset in offsets {
            let ts = Timestamp(live_at + offset);
            prop_assert!(!store.upsert(LocationEvent::simulated(id, LatLng::new(25.2, 55.3), ts)).is_applied());
        }

        let record = store.get(id).cloned();
        prop_assert_eq!(record.as_ref().map(|r| r.source), Some(LocationSource::Live));
        prop_assert_eq!(record.map(|r| r.position), Some(position));
    }

    #[test]
    fn generator_stays_in_bounds(seed in any::<u64>(), ticks in 1usize..60, max_speed in 2.0f64..80.0) {
        let motion = MotionConfig { max_speed_mps: max_speed, ..MotionConfig::default() };
        let config = FleetConfig { motion, ..FleetConfig::default() };
        let bounds: GeoBounds = config.bounds;
        let walk = RandomWalk::seeded(seed, &config.motion).unwrap();
        let mut generator = MotionGenerator::new(Box::new(walk), &config).unwrap();
        let mut store = DriverStore::with_defaults();

        for tick in 0..ticks {
            for event in generator.tick(&store, Timestamp(tick as u64 * 3_000)) {
                store.upsert(event);
            }
        }

        for record in store.records() {
            prop_assert!(bounds.contains(&record.position), "{} at {}", record.driver_id, record.position);
        }
    }

    #[test]
    fn reconcile_matches_store_and_is_stable(events in prop::collection::vec(event(), 0..60)) {
        let mut store = DriverStore::with_defaults();
        let mut sync = MarkerSync::new(StalenessPolicy::default());
        let mut surface = InMemorySurface::new();

        for (i, e) in events.into_iter().enumerate() {
            store.upsert(e);
            if i % 5 == 0 {
                sync.reconcile(&store, &mut surface, Timestamp(0));
            }
        }
        sync.reconcile(&store, &mut surface, Timestamp(0));

        prop_assert_eq!(surface.len(), store.len());
        for record in store.records() {
            let rendered = surface.marker(record.driver_id).map(|m| m.position);
            prop_assert_eq!(rendered, Some(record.position));
        }

        let again = sync.reconcile(&store, &mut surface, Timestamp(0));
        prop_assert!(again.is_noop());
    }

    #[test]
    fn relay_parser_never_panics(payload in ".*") {
        let _ = parse_relay_message(&payload);
    }

    #[test]
    fn relay_parser_never_panics_on_json_shapes(
        driver_id in prop_oneof![Just("1".to_string()), Just("\"1\"".to_string()), Just("-5".to_string()), Just("null".to_string())],
        lat in prop_oneof![(-200.0f64..200.0).prop_map(|v| v.to_string()), Just("\"x\"".to_string())],
        extra in prop_oneof![Just(""), Just(",\"speed\":null"), Just(",\"heading\":400")],
    ) {
        let payload = format!(
            "{{\"type\":\"DRIVER_LOCATION_UPDATE\",\"data\":{{\"driverId\":{driver_id},\"location\":{{\"lat\":{lat},\"lng\":55.3,\"timestamp\":1,\"accuracy\":5{extra}}},\"vehicleId\":\"V\",\"driverName\":\"N\"}}}}"
        );
        let _ = parse_relay_message(&payload);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn faulty_worlds_converge(
        seed in any::<u64>(),
        loss in 0.0f64..0.5,
        corrupt in 0.0f64..0.5,
        reorder in 0.0f64..0.5,
        surface_failures in 0.0f64..0.4,
    ) {
        let mut world = SimWorld::new(SimConfig {
            seed,
            drivers: 10,
            live_devices: 3,
            relay: RelayFaults { loss_rate: loss, corrupt_rate: corrupt, reorder_rate: reorder, max_delay_ms: 1_000 },
            surface_failure_rate: surface_failures,
            ..Default::default()
        }).unwrap();

        world.run_for(20.0).unwrap();
        world.flush_relay().unwrap();
        world.converge().unwrap();
    }
}
