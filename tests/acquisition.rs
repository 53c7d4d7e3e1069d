use std::fs;
use std::sync::Arc;

use serde_json::{json, Map, Value};

use forceplate_acq::drivers::SimulatedDriverFactory;
use forceplate_acq::types::PLATFORM_LABELS;
use forceplate_acq::{AcquisitionSession, ConfigStore, FileManager, OutputFormat, SensorManager};

fn platform_config(value: f64) -> Value {
    let mut sensors = Map::new();
    let mut ids = Vec::new();
    for (i, label) in PLATFORM_LABELS.iter().enumerate() {
        let id = format!("plate_{i}");
        sensors.insert(
            id.clone(),
            json!({
                "name": format!("plate{label}"),
                "type": "SENSOR_LOADCELL",
                "read": true,
                "connection": {"serial": "500", "channel": i},
                "properties": {"simulated_value": value}
            }),
        );
        ids.push(id);
    }
    sensors.insert(
        "lc".into(),
        json!({
            "name": "lc",
            "type": "SENSOR_LOADCELL",
            "read": true,
            "connection": {"serial": "600", "channel": 0},
            "properties": {"simulated_value": 5.0},
            "calibration": {"slope": 2.0, "intercept": -1.0}
        }),
    );
    json!({
        "settings": {"filter": {"enabled": false}},
        "sensor_groups": {
            "plate": {"name": "Plate", "type": "GROUP_PLATFORM", "read": true, "sensor_list": ids},
            "single": {"name": "Single", "type": "GROUP_DEFAULT", "read": true, "sensor_list": ["lc"]}
        },
        "sensors": sensors
    })
}

fn session(config: Value) -> AcquisitionSession {
    AcquisitionSession::new(SensorManager::new(
        ConfigStore::from_value(config),
        Arc::new(SimulatedDriverFactory::default()),
    ))
}

fn record(session: &mut AcquisitionSession, ticks: u64) {
    assert!(session.check_connections());
    session.start().unwrap();
    for i in 0..ticks {
        session.register_tick_at(1_000 + i * 10).unwrap();
    }
    session.stop().unwrap();
}

#[test]
fn constant_platform_sums_forces_and_centres_cop() {
    let mut session = session(platform_config(1.0));
    record(&mut session, 10);
    let data = session.data();
    let plate = session.manager().group("plate").unwrap();
    assert!(plate.is_platform_ready());

    let headers: Vec<String> = plate.sensors(true, None).iter().map(|s| s.name().to_string()).collect();
    let forces = data.platform_forces(&headers);
    assert_eq!(forces.fx, vec![4.0; 10]);
    assert_eq!(forces.fy, vec![4.0; 10]);
    assert_eq!(forces.fz, vec![4.0; 10]);

    let cop = data.platform_cop("plate").unwrap();
    assert_eq!(cop.x.len(), 10);
    assert!(cop.x.iter().chain(&cop.y).all(|v| *v == 0.0));
}

#[test]
fn default_group_loadcell_is_calibrated() {
    let mut session = session(platform_config(1.0));
    record(&mut session, 3);
    let calibrated = session.data().calibrated_frame(None).unwrap();
    assert_eq!(calibrated.column_vec("lc"), Some(vec![9.0; 3]));
    let raw = session.data().raw_frame(None).unwrap();
    assert_eq!(raw.column_vec("lc"), Some(vec![5.0; 3]));
}

#[test]
fn tare_shifts_intercept_by_window_mean() {
    let mut session = session(platform_config(3.0));
    assert!(session.check_connections());
    session.start().unwrap();
    for i in 0..10 {
        session.register_tick_at(1_000 + i * 10).unwrap();
    }
    let means = session.tare(1_020, 1_050).unwrap();
    assert_eq!(means.get("plate_0"), Some(&3.0));
    session.stop().unwrap();

    let manager = session.manager();
    let plate = manager.group("plate").unwrap();
    assert!(plate.intercepts().values().all(|b| *b == -3.0));
    // Default groups are never tared.
    assert_eq!(manager.find_sensor("lc").unwrap().intercept(), -1.0);
    assert_eq!(
        manager.config().get("sensors.plate_0.calibration.intercept"),
        Some(&json!(-3.0))
    );
}

#[test]
fn results_round_trip_through_csv() {
    let dir = std::env::temp_dir().join(format!("fpacq-it-{}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();

    let mut session = session(platform_config(0.123456789));
    record(&mut session, 5);
    let files = FileManager::new(&dir);
    let first = files
        .save_results("Test", session.data().results(), OutputFormat::Csv)
        .unwrap()
        .unwrap();
    let second = files
        .save_results("Test", session.data().results(), OutputFormat::Csv)
        .unwrap()
        .unwrap();
    assert!(first.ends_with("Test.csv"));
    assert!(second.ends_with("Test_1.csv"));
    assert_eq!(files.check_duplicated_name("Test", "csv"), "Test_2");

    let (timestamps, frame) = FileManager::load_csv(&first).unwrap();
    let original = &session.data().results().calibrated;
    assert_eq!(timestamps, session.data().timestamps());
    assert_eq!(frame.headers(), original.headers());
    for (a, b) in frame.values().iter().zip(original.values().iter()) {
        assert!((a - b).abs() <= b.abs() * 1e-6);
    }
    fs::remove_dir_all(&dir).ok();
}
