// src/engine.rs
use std::collections::BTreeMap;
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::calibrator::SensorCalibrator;
use crate::session::AcquisitionSession;
use crate::types::*;

const IDLE_SLEEP: Duration = Duration::from_millis(50);

/// 进行中的校准试验
struct CalibrationRun {
    group_id: String,
    sensor_id: String,
    remaining: usize,
    /// 连接由本次试验打开，结束后关闭
    owns_connection: bool,
}

/// 启动采集线程。线程持有会话，调用方通过 `SessionCommand` 控制，
/// 通过 `SessionEvent` 接收结果。
pub fn spawn_thread(
    mut session: AcquisitionSession,
    tx: Sender<SessionEvent>,
    rx_cmd: Receiver<SessionCommand>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        tx.send(SessionEvent::Log("⚙️ Acquisition engine ready.".to_owned())).ok();

        let settings = session.manager().settings().clone();
        let tick = Duration::from_millis(settings.tick_interval_ms.max(1));
        let tare_duration = Duration::from_millis(settings.tare_duration_ms);

        let mut next_tick = Instant::now();
        let mut tare_deadline: Option<Instant> = None;
        let mut calibration: Option<CalibrationRun> = None;
        let mut calibrators: BTreeMap<String, SensorCalibrator> = BTreeMap::new();

        loop {
            // ============================================================
            // 1. 命令处理 (每轮最多 10 条)
            // ============================================================
            for _ in 0..10 {
                let cmd = match rx_cmd.try_recv() {
                    Ok(cmd) => cmd,
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        if session.is_running() {
                            session.stop().ok();
                        }
                        return;
                    }
                };
                match cmd {
                    SessionCommand::CheckConnections => {
                        if calibration.is_some() {
                            tx.send(SessionEvent::Log("Calibration trial running, check skipped".to_owned())).ok();
                        } else if session.is_running() {
                            tx.send(SessionEvent::Log("Session running, check skipped".to_owned())).ok();
                        } else {
                            let connected = session.check_connections();
                            tx.send(SessionEvent::Connected(connected)).ok();
                        }
                    }
                    SessionCommand::Start if calibration.is_some() => {
                        tx.send(SessionEvent::Log("❌ Start refused: calibration trial running".to_owned())).ok();
                    }
                    SessionCommand::Start => match session.start() {
                        Ok(()) => {
                            next_tick = Instant::now();
                            tx.send(SessionEvent::Running(true)).ok();
                            tx.send(SessionEvent::Log("🌊 Recording started".to_owned())).ok();
                        }
                        Err(e) => {
                            tx.send(SessionEvent::Log(format!("❌ Start failed: {e}"))).ok();
                        }
                    },
                    SessionCommand::Stop => {
                        tare_deadline = None;
                        match session.stop() {
                            Ok(()) => {
                                tx.send(SessionEvent::Running(false)).ok();
                                tx.send(SessionEvent::Finished(Box::new(session.data().clone()))).ok();
                                tx.send(SessionEvent::Log("🛑 Recording stopped".to_owned())).ok();
                            }
                            Err(e) => {
                                tx.send(SessionEvent::Log(format!("Stop ignored: {e}"))).ok();
                            }
                        }
                    }
                    SessionCommand::Tare => match session.begin_tare() {
                        Ok(()) => tare_deadline = Some(Instant::now() + tare_duration),
                        Err(e) => {
                            tx.send(SessionEvent::Log(format!("Tare refused: {e}"))).ok();
                        }
                    },
                    SessionCommand::SetRead {
                        group_id,
                        sensor_id,
                        read,
                    } => {
                        if session.is_running() {
                            tx.send(SessionEvent::Log("Read flags are locked while recording".to_owned())).ok();
                        } else if !session
                            .manager_mut()
                            .set_sensor_read(read, &group_id, sensor_id.as_deref())
                        {
                            tx.send(SessionEvent::Log(format!("Unknown sensor in group {group_id}"))).ok();
                        }
                    }
                    SessionCommand::Calibrate {
                        group_id,
                        sensor_id,
                        reference,
                    } => {
                        if calibration.is_some() {
                            tx.send(SessionEvent::Log("Calibration trial already running".to_owned())).ok();
                            continue;
                        }
                        let owns_connection = !session.is_running();
                        let Some(sensor) = session
                            .manager_mut()
                            .group_mut(&group_id)
                            .and_then(|g| g.sensor_mut(&sensor_id))
                        else {
                            tx.send(SessionEvent::TrialResult { sensor_id, result: None }).ok();
                            continue;
                        };
                        if owns_connection && !sensor.connect(true) {
                            tx.send(SessionEvent::Log(format!("❌ {sensor_id} not reachable"))).ok();
                            tx.send(SessionEvent::TrialResult { sensor_id, result: None }).ok();
                            continue;
                        }
                        calibrators
                            .entry(sensor_id.clone())
                            .or_insert_with(|| SensorCalibrator::new(&sensor_id))
                            .new_calibration_test(reference);
                        calibration = Some(CalibrationRun {
                            group_id,
                            sensor_id,
                            remaining: settings.calibration_samples.max(1),
                            owns_connection,
                        });
                        next_tick = Instant::now();
                    }
                    SessionCommand::FinishCalibration {
                        group_id,
                        sensor_id,
                        apply,
                    } => {
                        let fit = calibrators
                            .remove(&sensor_id)
                            .and_then(|c| c.get_calibration_results());
                        if let (true, Some(fit)) = (apply, fit) {
                            session
                                .manager_mut()
                                .set_sensor_calibration(&sensor_id, fit.slope, fit.intercept);
                            info!("{group_id}/{sensor_id}: calibration applied {fit:?}");
                        }
                        tx.send(SessionEvent::CalibrationResult { sensor_id, fit }).ok();
                    }
                    SessionCommand::Shutdown => {
                        if session.is_running() {
                            session.stop().ok();
                        }
                        tx.send(SessionEvent::Log("Engine stopped".to_owned())).ok();
                        return;
                    }
                }
            }

            // ============================================================
            // 2. 采样节拍
            // ============================================================
            if !session.is_running() && calibration.is_none() {
                thread::sleep(IDLE_SLEEP);
                continue;
            }
            let now = Instant::now();
            if next_tick > now {
                thread::sleep(next_tick - now);
            }
            next_tick += tick;
            // 迟到的节拍直接丢弃，不补发
            if next_tick < Instant::now() {
                next_tick = Instant::now() + tick;
            }

            if session.is_running() {
                if let Err(e) = session.register_tick() {
                    warn!("tick failed: {e}");
                }
            }

            // 3. 去皮窗口
            if tare_deadline.map_or(false, |deadline| Instant::now() >= deadline) {
                tare_deadline = None;
                match session.end_tare() {
                    Ok(means) => {
                        tx.send(SessionEvent::Tared(means.into_iter().collect())).ok();
                    }
                    Err(e) => {
                        tx.send(SessionEvent::Log(format!("Tare failed: {e}"))).ok();
                    }
                }
            }

            // 4. 校准试验采样
            if let Some(run) = calibration.as_mut() {
                let sample = session
                    .manager()
                    .group(&run.group_id)
                    .and_then(|g| g.sensor(&run.sensor_id))
                    .and_then(|s| s.read_current())
                    .and_then(|r| r.as_scalar());
                if let (Some(value), Some(calibrator)) = (sample, calibrators.get_mut(&run.sensor_id)) {
                    calibrator.add_test_measurement(value);
                }
                run.remaining -= 1;
                if run.remaining == 0 {
                    let result = calibrators
                        .get_mut(&run.sensor_id)
                        .and_then(|c| c.get_test_results());
                    // 录制中的会话仍在使用该设备
                    if run.owns_connection && !session.is_running() {
                        if let Some(sensor) = session.manager().group(&run.group_id).and_then(|g| g.sensor(&run.sensor_id)) {
                            sensor.disconnect();
                        }
                    }
                    tx.send(SessionEvent::TrialResult {
                        sensor_id: run.sensor_id.clone(),
                        result,
                    })
                    .ok();
                    calibration = None;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigStore;
    use crate::drivers::SimulatedDriverFactory;
    use crate::manager::SensorManager;
    use serde_json::json;
    use std::sync::mpsc::{self, RecvTimeoutError};
    use std::sync::Arc;

    fn engine() -> (Sender<SessionCommand>, Receiver<SessionEvent>, JoinHandle<()>) {
        let config = ConfigStore::from_value(json!({
            "settings": {"tick_interval_ms": 5, "tare_duration_ms": 30, "calibration_samples": 4,
                         "filter": {"enabled": false}},
            "sensor_groups": {"g": {"name": "G", "type": "GROUP_PLATFORM", "read": true, "sensor_list": ["lc"]}},
            "sensors": {"lc": {"name": "P_Z_1", "type": "SENSOR_LOADCELL", "read": true,
                               "connection": {"serial": "1", "channel": 0},
                               "properties": {"simulated_value": 2.0}}}
        }));
        let session = AcquisitionSession::new(SensorManager::new(
            config,
            Arc::new(SimulatedDriverFactory::default()),
        ));
        let (tx_cmd, rx_cmd) = mpsc::channel();
        let (tx, rx) = mpsc::channel();
        let handle = spawn_thread(session, tx, rx_cmd);
        (tx_cmd, rx, handle)
    }

    fn wait_for<T>(rx: &Receiver<SessionEvent>, mut pick: impl FnMut(SessionEvent) -> Option<T>) -> T {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(left) {
                Ok(event) => {
                    if let Some(value) = pick(event) {
                        return value;
                    }
                }
                Err(RecvTimeoutError::Timeout) => panic!("event not received in time"),
                Err(RecvTimeoutError::Disconnected) => panic!("engine exited"),
            }
        }
    }

    #[test]
    fn records_tares_and_finishes() {
        let (cmd, rx, handle) = engine();
        cmd.send(SessionCommand::CheckConnections).unwrap();
        assert!(wait_for(&rx, |e| match e {
            SessionEvent::Connected(c) => Some(c),
            _ => None,
        }));
        cmd.send(SessionCommand::Start).unwrap();
        wait_for(&rx, |e| matches!(e, SessionEvent::Running(true)).then_some(()));
        cmd.send(SessionCommand::Tare).unwrap();
        let tared = wait_for(&rx, |e| match e {
            SessionEvent::Tared(means) => Some(means),
            _ => None,
        });
        assert_eq!(tared, vec![("lc".to_string(), 2.0)]);
        cmd.send(SessionCommand::Stop).unwrap();
        let data = wait_for(&rx, |e| match e {
            SessionEvent::Finished(data) => Some(data),
            _ => None,
        });
        assert!(data.timestamps().len() > 2);
        cmd.send(SessionCommand::Shutdown).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn start_waits_for_the_calibration_trial() {
        let (cmd, rx, handle) = engine();
        cmd.send(SessionCommand::Calibrate {
            group_id: "g".into(),
            sensor_id: "lc".into(),
            reference: 1.0,
        })
        .unwrap();
        cmd.send(SessionCommand::Start).unwrap();
        wait_for(&rx, |e| match e {
            SessionEvent::Log(msg) if msg.contains("Start refused") => Some(()),
            SessionEvent::Running(true) => panic!("session started during a trial"),
            _ => None,
        });
        let trial = wait_for(&rx, |e| match e {
            SessionEvent::TrialResult { result, .. } => Some(result),
            _ => None,
        })
        .unwrap();
        assert_eq!(trial.count, 4);

        cmd.send(SessionCommand::Start).unwrap();
        wait_for(&rx, |e| matches!(e, SessionEvent::Running(true)).then_some(()));
        thread::sleep(Duration::from_millis(60));
        cmd.send(SessionCommand::Stop).unwrap();
        let data = wait_for(&rx, |e| match e {
            SessionEvent::Finished(data) => Some(data),
            _ => None,
        });
        let column = data.results().calibrated.column_vec("P_Z_1").unwrap();
        assert!(column.len() > 2);
        assert!(column.iter().all(|v| *v == 2.0));
        drop(cmd);
        handle.join().unwrap();
    }

    #[test]
    fn calibration_trials_run_outside_a_session() {
        let (cmd, rx, handle) = engine();
        for reference in [0.0, 10.0] {
            cmd.send(SessionCommand::Calibrate {
                group_id: "g".into(),
                sensor_id: "lc".into(),
                reference,
            })
            .unwrap();
            let trial = wait_for(&rx, |e| match e {
                SessionEvent::TrialResult { result, .. } => Some(result),
                _ => None,
            })
            .unwrap();
            assert_eq!(trial.count, 4);
            assert_eq!(trial.mean, 2.0);
        }
        cmd.send(SessionCommand::FinishCalibration {
            group_id: "g".into(),
            sensor_id: "lc".into(),
            apply: true,
        })
        .unwrap();
        // 两次载荷均值相同，无法拟合
        let fit = wait_for(&rx, |e| match e {
            SessionEvent::CalibrationResult { fit, .. } => Some(fit),
            _ => None,
        });
        assert!(fit.is_none());
        drop(cmd);
        handle.join().unwrap();
    }
}
