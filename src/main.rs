// src/main.rs
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, warn};

use forceplate_acq::drivers::{DriverFactory, SerialDriverFactory, SimulatedDriverFactory};
use forceplate_acq::engine;
use forceplate_acq::types::{SessionCommand, SessionEvent};
use forceplate_acq::{AcquisitionSession, ConfigStore, DataManager, FileManager, OutputFormat, SensorManager};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Sensor/group configuration (JSON)
    #[arg(short, long)]
    pub config: PathBuf,

    /// Recording length in milliseconds
    #[arg(short, long, default_value_t = 5000)]
    pub duration_ms: u64,

    /// Use simulated devices instead of serial ports
    #[arg(long, default_value_t = false)]
    pub simulate: bool,

    /// Only probe connections and print sensor status
    #[arg(long)]
    pub check_only: bool,

    /// Output format (csv, json)
    #[arg(long, default_value = "csv")]
    pub format: OutputFormat,
}

// 入口函数
fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = ConfigStore::load(&args.config)
        .with_context(|| format!("cannot load configuration {}", args.config.display()))?;
    let factory: Arc<dyn DriverFactory> = if args.simulate {
        Arc::new(SimulatedDriverFactory::default())
    } else {
        Arc::new(SerialDriverFactory::default())
    };
    // 1. 加载传感器与分组
    let manager = SensorManager::new(config, factory);
    let settings = manager.settings().clone();
    let mut session = AcquisitionSession::new(manager);

    // 仅检测连接
    if args.check_only {
        let connected = session.check_connections();
        for group in session.manager().groups() {
            println!("{} ({}) {:?}", group.id(), group.name(), group.status());
            for sensor in group.sensors(false, None) {
                println!("  {:<16} {:<24} {:?}", sensor.id(), sensor.name(), sensor.status());
            }
        }
        if !connected {
            bail!("no sensor reachable");
        }
        return Ok(());
    }

    // 2. 启动后台采集线程
    let (tx, rx) = mpsc::channel();
    let (tx_cmd, rx_cmd) = mpsc::channel();
    let handle = engine::spawn_thread(session, tx, rx_cmd);
    tx_cmd.send(SessionCommand::CheckConnections)?;
    tx_cmd.send(SessionCommand::Start)?;

    let deadline = Instant::now() + Duration::from_millis(args.duration_ms);
    let mut stop_sent = false;
    let mut data: Option<Box<DataManager>> = None;
    while data.is_none() {
        if !stop_sent && Instant::now() >= deadline {
            tx_cmd.send(SessionCommand::Stop)?;
            stop_sent = true;
        }
        match rx.recv_timeout(Duration::from_millis(50)) {
            Ok(SessionEvent::Log(msg)) => info!("{msg}"),
            Ok(SessionEvent::Connected(false)) => warn!("no sensor reachable"),
            Ok(SessionEvent::Finished(finished)) => data = Some(finished),
            Ok(_) => {}
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => bail!("acquisition engine exited"),
        }
        if stop_sent && Instant::now() >= deadline + Duration::from_secs(5) {
            break;
        }
    }
    tx_cmd.send(SessionCommand::Shutdown).ok();
    handle.join().ok();

    let Some(data) = data else {
        bail!("session did not start, nothing recorded");
    };
    print_summary(&data);

    // 3. 保存结果
    let files = FileManager::new(&settings.output_folder);
    match files.save_results(&settings.test_name, data.results(), args.format)? {
        Some(path) => println!("saved {}", path.display()),
        None => warn!("results not saved"),
    }
    Ok(())
}

fn print_summary(data: &DataManager) {
    let results = data.results();
    println!(
        "{} ticks, {} raw columns, filtered: {}",
        results.timestamps.len(),
        results.raw.n_cols(),
        !results.filtered.is_empty()
    );
    for id in data.plot_options() {
        if let Some(group_id) = id.strip_suffix("/cop") {
            if let Some(ellipse) = data.ellipse(group_id) {
                println!("{group_id}: sway ellipse area {:.3} cm²", ellipse.area_cm2);
            }
        }
    }
}
