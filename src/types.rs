// src/types.rs
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::calibrator::{CalibrationFit, TrialResult};
use crate::data::DataManager;

// 传感器硬件类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SensorType {
    #[serde(rename = "SENSOR_LOADCELL")]
    LoadCell,
    #[serde(rename = "SENSOR_ENCODER")]
    Encoder,
    #[serde(rename = "SENSOR_IMU")]
    Imu,
}

impl SensorType {
    /// 测力传感器和编码器需要 channel，IMU 不需要
    pub fn needs_channel(&self) -> bool {
        !matches!(self, Self::Imu)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SensorStatus {
    Ignored,
    NotFound,
    Available,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GroupType {
    #[serde(rename = "GROUP_DEFAULT")]
    Default,
    #[serde(rename = "GROUP_PLATFORM")]
    Platform,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GroupStatus {
    Ok,
    Warning,
    Error,
}

// IMU 展开后的十个子通道列名后缀 (按读数顺序)
pub const IMU_CHANNELS: [&str; 10] = ["qx", "qy", "qz", "qw", "wx", "wy", "wz", "ax", "ay", "az"];

pub const PLATFORM_AXES: [char; 3] = ['X', 'Y', 'Z'];
pub const PLATFORM_CORNERS: usize = 4;

// 测力台列名后缀 `_X_1` .. `_Z_4`，先按轴再按角
pub static PLATFORM_LABELS: Lazy<Vec<String>> = Lazy::new(|| {
    PLATFORM_AXES
        .iter()
        .flat_map(|axis| (1..=PLATFORM_CORNERS).map(move |corner| format!("_{axis}_{corner}")))
        .collect()
});

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImuReading {
    /// 四元数 x, y, z, w
    pub orientation: [f64; 4],
    pub angular_velocity: [f64; 3],
    pub linear_acceleration: [f64; 3],
}

impl ImuReading {
    pub fn from_slice(values: &[f64]) -> Option<Self> {
        if values.len() < IMU_CHANNELS.len() {
            return None;
        }
        Some(Self {
            orientation: [values[0], values[1], values[2], values[3]],
            angular_velocity: [values[4], values[5], values[6]],
            linear_acceleration: [values[7], values[8], values[9]],
        })
    }

    pub fn flatten(&self) -> [f64; 10] {
        let mut out = [0.0; 10];
        out[..4].copy_from_slice(&self.orientation);
        out[4..7].copy_from_slice(&self.angular_velocity);
        out[7..].copy_from_slice(&self.linear_acceleration);
        out
    }
}

// 驱动返回的一次采样
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum Reading {
    Scalar(f64),
    Imu(ImuReading),
}

impl Reading {
    /// 驱动无数据时的占位值 (NaN)
    pub fn placeholder(kind: SensorType) -> Self {
        match kind {
            SensorType::Imu => Reading::Imu(ImuReading {
                orientation: [f64::NAN; 4],
                angular_velocity: [f64::NAN; 3],
                linear_acceleration: [f64::NAN; 3],
            }),
            _ => Reading::Scalar(f64::NAN),
        }
    }

    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Reading::Scalar(v) => Some(*v),
            Reading::Imu(_) => None,
        }
    }
}

// 前端发给后台的命令
#[derive(Clone, Debug)]
pub enum SessionCommand {
    CheckConnections,
    Start,
    Stop,
    Tare,
    SetRead {
        group_id: String,
        sensor_id: Option<String>,
        read: bool,
    },
    // 在已知参考载荷下记录一次校准试验
    Calibrate {
        group_id: String,
        sensor_id: String,
        reference: f64,
    },
    // 拟合全部试验，`apply` 为 true 时写回斜率和截距
    FinishCalibration {
        group_id: String,
        sensor_id: String,
        apply: bool,
    },
    Shutdown,
}

// 后台发给前端的消息
#[derive(Debug)]
pub enum SessionEvent {
    Log(String),
    Connected(bool),
    Running(bool),
    Tared(Vec<(String, f64)>),
    TrialResult {
        sensor_id: String,
        result: Option<TrialResult>,
    },
    CalibrationResult {
        sensor_id: String,
        fit: Option<CalibrationFit>,
    },
    Finished(Box<DataManager>),
}
