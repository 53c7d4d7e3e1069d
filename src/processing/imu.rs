use nalgebra::{Quaternion, UnitQuaternion};

/// Quaternion (x, y, z, w) to Euler angles in degrees, XYZ convention:
/// `[roll (about x), pitch (about y), yaw (about z)]`.
pub fn quaternion_to_euler_deg(x: f64, y: f64, z: f64, w: f64) -> [f64; 3] {
    let q = UnitQuaternion::from_quaternion(Quaternion::new(w, x, y, z));
    let (roll, pitch, yaw) = q.euler_angles();
    [roll.to_degrees(), pitch.to_degrees(), yaw.to_degrees()]
}
