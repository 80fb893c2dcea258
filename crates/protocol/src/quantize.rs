//! Lossy compression of rotations and input vectors.
//!
//! Both peers simulate with the *decompressed* values, so the client applies
//! the same quantization locally before predicting a move. Otherwise the
//! server replay would start from a slightly different input.

use std::f32::consts::TAU;

use glam::{EulerRot, Quat, Vec3};

const AXIS_STEPS: f32 = 65536.0;
const UNIT_SCALE: f32 = 127.0;

/// Squared length a packed unit vector may reach through rounding alone.
const UNIT_SLACK_SQ: f32 = 1.02;

/// Compress an angle in radians to 16 bits.
#[inline]
pub fn compress_axis(angle: f32) -> u16 {
    let wrapped = angle.rem_euclid(TAU);
    ((wrapped * AXIS_STEPS / TAU).round() as u32 & 0xFFFF) as u16
}

/// Decompress a 16-bit angle to radians in `(-PI, PI]`.
#[inline]
pub fn decompress_axis(value: u16) -> f32 {
    let angle = value as f32 * TAU / AXIS_STEPS;
    if angle > std::f32::consts::PI {
        angle - TAU
    } else {
        angle
    }
}

/// Compress a rotation to (yaw, pitch, roll).
pub fn compress_rotation(rotation: Quat) -> [u16; 3] {
    let (yaw, pitch, roll) = rotation.normalize().to_euler(EulerRot::YZX);
    [compress_axis(yaw), compress_axis(pitch), compress_axis(roll)]
}

pub fn decompress_rotation(packed: [u16; 3]) -> Quat {
    Quat::from_euler(
        EulerRot::YZX,
        decompress_axis(packed[0]),
        decompress_axis(packed[1]),
        decompress_axis(packed[2]),
    )
}

/// Round a rotation to wire precision.
pub fn quantize_rotation(rotation: Quat) -> Quat {
    decompress_rotation(compress_rotation(rotation))
}

/// Compress a vector of length at most 1 to one signed byte per axis.
///
/// Longer vectors are normalized first. Vectors within rounding slack of
/// unit length are packed as-is, so `compress(decompress(p)) == p`.
pub fn compress_unit_vector(v: Vec3) -> [i8; 3] {
    let v = if v.length_squared() > UNIT_SLACK_SQ {
        v.normalize_or_zero()
    } else {
        v
    };
    [pack_unit(v.x), pack_unit(v.y), pack_unit(v.z)]
}

pub fn decompress_unit_vector(packed: [i8; 3]) -> Vec3 {
    Vec3::new(
        packed[0] as f32 / UNIT_SCALE,
        packed[1] as f32 / UNIT_SCALE,
        packed[2] as f32 / UNIT_SCALE,
    )
}

/// Round an input vector to wire precision.
pub fn quantize_unit_vector(v: Vec3) -> Vec3 {
    decompress_unit_vector(compress_unit_vector(v))
}

#[inline]
fn pack_unit(x: f32) -> i8 {
    (x.clamp(-1.0, 1.0) * UNIT_SCALE).round() as i8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_axis_wraps_negative_angles() {
        assert_eq!(compress_axis(0.0), 0);
        assert_eq!(compress_axis(TAU), 0);
        assert_eq!(compress_axis(-std::f32::consts::FRAC_PI_2), compress_axis(3.0 * std::f32::consts::FRAC_PI_2));
        assert!((decompress_axis(compress_axis(-1.0)) + 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_rotation_error_is_small() {
        let rotation = Quat::from_rotation_y(1.234) * Quat::from_rotation_z(-0.4);
        let quantized = quantize_rotation(rotation);
        assert!(rotation.angle_between(quantized) < 1e-3);
    }

    #[test]
    fn test_quantize_rotation_is_stable() {
        // Simulating with an already-quantized rotation must not drift.
        let once = compress_rotation(Quat::from_rotation_y(0.7));
        let twice = compress_rotation(decompress_rotation(once));
        assert_eq!(once, twice);
    }

    #[test]
    fn test_unit_vector_is_normalized_and_close() {
        let packed = compress_unit_vector(Vec3::new(1.0, 0.0, 1.0));
        let v = decompress_unit_vector(packed);
        assert!(v.length() < 1.01);
        assert!((v - Vec3::new(1.0, 0.0, 1.0).normalize()).length() < 0.02);
    }

    #[test]
    fn test_quantize_unit_vector_is_stable() {
        let inputs = [
            Vec3::new(1.0, 0.0, 1.0),
            Vec3::new(0.6, 0.0, 0.8),
            Vec3::new(-0.35, 0.1, 0.93),
            Vec3::new(5.0, -2.0, 0.0),
        ];
        for v in inputs {
            let once = compress_unit_vector(v);
            assert_eq!(compress_unit_vector(decompress_unit_vector(once)), once, "unstable for {:?}", v);
        }
    }
}
