//! Math utilities and types
//!
//! Thin aliases over nalgebra plus the few camera helpers the renderer needs.

pub use nalgebra::{
    Vector2, Vector3, Vector4,
    Matrix4,
    Quaternion,
    Unit,
};

/// 2D vector type
pub type Vec2 = Vector2<f32>;

/// 3D vector type
pub type Vec3 = Vector3<f32>;

/// 4D vector type
pub type Vec4 = Vector4<f32>;

/// 4x4 matrix type
pub type Mat4 = Matrix4<f32>;

/// Quaternion type for rotations
pub type Quat = Unit<Quaternion<f32>>;

/// Width over height, or `None` while the surface has no area (minimized window).
pub fn aspect_ratio(width: u32, height: u32) -> Option<f32> {
    if width == 0 || height == 0 {
        None
    } else {
        Some(width as f32 / height as f32)
    }
}

/// Right-handed perspective projection.
pub fn perspective(fov_degrees: f32, aspect: f32, near: f32, far: f32) -> Mat4 {
    Mat4::new_perspective(aspect, fov_degrees.to_radians(), near, far)
}

/// View matrix for a camera sitting at `position` with no rotation.
pub fn view_from_position(position: Vec3) -> Mat4 {
    Mat4::new_translation(&-position)
}

/// Model matrix rotating around the Z axis.
pub fn rotation_z(angle_radians: f32) -> Mat4 {
    Quat::from_axis_angle(&Vector3::z_axis(), angle_radians).to_homogeneous()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_aspect_ratio() {
        assert_relative_eq!(aspect_ratio(1600, 900).unwrap(), 16.0 / 9.0);
        assert!(aspect_ratio(0, 600).is_none());
        assert!(aspect_ratio(800, 0).is_none());
    }

    #[test]
    fn test_view_from_position_moves_world_opposite() {
        let view = view_from_position(Vec3::new(0.0, 0.0, 30.0));
        let p = view.transform_point(&nalgebra::Point3::origin());
        assert_relative_eq!(p.z, -30.0);
    }

    #[test]
    fn test_rotation_z_quarter_turn() {
        let m = rotation_z(std::f32::consts::FRAC_PI_2);
        let v = m.transform_vector(&Vec3::x());
        assert_relative_eq!(v, Vec3::y(), epsilon = 1e-6);
    }

    #[test]
    fn test_perspective_changes_with_aspect() {
        let wide = perspective(45.0, 2.0, 0.1, 1000.0);
        let square = perspective(45.0, 1.0, 0.1, 1000.0);
        assert_relative_eq!(wide[(0, 0)] * 2.0, square[(0, 0)], epsilon = 1e-6);
    }
}
