//! Offscreen camera for visibility bakes
//!
//! Never presented to a surface; only its view/projection matrices feed the
//! ID rasterizer. The enable flag tracks whether a running check currently
//! borrows the camera.

use cgmath::{perspective, Deg, InnerSpace, Matrix4, Point3, Rad, Vector3};

#[derive(Debug)]
pub struct OffscreenCamera {
    pub position: Point3<f32>,
    pub yaw: Deg<f32>,
    pub pitch: Deg<f32>,
    pub fovy: Deg<f32>,
    pub znear: f32,
    pub zfar: f32,
    enabled: bool,
}

impl OffscreenCamera {
    pub fn new() -> Self {
        Self {
            position: Point3::new(0.0, 0.0, 0.0),
            yaw: Deg(-90.0), // Facing -Z
            pitch: Deg(0.0),
            fovy: Deg(45.0),
            znear: 0.1,
            zfar: 1000.0,
            enabled: false,
        }
    }

    /// Point the camera at a world-space target.
    pub fn look_at(&mut self, target: Point3<f32>) {
        let direction = (target - self.position).normalize();
        self.pitch = Deg::from(Rad(direction.y.asin()));
        self.yaw = Deg::from(Rad(direction.z.atan2(direction.x)));
    }

    pub fn get_forward_vector(&self) -> Vector3<f32> {
        let (sin_yaw, cos_yaw) = Rad::from(self.yaw).0.sin_cos();
        let (sin_pitch, cos_pitch) = Rad::from(self.pitch).0.sin_cos();

        Vector3::new(cos_pitch * cos_yaw, sin_pitch, cos_pitch * sin_yaw)
    }

    pub fn build_view_matrix(&self) -> Matrix4<f32> {
        let direction = self.get_forward_vector();

        Matrix4::look_at_rh(self.position, self.position + direction, Vector3::unit_y())
    }

    /// Square aspect ratio; the ID image is always width == height.
    pub fn build_projection_matrix(&self) -> Matrix4<f32> {
        perspective(self.fovy, 1.0, self.znear, self.zfar)
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

impl Default for OffscreenCamera {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn look_at_faces_target() {
        let mut camera = OffscreenCamera::new();
        camera.position = Point3::new(0.0, 0.0, 10.0);
        camera.look_at(Point3::new(0.0, 0.0, 0.0));

        let forward = camera.get_forward_vector();
        assert!(forward.x.abs() < 1e-6);
        assert!(forward.y.abs() < 1e-6);
        assert!((forward.z + 1.0).abs() < 1e-6);
    }

    #[test]
    fn default_camera_faces_negative_z() {
        let camera = OffscreenCamera::new();
        let forward = camera.get_forward_vector();
        assert!((forward.z + 1.0).abs() < 1e-6);
        assert!(!camera.is_enabled());
    }
}
