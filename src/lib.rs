pub mod camera;
pub mod compute;
pub mod controller;
pub mod error;
pub mod geometry;
pub mod raster;
pub mod readback;

pub use camera::OffscreenCamera;
pub use controller::{CheckStats, ReadyState, VisibilityChecker};
pub use error::{VisibilityError, VisibilityResult};
pub use geometry::{MeshData, MeshInstance};

/// Visibility pipeline configuration
#[derive(Debug, Clone)]
pub struct VisibilityConfig {
    /// Width and height of the offscreen ID image in pixels. Higher values
    /// resolve more overlapping triangles at the cost of memory and fill rate.
    pub resolution: u32,
    /// Upper bound on triangles drawn per submission slice. Ignored when
    /// `draw_in_one_frame` is set.
    pub triangles_per_slice: u32,
    /// Submit the whole scene as a single slice.
    pub draw_in_one_frame: bool,
}

impl Default for VisibilityConfig {
    fn default() -> Self {
        Self {
            resolution: 256,
            triangles_per_slice: 4096,
            draw_in_one_frame: false,
        }
    }
}
