//! Visibility pipeline error handling
//!
//! Every sanity violation is reported as a structured error and aborts only
//! the call that triggered it; the checker's state machine stays valid for
//! the next call.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VisibilityError {
    #[error("visibility checker used before init()")]
    NotInitialized,

    #[error("visibility checker is already initialized")]
    AlreadyInitialized,

    #[error("a visibility check is already in flight")]
    CheckInFlight,

    #[error("no geometry packed; call pack_geometry() first")]
    GeometryNotPacked,

    #[error("geometry packing requires at least one mesh with triangles")]
    EmptyMeshSet,

    #[error("mesh {mesh}: triangle index {index} out of range for {vertex_count} vertices")]
    MalformedMesh {
        mesh: usize,
        index: u32,
        vertex_count: usize,
    },

    #[error("check marker is set while no check is running")]
    TaskMarkerStuck,

    #[error("result readback failed: {0}")]
    Readback(String),
}

/// Type alias for visibility operation results
pub type VisibilityResult<T> = Result<T, VisibilityError>;
