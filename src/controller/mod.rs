//! Visibility controller and readiness state machine
//!
//! Owns every GPU resource of the pipeline and serializes all mutating calls
//! through the `Busy` guard: only one visibility computation runs at a time,
//! new work is rejected rather than queued, and buffers are released
//! deterministically. The frame-sliced check itself is an explicit step
//! machine advanced once per host update tick; the only suspension points
//! are the inter-slice yields, the two post-rasterization settle ticks and
//! the readback poll.

use std::sync::Arc;

use crate::camera::OffscreenCamera;
use crate::compute::{CheckBuffers, VisibilityCompute};
use crate::error::{VisibilityError, VisibilityResult};
use crate::geometry::{pack_meshes, upload_geometry, GeometryBuffers, MeshInstance};
use crate::raster::IdRasterizer;
use crate::readback::ResultReadback;
use crate::VisibilityConfig;

/// Readiness of the checker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Uninitialized,
    Ready,
    Busy,
    HasResults,
}

/// Diagnostics captured with each completed check.
#[derive(Debug, Clone, Copy, Default)]
pub struct CheckStats {
    /// Triangles in the packed scene.
    pub triangle_count: u32,
    /// GPU-side atomic append count. Informational; the two-consecutive-
    /// zeros scan stays the canonical visible count.
    pub counted_visible: u32,
}

/// Step machine for one in-flight check.
#[derive(Debug, Clone, Copy)]
enum CheckPhase {
    Idle,
    /// Submitting one triangle slice per tick.
    Raster { next_slice: u32 },
    /// Mandatory post-rasterization yields before any compute dispatch;
    /// rasterization completes asynchronously relative to submission and the
    /// compute pass must not read a partially-written image.
    Settle { frames_left: u32 },
    Dispatch,
    Readback,
}

/// Ticks to wait between the last slice and the compute dispatch.
const SETTLE_FRAMES: u32 = 2;

/// Effective triangles-per-slice for a scene.
fn slice_size(config: &VisibilityConfig, triangle_count: u32) -> u32 {
    if config.draw_in_one_frame {
        triangle_count
    } else {
        config.triangles_per_slice.max(1).min(triangle_count)
    }
}

/// Number of submission slices a scene needs.
fn slice_count(config: &VisibilityConfig, triangle_count: u32) -> u32 {
    let size = slice_size(config, triangle_count);
    (triangle_count + size - 1) / size
}

pub struct VisibilityChecker {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    config: VisibilityConfig,
    camera: OffscreenCamera,

    state: ReadyState,
    /// Defensive re-entrancy marker, double-checked against `state`.
    check_active: bool,
    /// Set on repack; the clean kernel runs on the next check to cover stale
    /// bitset entries from a previous configuration.
    bitset_stale: bool,
    phase: CheckPhase,

    rasterizer: Option<IdRasterizer>,
    compute: Option<VisibilityCompute>,
    geometry: Option<GeometryBuffers>,
    scratch: Option<CheckBuffers>,
    raster_bind_group: Option<wgpu::BindGroup>,
    compute_bind_group: Option<wgpu::BindGroup>,
    readback: Option<ResultReadback>,

    visible: Vec<u32>,
    visible_count: usize,
    stats: CheckStats,
}

impl VisibilityChecker {
    pub fn new(
        device: Arc<wgpu::Device>,
        queue: Arc<wgpu::Queue>,
        config: VisibilityConfig,
    ) -> Self {
        Self {
            device,
            queue,
            config,
            camera: OffscreenCamera::new(),
            state: ReadyState::Uninitialized,
            check_active: false,
            bitset_stale: false,
            phase: CheckPhase::Idle,
            rasterizer: None,
            compute: None,
            geometry: None,
            scratch: None,
            raster_bind_group: None,
            compute_bind_group: None,
            readback: None,
            visible: Vec::new(),
            visible_count: 0,
            stats: CheckStats::default(),
        }
    }

    /// Allocate the offscreen ID image, its camera binding and both
    /// pipelines. Must be called exactly once before any other operation.
    pub fn init(&mut self) -> VisibilityResult<()> {
        if self.state != ReadyState::Uninitialized {
            return Err(VisibilityError::AlreadyInitialized);
        }

        self.rasterizer = Some(IdRasterizer::new(&self.device, self.config.resolution));
        self.compute = Some(VisibilityCompute::new(&self.device));
        self.state = ReadyState::Ready;

        log::info!(
            "[VisibilityChecker::init] ready, ID image {0}x{0}",
            self.rasterizer.as_ref().map(|r| r.resolution()).unwrap_or(0)
        );
        Ok(())
    }

    /// Flatten and upload the mesh set, reallocating every transient buffer
    /// sized to the new triangle count and rebinding both stages.
    ///
    /// Call whenever the input mesh set or its count changes. Validation runs
    /// before any prior buffer is touched, so a rejected call leaves previous
    /// geometry and results fully intact.
    pub fn pack_geometry(&mut self, instances: &[MeshInstance]) -> VisibilityResult<()> {
        if self.state == ReadyState::Uninitialized {
            return Err(VisibilityError::NotInitialized);
        }
        if self.state == ReadyState::Busy || self.check_active {
            return Err(VisibilityError::CheckInFlight);
        }

        let packed = pack_meshes(instances)?;

        // Full dispose of prior buffers before the new allocation
        self.release_transient();

        let rasterizer = self
            .rasterizer
            .as_ref()
            .ok_or(VisibilityError::NotInitialized)?;
        let compute = self
            .compute
            .as_ref()
            .ok_or(VisibilityError::NotInitialized)?;

        let geometry = upload_geometry(&self.device, &packed);
        let scratch = compute.alloc_buffers(&self.device, geometry.triangle_count);

        self.raster_bind_group = Some(rasterizer.create_bind_group(&self.device, &geometry));
        self.compute_bind_group =
            Some(compute.create_bind_group(&self.device, rasterizer.id_view(), &scratch));
        compute.update_params(&self.queue, geometry.triangle_count, rasterizer.resolution());

        log::info!(
            "[VisibilityChecker::pack_geometry] {} meshes, {} triangles, {} slices per check",
            packed.transforms.len(),
            geometry.triangle_count,
            slice_count(&self.config, geometry.triangle_count)
        );

        self.geometry = Some(geometry);
        self.scratch = Some(scratch);
        self.bitset_stale = true;
        self.visible.clear();
        self.visible_count = 0;
        self.stats = CheckStats::default();
        self.state = ReadyState::Ready;
        Ok(())
    }

    /// Start a new check. Rejected (never queued) unless the state is
    /// `Ready` or `HasResults`, the re-entrancy marker is clear and geometry
    /// has been packed.
    pub fn check_visibility_async(&mut self) -> VisibilityResult<()> {
        match self.state {
            ReadyState::Uninitialized => return Err(VisibilityError::NotInitialized),
            ReadyState::Busy => return Err(VisibilityError::CheckInFlight),
            ReadyState::Ready | ReadyState::HasResults => {}
        }
        if self.check_active {
            // State says idle but the marker disagrees: logic fault.
            log::error!(
                "[VisibilityChecker::check_visibility_async] check marker set while state is {:?}",
                self.state
            );
            return Err(VisibilityError::TaskMarkerStuck);
        }

        let scratch = self.scratch.as_ref().ok_or(VisibilityError::GeometryNotPacked)?;
        let rasterizer = self
            .rasterizer
            .as_ref()
            .ok_or(VisibilityError::GeometryNotPacked)?;

        // Zero-fill the result buffer and counter so stale entries from a
        // previous run cannot masquerade as fresh indices.
        let zeros = vec![0u8; scratch.triangle_count as usize * 4];
        self.queue.write_buffer(&scratch.visible, 0, &zeros);
        self.queue.write_buffer(&scratch.counter, 0, &[0u8; 4]);

        self.camera.enable();
        rasterizer.update_camera(&self.queue, &self.camera);

        self.state = ReadyState::Busy;
        self.check_active = true;
        self.phase = CheckPhase::Raster { next_slice: 0 };

        log::debug!(
            "[VisibilityChecker::check_visibility_async] started, {} triangles",
            scratch.triangle_count
        );
        Ok(())
    }

    /// Advance the in-flight check by one tick. No-op outside a check.
    pub fn update(&mut self) -> VisibilityResult<ReadyState> {
        match self.phase {
            CheckPhase::Idle => {}
            CheckPhase::Raster { next_slice } => self.step_raster(next_slice),
            CheckPhase::Settle { frames_left } => {
                // Yield point: let the queue drain while the raster output
                // settles.
                self.device.poll(wgpu::Maintain::Poll);
                self.phase = if frames_left > 1 {
                    CheckPhase::Settle {
                        frames_left: frames_left - 1,
                    }
                } else {
                    CheckPhase::Dispatch
                };
            }
            CheckPhase::Dispatch => self.step_dispatch(),
            CheckPhase::Readback => return self.step_readback(),
        }
        Ok(self.state)
    }

    fn step_raster(&mut self, next_slice: u32) {
        let (Some(rasterizer), Some(bind_group), Some(geometry)) = (
            self.rasterizer.as_ref(),
            self.raster_bind_group.as_ref(),
            self.geometry.as_ref(),
        ) else {
            log::error!("[VisibilityChecker::update] raster step with missing resources");
            self.abort_check();
            return;
        };

        let total = geometry.triangle_count;
        let size = slice_size(&self.config, total);
        let first_triangle = next_slice * size;
        let count = size.min(total - first_triangle);

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Triangle ID Slice Encoder"),
            });
        rasterizer.encode_slice(
            &mut encoder,
            bind_group,
            first_triangle,
            count,
            next_slice == 0,
        );
        self.queue.submit(Some(encoder.finish()));

        self.phase = if first_triangle + count >= total {
            CheckPhase::Settle {
                frames_left: SETTLE_FRAMES,
            }
        } else {
            CheckPhase::Raster {
                next_slice: next_slice + 1,
            }
        };
    }

    fn step_dispatch(&mut self) {
        let (Some(rasterizer), Some(compute), Some(bind_group), Some(scratch)) = (
            self.rasterizer.as_ref(),
            self.compute.as_ref(),
            self.compute_bind_group.as_ref(),
            self.scratch.as_ref(),
        ) else {
            log::error!("[VisibilityChecker::update] dispatch step with missing resources");
            self.abort_check();
            return;
        };

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Visibility Dispatch Encoder"),
            });
        compute.encode_dispatch(
            &mut encoder,
            bind_group,
            scratch.triangle_count,
            rasterizer.resolution(),
            self.bitset_stale,
        );
        self.queue.submit(Some(encoder.finish()));
        self.bitset_stale = false;

        self.readback = Some(ResultReadback::begin(&self.device, &self.queue, scratch));
        self.phase = CheckPhase::Readback;
    }

    fn step_readback(&mut self) -> VisibilityResult<ReadyState> {
        let Some(readback) = self.readback.as_mut() else {
            log::error!("[VisibilityChecker::update] readback step with no transfer in flight");
            self.abort_check();
            return Ok(self.state);
        };

        match readback.poll(&self.device) {
            None => Ok(self.state),
            Some(Ok(output)) => {
                self.stats = CheckStats {
                    triangle_count: self.scratch.as_ref().map(|s| s.triangle_count).unwrap_or(0),
                    counted_visible: output.counted_visible,
                };
                self.visible = output.visible;
                self.visible_count = output.visible_count;
                self.finish_check(ReadyState::HasResults);
                log::debug!(
                    "[VisibilityChecker::update] check complete, {} of {} triangles visible",
                    self.visible_count,
                    self.stats.triangle_count
                );
                Ok(self.state)
            }
            Some(Err(e)) => {
                log::error!("[VisibilityChecker::update] readback failed: {}", e);
                self.finish_check(ReadyState::Ready);
                Err(e)
            }
        }
    }

    fn finish_check(&mut self, state: ReadyState) {
        self.readback = None;
        self.phase = CheckPhase::Idle;
        self.check_active = false;
        self.camera.disable();
        self.state = state;
    }

    fn abort_check(&mut self) {
        self.finish_check(ReadyState::Ready);
    }

    /// Release all transient GPU buffers; with `is_final` also the offscreen
    /// image and pipelines, for teardown. Idempotent.
    pub fn clear_and_dispose(&mut self, is_final: bool) {
        self.release_transient();
        self.readback = None;
        self.phase = CheckPhase::Idle;
        self.check_active = false;
        self.visible.clear();
        self.visible_count = 0;
        self.stats = CheckStats::default();

        if is_final {
            self.rasterizer = None;
            self.compute = None;
            self.state = ReadyState::Uninitialized;
        } else if self.state != ReadyState::Uninitialized {
            self.state = ReadyState::Ready;
        }
    }

    fn release_transient(&mut self) {
        // Dropping the handles releases the wgpu resources.
        self.raster_bind_group = None;
        self.compute_bind_group = None;
        self.geometry = None;
        self.scratch = None;
    }

    pub fn state(&self) -> ReadyState {
        self.state
    }

    /// Visible triangle indices of the last completed check.
    pub fn visible_triangles(&self) -> &[u32] {
        &self.visible[..self.visible_count]
    }

    /// Full-capacity host copy of the result buffer, zero tail included.
    pub fn visible_raw(&self) -> &[u32] {
        &self.visible
    }

    pub fn visible_count(&self) -> usize {
        self.visible_count
    }

    pub fn stats(&self) -> CheckStats {
        self.stats
    }

    pub fn triangle_count(&self) -> u32 {
        self.geometry.as_ref().map(|g| g.triangle_count).unwrap_or(0)
    }

    pub fn camera(&self) -> &OffscreenCamera {
        &self.camera
    }

    pub fn camera_mut(&mut self) -> &mut OffscreenCamera {
        &mut self.camera
    }

    pub fn config(&self) -> &VisibilityConfig {
        &self.config
    }
}
