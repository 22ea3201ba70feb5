/// Visibility Pipeline Integration Tests
///
/// Runs the whole rasterize -> compute -> readback pipeline against a real
/// adapter. Tests skip when no GPU is available.

use cgmath::Matrix4;
use std::sync::Arc;
use trivis::{
    MeshData, MeshInstance, ReadyState, VisibilityChecker, VisibilityConfig, VisibilityError,
};

/// Initialize GPU context for tests
fn init_gpu() -> Option<(Arc<wgpu::Device>, Arc<wgpu::Queue>)> {
    let _ = env_logger::builder().is_test(true).try_init();

    let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    });

    let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
        power_preference: wgpu::PowerPreference::HighPerformance,
        compatible_surface: None,
        force_fallback_adapter: false,
    }))?;

    let (device, queue) = pollster::block_on(adapter.request_device(
        &wgpu::DeviceDescriptor {
            label: Some("Visibility Test Device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
        },
        None,
    ))
    .ok()?;

    Some((Arc::new(device), Arc::new(queue)))
}

fn config(resolution: u32) -> VisibilityConfig {
    VisibilityConfig {
        resolution,
        triangles_per_slice: 4096,
        draw_in_one_frame: false,
    }
}

/// Axis-aligned quad facing +Z, two triangles.
fn quad(center: [f32; 3], half: f32) -> MeshData {
    let [cx, cy, cz] = center;
    MeshData {
        positions: vec![
            [cx - half, cy - half, cz],
            [cx + half, cy - half, cz],
            [cx + half, cy + half, cz],
            [cx - half, cy + half, cz],
        ],
        normals: vec![[0.0, 0.0, 1.0]; 4],
        indices: vec![0, 1, 2, 0, 2, 3],
    }
}

fn instance(mesh: MeshData) -> MeshInstance {
    MeshInstance {
        mesh,
        world_from_local: Matrix4::from_scale(1.0),
    }
}

/// Drive the step machine until results land. The default camera sits at the
/// origin facing -Z, so test geometry lives at negative z.
fn run_check(checker: &mut VisibilityChecker) {
    checker
        .check_visibility_async()
        .expect("check failed to start");

    let mut ticks = 0u32;
    loop {
        ticks += 1;
        match checker.update().expect("update failed") {
            ReadyState::HasResults => return,
            _ => {}
        }
        assert!(ticks < 1_000_000, "check did not complete");
    }
}

#[test]
fn two_triangles_fully_visible() {
    let Some((device, queue)) = init_gpu() else {
        println!("Skipping GPU test - no GPU available");
        return;
    };

    let mut checker = VisibilityChecker::new(device, queue, config(64));
    checker.init().unwrap();
    checker
        .pack_geometry(&[instance(quad([0.0, 0.0, -5.0], 1.0))])
        .unwrap();

    run_check(&mut checker);

    assert_eq!(checker.visible_count(), 2);
    let mut visible = checker.visible_triangles().to_vec();
    visible.sort_unstable();
    assert_eq!(visible, vec![0, 1]);
}

#[test]
fn occluded_mesh_is_absent() {
    let Some((device, queue)) = init_gpu() else {
        println!("Skipping GPU test - no GPU available");
        return;
    };

    // Mesh 0 (triangles 0..2) sits behind mesh 1 (triangles 2..4), which
    // covers it entirely from the camera's viewpoint.
    let scene = vec![
        instance(quad([0.0, 0.0, -10.0], 1.0)),
        instance(quad([0.0, 0.0, -5.0], 1.5)),
    ];

    let mut checker = VisibilityChecker::new(device, queue, config(128));
    checker.init().unwrap();
    checker.pack_geometry(&scene).unwrap();

    run_check(&mut checker);

    let visible = checker.visible_triangles();
    assert!(!visible.contains(&0), "occluded triangle 0 reported visible");
    assert!(!visible.contains(&1), "occluded triangle 1 reported visible");
    assert!(visible.contains(&2));
    assert!(visible.contains(&3));
    assert_eq!(checker.visible_count(), 2);
}

#[test]
fn slicing_matches_single_frame() {
    let Some((device, queue)) = init_gpu() else {
        println!("Skipping GPU test - no GPU available");
        return;
    };

    // 4x4 grid of quads, 32 triangles, all unobstructed.
    let mut scene = Vec::new();
    for gy in 0..4 {
        for gx in 0..4 {
            let x = (gx - 2) as f32 * 4.0 + 2.0;
            let y = (gy - 2) as f32 * 4.0 + 2.0;
            scene.push(instance(quad([x, y, -30.0], 1.5)));
        }
    }

    let run = |cfg: VisibilityConfig| {
        let mut checker =
            VisibilityChecker::new(device.clone(), queue.clone(), cfg);
        checker.init().unwrap();
        checker.pack_geometry(&scene).unwrap();
        run_check(&mut checker);
        let mut visible = checker.visible_triangles().to_vec();
        visible.sort_unstable();
        visible
    };

    // 5 does not divide 32; the last slice is partial.
    let sliced = run(VisibilityConfig {
        resolution: 256,
        triangles_per_slice: 5,
        draw_in_one_frame: false,
    });
    let single = run(VisibilityConfig {
        resolution: 256,
        triangles_per_slice: 5,
        draw_in_one_frame: true,
    });

    assert_eq!(sliced, single, "slicing changed the visible set");
    assert_eq!(sliced.len(), 32);
}

#[test]
fn busy_state_rejects_new_work() {
    let Some((device, queue)) = init_gpu() else {
        println!("Skipping GPU test - no GPU available");
        return;
    };

    let scene = vec![instance(quad([0.0, 0.0, -5.0], 1.0))];

    let mut checker = VisibilityChecker::new(device, queue, config(64));
    checker.init().unwrap();
    checker.pack_geometry(&scene).unwrap();
    checker.check_visibility_async().unwrap();
    assert_eq!(checker.state(), ReadyState::Busy);

    // A second check and a repack are both rejected, never queued.
    assert!(matches!(
        checker.check_visibility_async(),
        Err(VisibilityError::CheckInFlight)
    ));
    assert!(matches!(
        checker.pack_geometry(&scene),
        Err(VisibilityError::CheckInFlight)
    ));
    assert_eq!(checker.state(), ReadyState::Busy);

    // The rejected calls must not have disturbed the in-flight check.
    let mut ticks = 0u32;
    while checker.update().unwrap() != ReadyState::HasResults {
        ticks += 1;
        assert!(ticks < 1_000_000, "check did not complete");
    }
    assert_eq!(checker.visible_count(), 2);
}

#[test]
fn result_invariants_hold() {
    let Some((device, queue)) = init_gpu() else {
        println!("Skipping GPU test - no GPU available");
        return;
    };

    let mut scene = Vec::new();
    for gy in 0..3 {
        for gx in 0..3 {
            let x = (gx - 1) as f32 * 5.0;
            let y = (gy - 1) as f32 * 5.0;
            scene.push(instance(quad([x, y, -20.0], 2.0)));
        }
    }

    let mut checker = VisibilityChecker::new(device, queue, config(128));
    checker.init().unwrap();
    checker.pack_geometry(&scene).unwrap();
    run_check(&mut checker);

    let count = checker.visible_count();
    let total = checker.triangle_count();
    let visible = checker.visible_triangles();

    // Every reported index is unique and in range.
    let mut seen = std::collections::HashSet::new();
    for &index in visible {
        assert!(index < total, "index {} out of range", index);
        assert!(seen.insert(index), "index {} duplicated", index);
    }

    // Everything at or beyond the count is fill.
    for &slot in &checker.visible_raw()[count..] {
        assert_eq!(slot, 0, "zero tail corrupted");
    }
}

#[test]
fn back_to_back_checks_are_idempotent() {
    let Some((device, queue)) = init_gpu() else {
        println!("Skipping GPU test - no GPU available");
        return;
    };

    let scene = vec![
        instance(quad([-2.0, 0.0, -8.0], 1.0)),
        instance(quad([2.0, 0.0, -8.0], 1.0)),
    ];

    let mut checker = VisibilityChecker::new(device, queue, config(128));
    checker.init().unwrap();
    checker.pack_geometry(&scene).unwrap();

    run_check(&mut checker);
    let mut first = checker.visible_triangles().to_vec();
    first.sort_unstable();

    // Unchanged scene, unmoved camera: same result.
    run_check(&mut checker);
    let mut second = checker.visible_triangles().to_vec();
    second.sort_unstable();

    assert_eq!(first, second);
    assert_eq!(first.len(), 4);
}

#[test]
fn empty_pack_is_rejected_and_preserves_state() {
    let Some((device, queue)) = init_gpu() else {
        println!("Skipping GPU test - no GPU available");
        return;
    };

    let mut checker = VisibilityChecker::new(device, queue, config(64));
    checker.init().unwrap();
    checker
        .pack_geometry(&[instance(quad([0.0, 0.0, -5.0], 1.0))])
        .unwrap();
    run_check(&mut checker);
    assert_eq!(checker.state(), ReadyState::HasResults);

    // Rejected pack: no allocation, prior results and state untouched.
    assert!(matches!(
        checker.pack_geometry(&[]),
        Err(VisibilityError::EmptyMeshSet)
    ));
    assert_eq!(checker.state(), ReadyState::HasResults);
    assert_eq!(checker.visible_count(), 2);
}

#[test]
fn lifecycle_guards_and_teardown() {
    let Some((device, queue)) = init_gpu() else {
        println!("Skipping GPU test - no GPU available");
        return;
    };

    let mut checker = VisibilityChecker::new(device, queue, config(64));

    // Nothing works before init.
    assert!(matches!(
        checker.check_visibility_async(),
        Err(VisibilityError::NotInitialized)
    ));
    assert!(matches!(
        checker.pack_geometry(&[instance(quad([0.0, 0.0, -5.0], 1.0))]),
        Err(VisibilityError::NotInitialized)
    ));

    checker.init().unwrap();
    assert!(matches!(
        checker.init(),
        Err(VisibilityError::AlreadyInitialized)
    ));

    // Checking without packed geometry is rejected.
    assert!(matches!(
        checker.check_visibility_async(),
        Err(VisibilityError::GeometryNotPacked)
    ));

    checker
        .pack_geometry(&[instance(quad([0.0, 0.0, -5.0], 1.0))])
        .unwrap();
    run_check(&mut checker);

    // Non-final dispose releases buffers but keeps the checker usable.
    checker.clear_and_dispose(false);
    checker.clear_and_dispose(false); // idempotent
    assert_eq!(checker.state(), ReadyState::Ready);
    assert!(matches!(
        checker.check_visibility_async(),
        Err(VisibilityError::GeometryNotPacked)
    ));

    // Final dispose tears everything down.
    checker.clear_and_dispose(true);
    assert_eq!(checker.state(), ReadyState::Uninitialized);
    assert!(matches!(
        checker.check_visibility_async(),
        Err(VisibilityError::NotInitialized)
    ));

    // A fresh init brings it back.
    checker.init().unwrap();
    checker
        .pack_geometry(&[instance(quad([0.0, 0.0, -5.0], 1.0))])
        .unwrap();
    run_check(&mut checker);
    assert_eq!(checker.visible_count(), 2);
}
