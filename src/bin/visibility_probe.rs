/// Visibility Pipeline Probe
///
/// Drives the full per-triangle visibility pipeline against a generated
/// scene: a grid of quads behind a partial occluder wall. Prints per-check
/// statistics and timing.

use anyhow::{anyhow, bail, Result};
use cgmath::Matrix4;
use std::sync::Arc;
use std::time::Instant;
use trivis::{MeshData, MeshInstance, ReadyState, VisibilityChecker, VisibilityConfig};

/// Test configuration
const GRID: i32 = 16;
const GRID_SPACING: f32 = 4.0;
const GRID_DEPTH: f32 = -60.0;
const WALL_DEPTH: f32 = -20.0;

fn main() -> Result<()> {
    env_logger::init();

    println!("Visibility Pipeline Probe");
    println!("=========================\n");

    let (device, queue) = init_gpu()?;

    let scene = build_scene();
    let scene_triangles: u32 = scene.iter().map(|i| i.mesh.triangle_count()).sum();
    println!("Scene: {} meshes, {} triangles", scene.len(), scene_triangles);

    for (name, config) in [
        (
            "Sliced (256 triangles/frame)",
            VisibilityConfig {
                resolution: 512,
                triangles_per_slice: 256,
                draw_in_one_frame: false,
            },
        ),
        (
            "Single frame",
            VisibilityConfig {
                resolution: 512,
                triangles_per_slice: 256,
                draw_in_one_frame: true,
            },
        ),
    ] {
        println!("\nTest: {}", name);

        let mut checker = VisibilityChecker::new(device.clone(), queue.clone(), config);
        checker.init().map_err(|e| anyhow!("init failed: {}", e))?;
        checker
            .pack_geometry(&scene)
            .map_err(|e| anyhow!("pack failed: {}", e))?;

        let start = Instant::now();
        let ticks = run_check(&mut checker)?;
        let elapsed = start.elapsed();

        let stats = checker.stats();
        println!("  Total triangles: {}", stats.triangle_count);
        println!("  Visible triangles: {}", checker.visible_count());
        println!("  GPU append counter: {}", stats.counted_visible);
        println!(
            "  Visibility: {:.1}%",
            checker.visible_count() as f32 / stats.triangle_count as f32 * 100.0
        );
        println!("  Update ticks: {}", ticks);
        println!("  Wall time: {:.2}ms", elapsed.as_secs_f64() * 1000.0);

        checker.clear_and_dispose(true);
    }

    Ok(())
}

fn init_gpu() -> Result<(Arc<wgpu::Device>, Arc<wgpu::Queue>)> {
    let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    });

    let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
        power_preference: wgpu::PowerPreference::HighPerformance,
        compatible_surface: None,
        force_fallback_adapter: false,
    }))
    .ok_or_else(|| anyhow!("no suitable GPU adapter"))?;

    let (device, queue) = pollster::block_on(adapter.request_device(
        &wgpu::DeviceDescriptor {
            label: Some("Visibility Probe Device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
        },
        None,
    ))?;

    Ok((Arc::new(device), Arc::new(queue)))
}

/// Grid of quads plus one wall hiding roughly a quarter of them.
fn build_scene() -> Vec<MeshInstance> {
    let mut scene = Vec::new();

    for gy in 0..GRID {
        for gx in 0..GRID {
            let x = (gx - GRID / 2) as f32 * GRID_SPACING;
            let y = (gy - GRID / 2) as f32 * GRID_SPACING;
            scene.push(MeshInstance {
                mesh: quad([x, y, GRID_DEPTH], 1.5),
                world_from_local: Matrix4::from_scale(1.0),
            });
        }
    }

    // Occluder wall in front of the grid's upper-left quadrant
    scene.push(MeshInstance {
        mesh: quad(
            [-GRID as f32, GRID as f32, WALL_DEPTH],
            GRID as f32 * GRID_SPACING / 8.0,
        ),
        world_from_local: Matrix4::from_scale(1.0),
    });

    scene
}

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

/// Advance the checker once per simulated frame until results land.
fn run_check(checker: &mut VisibilityChecker) -> Result<u32> {
    checker
        .check_visibility_async()
        .map_err(|e| anyhow!("check failed to start: {}", e))?;

    let mut ticks = 0u32;
    loop {
        ticks += 1;
        match checker.update() {
            Ok(ReadyState::HasResults) => return Ok(ticks),
            Ok(_) => {}
            Err(e) => bail!("check failed: {}", e),
        }
        if ticks > 1_000_000 {
            bail!("check did not complete");
        }
    }
}
