//! Renderer integration tests.
//!
//! Every test runs against each [`Backend`] that is available.
//!
//! ```bash
//! cargo test --test renderer_tests
//!
//! # Include the GPU backend
//! DEFERRED_RENDERER_GPU_TESTS=1 cargo test --test renderer_tests
//! ```

mod common;

use rstest::rstest;

use common::{
    canvas_pixel, cube_scene, renderer, rgb_close, run_until_idle, target_pixels, Backend,
};
use deferred_renderer::pipeline::{AmbientLightPass, LightMergePass, PointLightPass};
use deferred_renderer::renderer::{TargetId, DEFAULT_OUTPUT};
use deferred_renderer::scene::{PointLight, SceneChange};
use deferred_renderer::{Renderer, RendererConfig};
use glam::Vec3;

const CLEAR_COLOR: [f32; 4] = [0.1, 0.1, 0.15, 1.0];
const TAA_FRAMES: u32 = 64;

// ============================================================================
// End-to-end
// ============================================================================

/// A lit cube renders non-black in the center and leaves the clear color
/// around it.
#[rstest]
#[case::software(Backend::Software)]
#[case::wgpu(Backend::Wgpu)]
fn test_lit_cube_end_to_end(#[case] backend: Backend) {
    let Some(mut renderer) = renderer(backend, 64, 64) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };
    cube_scene(&mut renderer);

    let frames = run_until_idle(&mut renderer, TAA_FRAMES * 2);
    assert_eq!(frames, TAA_FRAMES);
    assert!(renderer.taa().is_converged());

    let center = canvas_pixel(&mut renderer, 32, 32);
    assert!(
        center[0] + center[1] + center[2] > 0.1,
        "center pixel is not lit: {:?}",
        center
    );

    let corner = canvas_pixel(&mut renderer, 1, 1);
    assert!(
        rgb_close(corner, CLEAR_COLOR, 0.02),
        "corner pixel is not the clear color: {:?}",
        corner
    );
}

/// The capture matches the canvas readback.
#[rstest]
#[case::software(Backend::Software)]
#[case::wgpu(Backend::Wgpu)]
fn test_capture(#[case] backend: Backend) {
    let Some(mut renderer) = renderer(backend, 32, 16) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };
    cube_scene(&mut renderer);
    renderer.set_taa_enabled(false);
    assert_eq!(run_until_idle(&mut renderer, 8), 1);

    let image = renderer.capture().unwrap();
    assert_eq!(image.dimensions(), (32, 16));
    let corner = image.get_pixel(0, 0);
    assert_eq!(corner[3], 255);
    assert!((corner[0] as i32 - 26).abs() <= 1);
}

// ============================================================================
// Resize
// ============================================================================

/// Resizing from 100x100 to 50x50 resizes every framebuffer, even before the
/// first prepare.
#[rstest]
#[case::software(Backend::Software)]
#[case::wgpu(Backend::Wgpu)]
fn test_resize_before_first_prepare(#[case] backend: Backend) {
    let Some(mut renderer) = renderer(backend, 100, 100) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };
    renderer.resize(50, 50, 1.0);
    assert_eq!(renderer.backend().canvas_size(), (50, 50));
    assert_eq!(renderer.render_size(), (50, 50));

    assert!(renderer.prepare(0.0));
    renderer.draw(0.0);

    let targets = renderer.targets().unwrap();
    for framebuffer in targets.iter() {
        assert_eq!(framebuffer.size(), (50, 50), "{}", framebuffer.label());
        for attachment in framebuffer.attachments() {
            assert_eq!(
                renderer.backend().texture_size(attachment.texture),
                Some((50, 50)),
                "{} {}",
                framebuffer.label(),
                attachment.name
            );
        }
    }
}

#[test]
fn test_resize_before_initialize() {
    common::init_logging();
    let mut renderer = Renderer::new(
        Box::new(deferred_renderer::SoftwareBackend::new(100, 100)),
        RendererConfig::default(),
    );
    renderer.resize(50, 50, 1.0);
    assert!(!renderer.prepare(0.0));
    assert!(renderer.initialize());
    assert!(renderer.prepare(0.0));
    let targets = renderer.targets().unwrap();
    assert!(targets.iter().all(|fb| fb.size() == (50, 50)));
}

#[rstest]
#[case::half_scale(100, 80, 1.0, 0.5, (50, 40))]
#[case::hidpi(40, 30, 2.0, 1.0, (80, 60))]
#[case::fractional(33, 33, 1.5, 1.0, (49, 49))]
fn test_resolution_scale(
    #[case] width: u32,
    #[case] height: u32,
    #[case] dpr: f64,
    #[case] scale: f32,
    #[case] expected: (u32, u32),
) {
    let Some(mut renderer) = renderer(Backend::Software, 16, 16) else {
        return;
    };
    renderer.set_resolution_scale(scale);
    renderer.resize(width, height, dpr);
    renderer.prepare(0.0);
    assert_eq!(renderer.render_size(), expected);
    let targets = renderer.targets().unwrap();
    assert_eq!(targets.get(TargetId::Geometry).size(), expected);
}

// ============================================================================
// TAA
// ============================================================================

/// Convergence stops drawing; a camera move restarts the sequence.
#[rstest]
#[case::software(Backend::Software)]
#[case::wgpu(Backend::Wgpu)]
fn test_taa_reset_on_camera_move(#[case] backend: Backend) {
    let Some(mut renderer) = renderer(backend, 16, 16) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };
    cube_scene(&mut renderer);
    renderer.set_taa_frame_count(8);

    assert_eq!(run_until_idle(&mut renderer, 100), 8);
    assert!(!renderer.prepare(1000.0));
    assert_eq!(renderer.taa().frame(), 8);

    renderer.camera_mut().set_position(Vec3::new(3.0, 2.0, 2.0));
    assert!(renderer.prepare(1016.0));
    assert_eq!(renderer.taa().frame(), 0);
    renderer.draw(1016.0);
    assert_eq!(renderer.taa().frame(), 1);

    assert_eq!(run_until_idle(&mut renderer, 100), 7);
}

/// A reset empties the accumulation buffer before the first new sample.
#[rstest]
#[case::software(Backend::Software)]
#[case::wgpu(Backend::Wgpu)]
fn test_taa_reset_clears_accumulation(#[case] backend: Backend) {
    let Some(mut renderer) = renderer(backend, 16, 16) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };
    cube_scene(&mut renderer);
    renderer.set_taa_frame_count(4);
    run_until_idle(&mut renderer, 100);
    let converged = target_pixels(&mut renderer, TargetId::Accumulation);
    assert!(converged.iter().any(|pixel| pixel[3] > 0.0));

    renderer.camera_mut().set_position(Vec3::new(3.0, 2.0, 2.0));
    assert!(renderer.prepare(1000.0));
    let cleared = target_pixels(&mut renderer, TargetId::Accumulation);
    assert!(cleared.iter().all(|pixel| *pixel == [0.0; 4]));
}

/// Scene edits restart accumulation, whether marked by the host or reported
/// by the scene's update callback.
#[test]
fn test_taa_reset_on_scene_change() {
    let Some(mut renderer) = renderer(Backend::Software, 16, 16) else {
        return;
    };
    cube_scene(&mut renderer);
    renderer.set_taa_frame_count(8);
    assert_eq!(run_until_idle(&mut renderer, 100), 8);

    renderer.mark_scene_changed(SceneChange::DIRECTIONAL);
    assert!(renderer.prepare(500.0));
    assert_eq!(renderer.taa().frame(), 0);
    renderer.draw(500.0);
    assert_eq!(run_until_idle(&mut renderer, 100), 7);

    let scene = std::mem::take(renderer.scene_mut()).with_update(|content, time| {
        if time >= 1000.0 && content.ambient.is_empty() {
            content.ambient = vec![deferred_renderer::scene::AmbientLight::new(Vec3::ONE, 0.1)];
            SceneChange::AMBIENT
        } else {
            SceneChange::NONE
        }
    });
    renderer.set_scene(scene);
    assert_eq!(run_until_idle(&mut renderer, 100), 8);
    assert!(renderer.taa().is_converged());

    assert!(renderer.prepare(1000.0));
    assert_eq!(renderer.taa().frame(), 0);
    renderer.draw(1000.0);
    assert_eq!(run_until_idle(&mut renderer, 100), 7);
}

/// A new background after convergence is accumulated from scratch instead
/// of being blended into the old image.
#[rstest]
#[case::software(Backend::Software)]
#[case::wgpu(Backend::Wgpu)]
fn test_clear_color_change_restarts_taa(#[case] backend: Backend) {
    let Some(mut renderer) = renderer(backend, 16, 16) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };
    cube_scene(&mut renderer);
    renderer.set_taa_frame_count(8);
    assert_eq!(run_until_idle(&mut renderer, 100), 8);

    renderer.set_clear_color([1.0, 0.0, 0.0, 1.0]);
    assert_eq!(run_until_idle(&mut renderer, 100), 8);
    let corner = canvas_pixel(&mut renderer, 0, 0);
    assert!(rgb_close(corner, [1.0, 0.0, 0.0, 1.0], 0.02), "{:?}", corner);

    // Same color is not a change
    renderer.set_clear_color([1.0, 0.0, 0.0, 1.0]);
    assert!(!renderer.prepare(2000.0));
}

#[test]
fn test_taa_disabled_draws_once() {
    let Some(mut renderer) = renderer(Backend::Software, 16, 16) else {
        return;
    };
    cube_scene(&mut renderer);
    renderer.set_taa_enabled(false);
    assert_eq!(run_until_idle(&mut renderer, 100), 1);
    assert_eq!(renderer.taa().frame(), 0);

    renderer.set_taa_enabled(true);
    assert_eq!(run_until_idle(&mut renderer, 100), TAA_FRAMES);
}

#[test]
fn test_taa_setting_change_restarts() {
    let Some(mut renderer) = renderer(Backend::Software, 16, 16) else {
        return;
    };
    renderer.set_taa_frame_count(4);
    assert_eq!(run_until_idle(&mut renderer, 100), 4);

    // Same value is not a change
    renderer.set_taa_frame_count(4);
    assert!(!renderer.prepare(0.0));

    renderer.set_taa_halton_bases(3, 5);
    assert_eq!(run_until_idle(&mut renderer, 100), 4);
    assert_eq!(renderer.taa().jitter().len(), 4);
}

// ============================================================================
// Redundant state suppression
// ============================================================================

/// An idle frame uploads nothing; a camera move uploads only what changed.
#[rstest]
#[case::software(Backend::Software)]
#[case::wgpu(Backend::Wgpu)]
fn test_redundant_uploads_suppressed(#[case] backend: Backend) {
    let Some(mut renderer) = renderer(backend, 16, 16) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };
    cube_scene(&mut renderer);
    renderer.set_taa_frame_count(2);
    run_until_idle(&mut renderer, 100);

    renderer.backend_mut().reset_stats();
    assert!(!renderer.prepare(2000.0));
    let stats = renderer.backend().stats();
    assert!(stats.uniform_uploads.is_empty(), "{:?}", stats.uniform_uploads);
    assert_eq!(stats.program_compilations, 0);
    assert_eq!(stats.buffer_writes, 0);

    renderer.camera_mut().set_position(Vec3::new(2.0, 3.0, 3.0));
    assert!(renderer.prepare(2016.0));
    renderer.draw(2016.0);
    let stats = renderer.backend().stats();
    assert_eq!(stats.uniform_uploads("u_view"), 1);
    assert_eq!(stats.uniform_uploads("u_projection"), 0);
    assert_eq!(stats.uniform_uploads("u_model"), 0);
    assert_eq!(stats.uniform_uploads("u_background"), 0);
    assert_eq!(stats.program_compilations, 0);
}

// ============================================================================
// Light recompilation
// ============================================================================

fn point_lights(count: usize) -> Vec<PointLight> {
    (0..count)
        .map(|i| {
            PointLight::new(
                Vec3::new(i as f32, 1.0, 0.0),
                2.0,
                Vec3::new(1.0, 0.5, 0.25),
                1.0,
            )
        })
        .collect()
}

/// Only a change in light count recompiles the point light program.
#[rstest]
#[case::software(Backend::Software)]
#[case::wgpu(Backend::Wgpu)]
fn test_light_count_recompiles(#[case] backend: Backend) {
    let Some(mut renderer) = renderer(backend, 16, 16) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };
    cube_scene(&mut renderer);
    renderer.set_taa_enabled(false);
    run_until_idle(&mut renderer, 10);

    renderer.backend_mut().reset_stats();
    renderer.scene_mut().content.point = point_lights(3);
    renderer.mark_scene_changed(SceneChange::POINT);
    assert!(renderer.prepare(0.0));
    assert_eq!(renderer.backend().stats().program_compilations, 1);
    let variant = renderer.pass_mut::<PointLightPass>().unwrap().variant().unwrap();
    assert_eq!(variant.count, 3);
    renderer.draw(0.0);

    renderer.backend_mut().reset_stats();
    let mut lights = point_lights(3);
    lights[0].intensity = 4.0;
    renderer.scene_mut().content.point = lights;
    renderer.mark_scene_changed(SceneChange::POINT);
    assert!(renderer.prepare(16.0));
    let stats = renderer.backend().stats();
    assert_eq!(stats.program_compilations, 0);
    assert!(stats.buffer_writes >= 1);
    renderer.draw(16.0);

    renderer.backend_mut().reset_stats();
    renderer.scene_mut().content.point.clear();
    renderer.mark_scene_changed(SceneChange::POINT);
    assert!(renderer.prepare(32.0));
    assert_eq!(renderer.backend().stats().program_compilations, 1);
    let variant = renderer.pass_mut::<PointLightPass>().unwrap().variant().unwrap();
    assert_eq!(variant.count, 0);
}

#[test]
fn test_scene_update_callback_drives_recompile() {
    let Some(mut renderer) = renderer(Backend::Software, 16, 16) else {
        return;
    };
    cube_scene(&mut renderer);
    renderer.set_taa_enabled(false);
    let scene = std::mem::take(renderer.scene_mut()).with_update(|content, time| {
        if time >= 100.0 && content.ambient.len() < 2 {
            content.ambient = vec![
                deferred_renderer::scene::AmbientLight::new(Vec3::ONE, 0.1),
                deferred_renderer::scene::AmbientLight::new(Vec3::X, 0.2),
            ];
            SceneChange::AMBIENT
        } else {
            SceneChange::NONE
        }
    });
    renderer.set_scene(scene);
    assert!(renderer.prepare(0.0));
    renderer.draw(0.0);
    assert!(!renderer.prepare(50.0));

    renderer.backend_mut().reset_stats();
    assert!(renderer.prepare(100.0));
    assert_eq!(renderer.backend().stats().program_compilations, 1);
    let pass = renderer.pass_mut::<AmbientLightPass>().unwrap();
    assert_eq!(pass.light_count(), 2);
}

// ============================================================================
// Debug views
// ============================================================================

#[rstest]
#[case::software(Backend::Software)]
#[case::wgpu(Backend::Wgpu)]
fn test_debug_view_switch(#[case] backend: Backend) {
    let Some(mut renderer) = renderer(backend, 16, 16) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };
    cube_scene(&mut renderer);
    renderer.set_taa_enabled(false);
    run_until_idle(&mut renderer, 10);

    let views = renderer.debug_views();
    assert_eq!(views[renderer.output()].name, DEFAULT_OUTPUT);
    assert!(views.iter().all(|view| view.texture.is_some()));

    let albedo = views
        .iter()
        .position(|view| view.target == TargetId::Geometry && view.attachment == 0)
        .unwrap();
    assert!(renderer.set_output(albedo));
    assert!(renderer.prepare(100.0));
    renderer.draw(100.0);

    // Albedo is transparent black outside the cube and white on it
    let corner = canvas_pixel(&mut renderer, 0, 0);
    assert!(rgb_close(corner, [0.0, 0.0, 0.0, 1.0], 0.01), "{:?}", corner);
    let center = canvas_pixel(&mut renderer, 8, 8);
    assert!(rgb_close(center, [1.0, 1.0, 1.0, 1.0], 0.01), "{:?}", center);

    assert!(!renderer.set_output(views.len()));
    assert_eq!(renderer.output(), albedo);
}

/// Switching views on a converged image redraws the canvas but leaves the
/// accumulated samples alone.
#[rstest]
#[case::software(Backend::Software)]
#[case::wgpu(Backend::Wgpu)]
fn test_view_switch_keeps_converged_image(#[case] backend: Backend) {
    let Some(mut renderer) = renderer(backend, 16, 16) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };
    cube_scene(&mut renderer);
    renderer.set_taa_frame_count(8);
    run_until_idle(&mut renderer, 100);
    let converged = target_pixels(&mut renderer, TargetId::Accumulation);
    let accumulated = renderer.output();

    assert!(renderer.set_output(0));
    assert!(renderer.prepare(1000.0));
    renderer.draw(1000.0);
    assert!(renderer.set_output(accumulated));
    assert!(renderer.prepare(1016.0));
    renderer.draw(1016.0);

    assert_eq!(target_pixels(&mut renderer, TargetId::Accumulation), converged);
    assert_eq!(renderer.taa().frame(), 8);
    assert!(!renderer.prepare(1032.0));
}

#[test]
fn test_clear_color_reaches_merge() {
    let Some(mut renderer) = renderer(Backend::Software, 8, 8) else {
        return;
    };
    renderer.set_taa_enabled(false);
    renderer.set_clear_color([1.0, 0.0, 0.0, 1.0]);
    assert!(renderer.pass_mut::<LightMergePass>().is_some());
    run_until_idle(&mut renderer, 4);
    let pixel = canvas_pixel(&mut renderer, 4, 4);
    assert!(rgb_close(pixel, [1.0, 0.0, 0.0, 1.0], 0.01), "{:?}", pixel);
}
