//! Interactive viewer for the deferred renderer
//!
//! Run with:
//!   cargo run --example viewer
//!   cargo run --example viewer -- --output 5 --grid 12
//!   cargo run --example viewer -- --capture grid.png
//!
//! `--capture` renders headless until TAA converges and saves the canvas.

use std::error::Error;
use std::path::{Path, PathBuf};

use clap::Parser;
use deferred_renderer::{
    backend::GraphicsBackend,
    scene::{PointLight, Scene},
    window, Camera, Renderer, RendererConfig, TaaConfig, WgpuBackend, Window,
};
use glam::Vec3;
use winit::event_loop::EventLoop;

#[derive(Parser, Debug)]
#[command(about = "Deferred renderer viewer")]
struct Args {
    /// Window or capture width
    #[arg(long, default_value_t = 1280)]
    width: u32,

    /// Window or capture height
    #[arg(long, default_value_t = 720)]
    height: u32,

    /// Cubes per side of the instanced grid
    #[arg(long, default_value_t = 8)]
    grid: u32,

    /// Render resolution relative to the canvas
    #[arg(long, default_value_t = 1.0)]
    scale: f32,

    /// TAA samples accumulated before the image is final
    #[arg(long, default_value_t = 64)]
    taa_frames: u32,

    /// Disable temporal anti-aliasing
    #[arg(long)]
    no_taa: bool,

    /// Debug view shown on the canvas
    #[arg(long)]
    output: Option<usize>,

    /// Slowly orbit the camera (restarts TAA every frame)
    #[arg(long)]
    orbit: bool,

    /// Render headless and save the converged image to this PNG
    #[arg(long)]
    capture: Option<PathBuf>,
}

impl Args {
    fn config(&self) -> RendererConfig {
        RendererConfig::default()
            .with_resolution_scale(self.scale)
            .with_taa(TaaConfig {
                enabled: !self.no_taa,
                frame_count: self.taa_frames,
                ..Default::default()
            })
    }
}

fn build_scene(backend: &mut dyn GraphicsBackend, grid: u32) -> Result<Scene, Box<dyn Error>> {
    let mut scene = Scene::debug_grid(backend, grid)?;
    let reach = grid as f32 * 0.75;
    scene.content.point = vec![
        PointLight::new(Vec3::new(-reach, 1.0, 0.0), reach, Vec3::new(1.0, 0.3, 0.2), 2.0),
        PointLight::new(Vec3::new(reach, 1.0, 0.0), reach, Vec3::new(0.2, 0.4, 1.0), 2.0),
    ];
    Ok(scene)
}

fn setup(renderer: &mut Renderer, args: &Args) -> Result<(), Box<dyn Error>> {
    if !renderer.initialize() {
        return Err("renderer failed to initialize".into());
    }
    let scene = build_scene(renderer.backend_mut(), args.grid)?;
    renderer.set_scene(scene);

    let distance = args.grid.max(2) as f32 * 1.2;
    renderer.set_camera(Camera::new(
        Vec3::new(distance, distance * 0.8, distance),
        Vec3::ZERO,
    ));

    if let Some(output) = args.output {
        let views = renderer.debug_views();
        if !renderer.set_output(output) {
            log::warn!("{} debug views available:", views.len());
        }
        for (index, view) in views.iter().enumerate() {
            log::info!("  [{}] {} / {}", index, view.target.label(), view.name);
        }
    }
    Ok(())
}

fn capture(args: &Args, path: &Path) -> Result<(), Box<dyn Error>> {
    let backend = WgpuBackend::headless(args.width, args.height)?;
    let mut renderer = Renderer::new(Box::new(backend), args.config());
    setup(&mut renderer, args)?;

    let mut frames = 0;
    let limit = args.taa_frames.max(1) + 2;
    while frames < limit {
        let time = frames as f64 * 16.0;
        if !renderer.prepare(time) {
            break;
        }
        renderer.draw(time);
        frames += 1;
    }
    log::info!("Converged after {} frames", frames);

    renderer.capture()?.save(path)?;
    log::info!("Saved {}", path.display());
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if let Some(path) = &args.capture {
        return capture(&args, path);
    }

    let event_loop = EventLoop::new()?;
    let window = Window::new(&event_loop, "Deferred Renderer", args.width, args.height)?;
    let backend = WgpuBackend::new(window.window_arc(), true)?;
    let mut renderer = Renderer::new(Box::new(backend), args.config());
    setup(&mut renderer, &args)?;

    let orbit = args.orbit;
    let distance = args.grid.max(2) as f32 * 1.2;
    window::run(event_loop, window, renderer, move |renderer, time| {
        if orbit {
            let angle = (time * 0.0002) as f32;
            renderer.camera_mut().set_position(Vec3::new(
                distance * angle.cos() * 1.4,
                distance * 0.8,
                distance * angle.sin() * 1.4,
            ));
        }
    })?;
    Ok(())
}
