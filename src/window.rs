//! Window management using winit

use std::sync::Arc;
use std::time::Instant;

use winit::{
    dpi::PhysicalSize,
    event::{Event, WindowEvent},
    event_loop::{ControlFlow, EventLoop, EventLoopWindowTarget},
    window::{Window as WinitWindow, WindowBuilder},
};

use crate::backend::{BackendError, BackendResult};
use crate::renderer::Renderer;

/// Wrapper around winit window with additional state
pub struct Window {
    window: Arc<WinitWindow>,
    width: u32,
    height: u32,
    scale_factor: f64,
    resized: bool,
    close_requested: bool,
}

impl Window {
    /// Create a new window with the given title and dimensions
    pub fn new(
        event_loop: &EventLoop<()>,
        title: &str,
        width: u32,
        height: u32,
    ) -> BackendResult<Self> {
        let window = WindowBuilder::new()
            .with_title(title)
            .with_inner_size(PhysicalSize::new(width, height))
            .build(event_loop)
            .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;
        let size = window.inner_size();
        let scale_factor = window.scale_factor();

        Ok(Self {
            window: Arc::new(window),
            width: size.width,
            height: size.height,
            scale_factor,
            resized: false,
            close_requested: false,
        })
    }

    /// Get the raw window for backend initialization
    pub fn window(&self) -> &WinitWindow {
        &self.window
    }

    /// Get arc reference to window
    pub fn window_arc(&self) -> Arc<WinitWindow> {
        Arc::clone(&self.window)
    }

    /// Current client size in CSS-like logical pixels
    pub fn client_size(&self) -> (u32, u32) {
        let logical = PhysicalSize::new(self.width, self.height).to_logical::<f64>(self.scale_factor);
        (logical.width.round() as u32, logical.height.round() as u32)
    }

    pub fn scale_factor(&self) -> f64 {
        self.scale_factor
    }

    /// Check if window was resized since last frame
    pub fn was_resized(&self) -> bool {
        self.resized
    }

    /// Clear the resize flag
    pub fn clear_resize_flag(&mut self) {
        self.resized = false;
    }

    /// Check if close was requested
    pub fn should_close(&self) -> bool {
        self.close_requested
    }

    /// Handle window events
    pub fn handle_event(&mut self, event: &WindowEvent) {
        match event {
            WindowEvent::Resized(size) => {
                self.width = size.width;
                self.height = size.height;
                self.resized = true;
            }
            WindowEvent::ScaleFactorChanged { scale_factor, .. } => {
                self.scale_factor = *scale_factor;
                self.resized = true;
            }
            WindowEvent::CloseRequested => {
                self.close_requested = true;
            }
            _ => {}
        }
    }

    /// Request a redraw
    pub fn request_redraw(&self) {
        self.window.request_redraw();
    }
}

/// Drive `renderer` from the window's event loop.
///
/// Every iteration runs `on_frame`, which may edit the scene or camera, and
/// requests a redraw. The redraw only reaches the backend while `prepare`
/// reports pending work, so a converged image costs no GPU time.
pub fn run<F>(
    event_loop: EventLoop<()>,
    mut window: Window,
    mut renderer: Renderer,
    mut on_frame: F,
) -> BackendResult<()>
where
    F: FnMut(&mut Renderer, f64) + 'static,
{
    let start = Instant::now();
    let (width, height) = window.client_size();
    renderer.resize(width, height, window.scale_factor());

    event_loop
        .run(move |event, elwt: &EventLoopWindowTarget<()>| {
            elwt.set_control_flow(ControlFlow::Poll);

            match event {
                Event::WindowEvent { event, .. } => {
                    window.handle_event(&event);

                    match event {
                        WindowEvent::CloseRequested => elwt.exit(),
                        WindowEvent::RedrawRequested => {
                            let time = start.elapsed().as_secs_f64() * 1000.0;
                            if renderer.prepare(time) {
                                renderer.draw(time);
                            }
                        }
                        _ => {}
                    }
                }
                Event::AboutToWait => {
                    if window.was_resized() {
                        let (width, height) = window.client_size();
                        renderer.resize(width, height, window.scale_factor());
                        window.clear_resize_flag();
                    }
                    on_frame(&mut renderer, start.elapsed().as_secs_f64() * 1000.0);
                    window.request_redraw();
                }
                _ => {}
            }
        })
        .map_err(|e| BackendError::SurfaceError(e.to_string()))
}
