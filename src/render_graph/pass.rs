//! Render pass contract
//!
//! A pass owns one program and a dirty register over its own uniforms. The
//! orchestrator drives it through `initialize` / `prepare` / `draw`, and may
//! inject pre- and post-draw hooks for clears or blend toggles. Camera and
//! jitter input are optional capabilities queried at runtime.

use std::any::Any;

use glam::Vec2;

use crate::backend::{
    BackendError, FramebufferHandle, GraphicsBackend, ProgramDescriptor, ProgramHandle,
    TextureHandle, UniformValue,
};
use crate::scene::CameraMatrices;

/// Closure run against the backend around a pass's draw body
pub type PassHook = Box<dyn FnMut(&mut dyn GraphicsBackend)>;

/// Optional hooks injected by the orchestrator
#[derive(Default)]
pub struct PassHooks {
    pub pre_draw: Option<PassHook>,
    pub post_draw: Option<PassHook>,
}

impl std::fmt::Debug for PassHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PassHooks")
            .field("pre_draw", &self.pre_draw.is_some())
            .field("post_draw", &self.post_draw.is_some())
            .finish()
    }
}

/// Accepts view/projection matrices and their derived inverses
pub trait CameraConsumer {
    fn set_camera(&mut self, camera: &CameraMatrices);
}

/// Accepts an NDC-space sub-pixel offset
pub trait JitterConsumer {
    fn set_ndc_offset(&mut self, offset: Vec2);
}

/// Trait for render passes
pub trait RenderPass: Any {
    /// Get the pass name for debugging
    fn name(&self) -> &str;

    /// Compile the program, bind static texture units and mark everything dirty
    fn initialize(&mut self, backend: &mut dyn GraphicsBackend) -> bool;

    /// Upload dirty uniform state; returns whether anything was dirty
    fn prepare(&mut self, backend: &mut dyn GraphicsBackend) -> bool;

    fn core(&self) -> &PassCore;

    fn core_mut(&mut self) -> &mut PassCore;

    fn hooks_mut(&mut self) -> &mut PassHooks {
        &mut self.core_mut().hooks
    }

    /// Point the pass at a framebuffer of the given size
    fn set_target(&mut self, target: FramebufferHandle, size: (u32, u32)) {
        let core = self.core_mut();
        core.target = Some(target);
        core.size = size;
    }

    /// Whether the program compiled
    fn is_ready(&self) -> bool {
        self.core().program.is_some()
    }

    /// Bind target and program. Returns `false` when the pass cannot draw.
    fn setup(&mut self, backend: &mut dyn GraphicsBackend) -> bool;

    /// Pass-specific draw calls
    fn draw_body(&mut self, backend: &mut dyn GraphicsBackend);

    /// Undo state that must not leak into later passes
    fn teardown(&mut self, _backend: &mut dyn GraphicsBackend) {}

    /// setup, pre-draw hook, body, post-draw hook, teardown
    fn draw(&mut self, backend: &mut dyn GraphicsBackend) {
        if !self.setup(backend) {
            log::trace!("{}: skipped, pass is not ready", self.name());
            return;
        }
        if let Some(hook) = self.hooks_mut().pre_draw.as_mut() {
            hook(backend);
        }
        self.draw_body(backend);
        if let Some(hook) = self.hooks_mut().post_draw.as_mut() {
            hook(backend);
        }
        self.teardown(backend);
    }

    fn as_camera_consumer(&mut self) -> Option<&mut dyn CameraConsumer> {
        None
    }

    fn as_jitter_consumer(&mut self) -> Option<&mut dyn JitterConsumer> {
        None
    }

    /// Allow downcasting
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Program, target and hooks shared by every pass
#[derive(Debug, Default)]
pub struct PassCore {
    pub program: Option<ProgramHandle>,
    pub target: Option<FramebufferHandle>,
    pub size: (u32, u32),
    pub hooks: PassHooks,
}

impl PassCore {
    /// Replace the current program with a fresh compilation of `desc`.
    ///
    /// On failure the error is logged and the pass is left without a program.
    pub fn compile(&mut self, backend: &mut dyn GraphicsBackend, desc: &ProgramDescriptor) -> bool {
        if let Some(old) = self.program.take() {
            backend.destroy_program(old);
        }
        match backend.create_program(desc) {
            Ok(program) => {
                self.program = Some(program);
                true
            }
            Err(BackendError::ShaderCompilationFailed { label, message }) => {
                log::error!("Program '{}' failed to compile:\n{}", label, message);
                false
            }
            Err(e) => {
                log::error!("Program '{}' could not be created: {}", desc.label, e);
                false
            }
        }
    }

    /// Bind target framebuffer, viewport and program
    pub fn bind(&self, backend: &mut dyn GraphicsBackend) -> bool {
        let (Some(program), Some(target)) = (self.program, self.target) else {
            return false;
        };
        backend.bind_framebuffer(target);
        backend.set_viewport(self.size.0, self.size.1);
        backend.use_program(Some(program));
        true
    }

    /// Point each sampler uniform at the texture unit matching its position
    pub fn bind_units(&self, backend: &mut dyn GraphicsBackend, samplers: &[&str]) {
        let Some(program) = self.program else {
            return;
        };
        for (unit, name) in samplers.iter().enumerate() {
            backend.set_uniform(program, name, UniformValue::Int(unit as i32));
        }
    }

    /// Bind `textures` to units 0..n
    pub fn bind_textures(backend: &mut dyn GraphicsBackend, textures: &[Option<TextureHandle>]) {
        for (unit, texture) in textures.iter().enumerate() {
            backend.bind_texture(unit as u32, *texture);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::software::SoftwareBackend;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct RecordingPass {
        core: PassCore,
        ready: bool,
        log: Rc<RefCell<Vec<&'static str>>>,
    }

    impl RenderPass for RecordingPass {
        fn name(&self) -> &str {
            "Recording"
        }

        fn initialize(&mut self, _backend: &mut dyn GraphicsBackend) -> bool {
            true
        }

        fn prepare(&mut self, _backend: &mut dyn GraphicsBackend) -> bool {
            false
        }

        fn core(&self) -> &PassCore {
            &self.core
        }

        fn core_mut(&mut self) -> &mut PassCore {
            &mut self.core
        }

        fn setup(&mut self, _backend: &mut dyn GraphicsBackend) -> bool {
            self.log.borrow_mut().push("setup");
            self.ready
        }

        fn draw_body(&mut self, _backend: &mut dyn GraphicsBackend) {
            self.log.borrow_mut().push("body");
        }

        fn teardown(&mut self, _backend: &mut dyn GraphicsBackend) {
            self.log.borrow_mut().push("teardown");
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    fn recording_pass(ready: bool) -> (RecordingPass, Rc<RefCell<Vec<&'static str>>>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut pass = RecordingPass {
            core: PassCore::default(),
            ready,
            log: log.clone(),
        };
        let pre = log.clone();
        pass.hooks_mut().pre_draw = Some(Box::new(move |_: &mut dyn GraphicsBackend| {
            pre.borrow_mut().push("pre")
        }));
        let post = log.clone();
        pass.hooks_mut().post_draw = Some(Box::new(move |_: &mut dyn GraphicsBackend| {
            post.borrow_mut().push("post")
        }));
        (pass, log)
    }

    #[test]
    fn test_draw_order() {
        let mut backend = SoftwareBackend::new(1, 1);
        let (mut pass, log) = recording_pass(true);
        pass.draw(&mut backend);
        assert_eq!(
            *log.borrow(),
            vec!["setup", "pre", "body", "post", "teardown"]
        );
    }

    #[test]
    fn test_failed_setup_skips_draw() {
        let mut backend = SoftwareBackend::new(1, 1);
        let (mut pass, log) = recording_pass(false);
        pass.draw(&mut backend);
        assert_eq!(*log.borrow(), vec!["setup"]);
    }

    #[test]
    fn test_capabilities_default_to_none() {
        let (mut pass, _) = recording_pass(true);
        assert!(pass.as_camera_consumer().is_none());
        assert!(pass.as_jitter_consumer().is_none());
        assert!(!pass.is_ready());
    }

    #[test]
    fn test_bind_without_program() {
        let mut backend = SoftwareBackend::new(1, 1);
        let mut core = PassCore::default();
        core.target = Some(FramebufferHandle::CANVAS);
        assert!(!core.bind(&mut backend));
    }
}
