//! Framebuffers: named color attachments plus optional depth, all one size

use crate::backend::{
    BackendResult, FramebufferDescriptor, FramebufferHandle, GraphicsBackend, TextureDescriptor,
    TextureFormat, TextureHandle, TextureUsage,
};

/// Layout of one color attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentSpec {
    pub slot: u32,
    pub name: &'static str,
    pub format: TextureFormat,
}

impl AttachmentSpec {
    pub const fn new(slot: u32, name: &'static str, format: TextureFormat) -> Self {
        Self { slot, name, format }
    }
}

/// A created color attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attachment {
    pub slot: u32,
    pub name: &'static str,
    pub format: TextureFormat,
    pub texture: TextureHandle,
}

/// Render target owning its attachment textures
#[derive(Debug)]
pub struct Framebuffer {
    label: String,
    handle: FramebufferHandle,
    attachments: Vec<Attachment>,
    depth: Option<TextureHandle>,
    size: (u32, u32),
}

impl Framebuffer {
    pub fn new(
        backend: &mut dyn GraphicsBackend,
        label: &str,
        specs: &[AttachmentSpec],
        depth: Option<TextureFormat>,
        size: (u32, u32),
    ) -> BackendResult<Self> {
        let (width, height) = (size.0.max(1), size.1.max(1));
        let mut attachments = Vec::with_capacity(specs.len());
        for spec in specs {
            let texture = backend.create_texture(&TextureDescriptor {
                label: Some(format!("{} {}", label, spec.name)),
                width,
                height,
                format: spec.format,
                usage: TextureUsage::RENDER_ATTACHMENT
                    | TextureUsage::TEXTURE_BINDING
                    | TextureUsage::COPY_SRC,
            })?;
            attachments.push(Attachment {
                slot: spec.slot,
                name: spec.name,
                format: spec.format,
                texture,
            });
        }

        let depth = match depth {
            Some(format) => Some(backend.create_texture(&TextureDescriptor {
                label: Some(format!("{} depth", label)),
                width,
                height,
                format,
                usage: TextureUsage::RENDER_ATTACHMENT,
            })?),
            None => None,
        };

        let handle = backend.create_framebuffer(&FramebufferDescriptor {
            label: Some(label.to_string()),
            color_attachments: attachments.iter().map(|a| (a.slot, a.texture)).collect(),
            depth_attachment: depth,
        })?;

        log::debug!(
            "Created framebuffer '{}' ({}x{}, {} color attachments)",
            label,
            width,
            height,
            attachments.len()
        );

        Ok(Self {
            label: label.to_string(),
            handle,
            attachments,
            depth,
            size: (width, height),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn handle(&self) -> FramebufferHandle {
        self.handle
    }

    pub fn size(&self) -> (u32, u32) {
        self.size
    }

    pub fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }

    /// Texture bound at `slot`
    pub fn texture(&self, slot: u32) -> Option<TextureHandle> {
        self.attachments
            .iter()
            .find(|a| a.slot == slot)
            .map(|a| a.texture)
    }

    pub fn depth(&self) -> Option<TextureHandle> {
        self.depth
    }

    /// Reallocate every attachment at the new size. Handles stay the same.
    pub fn resize(&mut self, backend: &mut dyn GraphicsBackend, width: u32, height: u32) {
        let (width, height) = (width.max(1), height.max(1));
        if self.size == (width, height) {
            return;
        }
        for attachment in &self.attachments {
            backend.resize_texture(attachment.texture, width, height);
        }
        if let Some(depth) = self.depth {
            backend.resize_texture(depth, width, height);
        }
        self.size = (width, height);
    }

    /// Bind and clear all attachments
    pub fn clear(&self, backend: &mut dyn GraphicsBackend, color: [f32; 4]) {
        backend.bind_framebuffer(self.handle);
        backend.set_viewport(self.size.0, self.size.1);
        backend.clear(Some(color), self.depth.map(|_| 1.0));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::software::SoftwareBackend;

    const SPECS: [AttachmentSpec; 2] = [
        AttachmentSpec::new(0, "Albedo", TextureFormat::Rgba8Unorm),
        AttachmentSpec::new(1, "Normal", TextureFormat::Rgba16Float),
    ];

    #[test]
    fn test_create_and_resize() {
        let mut backend = SoftwareBackend::new(1, 1);
        let mut fb = Framebuffer::new(
            &mut backend,
            "Test",
            &SPECS,
            Some(TextureFormat::Depth32Float),
            (16, 8),
        )
        .unwrap();
        assert_eq!(fb.size(), (16, 8));
        let albedo = fb.texture(0).unwrap();

        fb.resize(&mut backend, 4, 2);
        assert_eq!(fb.size(), (4, 2));
        assert_eq!(fb.texture(0), Some(albedo));
        for attachment in fb.attachments() {
            assert_eq!(backend.texture_size(attachment.texture), Some((4, 2)));
        }
        assert_eq!(backend.texture_size(fb.depth().unwrap()), Some((4, 2)));
    }

    #[test]
    fn test_clear() {
        let mut backend = SoftwareBackend::new(1, 1);
        let fb = Framebuffer::new(&mut backend, "Test", &SPECS, None, (2, 2)).unwrap();
        fb.clear(&mut backend, [0.5, 0.0, 0.0, 1.0]);
        let pixels = backend.read_pixels(fb.handle(), 1, (0, 0, 2, 2)).unwrap();
        assert!(pixels.iter().all(|p| p[0] == 0.5));
    }

    #[test]
    fn test_zero_size_is_clamped() {
        let mut backend = SoftwareBackend::new(1, 1);
        let mut fb = Framebuffer::new(&mut backend, "Test", &SPECS, None, (0, 0)).unwrap();
        assert_eq!(fb.size(), (1, 1));
        fb.resize(&mut backend, 0, 10);
        assert_eq!(fb.size(), (1, 10));
    }
}
