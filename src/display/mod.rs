//! Framebuffer compositing: per-display pixel surfaces, pixel-format
//! grouping, row layout, and the vertical scroll animation.

pub mod framebuffer;
pub mod group;
pub mod linux_fb;

pub use framebuffer::{Framebuffer, FramebufferDevice, PixelFormat};
pub use group::{FramebuffersGroup, LayoutRect, LayoutRow};
pub use linux_fb::LinuxFramebufferDevice;
