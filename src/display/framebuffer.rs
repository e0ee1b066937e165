//! `Framebuffer`: one physical display's linear pixel surface, plus the
//! `FramebufferDevice` trait abstracting `/dev/fb*` (`FBIOGET_FSCREENINFO`/
//! `FBIOGET_VSCREENINFO`/`mmap`) so the compositor math is testable
//! without a real display.

use crate::error::PlayerError;

/// A pixel format the compositor can classify, derived from bit depth and
/// channel bit offsets reported by the device. Mirrors
/// `decoder::device::PixelFormat`'s variant set (the two halves of the
/// pipeline must agree on a format to render a stream at all) but is kept
/// as a distinct type since this one is a property of a *display*, not a
/// *decoder capability query*.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Rgb565,
    Bgra8888,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Rgb565 => 2,
            PixelFormat::Bgra8888 => 4,
        }
    }

    /// Classifies reported bit-depth/channel-offset info: 16bpp with
    /// R5G6B5 offsets, or 32bpp with 8/8/8/8 BGRA offsets. Returns `None`
    /// for anything else — an unrecognized format cannot be grouped, so
    /// `Framebuffer::open` rejects it.
    pub fn classify(bits_per_pixel: u32, r_offset: u32, g_offset: u32, b_offset: u32) -> Option<Self> {
        match (bits_per_pixel, r_offset, g_offset, b_offset) {
            (16, 11, 5, 0) => Some(PixelFormat::Rgb565),
            (32, 16, 8, 0) => Some(PixelFormat::Bgra8888),
            _ => None,
        }
    }

    pub fn from_decoder(pf: crate::decoder::device::PixelFormat) -> Option<Self> {
        match pf {
            crate::decoder::device::PixelFormat::Rgb565 => Some(PixelFormat::Rgb565),
            crate::decoder::device::PixelFormat::Bgra8888 => Some(PixelFormat::Bgra8888),
            crate::decoder::device::PixelFormat::Yuv420 => None,
        }
    }
}

/// Screen info read back from the device: fixed geometry plus the channel
/// offsets `PixelFormat::classify` derives a format from.
#[derive(Debug, Clone, Copy)]
pub struct ScreenInfo {
    pub width: u32,
    pub height: u32,
    pub bits_per_pixel: u32,
    pub bytes_per_line: u32,
    pub r_offset: u32,
    pub g_offset: u32,
    pub b_offset: u32,
    pub total_size: usize,
}

/// The raw framebuffer device capability surface (`FBIOGET_FSCREENINFO`,
/// `FBIOGET_VSCREENINFO`, `mmap` of `/dev/fb*`), abstracted so the
/// compositor (bitblit, layout, animation) is exercised in tests without
/// a real display.
pub trait FramebufferDevice {
    fn screen_info(&self) -> Result<ScreenInfo, PlayerError>;
    /// Maps the screen region for write; returns `(ptr, len)`.
    fn mmap_screen(&self) -> Result<(*mut u8, usize), PlayerError>;
}

/// One physical display: its device handle, the mapped screen surface (or
/// an offscreen shadow buffer when double-buffering), and a scratch
/// "black line" used to fill gaps cheaply.
pub struct Framebuffer {
    pub info: ScreenInfo,
    pub pixel_format: PixelFormat,
    screen: crate::decoder::buffer::MappedRegion,
    offscreen: Vec<u8>,
    black_line: Vec<u8>,
    /// This framebuffer's top-left origin relative to its group's
    /// aggregate bounding box.
    pub origin_x: i32,
    pub origin_y: i32,
}

impl Framebuffer {
    pub fn open(device: &dyn FramebufferDevice, origin_x: i32, origin_y: i32) -> Result<Self, PlayerError> {
        let info = device.screen_info()?;
        let pixel_format = PixelFormat::classify(
            info.bits_per_pixel,
            info.r_offset,
            info.g_offset,
            info.b_offset,
        )
        .ok_or_else(|| PlayerError::FormatNotSupported {
            device: "framebuffer".into(),
            format: format!(
                "{}bpp r={} g={} b={}",
                info.bits_per_pixel, info.r_offset, info.g_offset, info.b_offset
            ),
        })?;
        let (ptr, len) = device.mmap_screen()?;
        let screen = crate::decoder::buffer::MappedRegion::new(ptr, len);
        let offscreen = vec![0u8; len];
        let black_line = vec![0u8; info.bytes_per_line as usize];
        Ok(Self {
            info,
            pixel_format,
            screen,
            offscreen,
            black_line,
            origin_x,
            origin_y,
        })
    }

    pub fn width(&self) -> u32 {
        self.info.width
    }

    pub fn height(&self) -> u32 {
        self.info.height
    }

    /// Copies `src_rect` out of `src` (bytes-per-line `src_bpl`) into this
    /// framebuffer's offscreen surface at `dst_pos`. Clips both
    /// rectangles against this surface's bounds first; uses a single
    /// `memcpy` for the whole region when geometry allows, otherwise
    /// copies line by line.
    pub fn bitblit(
        &mut self,
        dst_x: i32,
        dst_y: i32,
        src: &[u8],
        src_bpl: u32,
        src_x: u32,
        src_y: u32,
        width: u32,
        height: u32,
    ) {
        let bpp = self.pixel_format.bytes_per_pixel();
        let dst_bpl = self.info.bytes_per_line;

        let clipped_x0 = dst_x.max(0);
        let clipped_y0 = dst_y.max(0);
        let clipped_x1 = (dst_x + width as i32).min(self.info.width as i32);
        let clipped_y1 = (dst_y + height as i32).min(self.info.height as i32);
        if clipped_x1 <= clipped_x0 || clipped_y1 <= clipped_y0 {
            return;
        }
        let clip_w = (clipped_x1 - clipped_x0) as u32;
        let clip_h = (clipped_y1 - clipped_y0) as u32;
        let src_x = src_x + (clipped_x0 - dst_x) as u32;
        let src_y = src_y + (clipped_y0 - dst_y) as u32;

        let row_bytes = (clip_w * bpp) as usize;

        if clipped_x0 == 0 && src_x == 0 && src_bpl == dst_bpl {
            let dst_off = clipped_y0 as usize * dst_bpl as usize;
            let src_off = src_y as usize * src_bpl as usize;
            let total = clip_h as usize * dst_bpl as usize;
            if dst_off + total <= self.offscreen.len() && src_off + total <= src.len() {
                self.offscreen[dst_off..dst_off + total]
                    .copy_from_slice(&src[src_off..src_off + total]);
                return;
            }
        }

        for row in 0..clip_h {
            let dst_off = (clipped_y0 as u32 + row) as usize * dst_bpl as usize
                + clipped_x0 as usize * bpp as usize;
            let src_off =
                (src_y + row) as usize * src_bpl as usize + src_x as usize * bpp as usize;
            if dst_off + row_bytes <= self.offscreen.len() && src_off + row_bytes <= src.len() {
                self.offscreen[dst_off..dst_off + row_bytes]
                    .copy_from_slice(&src[src_off..src_off + row_bytes]);
            }
        }
    }

    /// Fills a destination rectangle with the black-line scratch, used for
    /// zero-id filler rects in the row layout.
    pub fn fill_black(&mut self, dst_x: i32, dst_y: i32, width: u32, height: u32) {
        let bpp = self.pixel_format.bytes_per_pixel();
        let dst_bpl = self.info.bytes_per_line;
        let clipped_x0 = dst_x.max(0);
        let clipped_y0 = dst_y.max(0);
        let clipped_x1 = (dst_x + width as i32).min(self.info.width as i32);
        let clipped_y1 = (dst_y + height as i32).min(self.info.height as i32);
        if clipped_x1 <= clipped_x0 || clipped_y1 <= clipped_y0 {
            return;
        }
        let row_bytes = ((clipped_x1 - clipped_x0) as u32 * bpp) as usize;
        for y in clipped_y0..clipped_y1 {
            let dst_off = y as usize * dst_bpl as usize + clipped_x0 as usize * bpp as usize;
            if dst_off + row_bytes <= self.offscreen.len() && row_bytes <= self.black_line.len() {
                self.offscreen[dst_off..dst_off + row_bytes]
                    .copy_from_slice(&self.black_line[..row_bytes]);
            }
        }
    }

    /// Publishes the offscreen surface to the mapped screen region.
    pub fn present(&mut self) {
        let screen = self.screen.as_mut_slice();
        let len = screen.len().min(self.offscreen.len());
        screen[..len].copy_from_slice(&self.offscreen[..len]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_recognizes_rgb565_and_bgra8888() {
        assert_eq!(
            PixelFormat::classify(16, 11, 5, 0),
            Some(PixelFormat::Rgb565)
        );
        assert_eq!(
            PixelFormat::classify(32, 16, 8, 0),
            Some(PixelFormat::Bgra8888)
        );
        assert_eq!(PixelFormat::classify(24, 16, 8, 0), None);
    }

    struct FakeDevice {
        info: ScreenInfo,
        backing: std::cell::UnsafeCell<Vec<u8>>,
    }

    impl FramebufferDevice for FakeDevice {
        fn screen_info(&self) -> Result<ScreenInfo, PlayerError> {
            Ok(self.info)
        }

        fn mmap_screen(&self) -> Result<(*mut u8, usize), PlayerError> {
            let ptr = unsafe { (*self.backing.get()).as_mut_ptr() };
            Ok((ptr, self.info.total_size))
        }
    }

    fn fake_32bpp(width: u32, height: u32) -> FakeDevice {
        let bpl = width * 4;
        let total = (bpl * height) as usize;
        FakeDevice {
            info: ScreenInfo {
                width,
                height,
                bits_per_pixel: 32,
                bytes_per_line: bpl,
                r_offset: 16,
                g_offset: 8,
                b_offset: 0,
                total_size: total,
            },
            backing: std::cell::UnsafeCell::new(vec![0u8; total]),
        }
    }

    #[test]
    fn bitblit_full_frame_matches_memcpy_fast_path() {
        let device = fake_32bpp(4, 4);
        let mut fb = Framebuffer::open(&device, 0, 0).unwrap();
        let src: Vec<u8> = (0..(4 * 4 * 4) as u8).collect();
        fb.bitblit(0, 0, &src, 16, 0, 0, 4, 4);
        assert_eq!(&fb.offscreen[..], &src[..]);
    }

    #[test]
    fn bitblit_clips_to_surface_bounds() {
        let device = fake_32bpp(4, 4);
        let mut fb = Framebuffer::open(&device, 0, 0).unwrap();
        let src = vec![0xABu8; 8 * 8 * 4];
        fb.bitblit(2, 2, &src, 32, 0, 0, 8, 8);
        // Only the bottom-right 2x2 block should have been written.
        let bpp = 4usize;
        let bpl = 16usize;
        assert_eq!(fb.offscreen[2 * bpl + 2 * bpp], 0xAB);
        assert_eq!(fb.offscreen[0], 0);
    }
}
