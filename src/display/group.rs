//! `FramebuffersGroup`: the set of framebuffers sharing one pixel format,
//! plus the row-based layout and vertical scroll animation that arranges
//! streams within it.
//!
//! Layout is rebuilt wholesale on every reorganize event via the explicit
//! `layout_start → layout_add* → layout_end` sequence, which is
//! idempotent: the same inputs run twice produce byte-identical row
//! structure. Packing is deterministic greedy left-to-right, not an
//! optimal bin-pack.

use crate::display::framebuffer::{Framebuffer, PixelFormat};

/// One destination rectangle inside a row. `stream_id == 0` marks a
/// filler drawn black rather than a real stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutRect {
    pub stream_id: u32,
    pub x: u32,
    /// Always 0: every rect in a row is top-aligned to the row itself: the
    /// vertical position of the *row* is carried separately by the
    /// animation cursor, not by the rect.
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayoutRow {
    pub width: u32,
    pub height: u32,
    pub rects: Vec<LayoutRect>,
}

impl LayoutRow {
    /// Fills gaps left by greedy packing with zero-id (black) rects so the
    /// row's rects, in `x` order, always tile the full group width.
    fn fill_gaps(&mut self) {
        self.rects.sort_by_key(|r| r.x);
        let mut gaps = Vec::new();
        let mut cursor = 0u32;
        for r in &self.rects {
            if r.x > cursor {
                gaps.push(LayoutRect {
                    stream_id: 0,
                    x: cursor,
                    y: 0,
                    width: r.x - cursor,
                    height: self.height,
                });
            }
            cursor = r.x + r.width;
        }
        if cursor < self.width {
            gaps.push(LayoutRect {
                stream_id: 0,
                x: cursor,
                y: 0,
                width: self.width - cursor,
                height: self.height,
            });
        }
        self.rects.extend(gaps);
        self.rects.sort_by_key(|r| r.x);
    }
}

#[derive(Default)]
struct LayoutBuilder {
    rows: Vec<LayoutRow>,
    cursor_x: u32,
    current_row: LayoutRow,
}

/// A rectangle's overlap with one member framebuffer, in that
/// framebuffer's own local coordinates plus the offset into the source
/// rect it corresponds to (for rects straddling two framebuffers).
#[derive(Debug, Clone, Copy)]
pub struct FbPortion {
    pub local_x: i32,
    pub local_y: i32,
    pub src_offset_x: u32,
    pub src_offset_y: u32,
    pub width: u32,
    pub height: u32,
}

pub struct FramebuffersGroup {
    pub pixel_format: PixelFormat,
    pub closed: bool,
    /// Indices into the player's `Vec<Framebuffer>` belonging to this
    /// group, in registration order.
    pub framebuffer_indices: Vec<usize>,
    pub bounds_width: u32,
    pub bounds_height: u32,
    pub streams: Vec<u32>,
    pub rows: Vec<LayoutRow>,
    builder: Option<LayoutBuilder>,

    // Animation cursor: (iRowFirst, yOffset, msWait).
    i_row_first: usize,
    y_offset: i32,
    ms_wait: i64,
    anim_secs_wait: u64,
    anim_pre_render_ms: i64,
}

impl FramebuffersGroup {
    pub fn new(pixel_format: PixelFormat, anim_secs_wait: u64, anim_pre_render_secs: u64) -> Self {
        Self {
            pixel_format,
            closed: false,
            framebuffer_indices: Vec::new(),
            bounds_width: 0,
            bounds_height: 0,
            streams: Vec::new(),
            rows: Vec::new(),
            builder: None,
            i_row_first: 0,
            y_offset: 0,
            ms_wait: (anim_secs_wait * 1000) as i64,
            anim_secs_wait,
            anim_pre_render_ms: (anim_pre_render_secs * 1000) as i64,
        }
    }

    /// Registers a member framebuffer and recomputes the aggregate
    /// bounding box from every member's placement.
    pub fn add_framebuffer(&mut self, index: usize, fbs: &[Framebuffer]) {
        self.framebuffer_indices.push(index);
        self.recompute_bounds(fbs);
    }

    fn recompute_bounds(&mut self, fbs: &[Framebuffer]) {
        let mut x1 = 0i32;
        let mut y1 = 0i32;
        for &idx in &self.framebuffer_indices {
            let fb = &fbs[idx];
            x1 = x1.max(fb.origin_x + fb.width() as i32);
            y1 = y1.max(fb.origin_y + fb.height() as i32);
        }
        self.bounds_width = x1.max(0) as u32;
        self.bounds_height = y1.max(0) as u32;
    }

    pub fn layout_start(&mut self) {
        self.builder = Some(LayoutBuilder::default());
        self.streams.clear();
    }

    pub fn layout_add(&mut self, stream_id: u32, width: u32, height: u32) {
        let bounds_width = self.bounds_width;
        let builder = self.builder.get_or_insert_with(LayoutBuilder::default);
        if builder.cursor_x > 0 && builder.cursor_x + width > bounds_width {
            Self::close_row(builder, bounds_width);
        }
        builder.current_row.rects.push(LayoutRect {
            stream_id,
            x: builder.cursor_x,
            y: 0,
            width,
            height,
        });
        builder.current_row.height = builder.current_row.height.max(height);
        builder.cursor_x += width;
        self.streams.push(stream_id);
    }

    fn close_row(builder: &mut LayoutBuilder, bounds_width: u32) {
        if builder.current_row.rects.is_empty() {
            return;
        }
        let mut row = std::mem::take(&mut builder.current_row);
        row.width = bounds_width;
        row.fill_gaps();
        builder.rows.push(row);
        builder.cursor_x = 0;
    }

    pub fn layout_end(&mut self) {
        let bounds_width = self.bounds_width;
        if let Some(mut builder) = self.builder.take() {
            Self::close_row(&mut builder, bounds_width);
            self.rows = builder.rows;
        }
        if self.rows.is_empty() {
            self.i_row_first = 0;
        } else {
            self.i_row_first %= self.rows.len();
        }
        self.y_offset = 0;
    }

    /// Advances the scroll cursor by `dt_ms`. Returns `true` if the
    /// pre-render window — within `anim_pre_render_secs` of the current
    /// wait ending — is currently active.
    pub fn tick_animation(&mut self, dt_ms: i64) -> bool {
        if self.rows.is_empty() {
            return false;
        }
        if self.ms_wait > 0 {
            self.ms_wait -= dt_ms;
            return self.ms_wait > 0 && self.ms_wait <= self.anim_pre_render_ms;
        }
        let scrolling_height = self.rows[self.i_row_first].height as i64;
        let delta = ((scrolling_height * dt_ms) / 1000).max(1) as i32;
        self.y_offset -= delta;
        if (-self.y_offset) as i64 >= scrolling_height {
            self.i_row_first = (self.i_row_first + 1) % self.rows.len();
            self.y_offset = 0;
            self.ms_wait = (self.anim_secs_wait * 1000) as i64;
        }
        false
    }

    /// The rects that will become visible once the in-progress scroll
    /// completes — the trigger that activates a stream's decoder peek
    /// before it actually appears on screen.
    pub fn pre_render_rects(&self) -> Vec<LayoutRect> {
        if self.rows.is_empty() {
            return Vec::new();
        }
        let next = (self.i_row_first + 1) % self.rows.len();
        self.rows[next].rects.clone()
    }

    /// Every rect currently on screen, paired with the group-space
    /// absolute y of its row after applying the scroll cursor. Rows are
    /// walked starting at `iRowFirst`, wrapping modulo the row count,
    /// until the accumulated y exceeds the group's bounding height.
    pub fn visible_rects(&self) -> Vec<(LayoutRect, i32)> {
        if self.rows.is_empty() {
            return Vec::new();
        }
        let mut out = Vec::new();
        let mut y = self.y_offset;
        let mut idx = self.i_row_first;
        for _ in 0..self.rows.len() {
            let row = &self.rows[idx];
            if y + row.height as i32 > 0 && y < self.bounds_height as i32 {
                for rect in &row.rects {
                    out.push((*rect, y));
                }
            }
            y += row.height as i32;
            idx = (idx + 1) % self.rows.len();
            if y >= self.bounds_height as i32 {
                break;
            }
        }
        out
    }

    /// Splits an absolute group-space rect across whichever member
    /// framebuffers it overlaps, in each framebuffer's own local
    /// coordinates (handling rects that straddle two framebuffers).
    pub fn framebuffer_portions(
        &self,
        fbs: &[Framebuffer],
        abs_x: i32,
        abs_y: i32,
        width: u32,
        height: u32,
    ) -> Vec<(usize, FbPortion)> {
        let mut out = Vec::new();
        for &idx in &self.framebuffer_indices {
            let fb = &fbs[idx];
            let fb_x0 = fb.origin_x;
            let fb_y0 = fb.origin_y;
            let fb_x1 = fb_x0 + fb.width() as i32;
            let fb_y1 = fb_y0 + fb.height() as i32;
            let ox0 = abs_x.max(fb_x0);
            let oy0 = abs_y.max(fb_y0);
            let ox1 = (abs_x + width as i32).min(fb_x1);
            let oy1 = (abs_y + height as i32).min(fb_y1);
            if ox1 <= ox0 || oy1 <= oy0 {
                continue;
            }
            out.push((
                idx,
                FbPortion {
                    local_x: ox0 - fb_x0,
                    local_y: oy0 - fb_y0,
                    src_offset_x: (ox0 - abs_x) as u32,
                    src_offset_y: (oy0 - abs_y) as u32,
                    width: (ox1 - ox0) as u32,
                    height: (oy1 - oy0) as u32,
                },
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(group: &mut FramebuffersGroup, streams: &[(u32, u32, u32)]) {
        group.layout_start();
        for &(id, w, h) in streams {
            group.layout_add(id, w, h);
        }
        group.layout_end();
    }

    #[test]
    fn rows_tile_group_width() {
        let mut g = FramebuffersGroup::new(PixelFormat::Bgra8888, 3, 1);
        g.bounds_width = 100;
        g.bounds_height = 200;
        build(&mut g, &[(1, 60, 40), (2, 60, 40), (3, 100, 40)]);

        assert_eq!(g.rows.len(), 2);
        for row in &g.rows {
            let sum: u32 = row.rects.iter().map(|r| r.width).sum();
            assert_eq!(sum, g.bounds_width);
        }
    }

    #[test]
    fn x_ordering_holds_within_a_row() {
        let mut g = FramebuffersGroup::new(PixelFormat::Rgb565, 3, 1);
        g.bounds_width = 100;
        g.bounds_height = 50;
        build(&mut g, &[(1, 30, 50), (2, 30, 50)]);

        let row = &g.rows[0];
        for w in row.rects.windows(2) {
            assert!(w[0].x <= w[1].x);
        }
    }

    #[test]
    fn layout_is_idempotent() {
        let streams = [(1, 40, 30), (2, 40, 30), (3, 40, 30), (4, 40, 30)];
        let mut g1 = FramebuffersGroup::new(PixelFormat::Bgra8888, 3, 1);
        g1.bounds_width = 80;
        g1.bounds_height = 120;
        build(&mut g1, &streams);
        let rows1 = g1.rows.clone();

        let mut g2 = FramebuffersGroup::new(PixelFormat::Bgra8888, 3, 1);
        g2.bounds_width = 80;
        g2.bounds_height = 120;
        build(&mut g2, &streams);
        let rows2 = g2.rows.clone();

        assert_eq!(rows1, rows2);
    }

    #[test]
    fn animation_advances_row_first_on_arrival() {
        let mut g = FramebuffersGroup::new(PixelFormat::Bgra8888, 0, 1);
        g.bounds_width = 50;
        g.bounds_height = 100;
        build(&mut g, &[(1, 50, 20), (2, 50, 30)]);
        assert_eq!(g.rows.len(), 2);

        // anim_secs_wait = 0, so the very first tick starts scrolling.
        g.tick_animation(1);
        let row0_height = g.rows[0].height as i64;
        let mut elapsed = 1i64;
        while g.i_row_first == 0 && elapsed < row0_height * 1000 + 10 {
            g.tick_animation(1000);
            elapsed += 1000;
        }
        assert_eq!(g.i_row_first, 1);
        assert_eq!(g.y_offset, 0);
    }

    #[test]
    fn framebuffer_portions_splits_straddling_rect() {
        use crate::display::framebuffer::{FramebufferDevice, ScreenInfo};
        use crate::error::PlayerError;

        struct FakeDevice {
            info: ScreenInfo,
            backing: std::cell::UnsafeCell<Vec<u8>>,
        }
        impl FramebufferDevice for FakeDevice {
            fn screen_info(&self) -> Result<ScreenInfo, PlayerError> {
                Ok(self.info)
            }
            fn mmap_screen(&self) -> Result<(*mut u8, usize), PlayerError> {
                Ok((
                    unsafe { (*self.backing.get()).as_mut_ptr() },
                    self.info.total_size,
                ))
            }
        }
        fn make(width: u32, height: u32) -> FakeDevice {
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

        let d0 = make(50, 50);
        let d1 = make(50, 50);
        let fb0 = Framebuffer::open(&d0, 0, 0).unwrap();
        let fb1 = Framebuffer::open(&d1, 50, 0).unwrap();
        let fbs = vec![fb0, fb1];

        let mut g = FramebuffersGroup::new(PixelFormat::Bgra8888, 3, 1);
        g.framebuffer_indices = vec![0, 1];
        g.recompute_bounds(&fbs);

        let portions = g.framebuffer_portions(&fbs, 40, 0, 20, 10);
        assert_eq!(portions.len(), 2);
        assert_eq!(portions[0].0, 0);
        assert_eq!(portions[0].width, 10);
        assert_eq!(portions[1].0, 1);
        assert_eq!(portions[1].width, 10);
    }
}
