//! Per-tick draw planning and execution: turns a group's visible rects
//! into per-framebuffer blit tasks and runs them sharded across worker
//! threads plus the caller thread.
//!
//! Sharding is by framebuffer rather than by individual rect: each
//! framebuffer's offscreen surface is touched by exactly one thread per
//! tick, which keeps the whole pipeline in safe Rust (`std::thread::scope`
//! borrowing disjoint `&mut Framebuffer`s) instead of the raw-pointer
//! `unsafe impl Send` wrapper `decoder::buffer::MappedRegion` needs for
//! mmap'd device memory.

use std::time::{Duration, Instant};

use crate::config::DrawMode;
use crate::display::framebuffer::Framebuffer;

/// Where a rect's pixels come from: a borrowed region of a decoded output
/// buffer (or the heap-cloned "last frame" kept across re-enqueue).
pub struct SrcRegion<'a> {
    pub data: &'a [u8],
    pub bytes_per_line: u32,
    pub src_x: u32,
    pub src_y: u32,
}

/// One rectangle to draw into a single framebuffer's local coordinate
/// space. `src.is_none()` means "fill black" (zero-id filler rect, or a
/// stream with nothing decoded yet).
pub struct FramebufferTask<'a> {
    pub dst_x: i32,
    pub dst_y: i32,
    pub width: u32,
    pub height: u32,
    pub src: Option<SrcRegion<'a>>,
}

/// The full tick's work, one task list per framebuffer (indices line up
/// with the `Player`'s `Vec<Framebuffer>`).
pub type DrawPlan<'a> = Vec<Vec<FramebufferTask<'a>>>;

fn execute_framebuffer(fb: &mut Framebuffer, tasks: &[FramebufferTask<'_>], _mode: DrawMode) {
    for task in tasks {
        match &task.src {
            Some(src) => fb.bitblit(
                task.dst_x,
                task.dst_y,
                src.data,
                src.bytes_per_line,
                src.src_x,
                src.src_y,
                task.width,
                task.height,
            ),
            None => fb.fill_black(task.dst_x, task.dst_y, task.width, task.height),
        }
    }
    fb.present();
}

/// Executes a `DrawPlan` against the live framebuffers, sharding
/// round-robin across `worker_count` scoped threads plus the caller
/// thread, and returns how long the whole dispatch took, for the
/// per-tick draw-time statistic.
///
/// `draw_mode` only changes the order tasks within a framebuffer were
/// submitted in (`player::draw_tick` leaves `Src` in source/stream
/// discovery order and pre-sorts `Dst` by `(dst_y, dst_x)` before calling
/// this). Sorting by destination scan-line groups writes to the same
/// framebuffer row together, the cache-friendliness the planed mode is
/// for; `Framebuffer::bitblit` itself is clipped and correct regardless
/// of submission order, so this function only needs to execute the plan
/// it is handed, not reorder it.
pub fn run(framebuffers: &mut [Framebuffer], plan: &DrawPlan<'_>, draw_mode: DrawMode, worker_count: usize) -> Duration {
    let start = Instant::now();
    let shards = worker_count + 1;
    if framebuffers.is_empty() {
        return start.elapsed();
    }

    let mut groups: Vec<Vec<usize>> = vec![Vec::new(); shards];
    for i in 0..framebuffers.len() {
        groups[i % shards].push(i);
    }

    let mut remaining: Vec<Option<&mut Framebuffer>> = framebuffers.iter_mut().map(Some).collect();

    std::thread::scope(|scope| {
        for group in groups.iter().skip(1) {
            if group.is_empty() {
                continue;
            }
            let fbs: Vec<&mut Framebuffer> = group.iter().map(|&i| remaining[i].take().unwrap()).collect();
            let tasks: Vec<&Vec<FramebufferTask<'_>>> = group.iter().map(|&i| &plan[i]).collect();
            scope.spawn(move || {
                for (fb, t) in fbs.into_iter().zip(tasks) {
                    execute_framebuffer(fb, t, draw_mode);
                }
            });
        }
        for &i in &groups[0] {
            if let Some(fb) = remaining[i].take() {
                execute_framebuffer(fb, &plan[i], draw_mode);
            }
        }
    });

    start.elapsed()
}

/// Accumulated per-second statistics: draw time min/max/sum/count;
/// decoder frames fed/output/skipped min/max/sum ms; parser NALs
/// started/completed; frames queued/IDR/ignored.
#[derive(Debug, Default, Clone, Copy)]
pub struct TickStats {
    pub draw_ms_min: f64,
    pub draw_ms_max: f64,
    pub draw_ms_sum: f64,
    pub draw_count: u64,

    pub frames_fed_sum: u64,
    pub frames_output_sum: u64,
    pub frames_skipped_sum: u64,

    pub nals_started_sum: u64,
    pub nals_completed_sum: u64,

    pub frames_queued_sum: u64,
    pub frames_idr_sum: u64,
    pub frames_ignored_sum: u64,
}

impl TickStats {
    pub fn record_draw(&mut self, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        if self.draw_count == 0 {
            self.draw_ms_min = ms;
            self.draw_ms_max = ms;
        } else {
            self.draw_ms_min = self.draw_ms_min.min(ms);
            self.draw_ms_max = self.draw_ms_max.max(ms);
        }
        self.draw_ms_sum += ms;
        self.draw_count += 1;
    }

    pub fn reset(&mut self) {
        *self = TickStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_stats_track_min_max_sum() {
        let mut s = TickStats::default();
        s.record_draw(Duration::from_millis(5));
        s.record_draw(Duration::from_millis(1));
        s.record_draw(Duration::from_millis(9));
        assert_eq!(s.draw_count, 3);
        assert!(s.draw_ms_min <= 1.1);
        assert!(s.draw_ms_max >= 8.9);
        assert!(s.draw_ms_sum >= 14.9);
    }

    #[test]
    fn run_with_no_framebuffers_is_a_no_op() {
        let mut fbs: Vec<Framebuffer> = Vec::new();
        let plan: DrawPlan<'_> = Vec::new();
        let elapsed = run(&mut fbs, &plan, DrawMode::Src, 2);
        assert!(elapsed < Duration::from_secs(1));
    }
}
