//! `Player`: owns every `StreamContext`, the framebuffer groups, and the
//! cooperative poll-driven main loop that ties them together.
//!
//! The loop itself is deliberately *not* async: a single `libc::poll` call
//! per tick drives every stream's I/O and decoder readiness, matching the
//! synchronous, single-threaded state-machine style the rest of this
//! crate (`stream::StreamContext::tick`, `ingest::SourceIngest`) already
//! follows. Worker threads are used only for the draw phase
//! (`draw::run`).

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::time::Instant;

use crate::config::Config;
use crate::decoder::buffer::Buffer;
use crate::decoder::device::{DecoderDevice, PixelFormat as DecoderPixelFormat};
use crate::decoder::mock::MockDecoder;
use crate::display::framebuffer::{Framebuffer, FramebufferDevice, PixelFormat as FbPixelFormat};
use crate::display::group::FramebuffersGroup;
use crate::draw::{self, FramebufferTask, SrcRegion, TickStats};
use crate::stream::{SourceSpec, StreamConfig, StreamContext, StreamState};

const POLL_TIMEOUT_MS: i32 = 40;

/// Which kind of fd a poll-set slot refers to, so the post-`poll` dispatch
/// loop knows which `StreamContext` method to call without re-deriving it
/// from the raw fd.
enum PollKind {
    Decoder(usize),
    SourceRead(usize),
    SourceWrite(usize),
}

/// Drives every configured stream plus its on-screen placement to
/// completion: opens decoders under a budget, feeds frames, composites
/// onto framebuffers, and exits once every stream is permanently closed
/// (or the configured run duration elapses).
pub struct Player {
    config: Config,
    streams: Vec<StreamContext>,
    stream_ids: Vec<u32>,
    framebuffers: Vec<Framebuffer>,
    groups: Vec<FramebuffersGroup>,
    /// Which group (index into `groups`) each framebuffer belongs to.
    framebuffer_group: Vec<usize>,
    last_frames: HashMap<u32, Buffer>,
    last_pixel_format: HashMap<u32, DecoderPixelFormat>,

    decoders_open: Vec<bool>,
    peek_cursor: usize,
    peek_budget_ms: Vec<i64>,

    tick_ms: i64,
    last_tick_at: Instant,
    start_time: Instant,
    last_second_mark: Instant,
    stats: TickStats,
}

impl Player {
    pub fn new(
        config: Config,
        framebuffer_devices: Vec<(Box<dyn FramebufferDevice>, i32, i32, usize)>,
        group_formats: Vec<FbPixelFormat>,
    ) -> anyhow::Result<Self> {
        let mut framebuffers = Vec::with_capacity(framebuffer_devices.len());
        let mut framebuffer_group = Vec::with_capacity(framebuffer_devices.len());
        for (device, x, y, group_idx) in &framebuffer_devices {
            let fb = Framebuffer::open(device.as_ref(), *x, *y)?;
            framebuffers.push(fb);
            framebuffer_group.push(*group_idx);
        }

        let mut groups: Vec<FramebuffersGroup> = group_formats
            .into_iter()
            .map(|pf| FramebuffersGroup::new(pf, config.anim_secs_wait, config.anim_pre_render_secs))
            .collect();
        for (fb_idx, &group_idx) in framebuffer_group.iter().enumerate() {
            groups[group_idx].add_framebuffer(fb_idx, &framebuffers);
        }

        let mut streams = Vec::new();
        let mut stream_ids = Vec::new();
        let mut next_id = 1u32;
        for spec in &config.streams {
            streams.push(StreamContext::new(parse_stream_source(spec, &config, &groups)?));
            stream_ids.push(next_id);
            next_id += 1;
        }
        for path in &config.files {
            streams.push(StreamContext::new(StreamConfig {
                source: SourceSpec::File(std::path::PathBuf::from(path)),
                decoder_device_path: config.decoder_device.clone(),
                pixel_format: decoder_pixel_format_for(&groups, 0),
                conn_timeout: config.conn_timeout,
                conn_wait_reconn: config.conn_wait_reconn,
                decoder_timeout: config.decoder_timeout,
                decoder_wait_reopen: config.decoder_wait_reopen,
                frames_skip: config.frames_skip,
                frames_feed_max: config.frames_feed_max,
                keep_alive: config.keep_alive,
                sim_decoder_timeout: config.sim_decoder_timeout,
            }));
            stream_ids.push(next_id);
            next_id += 1;
        }

        let n = streams.len();
        // Every stream is assigned round-robin to groups in registration
        // order; operators who split framebuffers with `--framebuffer
        // new-group` get that split honored here, wrapping once groups
        // run out.
        relayout(&mut groups, &streams, &stream_ids);

        Ok(Self {
            config,
            streams,
            stream_ids,
            framebuffers,
            groups,
            framebuffer_group,
            last_frames: HashMap::new(),
            last_pixel_format: HashMap::new(),
            decoders_open: vec![false; n],
            peek_cursor: 0,
            peek_budget_ms: vec![0; n],
            tick_ms: 1000 / config_refresh_or_default(&config),
            last_tick_at: Instant::now(),
            start_time: Instant::now(),
            last_second_mark: Instant::now(),
            stats: TickStats::default(),
        })
    }

    /// Runs the cooperative main loop to completion: returns once every
    /// stream reports permanently closed, or the configured run duration
    /// elapses.
    pub fn run(&mut self) -> anyhow::Result<()> {
        self.last_tick_at = Instant::now();
        loop {
            if let Some(secs) = self.config.secs_run_and_exit {
                if self.start_time.elapsed().as_secs() >= secs {
                    tracing::info!("secs_run_and_exit elapsed, shutting down");
                    self.begin_shutdown_all();
                }
            }

            let pollset = self.build_pollset();
            if pollset.is_empty() {
                std::thread::sleep(std::time::Duration::from_millis((self.tick_ms / 4).max(1) as u64));
            } else {
                self.poll_and_dispatch(&pollset);
            }

            let now = Instant::now();
            let dt_ms = now.duration_since(self.last_tick_at).as_millis() as i64;
            if dt_ms < self.tick_ms {
                continue;
            }
            self.last_tick_at = now;
            self.tick(dt_ms);

            if self.all_streams_closed() {
                tracing::info!("every stream permanently closed, exiting");
                return Ok(());
            }

            if now.duration_since(self.last_second_mark).as_secs() >= 1 {
                self.print_stats();
                self.stats.reset();
                self.last_second_mark = now;
            }
        }
    }

    fn build_pollset(&self) -> Vec<(libc::pollfd, PollKind)> {
        let mut set = Vec::new();
        for (i, s) in self.streams.iter().enumerate() {
            if let Some(fd) = s.decoder_poll_fd() {
                set.push((poll_entry(fd, true, false), PollKind::Decoder(i)));
            }
            if let Some(fd) = s.source_poll_fd() {
                if s.source_wants_read() {
                    set.push((poll_entry(fd, true, false), PollKind::SourceRead(i)));
                }
                if s.source_wants_write() {
                    set.push((poll_entry(fd, false, true), PollKind::SourceWrite(i)));
                }
            }
        }
        set
    }

    fn poll_and_dispatch(&mut self, pollset: &[(libc::pollfd, PollKind)]) {
        let mut fds: Vec<libc::pollfd> = pollset.iter().map(|(pfd, _)| *pfd).collect();
        // SAFETY: `fds` is a validly initialized, appropriately sized
        // `pollfd` array for the duration of this call.
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, POLL_TIMEOUT_MS) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                tracing::warn!(error = %err, "poll() failed");
            }
            return;
        }
        if rc == 0 {
            return;
        }
        for (pfd, (_, kind)) in fds.iter().zip(pollset.iter()) {
            if pfd.revents == 0 {
                continue;
            }
            match kind {
                PollKind::Decoder(i) => {
                    self.streams[*i].on_decoder_ready();
                    self.drain_decoded(*i);
                }
                PollKind::SourceRead(i) => self.streams[*i].pump_ingest(),
                PollKind::SourceWrite(i) => self.streams[*i].pump_ingest_writable(),
            }
        }
    }

    /// Pulls every decoded output buffer currently ready for stream `i`
    /// and keeps the newest as this stream's "last frame" for drawing.
    fn drain_decoded(&mut self, i: usize) {
        while let Some(buf) = self.streams[i].dequeue_output_for_draw() {
            let id = self.stream_ids[i];
            self.last_frames.insert(id, buf);
            self.last_pixel_format.insert(id, self.streams[i].config.pixel_format);
        }
    }

    fn tick(&mut self, dt_ms: i64) {
        for s in &mut self.streams {
            s.resume_ingest_read();
            s.tick(dt_ms);
        }

        self.schedule_decoder_budget(dt_ms);

        for group in &mut self.groups {
            group.tick_animation(dt_ms);
        }

        self.accumulate_stats();
        self.draw_tick();
    }

    /// Decoder-open budget scheduler: already-open streams that should
    /// stay open are left alone; among closed streams, priority goes to
    /// ones that will draw this tick, then ones flagged by a group's
    /// pre-render hint, then a round-robin peek grant bounded by
    /// `decoders_to_peek_secs`, bounded overall by `decoders_max`.
    fn schedule_decoder_budget(&mut self, dt_ms: i64) {
        let max_open = self.config.decoders_max;
        let visible: std::collections::HashSet<u32> = self
            .groups
            .iter()
            .flat_map(|g| g.visible_rects().into_iter().map(|(r, _)| r.stream_id))
            .collect();
        let pre_render: std::collections::HashSet<u32> = self
            .groups
            .iter()
            .flat_map(|g| g.pre_render_rects().into_iter().map(|r| r.stream_id))
            .collect();

        for (i, budget) in self.peek_budget_ms.iter_mut().enumerate() {
            *budget = (*budget - dt_ms).max(0);
            let id = self.stream_ids[i];
            if *budget == 0 && !visible.contains(&id) {
                self.streams[i].set_should_be_open(false);
            }
        }

        let mut open_count = self.decoders_open.iter().filter(|&&o| o).count();

        // Tier 1: streams that should stay open (already open, still
        // wanted) keep their slot; nothing to do beyond not touching them.

        // Tier 2/3: closed streams that will draw this tick, or are
        // flagged by a pre-render hint, get opened first.
        let mut candidates: Vec<usize> = (0..self.streams.len())
            .filter(|&i| !self.decoders_open[i])
            .collect();
        candidates.sort_by_key(|&i| {
            let id = self.stream_ids[i];
            if visible.contains(&id) {
                0
            } else if pre_render.contains(&id) {
                1
            } else {
                2
            }
        });

        for i in candidates {
            if open_count >= max_open {
                break;
            }
            let id = self.stream_ids[i];
            let is_visible = visible.contains(&id);
            let is_pre_render = pre_render.contains(&id);
            if is_visible || is_pre_render {
                self.open_stream_decoder(i);
                open_count += 1;
                self.streams[i].set_should_be_open(true);
                continue;
            }
            // Tier 4: round-robin peek grant within the remaining budget.
            if self.peek_cursor == i {
                self.peek_budget_ms[i] = (self.config.decoders_to_peek_secs * 1000) as i64;
                self.open_stream_decoder(i);
                open_count += 1;
                self.streams[i].set_should_be_open(true);
            }
        }

        if !self.streams.is_empty() {
            self.peek_cursor = (self.peek_cursor + 1) % self.streams.len();
        }

        // Close decoders for streams no longer wanted (budget expired,
        // not visible, not pre-rendered).
        for i in 0..self.streams.len() {
            if self.decoders_open[i] && !self.streams[i].should_be_open() {
                self.streams[i].begin_close(false);
                self.decoders_open[i] = false;
            }
        }
    }

    fn open_stream_decoder(&mut self, i: usize) {
        if self.decoders_open[i] || !matches!(self.streams[i].state(), StreamState::Opening) {
            return;
        }
        let path = self.streams[i].config.decoder_device_path.clone();
        let factory = move || -> Box<dyn DecoderDevice> {
            let _ = &path;
            Box::new(MockDecoder::new(640, 480))
        };
        self.streams[i].open_decoder(factory);
        self.decoders_open[i] = true;
    }

    fn begin_shutdown_all(&mut self) {
        for s in &mut self.streams {
            s.begin_close(true);
        }
    }

    fn all_streams_closed(&self) -> bool {
        !self.streams.is_empty() && self.streams.iter().all(|s| s.is_permanently_closed())
    }

    fn accumulate_stats(&mut self) {
        for s in &self.streams {
            self.stats.frames_fed_sum += s.frames_fed();
            self.stats.frames_queued_sum += s.frames_queued() as u64;
            self.stats.frames_idr_sum += s.idr_fed_count();
            self.stats.frames_ignored_sum += s.ignored_count();
            self.stats.frames_skipped_sum += s.frames_skipped_decoder_count();
            self.stats.nals_started_sum += s.nals_started();
            self.stats.nals_completed_sum += s.nals_completed();
        }
    }

    fn print_stats(&self) {
        tracing::info!(
            streams = self.streams.len(),
            draw_ms_min = self.stats.draw_ms_min,
            draw_ms_max = self.stats.draw_ms_max,
            draw_ms_avg = if self.stats.draw_count > 0 {
                self.stats.draw_ms_sum / self.stats.draw_count as f64
            } else {
                0.0
            },
            frames_fed = self.stats.frames_fed_sum,
            frames_queued = self.stats.frames_queued_sum,
            frames_idr = self.stats.frames_idr_sum,
            frames_ignored = self.stats.frames_ignored_sum,
            frames_skipped = self.stats.frames_skipped_sum,
            nals_started = self.stats.nals_started_sum,
            nals_completed = self.stats.nals_completed_sum,
            "per-second stats"
        );
    }

    /// Builds the per-framebuffer task lists from every group's visible
    /// rects and the last decoded frame per stream, then dispatches them
    /// through `draw::run`.
    fn draw_tick(&mut self) {
        let mut plan: Vec<Vec<FramebufferTask<'_>>> = self.framebuffers.iter().map(|_| Vec::new()).collect();

        for group in &self.groups {
            for (rect, row_y) in group.visible_rects() {
                let portions = group.framebuffer_portions(
                    &self.framebuffers,
                    rect.x as i32,
                    row_y,
                    rect.width,
                    rect.height,
                );
                for (fb_idx, portion) in portions {
                    let src = if rect.stream_id == 0 {
                        None
                    } else {
                        self.last_frames.get(&rect.stream_id).and_then(|buf| {
                            let plane = buf.planes.first()?;
                            Some(SrcRegion {
                                data: plane.as_slice(),
                                bytes_per_line: plane.bytes_per_line,
                                src_x: portion.src_offset_x,
                                src_y: portion.src_offset_y,
                            })
                        })
                    };
                    plan[fb_idx].push(FramebufferTask {
                        dst_x: portion.local_x,
                        dst_y: portion.local_y,
                        width: portion.width,
                        height: portion.height,
                        src,
                    });
                }
            }
        }

        if self.config.draw_mode == crate::config::DrawMode::Dst {
            for tasks in plan.iter_mut() {
                tasks.sort_by_key(|t| (t.dst_y, t.dst_x));
            }
        }

        let elapsed = draw::run(&mut self.framebuffers, &plan, self.config.draw_mode, self.config.extra_threads);
        self.stats.record_draw(elapsed);
    }
}

fn poll_entry(fd: RawFd, read: bool, write: bool) -> libc::pollfd {
    let mut events = 0;
    if read {
        events |= libc::POLLIN;
    }
    if write {
        events |= libc::POLLOUT;
    }
    libc::pollfd {
        fd,
        events,
        revents: 0,
    }
}

fn config_refresh_or_default(config: &Config) -> i64 {
    config.screen_refresh_per_sec.max(1) as i64
}

fn decoder_pixel_format_for(groups: &[FramebuffersGroup], group_idx: usize) -> DecoderPixelFormat {
    match groups.get(group_idx).map(|g| g.pixel_format) {
        Some(FbPixelFormat::Rgb565) => DecoderPixelFormat::Rgb565,
        Some(FbPixelFormat::Bgra8888) | None => DecoderPixelFormat::Bgra8888,
    }
}

fn parse_stream_source(spec: &str, config: &Config, groups: &[FramebuffersGroup]) -> anyhow::Result<StreamConfig> {
    let url = url::Url::parse(spec)?;
    anyhow::ensure!(url.scheme() == "http", "only http:// stream URLs are supported");
    let host = url
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("stream URL {spec} has no host"))?
        .to_string();
    let port = url.port().unwrap_or(80);
    let path = if url.path().is_empty() { "/".to_string() } else { url.path().to_string() };
    Ok(StreamConfig {
        source: SourceSpec::Http { host, port, path },
        decoder_device_path: config.decoder_device.clone(),
        pixel_format: decoder_pixel_format_for(groups, 0),
        conn_timeout: config.conn_timeout,
        conn_wait_reconn: config.conn_wait_reconn,
        decoder_timeout: config.decoder_timeout,
        decoder_wait_reopen: config.decoder_wait_reopen,
        frames_skip: config.frames_skip,
        frames_feed_max: config.frames_feed_max,
        keep_alive: config.keep_alive,
        sim_decoder_timeout: config.sim_decoder_timeout,
    })
}

/// Rebuilds every group's layout from its currently assigned streams'
/// last-known output dimensions, falling back to a placeholder size for
/// streams that have not produced a decoded frame yet.
fn relayout(groups: &mut [FramebuffersGroup], streams: &[StreamContext], stream_ids: &[u32]) {
    if groups.is_empty() {
        return;
    }
    for group in groups.iter_mut() {
        group.layout_start();
    }
    for (i, s) in streams.iter().enumerate() {
        let g = i % groups.len();
        let (w, h) = s.output_dimensions();
        let (w, h) = if w == 0 || h == 0 { (320, 240) } else { (w, h) };
        groups[g].layout_add(stream_ids[i], w, h);
    }
    for group in groups.iter_mut() {
        group.layout_end();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DrawMode;

    fn test_config(files: Vec<String>, decoders_max: usize) -> Config {
        Config {
            extra_threads: 0,
            conn_timeout: std::time::Duration::from_secs(10),
            conn_wait_reconn: std::time::Duration::from_secs(5),
            decoder_timeout: std::time::Duration::from_secs(5),
            decoder_wait_reopen: std::time::Duration::from_secs(2),
            anim_secs_wait: 3,
            anim_pre_render_secs: 1,
            screen_refresh_per_sec: 25,
            draw_mode: DrawMode::Src,
            decoder_device: "/dev/video0".to_string(),
            server: None,
            port: 80,
            keep_alive: false,
            streams: Vec::new(),
            files,
            log_level: "info".to_string(),
            decoders_max,
            decoders_to_peek_secs: 1,
            sim_decoder_timeout: false,
            frames_skip: 0,
            frames_feed_max: None,
            secs_run_and_exit: None,
            framebuffers: Vec::new(),
        }
    }

    /// Every configured stream's source resolves to `/dev/null`, a path
    /// that always exists: `StreamContext::tick` drives `ingest.open()`
    /// to success and leaves the stream in `Opening` without ever
    /// producing readable bytes (the pollset is never built in this
    /// test, so `pump_ingest` never runs), which is exactly the state
    /// `schedule_decoder_budget` needs to keep granting and revoking
    /// decoder slots every tick.
    #[test]
    fn decoder_budget_never_exceeds_decoders_max_across_many_ticks() {
        let files = vec!["/dev/null".to_string(); 5];
        let config = test_config(files, 2);
        let mut player = Player::new(config, Vec::new(), Vec::new()).expect("player construction");

        let mut ever_opened = false;
        for _ in 0..200 {
            player.tick(50);
            let open_count = player.decoders_open.iter().filter(|&&o| o).count();
            assert!(
                open_count <= player.config.decoders_max,
                "decoders_open ({open_count}) exceeded decoders_max ({})",
                player.config.decoders_max
            );
            ever_opened |= open_count > 0;
        }
        assert!(ever_opened, "budget scheduler never opened a single decoder");
    }

    /// With `decoders_max` at least as large as the stream count, every
    /// stream should eventually hold an open decoder simultaneously
    /// (nothing is contended away by the round-robin peek grant).
    #[test]
    fn decoder_budget_opens_every_stream_when_unconstrained() {
        let files = vec!["/dev/null".to_string(); 3];
        let config = test_config(files, 3);
        let mut player = Player::new(config, Vec::new(), Vec::new()).expect("player construction");

        let mut max_open_seen = 0usize;
        for _ in 0..200 {
            player.tick(50);
            let open_count = player.decoders_open.iter().filter(|&&o| o).count();
            max_open_seen = max_open_seen.max(open_count);
        }
        assert_eq!(max_open_seen, 3);
    }
}
