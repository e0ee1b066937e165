//! `StreamContext`: the per-stream orchestrator tying `SourceIngest`, the
//! NAL parser, and `Decoder` together and advancing their state machines
//! on every tick.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::decoder::device::{DecoderEvent, PixelFormat};
use crate::decoder::Decoder;
use crate::error::PlayerError;
use crate::frame::{FramePool, FrameStateLog};
use crate::ingest::{FileIngest, HttpIngest, IngestEvent, SourceIngest};
use crate::parser::NalParser;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Opening,
    OpenIdle,
    Feeding,
    Flushing,
    ShuttingDown,
    Closed,
}

/// Per-stream static configuration, read once at construction.
pub struct StreamConfig {
    pub source: SourceSpec,
    pub decoder_device_path: String,
    pub pixel_format: PixelFormat,
    pub conn_timeout: Duration,
    pub conn_wait_reconn: Duration,
    pub decoder_timeout: Duration,
    pub decoder_wait_reopen: Duration,
    pub frames_skip: u64,
    pub frames_feed_max: Option<u64>,
    pub keep_alive: bool,
    pub sim_decoder_timeout: bool,
}

pub enum SourceSpec {
    File(PathBuf),
    Http {
        host: String,
        port: u16,
        path: String,
    },
}

/// All ms-counters advanced in one place at the top of `tick`, so every
/// timer reflects the same elapsed `dt_ms` before any state transition
/// reads it.
#[derive(Default)]
struct Timers {
    decoder_reopen_backoff_ms: i64,
    source_reconnect_backoff_ms: i64,
    flush_elapsed_ms: i64,
    shutdown_elapsed_ms: i64,
    decoder_idle_ms: i64,
    peek_budget_ms: i64,
}

const FLUSH_HARD_CAP_MS: i64 = 250;
const SHUTDOWN_HARD_CAP_MS: i64 = 500;

pub struct StreamContext {
    pub config: StreamConfig,
    pub state: StreamState,
    ingest: Box<dyn SourceIngest>,
    parser: NalParser,
    pub pool: FramePool,
    pub frame_state_log: FrameStateLog,
    decoder: Option<Decoder>,
    timers: Timers,
    permanent: bool,
    permanent_reason: Option<String>,
    frames_skipped_remaining: u64,
    frames_fed: u64,
    should_be_open: bool,
    last_output_width: u32,
    last_output_height: u32,
    ingest_open: bool,
    idr_fed: u64,
    frames_skipped_decoder: u64,
    last_dequeued_i_seq: Option<u64>,
}

impl StreamContext {
    pub fn new(config: StreamConfig) -> Self {
        let networked = matches!(config.source, SourceSpec::Http { .. });
        let ingest: Box<dyn SourceIngest> = match &config.source {
            SourceSpec::File(path) => {
                Box::new(FileIngest::new(path.clone(), config.conn_timeout))
            }
            SourceSpec::Http { host, port, path } => Box::new(HttpIngest::new(
                host.clone(),
                *port,
                path.clone(),
                config.keep_alive,
                config.conn_timeout,
            )),
        };
        let frames_skip = config.frames_skip;
        Self {
            config,
            state: StreamState::Opening,
            ingest,
            parser: NalParser::new(networked),
            pool: FramePool::new(),
            frame_state_log: FrameStateLog::new(),
            decoder: None,
            timers: Timers::default(),
            permanent: false,
            permanent_reason: None,
            frames_skipped_remaining: frames_skip,
            frames_fed: 0,
            should_be_open: true,
            last_output_width: 0,
            last_output_height: 0,
            ingest_open: false,
            idr_fed: 0,
            frames_skipped_decoder: 0,
            last_dequeued_i_seq: None,
        }
    }

    pub fn is_permanently_closed(&self) -> bool {
        self.permanent && self.state == StreamState::Closed
    }

    pub fn should_be_open(&self) -> bool {
        self.should_be_open && !self.permanent
    }

    pub fn set_should_be_open(&mut self, open: bool) {
        self.should_be_open = open;
    }

    pub fn decoder_poll_fd(&self) -> Option<std::os::unix::io::RawFd> {
        self.decoder.as_ref().map(|d| d.poll_fd())
    }

    pub fn source_poll_fd(&self) -> Option<std::os::unix::io::RawFd> {
        self.ingest.poll_fd()
    }

    pub fn source_wants_read(&self) -> bool {
        self.ingest.wants_read()
    }

    pub fn source_wants_write(&self) -> bool {
        self.ingest.wants_write()
    }

    /// Dispatches a write-readiness callback (connect completion, request
    /// write) for sources that need one, e.g. `HttpIngest`.
    pub fn pump_ingest_writable(&mut self) {
        match self.ingest.on_writable() {
            IngestEvent::Progressed | IngestEvent::Idle => {}
            IngestEvent::Eof => {
                if self.ingest.is_reconnectable() {
                    self.arm_reconnect();
                    self.timers.source_reconnect_backoff_ms =
                        self.config.conn_wait_reconn.as_millis() as i64;
                } else {
                    self.begin_close(true);
                }
            }
            IngestEvent::Transient(reason) => {
                tracing::warn!(reason, "source ingest transient error");
                if self.ingest.is_reconnectable() {
                    self.arm_reconnect();
                    self.timers.source_reconnect_backoff_ms =
                        self.config.conn_wait_reconn.as_millis() as i64;
                } else {
                    self.begin_close(true);
                }
            }
        }
    }

    pub fn frames_fed(&self) -> u64 {
        self.frames_fed
    }

    pub fn ignored_count(&self) -> u64 {
        self.pool.ignored_count
    }

    pub fn idr_fed_count(&self) -> u64 {
        self.idr_fed
    }

    /// Frames fed to the decoder that were never reconciled against a
    /// dequeued output: dropped by `FrameStateLog::reconcile` because a
    /// later-sequenced output arrived first, or by the output-ordering
    /// check in `dequeue_output_for_draw`.
    pub fn frames_skipped_decoder_count(&self) -> u64 {
        self.frames_skipped_decoder
    }

    pub fn nals_started(&self) -> u64 {
        self.parser.nals_started
    }

    pub fn nals_completed(&self) -> u64 {
        self.parser.nals_completed
    }

    pub fn frames_queued(&self) -> usize {
        self.pool.filled_len()
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn output_dimensions(&self) -> (u32, u32) {
        (self.last_output_width, self.last_output_height)
    }

    /// Opens the decoder, negotiates formats, and registers buffers.
    /// Leaves `state` at `OpenIdle` on success.
    pub fn open_decoder(&mut self, decoder_factory: impl FnOnce() -> Box<dyn crate::decoder::device::DecoderDevice>) {
        let mut decoder = Decoder::new(decoder_factory());
        let input_buffer_size = 512 * 1024;
        if let Err(e) = decoder.open_input(input_buffer_size, 8) {
            tracing::warn!(error = %e, "decoder input open failed");
            self.arm_reopen_backoff();
            return;
        }
        if let Err(e) = decoder.open_output(self.config.pixel_format, 6) {
            tracing::warn!(error = %e, "decoder output open failed");
            self.permanent = matches!(e, PlayerError::FormatNotSupported { .. });
            if !self.permanent {
                self.arm_reopen_backoff();
            } else {
                self.permanent_reason = Some(e.to_string());
            }
            return;
        }
        let (w, h) = (decoder.output.width, decoder.output.height);
        self.last_output_width = w;
        self.last_output_height = h;
        self.decoder = Some(decoder);
        self.state = StreamState::OpenIdle;
        self.timers.decoder_idle_ms = 0;
    }

    fn arm_reopen_backoff(&mut self) {
        self.decoder = None;
        self.state = StreamState::OpenIdle;
        self.timers.decoder_reopen_backoff_ms = self.config.decoder_wait_reopen.as_millis() as i64;
    }

    fn arm_reconnect(&mut self) {
        self.ingest.close();
        self.ingest_open = false;
    }

    /// Advances every timer, then runs the state machine for this tick.
    pub fn tick(&mut self, dt_ms: i64) {
        if let Err(e) = self.ingest.poll() {
            tracing::warn!(error = %e, "source poll failed");
            self.arm_reconnect();
            self.timers.source_reconnect_backoff_ms = self.config.conn_wait_reconn.as_millis() as i64;
        }

        if self.permanent {
            if self.decoder.is_some() || self.state != StreamState::Closed {
                self.state = StreamState::ShuttingDown;
            }
        }

        self.timers.decoder_reopen_backoff_ms = (self.timers.decoder_reopen_backoff_ms - dt_ms).max(0);
        self.timers.source_reconnect_backoff_ms =
            (self.timers.source_reconnect_backoff_ms - dt_ms).max(0);
        self.timers.flush_elapsed_ms += dt_ms;
        self.timers.shutdown_elapsed_ms += dt_ms;
        self.timers.peek_budget_ms = (self.timers.peek_budget_ms - dt_ms).max(0);
        if self.decoder.is_some() && self.frames_fed > 0 {
            self.timers.decoder_idle_ms += dt_ms;
        } else {
            self.timers.decoder_idle_ms = 0;
        }

        if let SourceSpec::Http { .. } = self.config.source {
            // DNS/connect progression is driven from `on_writable`/
            // `poll_callback`; nothing additional to advance here beyond
            // the idle timer already updated above.
        }

        if self.decoder.is_none()
            && self.should_be_open()
            && self.timers.decoder_reopen_backoff_ms == 0
            && !matches!(self.state, StreamState::Flushing | StreamState::ShuttingDown)
        {
            self.state = StreamState::Opening;
        }

        if !self.ingest_open
            && matches!(self.state, StreamState::Opening)
            && self.timers.source_reconnect_backoff_ms == 0
        {
            match self.ingest.open() {
                Ok(()) => self.ingest_open = true,
                Err(e) => {
                    tracing::warn!(error = %e, "source open failed");
                    if matches!(e, PlayerError::PermanentSource { .. }) {
                        self.permanent = true;
                        self.permanent_reason = Some(e.to_string());
                    } else {
                        self.timers.source_reconnect_backoff_ms =
                            self.config.conn_wait_reconn.as_millis() as i64;
                    }
                }
            }
        }

        if self.ingest.idle_timed_out() && self.ingest.is_reconnectable() {
            let e = PlayerError::Timeout {
                what: "source idle",
                secs: self.config.conn_timeout.as_secs(),
            };
            tracing::warn!(error = %e, "source idle timeout, reconnecting");
            self.arm_reconnect();
            self.timers.source_reconnect_backoff_ms = self.config.conn_wait_reconn.as_millis() as i64;
        }

        if self.decoder.is_some()
            && self.config.sim_decoder_timeout
            && self.timers.decoder_idle_ms > self.config.decoder_timeout.as_millis() as i64
        {
            let e = PlayerError::Timeout {
                what: "decoder idle",
                secs: self.config.decoder_timeout.as_secs(),
            };
            tracing::warn!(error = %e, "decoder idle timeout, transient close");
            self.arm_reopen_backoff();
        }

        if self.state == StreamState::Feeding {
            self.feed_available();
        }

        if self.state == StreamState::Flushing {
            self.flush_tick();
        }

        if self.state == StreamState::ShuttingDown {
            self.shutdown_tick();
        }
    }

    fn feed_available(&mut self) {
        let Some(decoder) = self.decoder.as_mut() else {
            return;
        };
        while let Some(frame) = self.pool.peek_filled() {
            if self.frames_skipped_remaining > 0 {
                self.frames_skipped_remaining -= 1;
                let frame = self.pool.pop_filled().unwrap();
                self.pool.return_to_pool(frame);
                continue;
            }
            if self.frames_fed == 0 && !frame.is_independent {
                let frame = self.pool.pop_filled().unwrap();
                self.pool.return_to_pool(frame);
                continue;
            }
            let i_seq = frame.i_seq;
            let is_independent = frame.is_independent;
            let data_len = frame.data.len();
            let fed = match decoder.feed(i_seq, &frame.data) {
                Ok(fed) => fed,
                Err(e) => {
                    tracing::warn!(error = %e, "decoder feed failed");
                    self.arm_reopen_backoff();
                    return;
                }
            };
            if !fed {
                break;
            }
            let frame = self.pool.pop_filled().unwrap();
            self.pool.return_to_pool(frame);
            let _ = data_len;
            self.frame_state_log.push_fed(crate::frame::FrameStateEntry {
                i_seq,
                arrived_at: Instant::now(),
                fed_at: Instant::now(),
                is_independent,
            });
            self.frames_fed += 1;
            if is_independent {
                self.idr_fed += 1;
            }
            if let Some(max) = self.config.frames_feed_max {
                if self.frames_fed >= max {
                    self.permanent = true;
                    self.permanent_reason = Some("frames_feed_max reached".into());
                    break;
                }
            }
        }
    }

    fn flush_tick(&mut self) {
        if let Some(decoder) = self.decoder.as_mut() {
            loop {
                match decoder.try_dequeue_input() {
                    Ok(Some(_)) => continue,
                    Ok(None) => break,
                    Err(_) => break,
                }
            }
        }
        if self.timers.flush_elapsed_ms >= FLUSH_HARD_CAP_MS {
            let e = PlayerError::HardCapElapsed {
                what: "flush",
                cap_ms: FLUSH_HARD_CAP_MS as u64,
            };
            tracing::warn!(error = %e);
            if self.permanent {
                self.state = StreamState::ShuttingDown;
            } else {
                self.state = StreamState::OpenIdle;
            }
        }
    }

    fn shutdown_tick(&mut self) {
        if let Some(mut decoder) = self.decoder.take() {
            let _ = decoder.stop_all();
        }
        self.ingest.close();
        self.ingest_open = false;
        if self.timers.shutdown_elapsed_ms >= SHUTDOWN_HARD_CAP_MS {
            let e = PlayerError::HardCapElapsed {
                what: "shutdown",
                cap_ms: SHUTDOWN_HARD_CAP_MS as u64,
            };
            tracing::warn!(error = %e);
        }
        if self.timers.shutdown_elapsed_ms >= SHUTDOWN_HARD_CAP_MS || self.decoder.is_none() {
            self.state = StreamState::Closed;
        }
    }

    /// Starts flushing (transient) or shutting down (permanent).
    pub fn begin_close(&mut self, permanent: bool) {
        if permanent {
            self.permanent = true;
        }
        self.timers.flush_elapsed_ms = 0;
        self.timers.shutdown_elapsed_ms = 0;
        self.state = if permanent {
            StreamState::ShuttingDown
        } else {
            StreamState::Flushing
        };
    }

    /// Dispatches a decoder readiness event: input-ready opportunistically
    /// feeds, output-ready dequeues and reconciles the frame-state log,
    /// device error triggers a transient close, source-change reinits the
    /// capture side.
    pub fn on_decoder_ready(&mut self) {
        let events = match self.decoder.as_mut() {
            Some(d) => d.poll_events(),
            None => return,
        };
        for event in events {
            match event {
                DecoderEvent::SourceChange => {
                    if let Some(decoder) = self.decoder.as_mut() {
                        if let Err(e) = decoder.reinit_output(self.config.pixel_format, 6) {
                            tracing::warn!(error = %e, "output reinit after source change failed");
                            self.arm_reopen_backoff();
                            continue;
                        }
                        self.last_output_width = decoder.output.width;
                        self.last_output_height = decoder.output.height;
                    }
                }
                DecoderEvent::EndOfStream => {}
            }
        }

        if let Some(decoder) = self.decoder.as_mut() {
            loop {
                match decoder.try_dequeue_input() {
                    Ok(Some(_)) => {}
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "input dequeue failed");
                        self.arm_reopen_backoff();
                        return;
                    }
                }
            }
        }

        if self.state == StreamState::OpenIdle && self.pool.filled_len() > 0 {
            self.state = StreamState::Feeding;
        }
        if self.state == StreamState::Feeding {
            self.feed_available();
        }
    }

    /// Called when the decoder output side signals readiness: dequeues
    /// the decoded buffer, reconciles against the frame-state log, and
    /// returns the buffer index the draw phase should read (the original
    /// is re-queued immediately after `keep_last_as_clone`).
    pub fn dequeue_output_for_draw(&mut self) -> Option<crate::decoder::buffer::Buffer> {
        let decoder = self.decoder.as_mut()?;
        let (index, i_seq) = match decoder.try_dequeue_output() {
            Ok(Some(pair)) => pair,
            _ => return None,
        };
        let clone = decoder.keep_last_as_clone(index);
        let _ = decoder.release_output(index);
        self.timers.decoder_idle_ms = 0;

        if let Some(last) = self.last_dequeued_i_seq {
            if i_seq <= last {
                self.frames_skipped_decoder += 1;
            }
        }
        self.last_dequeued_i_seq = Some(i_seq);

        let (_, skipped) = self.frame_state_log.reconcile(i_seq);
        self.frames_skipped_decoder += skipped as u64;

        Some(clone)
    }

    /// Feeds raw bytes from the source into the parser, honoring the
    /// file-source backpressure rule (suspend read after a frame becomes
    /// available for feeding).
    pub fn pump_ingest(&mut self) {
        match self.ingest.on_readable(&mut self.parser, &mut self.pool) {
            IngestEvent::Progressed => {
                if self.pool.filled_len() > 0 {
                    self.ingest.suspend_read_until_next_tick();
                    if self.state == StreamState::OpenIdle {
                        self.state = StreamState::Feeding;
                    }
                }
            }
            IngestEvent::Eof => {
                if self.ingest.is_reconnectable() {
                    self.arm_reconnect();
                    self.timers.source_reconnect_backoff_ms =
                        self.config.conn_wait_reconn.as_millis() as i64;
                } else {
                    self.begin_close(true);
                }
            }
            IngestEvent::Transient(reason) => {
                tracing::warn!(reason, "source ingest transient error");
                self.parser.finish(&mut self.pool);
                if self.ingest.is_reconnectable() {
                    self.arm_reconnect();
                    self.timers.source_reconnect_backoff_ms =
                        self.config.conn_wait_reconn.as_millis() as i64;
                } else {
                    self.begin_close(true);
                }
            }
            IngestEvent::Idle => {}
        }
    }

    /// Resumes read readiness for backpressured file sources; called once
    /// at the top of each tick, mirroring `resume_read`'s role in the
    /// render-cadence design.
    pub fn resume_ingest_read(&mut self) {
        self.ingest.resume_read();
    }
}
