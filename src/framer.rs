//! The framer state machine: drives the scanner, classifies start
//! codes, decides frame boundaries, and turns completed frames into
//! [`Frame`] values via the header interpreter.

use std::fmt;

use bytes::BytesMut;
use failure::format_err;
use log::debug;
use pretty_hex::PrettyHex;

use crate::block::{AnnotatedBlock, Block, Timestamps};
use crate::constants;
use crate::error::FramerError;
use crate::header::{self, FlowDescription, Rational};
use crate::probe::Probe;
use crate::scan;
use crate::stream::InputStream;

/// System clock rate frame durations and VBV delays are expressed in,
/// matching the 27 MHz reference clock MPEG-2 systems streams use.
pub const CLOCK_FREQ: i64 = 27_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PictureType {
    I,
    P,
    B,
}

impl PictureType {
    fn from_coding_type(t: u8) -> Result<Self, FramerError> {
        match t {
            1 => Ok(PictureType::I),
            2 => Ok(PictureType::P),
            3 => Ok(PictureType::B),
            other => Err(FramerError::malformed(format_err!("invalid picture_coding_type {}", other))),
        }
    }
}

/// One emitted access unit.
pub struct Frame {
    pub data: Block,
    /// Length of the leading out-of-band header portion of `data`
    /// (cached sequence material, possibly prepended by sequence
    /// insertion). Zero when the frame starts directly with picture
    /// data.
    pub header_len: usize,
    pub picture_number: i64,
    pub coding_type: PictureType,
    /// VBV delay in `CLOCK_FREQ` ticks, absent when the source signaled
    /// `0xFFFF` (unspecified).
    pub vbv_delay: Option<i64>,
    pub duration: i64,
    pub timestamps: Timestamps,
    pub random_access: bool,
    pub discontinuity: bool,
    pub top_field: bool,
    pub bottom_field: bool,
    pub top_field_first: bool,
    pub progressive_frame: bool,
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("header_len", &self.header_len)
            .field("picture_number", &self.picture_number)
            .field("coding_type", &self.coding_type)
            .field("vbv_delay", &self.vbv_delay)
            .field("duration", &self.duration)
            .field("timestamps", &self.timestamps)
            .field("random_access", &self.random_access)
            .field("discontinuity", &self.discontinuity)
            .field("data", &self.data.hex_dump())
            .finish()
    }
}

/// Where emitted frames and flow-description changes go.
pub trait Sink {
    fn flow_description(&mut self, flow: FlowDescription);
    fn frame(&mut self, frame: Frame);

    /// An empty input block passed straight through (it carries only
    /// metadata, no payload to frame).
    fn passthrough(&mut self, block: AnnotatedBlock) {
        let _ = block;
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Offsets {
    sequence_ext: Option<usize>,
    sequence_display: Option<usize>,
    gop: Option<usize>,
    picture: Option<usize>,
    picture_ext: Option<usize>,
}

enum Step4 {
    Continue,
    Emit(usize),
}

fn compute_picture_number(last_picture_number: i64, last_temporal_reference: Option<u16>, tr: u16) -> (i64, bool) {
    let baseline = last_temporal_reference.unwrap_or(0);
    let picture_number = last_picture_number + i64::from(tr) - i64::from(baseline);
    (picture_number, tr > baseline)
}

fn alloc_fail(what: &str) -> FramerError {
    FramerError::fatal(format_err!("allocation failure: {}", what))
}

/// The streaming MPEG-2 video framer. Push annotated blocks in with
/// [`Framer::push`]; completed access units come out through the
/// configured [`Sink`].
pub struct Framer {
    stream: InputStream,
    scan_context: u32,
    next_frame_size: usize,
    offsets: Offsets,
    next_frame_sequence: bool,
    next_frame_slice: bool,
    next_frame_timestamps: Timestamps,
    acquired: bool,
    got_discontinuity: bool,

    cached_sequence_header: Option<Block>,
    cached_sequence_ext: Option<Block>,
    cached_sequence_display: Option<Block>,
    progressive_sequence: bool,
    fps: Rational,
    closed_gop: bool,
    flow: Option<FlowDescription>,

    insert_sequence: bool,

    systime_rap: Option<i64>,
    systime_rap_ref: Option<i64>,

    last_picture_number: i64,
    last_temporal_reference: Option<u16>,

    probe: Box<dyn Probe>,
    sink: Option<Box<dyn Sink>>,
}

impl Framer {
    pub fn new(probe: Box<dyn Probe>) -> Self {
        let mut f = Framer {
            stream: InputStream::new(),
            scan_context: scan::SCAN_CONTEXT_INIT,
            next_frame_size: 0,
            offsets: Offsets::default(),
            next_frame_sequence: false,
            next_frame_slice: false,
            next_frame_timestamps: Timestamps::default(),
            acquired: false,
            got_discontinuity: false,
            cached_sequence_header: None,
            cached_sequence_ext: None,
            cached_sequence_display: None,
            progressive_sequence: true,
            fps: (25, 1),
            closed_gop: false,
            flow: None,
            insert_sequence: false,
            systime_rap: None,
            systime_rap_ref: None,
            last_picture_number: 0,
            last_temporal_reference: None,
            probe,
            sink: None,
        };
        f.probe.ready();
        f
    }

    pub fn with_logging_probe() -> Self {
        Self::new(Box::new(crate::probe::LoggingProbe::default()))
    }

    pub fn set_sink(&mut self, sink: Box<dyn Sink>) {
        self.sink = Some(sink);
    }

    pub fn flow_description(&self) -> Option<&FlowDescription> {
        self.flow.as_ref()
    }

    pub fn sequence_insertion(&self) -> bool {
        self.insert_sequence
    }

    pub fn set_sequence_insertion(&mut self, value: bool) {
        self.insert_sequence = value;
    }

    /// Feeds one annotated input block through the framer, emitting
    /// zero or more frames to the configured sink.
    pub fn push(&mut self, block: AnnotatedBlock) -> Result<(), FramerError> {
        if block.is_empty() {
            if let Some(sink) = self.sink.as_mut() {
                sink.passthrough(block);
            }
            return Ok(());
        }

        if block.discontinuity {
            if !self.next_frame_slice {
                self.stream.clear();
                self.got_discontinuity = true;
                self.lose_sync();
            } else {
                self.stream.set_head_error(true);
            }
        }

        let was_empty = self.stream.is_empty();
        self.stream.append(block);
        if was_empty {
            self.promote();
        }

        self.work()
    }

    fn promote(&mut self) {
        if let Some(ts) = self.stream.head_timestamps() {
            self.next_frame_timestamps.fill_absent_from(&ts);
        }
    }

    fn reset_offsets(&mut self) {
        self.next_frame_sequence = false;
        self.offsets = Offsets::default();
        self.next_frame_slice = false;
    }

    fn lose_sync(&mut self) {
        self.reset_offsets();
        self.next_frame_size = 0;
        self.scan_context = scan::SCAN_CONTEXT_INIT;
        self.acquired = false;
        self.probe.sync_lost();
    }

    fn step_not_acquired(&mut self, pos: usize, code: u8) {
        let garbage = pos.saturating_sub(4);
        if garbage > 0 {
            let changed = self.stream.consume(garbage);
            if changed {
                self.promote();
            }
        }
        self.next_frame_size = 4;
        match code {
            constants::SEQUENCE_HEADER => {
                self.next_frame_sequence = true;
                self.acquired = true;
                self.probe.sync_acquired();
            }
            constants::PICTURE_START => {
                self.next_frame_timestamps = Timestamps::default();
            }
            _ => {}
        }
    }

    fn step_pre_picture(&mut self, pos: usize, code: u8, next_byte: Option<u8>) {
        match code {
            constants::EXTENSION_START => match next_byte.map(constants::extension_id) {
                Some(constants::SEQUENCE_EXTENSION_ID) => self.offsets.sequence_ext = Some(pos - 4),
                Some(constants::SEQUENCE_DISPLAY_EXTENSION_ID) => self.offsets.sequence_display = Some(pos - 4),
                _ => {}
            },
            constants::GOP_START => self.offsets.gop = Some(pos - 4),
            constants::PICTURE_START => self.offsets.picture = Some(pos - 4),
            _ => {}
        }
    }

    fn step_post_picture(&mut self, pos: usize, code: u8, next_byte: Option<u8>) -> Step4 {
        if code == constants::EXTENSION_START && next_byte.map(constants::extension_id) == Some(constants::PICTURE_CODING_EXTENSION_ID) {
            self.offsets.picture_ext = Some(pos - 4);
            return Step4::Continue;
        }
        match code {
            constants::USER_DATA_START => Step4::Continue,
            c if constants::is_slice_start(c) => {
                self.next_frame_slice = true;
                Step4::Continue
            }
            constants::SEQUENCE_END => Step4::Emit(self.next_frame_size),
            _ => Step4::Emit(self.next_frame_size - 4),
        }
    }

    fn seed_next_frame(&mut self, code: u8) {
        match code {
            constants::SEQUENCE_HEADER => self.next_frame_sequence = true,
            constants::GOP_START => self.offsets.gop = Some(0),
            constants::PICTURE_START => self.offsets.picture = Some(0),
            constants::SEQUENCE_END => {
                self.next_frame_size = 0;
                self.lose_sync();
            }
            _ => {
                self.probe.warn("unexpected start code following a frame");
                self.lose_sync();
            }
        }
    }

    /// The main driving loop: §4.3 of `SPEC_FULL.md`.
    fn work(&mut self) -> Result<(), FramerError> {
        loop {
            let found = self.stream.scan_from(self.next_frame_size, &mut self.scan_context);
            let (pos, code) = match found {
                Some(f) => f,
                None => {
                    self.next_frame_size = self.stream.total_len();
                    return Ok(());
                }
            };

            let next_byte = if code == constants::EXTENSION_START {
                match self.stream.peek(pos, 1) {
                    Some(b) => Some(b[0]),
                    None => {
                        // The identifier nibble isn't available yet; rewind
                        // and wait for more input.
                        self.next_frame_size = pos.saturating_sub(4);
                        return Ok(());
                    }
                }
            } else {
                None
            };

            self.next_frame_size = pos;

            if !self.acquired {
                self.step_not_acquired(pos, code);
                continue;
            }

            if self.offsets.picture.is_none() {
                self.step_pre_picture(pos, code, next_byte);
                continue;
            }

            match self.step_post_picture(pos, code, next_byte) {
                Step4::Continue => continue,
                Step4::Emit(frame_end) => match self.emit_frame(frame_end) {
                    Ok(()) => {
                        self.reset_offsets();
                        self.next_frame_size = 4;
                        self.seed_next_frame(code);
                    }
                    Err(e) => {
                        if e.is_fatal() {
                            self.probe.fatal(&e);
                            return Err(e);
                        }
                        self.probe.warn(&e.to_string());
                        self.lose_sync();
                    }
                },
            }
        }
    }

    fn handle_sequence_header(&mut self) -> Result<Option<FlowDescription>, FramerError> {
        let seq = header::parse_sequence_header(|o, l| self.stream.peek(o, l))?;
        let seq_bytes = self
            .stream
            .peek(0, seq.total_len)
            .ok_or_else(|| FramerError::malformed(format_err!("truncated sequence header")))?;

        let ext_fields = match self.offsets.sequence_ext {
            Some(off) => {
                let bytes = self
                    .stream
                    .peek(off, 10)
                    .ok_or_else(|| FramerError::malformed(format_err!("truncated sequence extension")))?;
                Some((header::parse_sequence_extension(&bytes)?, bytes))
            }
            None => None,
        };

        let display_fields = match self.offsets.sequence_display {
            Some(off) => {
                let fields = header::parse_sequence_display_extension(|o, l| self.stream.peek(off + o, l))?;
                let bytes = self
                    .stream
                    .peek(off, fields.total_len)
                    .ok_or_else(|| FramerError::malformed(format_err!("truncated sequence display extension")))?;
                Some((fields, bytes))
            }
            None => None,
        };

        let ext_bytes = ext_fields.as_ref().map(|(_, b)| b.clone());
        let display_bytes = display_fields.as_ref().map(|(_, b)| b.clone());

        let unchanged = self.cached_sequence_header.as_ref() == Some(&seq_bytes)
            && self.cached_sequence_ext == ext_bytes
            && self.cached_sequence_display == display_bytes;

        self.cached_sequence_header = Some(seq_bytes);
        self.cached_sequence_ext = ext_bytes;
        self.cached_sequence_display = display_bytes;

        if unchanged {
            return Ok(None);
        }

        let flow = header::build_flow_description(&seq, ext_fields.as_ref().map(|(f, _)| f), display_fields.as_ref().map(|(f, _)| f))?;

        self.progressive_sequence = ext_fields.map(|(f, _)| f.progressive_sequence).unwrap_or(true);
        self.fps = flow.frame_rate;

        Ok(Some(flow))
    }

    /// Emits the frame ending at logical offset `frame_end`: §4.4 of
    /// `SPEC_FULL.md`, steps E1-E9.
    fn emit_frame(&mut self, frame_end: usize) -> Result<(), FramerError> {
        let picture_offset = self.offsets.picture.unwrap_or(0);
        let header_len_base = self.offsets.gop.unwrap_or(if picture_offset > 0 { picture_offset } else { 0 });

        // E2: snapshot and flush the prospective-frame timestamps.
        let mut ts = std::mem::take(&mut self.next_frame_timestamps);

        // E3: sequence header, if this frame begins with one.
        let new_flow = if self.next_frame_sequence { self.handle_sequence_header()? } else { None };

        // E4: GOP header and picture header.
        let gop_fields = match self.offsets.gop {
            Some(off) => {
                let bytes = self
                    .stream
                    .peek(off, 8)
                    .ok_or_else(|| FramerError::malformed(format_err!("truncated GOP header")))?;
                Some(header::parse_gop_header(&bytes)?)
            }
            None => None,
        };
        if let Some(gop) = &gop_fields {
            self.closed_gop = gop.closed_gop;
            self.last_temporal_reference = None;
        } else {
            self.closed_gop = false;
        }
        let broken_link = gop_fields.map(|g| g.broken_link).unwrap_or(false);
        let discontinuity_flag = broken_link || (self.got_discontinuity && !self.closed_gop);
        self.got_discontinuity = false;

        let picture_bytes = self
            .stream
            .peek(picture_offset, 8)
            .ok_or_else(|| FramerError::malformed(format_err!("truncated picture header")))?;
        let pic = header::parse_picture_header(&picture_bytes)?;
        let coding_type = PictureType::from_coding_type(pic.coding_type)?;

        let (picture_number, advances) = compute_picture_number(self.last_picture_number, self.last_temporal_reference, pic.temporal_reference);
        if advances {
            self.last_picture_number = picture_number;
            self.last_temporal_reference = Some(pic.temporal_reference);
        }

        let vbv_delay = if pic.vbv_delay == 0xffff {
            None
        } else {
            Some(i64::from(pic.vbv_delay) * CLOCK_FREQ / 90_000)
        };

        if self.fps.0 == 0 {
            return Err(FramerError::malformed(format_err!("picture before any sequence header established a frame rate")));
        }
        let mut duration = CLOCK_FREQ * i64::from(self.fps.1) / i64::from(self.fps.0);

        // E5: picture coding extension.
        let mut top_field = true;
        let mut bottom_field = true;
        let mut top_field_first = false;
        let mut progressive_frame = true;
        if let Some(off) = self.offsets.picture_ext {
            let bytes = self
                .stream
                .peek(off, 9)
                .ok_or_else(|| FramerError::malformed(format_err!("truncated picture coding extension")))?;
            let ext = header::parse_picture_coding_extension(&bytes)?;
            if ext.intra_dc_precision != 0 {
                self.probe.warn("nonzero intra_dc_precision");
            }
            top_field = ext.picture_structure & 0b10 != 0;
            bottom_field = ext.picture_structure & 0b01 != 0;
            top_field_first = ext.top_field_first;
            progressive_frame = ext.progressive_frame;

            if self.progressive_sequence {
                if ext.repeat_first_field {
                    duration *= 1 + i64::from(ext.top_field_first);
                }
            } else if ext.picture_structure == 0b11 {
                if ext.repeat_first_field {
                    duration += duration / 2;
                }
            } else {
                duration /= 2;
            }
        }

        // E6: random-access-point bookkeeping.
        let mut random_access = false;
        match coding_type {
            PictureType::I => {
                if self.next_frame_sequence {
                    random_access = true;
                }
                self.systime_rap_ref = self.systime_rap;
                self.systime_rap = ts.systime_rap;
            }
            PictureType::P => {
                self.systime_rap_ref = self.systime_rap;
                if let Some(rap) = self.systime_rap {
                    ts.systime_rap = Some(rap);
                }
            }
            PictureType::B => {
                if let Some(rap) = self.systime_rap_ref {
                    ts.systime_rap = Some(rap);
                }
            }
        }
        if self.closed_gop {
            self.systime_rap_ref = self.systime_rap;
        }

        // E1 (assembly) + sequence insertion: build the final frame bytes.
        let mut out = BytesMut::new();
        let mut header_len = header_len_base;
        if coding_type == PictureType::I && !self.next_frame_sequence && self.insert_sequence {
            if let Some(h) = self.cached_sequence_header.clone() {
                out.extend_from_slice(&h);
                if let Some(e) = &self.cached_sequence_ext {
                    out.extend_from_slice(e);
                }
                if let Some(d) = &self.cached_sequence_display {
                    out.extend_from_slice(d);
                }
                header_len += out.len();
                random_access = true;
            }
        }

        if picture_offset > 0 {
            let (a, changed) = self.stream.extract(picture_offset).ok_or_else(|| alloc_fail("header prefix"))?;
            if changed {
                self.promote();
            }
            out.extend_from_slice(&a);
        }
        let (b, changed) = self.stream.extract(frame_end - picture_offset).ok_or_else(|| alloc_fail("frame body"))?;
        if changed {
            self.promote();
        }
        out.extend_from_slice(&b);
        let data = out.freeze();

        // E8: interpolate DTS forward for the next picture.
        if self.next_frame_timestamps.dts_orig.is_none() {
            if let Some(v) = ts.dts_orig {
                self.next_frame_timestamps.dts_orig = Some(v + duration);
            }
        }
        if self.next_frame_timestamps.dts.is_none() {
            if let Some(v) = ts.dts {
                self.next_frame_timestamps.dts = Some(v + duration);
            }
        }
        if self.next_frame_timestamps.dts_sys.is_none() {
            if let Some(v) = ts.dts_sys {
                self.next_frame_timestamps.dts_sys = Some(v + duration);
            }
        }

        let frame = Frame {
            data,
            header_len,
            picture_number,
            coding_type,
            vbv_delay,
            duration,
            timestamps: ts,
            random_access,
            discontinuity: discontinuity_flag,
            top_field,
            bottom_field,
            top_field_first,
            progressive_frame,
        };

        debug!(
            "emitted {:?} picture_number={} len={} random_access={}",
            frame.coding_type,
            frame.picture_number,
            frame.data.len(),
            frame.random_access
        );

        if let Some(flow) = new_flow {
            self.flow = Some(flow.clone());
            if let Some(sink) = self.sink.as_mut() {
                sink.flow_description(flow);
            }
        }
        if let Some(sink) = self.sink.as_mut() {
            sink.frame(frame);
        }

        Ok(())
    }
}

impl Drop for Framer {
    fn drop(&mut self) {
        self.probe.dead();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picture_number_baselines_at_zero_without_prior_tr() {
        let (n, advances) = compute_picture_number(0, None, 2);
        assert_eq!(n, 2);
        assert!(advances);
    }

    #[test]
    fn picture_number_tracks_within_gop() {
        let (n, advances) = compute_picture_number(2, Some(2), 5);
        assert_eq!(n, 5);
        assert!(advances);

        let (n, advances) = compute_picture_number(5, Some(5), 0);
        assert_eq!(n, 0);
        assert!(!advances, "tr=0 does not exceed baseline 5");
    }

    #[test]
    fn reset_offsets_clears_everything() {
        let mut f = Framer::with_logging_probe();
        f.offsets.gop = Some(3);
        f.next_frame_sequence = true;
        f.next_frame_slice = true;
        f.reset_offsets();
        assert!(f.offsets.gop.is_none());
        assert!(!f.next_frame_sequence);
        assert!(!f.next_frame_slice);
    }

    #[test]
    fn lose_sync_resets_scan_state() {
        let mut f = Framer::with_logging_probe();
        f.acquired = true;
        f.next_frame_size = 40;
        f.scan_context = 0x1234;
        f.lose_sync();
        assert!(!f.acquired);
        assert_eq!(f.next_frame_size, 0);
        assert_eq!(f.scan_context, scan::SCAN_CONTEXT_INIT);
    }
}
