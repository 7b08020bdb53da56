//! A streaming framer for ISO/IEC 13818-2 (MPEG-2 video) elementary
//! streams: push arbitrarily-chunked byte ranges in, get complete,
//! timestamped access units out.
//!
//! The crate does no I/O and no threading; [`framer::Framer`] is a
//! plain synchronous state machine meant to sit inside whatever pipeline
//! an embedder already has. See `SPEC_FULL.md` for the full design.

mod block;
mod constants;
mod error;
mod framer;
mod header;
mod probe;
mod scan;
mod stream;

pub use block::{AnnotatedBlock, Block, Timestamps};
pub use error::FramerError;
pub use framer::{Frame, Framer, PictureType, Sink, CLOCK_FREQ};
pub use header::{ChromaFormat, FlowDescription, Rational};
pub use probe::{LoggingProbe, Probe};

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct Stats {
        frame_count: usize,
        flow_count: usize,
        passthroughs: usize,
        last_picture_number: i64,
        last_header_len: usize,
        last_random_access: bool,
    }

    struct RecordingSink(Rc<RefCell<Stats>>);

    impl Sink for RecordingSink {
        fn flow_description(&mut self, _flow: FlowDescription) {
            self.0.borrow_mut().flow_count += 1;
        }

        fn frame(&mut self, frame: Frame) {
            let mut s = self.0.borrow_mut();
            s.frame_count += 1;
            s.last_picture_number = frame.picture_number;
            s.last_header_len = frame.header_len;
            s.last_random_access = frame.random_access;
        }

        fn passthrough(&mut self, _block: AnnotatedBlock) {
            self.0.borrow_mut().passthroughs += 1;
        }
    }

    #[test]
    fn framer_starts_with_no_flow_description() {
        let framer = Framer::with_logging_probe();
        assert!(framer.flow_description().is_none());
    }

    #[test]
    fn sequence_insertion_defaults_off() {
        let framer = Framer::with_logging_probe();
        assert!(!framer.sequence_insertion());
    }

    #[test]
    fn single_i_frame_with_sequence_header_is_emitted() {
        let mut data = Vec::new();
        data.extend_from_slice(&[0x00, 0x00, 0x01, 0xb3]); // sequence_header_code
        data.extend_from_slice(&[0x00, 0x00, 0x00, 0x13, 0x00, 0x00, 0x20, 0x00]);
        data.extend_from_slice(&[0x00, 0x00, 0x01, 0x00]); // picture_start_code
        data.extend_from_slice(&[0x00, 0x0f, 0xff, 0xf8]); // temporal_reference=0, I, vbv_delay unspecified
        data.extend_from_slice(&[0x00, 0x00, 0x01, 0x01]); // slice_start_code
        data.extend_from_slice(&[0xaa, 0xbb]);
        data.extend_from_slice(&[0x00, 0x00, 0x01, 0xb7]); // sequence_end_code

        let stats = Rc::new(RefCell::new(Stats::default()));
        let mut framer = Framer::with_logging_probe();
        framer.set_sink(Box::new(RecordingSink(stats.clone())));
        framer.push(AnnotatedBlock::new(Bytes::copy_from_slice(&data))).unwrap();

        let s = stats.borrow();
        assert_eq!(s.flow_count, 1);
        assert_eq!(s.frame_count, 1);
        assert_eq!(s.last_picture_number, 0);
        assert_eq!(s.last_header_len, 12);
        assert!(s.last_random_access);

        let flow = framer.flow_description().unwrap();
        assert_eq!(flow.frame_rate, (25, 1));
    }
}
