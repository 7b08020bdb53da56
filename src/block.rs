//! The data model: blocks, timestamp annotations, and annotated blocks.

use bytes::Bytes;

/// An immutable, shareable, reference-counted byte sequence.
///
/// `bytes::Bytes` already gives us zero-copy subrange slicing, cheap
/// cloning via refcounting, and content equality - exactly what the
/// parser state needs for its cached sequence-header triple.
pub type Block = Bytes;

/// The six timestamp kinds an input block or an emitted frame may carry,
/// plus the system time of the most recent random-access point.
///
/// Every field is independently optional: a slot absent here must stay
/// absent until something downstream fills it in (promotion only ever
/// fills slots that are `None`; see [`crate::stream::InputStream`]).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Timestamps {
    pub pts_orig: Option<i64>,
    pub pts: Option<i64>,
    pub pts_sys: Option<i64>,
    pub dts_orig: Option<i64>,
    pub dts: Option<i64>,
    pub dts_sys: Option<i64>,
    pub systime_rap: Option<i64>,
}

impl Timestamps {
    /// Copies every field from `other` into `self` where `self` is
    /// currently absent. Used by promotion: an earlier promotion's
    /// values always win over a later one.
    pub fn fill_absent_from(&mut self, other: &Timestamps) {
        if self.pts_orig.is_none() {
            self.pts_orig = other.pts_orig;
        }
        if self.pts.is_none() {
            self.pts = other.pts;
        }
        if self.pts_sys.is_none() {
            self.pts_sys = other.pts_sys;
        }
        if self.dts_orig.is_none() {
            self.dts_orig = other.dts_orig;
        }
        if self.dts.is_none() {
            self.dts = other.dts;
        }
        if self.dts_sys.is_none() {
            self.dts_sys = other.dts_sys;
        }
        if self.systime_rap.is_none() {
            self.systime_rap = other.systime_rap;
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Timestamps::default()
    }
}

/// An input block annotated with timestamps and flow flags, attached to
/// the block's first byte.
#[derive(Debug, Clone)]
pub struct AnnotatedBlock {
    pub data: Block,
    pub timestamps: Timestamps,
    pub discontinuity: bool,
    pub error: bool,
}

impl AnnotatedBlock {
    pub fn new(data: Block) -> Self {
        AnnotatedBlock {
            data,
            timestamps: Timestamps::default(),
            discontinuity: false,
            error: false,
        }
    }

    pub fn with_timestamps(data: Block, timestamps: Timestamps) -> Self {
        AnnotatedBlock {
            data,
            timestamps,
            discontinuity: false,
            error: false,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
