//! The header interpreter: parses sequence/GOP/picture headers and their
//! extensions, and derives the flow description downstream consumers need.

use bytes::Bytes;
use failure::format_err;

use crate::constants;
use crate::error::FramerError;

/// A simplified (numerator, denominator) pair.
pub type Rational = (u32, u32);

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = b;
        b = a % b;
        a = t;
    }
    a
}

pub fn simplify(num: u64, den: u64) -> Rational {
    if num == 0 || den == 0 {
        return (0, 1);
    }
    let g = gcd(num, den);
    ((num / g) as u32, (den / g) as u32)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChromaFormat {
    Yuv420,
    Yuv422,
    Yuv444,
}

impl ChromaFormat {
    fn from_code(code: u8) -> Result<Self, FramerError> {
        match code {
            0b01 => Ok(ChromaFormat::Yuv420),
            0b10 => Ok(ChromaFormat::Yuv422),
            0b11 => Ok(ChromaFormat::Yuv444),
            other => Err(FramerError::malformed(format_err!(
                "invalid chroma_format code {}",
                other
            ))),
        }
    }
}

/// A resolved description of the video flow, rebuilt whenever the
/// cached sequence triple changes content.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowDescription {
    pub width: u16,
    pub height: u16,
    pub frame_rate: Rational,
    pub sample_aspect_ratio: Rational,
    pub chroma: ChromaFormat,
    pub profile_and_level: Option<u8>,
    pub low_delay: Option<bool>,
    pub octet_rate: Option<u64>,
    pub cpb_buffer_octets: Option<u64>,
    pub progressive: bool,
    pub display_size: Option<(u16, u16)>,
}

#[derive(Debug, Clone, Copy)]
pub struct SequenceHeaderFields {
    pub width: u16,
    pub height: u16,
    pub aspect_ratio_code: u8,
    pub frame_rate_code: u8,
    pub bitrate_low18: u32,
    pub vbv_buffer_low10: u16,
    /// Total length in bytes of the sequence header, including any
    /// quantiser matrices, starting from the start code.
    pub total_len: usize,
}

/// Parses the fixed part of a sequence header and determines its total
/// length (the fixed part plus any quantiser matrices), using `peek` to
/// fetch additional bytes on demand so the quantiser-matrix flag byte at
/// offset 75 (see `SPEC_FULL.md` §4.4 E3) can be fetched lazily.
pub fn parse_sequence_header<F>(peek: F) -> Result<SequenceHeaderFields, FramerError>
where
    F: Fn(usize, usize) -> Option<Bytes>,
{
    let fixed = peek(0, 12).ok_or_else(|| FramerError::malformed(format_err!("short sequence header")))?;
    let mut r = bitreader::BitReader::new(&fixed[4..]); // skip the 4-byte start code
    let width = r.read_u16(12).map_err(FramerError::malformed)?;
    let height = r.read_u16(12).map_err(FramerError::malformed)?;
    let aspect_ratio_code = r.read_u8(4).map_err(FramerError::malformed)?;
    let frame_rate_code = r.read_u8(4).map_err(FramerError::malformed)?;
    let bitrate_low18 = r.read_u32(18).map_err(FramerError::malformed)?;
    r.skip(1).map_err(FramerError::malformed)?; // marker_bit
    let vbv_buffer_low10 = r.read_u16(10).map_err(FramerError::malformed)?;
    r.skip(1).map_err(FramerError::malformed)?; // constrained_parameters_flag
    let load_intra = r.read_bool().map_err(FramerError::malformed)?;

    let mut total_len = 12usize;
    let load_non_intra = if load_intra {
        total_len += 64;
        let b = peek(75, 1).ok_or_else(|| FramerError::malformed(format_err!("truncated intra quantiser matrix")))?;
        (b[0] & 0x01) != 0
    } else {
        r.read_bool().map_err(FramerError::malformed)?
    };
    if load_non_intra {
        total_len += 64;
    }

    Ok(SequenceHeaderFields {
        width,
        height,
        aspect_ratio_code,
        frame_rate_code,
        bitrate_low18,
        vbv_buffer_low10,
        total_len,
    })
}

#[derive(Debug, Clone, Copy)]
pub struct SequenceExtensionFields {
    pub profile_and_level: u8,
    pub progressive_sequence: bool,
    pub chroma_format_code: u8,
    pub horizontal_size_ext: u8,
    pub vertical_size_ext: u8,
    pub bitrate_ext: u16,
    pub vbv_buffer_ext: u8,
    pub low_delay: bool,
    pub frame_rate_ext_n: u8,
    pub frame_rate_ext_d: u8,
}

/// `bytes` must be the 10-byte region starting at the extension's start
/// code (4 bytes of start code + id byte + 5 more payload bytes).
pub fn parse_sequence_extension(bytes: &[u8]) -> Result<SequenceExtensionFields, FramerError> {
    if bytes.len() < 10 {
        return Err(FramerError::malformed(format_err!("short sequence extension")));
    }
    let mut r = bitreader::BitReader::new(&bytes[4..]);
    r.skip(4).map_err(FramerError::malformed)?; // extension_start_code_identifier
    let profile_and_level = r.read_u8(8).map_err(FramerError::malformed)?;
    let progressive_sequence = r.read_bool().map_err(FramerError::malformed)?;
    let chroma_format_code = r.read_u8(2).map_err(FramerError::malformed)?;
    let horizontal_size_ext = r.read_u8(2).map_err(FramerError::malformed)?;
    let vertical_size_ext = r.read_u8(2).map_err(FramerError::malformed)?;
    let bitrate_ext = r.read_u16(12).map_err(FramerError::malformed)?;
    r.skip(1).map_err(FramerError::malformed)?; // marker_bit
    let vbv_buffer_ext = r.read_u8(8).map_err(FramerError::malformed)?;
    let low_delay = r.read_bool().map_err(FramerError::malformed)?;
    let frame_rate_ext_n = r.read_u8(2).map_err(FramerError::malformed)?;
    let frame_rate_ext_d = r.read_u8(2).map_err(FramerError::malformed)?;
    Ok(SequenceExtensionFields {
        profile_and_level,
        progressive_sequence,
        chroma_format_code,
        horizontal_size_ext,
        vertical_size_ext,
        bitrate_ext,
        vbv_buffer_ext,
        low_delay,
        frame_rate_ext_n,
        frame_rate_ext_d,
    })
}

#[derive(Debug, Clone, Copy)]
pub struct SequenceDisplayExtensionFields {
    pub display_horizontal_size: u16,
    pub display_vertical_size: u16,
    pub total_len: usize,
}

pub fn parse_sequence_display_extension<F>(peek: F) -> Result<SequenceDisplayExtensionFields, FramerError>
where
    F: Fn(usize, usize) -> Option<Bytes>,
{
    let head = peek(0, 5).ok_or_else(|| FramerError::malformed(format_err!("short sequence display extension")))?;
    let mut r = bitreader::BitReader::new(&head[4..]);
    r.skip(4).map_err(FramerError::malformed)?; // extension_start_code_identifier
    r.skip(3).map_err(FramerError::malformed)?; // video_format
    let colour_description = r.read_bool().map_err(FramerError::malformed)?;

    if colour_description {
        let full = peek(0, 12).ok_or_else(|| FramerError::malformed(format_err!("short sequence display extension (colour)")))?;
        let mut r = bitreader::BitReader::new(&full[4..]);
        r.skip(4 + 3 + 1).map_err(FramerError::malformed)?;
        r.skip(8 + 8 + 8).map_err(FramerError::malformed)?; // colour_primaries, transfer_characteristics, matrix_coefficients
        let display_horizontal_size = r.read_u16(14).map_err(FramerError::malformed)?;
        r.skip(1).map_err(FramerError::malformed)?; // marker_bit
        let display_vertical_size = r.read_u16(14).map_err(FramerError::malformed)?;
        Ok(SequenceDisplayExtensionFields {
            display_horizontal_size,
            display_vertical_size,
            total_len: 12,
        })
    } else {
        let full = peek(0, 9).ok_or_else(|| FramerError::malformed(format_err!("short sequence display extension")))?;
        let mut r = bitreader::BitReader::new(&full[4..]);
        r.skip(4 + 3 + 1).map_err(FramerError::malformed)?;
        let display_horizontal_size = r.read_u16(14).map_err(FramerError::malformed)?;
        r.skip(1).map_err(FramerError::malformed)?;
        let display_vertical_size = r.read_u16(14).map_err(FramerError::malformed)?;
        Ok(SequenceDisplayExtensionFields {
            display_horizontal_size,
            display_vertical_size,
            total_len: 9,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GopHeaderFields {
    pub closed_gop: bool,
    pub broken_link: bool,
}

/// `bytes` must be the 8 bytes starting at the GOP start code (4 bytes
/// of start code plus the 4-byte fixed payload).
pub fn parse_gop_header(bytes: &[u8]) -> Result<GopHeaderFields, FramerError> {
    if bytes.len() < 8 {
        return Err(FramerError::malformed(format_err!("short GOP header")));
    }
    let mut r = bitreader::BitReader::new(&bytes[4..]);
    r.skip(25).map_err(FramerError::malformed)?; // time_code
    let closed_gop = r.read_bool().map_err(FramerError::malformed)?;
    let broken_link = r.read_bool().map_err(FramerError::malformed)?;
    Ok(GopHeaderFields { closed_gop, broken_link })
}

#[derive(Debug, Clone, Copy)]
pub struct PictureHeaderFields {
    pub temporal_reference: u16,
    pub coding_type: u8,
    pub vbv_delay: u16,
}

/// `bytes` must be the 8 bytes starting at the picture start code (4
/// bytes of start code plus the 4-byte fixed payload).
pub fn parse_picture_header(bytes: &[u8]) -> Result<PictureHeaderFields, FramerError> {
    if bytes.len() < 8 {
        return Err(FramerError::malformed(format_err!("short picture header")));
    }
    let mut r = bitreader::BitReader::new(&bytes[4..]);
    let temporal_reference = r.read_u16(10).map_err(FramerError::malformed)?;
    let coding_type = r.read_u8(3).map_err(FramerError::malformed)?;
    let vbv_delay = r.read_u16(16).map_err(FramerError::malformed)?;
    Ok(PictureHeaderFields {
        temporal_reference,
        coding_type,
        vbv_delay,
    })
}

#[derive(Debug, Clone, Copy)]
pub struct PictureCodingExtensionFields {
    pub intra_dc_precision: u8,
    pub picture_structure: u8,
    pub top_field_first: bool,
    pub repeat_first_field: bool,
    pub progressive_frame: bool,
}

/// `bytes` must be the 9 bytes starting at the extension's start code (4
/// bytes of start code plus 5 payload bytes covering every field read
/// below).
pub fn parse_picture_coding_extension(bytes: &[u8]) -> Result<PictureCodingExtensionFields, FramerError> {
    if bytes.len() < 9 {
        return Err(FramerError::malformed(format_err!("short picture coding extension")));
    }
    let mut r = bitreader::BitReader::new(&bytes[4..]);
    r.skip(4).map_err(FramerError::malformed)?; // extension_start_code_identifier
    r.skip(16).map_err(FramerError::malformed)?; // f_code[0][0..1], f_code[1][0..1]
    let intra_dc_precision = r.read_u8(2).map_err(FramerError::malformed)?;
    let picture_structure = r.read_u8(2).map_err(FramerError::malformed)?;
    let top_field_first = r.read_bool().map_err(FramerError::malformed)?;
    r.skip(1).map_err(FramerError::malformed)?; // frame_pred_frame_dct
    r.skip(1).map_err(FramerError::malformed)?; // concealment_motion_vectors
    r.skip(1).map_err(FramerError::malformed)?; // q_scale_type
    r.skip(1).map_err(FramerError::malformed)?; // intra_vlc_format
    r.skip(1).map_err(FramerError::malformed)?; // alternate_scan
    let repeat_first_field = r.read_bool().map_err(FramerError::malformed)?;
    r.skip(1).map_err(FramerError::malformed)?; // chroma_420_type
    let progressive_frame = r.read_bool().map_err(FramerError::malformed)?;
    Ok(PictureCodingExtensionFields {
        intra_dc_precision,
        picture_structure,
        top_field_first,
        repeat_first_field,
        progressive_frame,
    })
}

/// `profile_and_level_indication`'s low nibble must be one of the levels
/// defined by ISO/IEC 13818-2 Table 8-3 (Low, Main, High 1440, High).
const LEVEL_MASK: u8 = 0x0f;
const LEVEL_LOW: u8 = 0x0a;
const LEVEL_MAIN: u8 = 0x08;
const LEVEL_HIGH_1440: u8 = 0x06;
const LEVEL_HIGH: u8 = 0x04;

fn validate_level(profile_and_level: u8) -> Result<(), FramerError> {
    match profile_and_level & LEVEL_MASK {
        LEVEL_LOW | LEVEL_MAIN | LEVEL_HIGH_1440 | LEVEL_HIGH => Ok(()),
        other => Err(FramerError::malformed(format_err!("invalid level {}", other))),
    }
}

fn sample_aspect_ratio(code: u8, width: u32, height: u32) -> Result<Rational, FramerError> {
    match code {
        1 => Ok((1, 1)),
        2 => Ok(simplify(u64::from(height) * 4, u64::from(width) * 3)),
        3 => Ok(simplify(u64::from(height) * 16, u64::from(width) * 9)),
        4 => Ok(simplify(u64::from(height) * 221, u64::from(width) * 100)),
        other => Err(FramerError::malformed(format_err!("invalid aspect_ratio_information {}", other))),
    }
}

/// Builds a [`FlowDescription`] from a parsed sequence header plus
/// optional extension and display extension.
pub fn build_flow_description(
    seq: &SequenceHeaderFields,
    ext: Option<&SequenceExtensionFields>,
    display: Option<&SequenceDisplayExtensionFields>,
) -> Result<FlowDescription, FramerError> {
    let (fr_num, fr_den) = constants::frame_rate_from_code(seq.frame_rate_code)
        .ok_or_else(|| FramerError::malformed(format_err!("invalid frame_rate_code {}", seq.frame_rate_code)))?;

    let mut width = u32::from(seq.width);
    let mut height = u32::from(seq.height);
    let mut bitrate = u64::from(seq.bitrate_low18);
    let mut vbv_buffer = u64::from(seq.vbv_buffer_low10);
    let mut frame_rate = (fr_num, fr_den);
    let mut chroma = ChromaFormat::Yuv420;
    let mut progressive = true;
    let mut profile_and_level = None;
    let mut low_delay = None;

    if let Some(ext) = ext {
        width |= u32::from(ext.horizontal_size_ext) << 12;
        height |= u32::from(ext.vertical_size_ext) << 12;
        bitrate |= u64::from(ext.bitrate_ext) << 18;
        vbv_buffer |= u64::from(ext.vbv_buffer_ext) << 10;
        frame_rate = simplify(
            u64::from(frame_rate.0) * u64::from(ext.frame_rate_ext_n + 1),
            u64::from(frame_rate.1) * u64::from(ext.frame_rate_ext_d + 1),
        );
        chroma = ChromaFormat::from_code(ext.chroma_format_code)?;
        validate_level(ext.profile_and_level)?;
        progressive = ext.progressive_sequence;
        profile_and_level = Some(ext.profile_and_level);
        low_delay = Some(ext.low_delay);
    }

    let sar = sample_aspect_ratio(seq.aspect_ratio_code, width, height)?;
    let octet_rate = Some(bitrate * 400 / 8);
    let cpb_buffer_octets = Some(vbv_buffer * 16 * 1024 / 8);
    let display_size = display.map(|d| (d.display_horizontal_size, d.display_vertical_size));

    Ok(FlowDescription {
        width: width as u16,
        height: height as u16,
        frame_rate,
        sample_aspect_ratio: sar,
        chroma,
        profile_and_level,
        low_delay,
        octet_rate,
        cpb_buffer_octets,
        progressive,
        display_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn mem_peek(buf: Vec<u8>) -> impl Fn(usize, usize) -> Option<Bytes> {
        move |offset, len| {
            if offset + len > buf.len() {
                return None;
            }
            Some(Bytes::copy_from_slice(&buf[offset..offset + len]))
        }
    }

    #[test]
    fn sequence_header_without_matrices() {
        // 12-byte fixed header, last byte's two low bits clear (no matrices).
        let mut data = vec![0u8; 12];
        // width=720 (0b1011010000), height=576: pack bits manually.
        // Keep it simple: just check total_len and that parsing succeeds.
        data[11] &= !0x03;
        let fields = parse_sequence_header(mem_peek(data)).unwrap();
        assert_eq!(fields.total_len, 12);
    }

    #[test]
    fn sequence_header_with_intra_matrix_only() {
        let mut data = vec![0u8; 76];
        data[11] |= 0x02; // load_intra_quantiser_matrix
        data[75] &= !0x01; // load_non_intra_quantiser_matrix (shifted 64 bytes later)
        let fields = parse_sequence_header(mem_peek(data)).unwrap();
        assert_eq!(fields.total_len, 76);
    }

    #[test]
    fn sequence_header_with_both_matrices() {
        let mut data = vec![0u8; 140];
        data[11] |= 0x02;
        data[75] |= 0x01;
        let fields = parse_sequence_header(mem_peek(data)).unwrap();
        assert_eq!(fields.total_len, 140);
    }

    #[test]
    fn frame_rate_extension_combines() {
        let seq = SequenceHeaderFields {
            width: 1920,
            height: 1080,
            aspect_ratio_code: 3,
            frame_rate_code: 4, // 30000/1001
            bitrate_low18: 0,
            vbv_buffer_low10: 0,
            total_len: 12,
        };
        let ext = SequenceExtensionFields {
            profile_and_level: 0b0100_0100, // High, level High
            progressive_sequence: true,
            chroma_format_code: 0b01,
            horizontal_size_ext: 0,
            vertical_size_ext: 0,
            bitrate_ext: 0,
            vbv_buffer_ext: 0,
            low_delay: false,
            frame_rate_ext_n: 1, // multiplier 2
            frame_rate_ext_d: 0, // multiplier 1
        };
        let flow = build_flow_description(&seq, Some(&ext), None).unwrap();
        assert_eq!(flow.frame_rate, (60000, 1001));
    }

    #[test]
    fn build_flow_description_rejects_unknown_level() {
        let seq = SequenceHeaderFields {
            width: 1920,
            height: 1080,
            aspect_ratio_code: 1,
            frame_rate_code: 3,
            bitrate_low18: 0,
            vbv_buffer_low10: 0,
            total_len: 12,
        };
        let ext = SequenceExtensionFields {
            profile_and_level: 0b0100_0000, // level nibble 0 isn't Low/Main/High1440/High
            progressive_sequence: true,
            chroma_format_code: 0b01,
            horizontal_size_ext: 0,
            vertical_size_ext: 0,
            bitrate_ext: 0,
            vbv_buffer_ext: 0,
            low_delay: false,
            frame_rate_ext_n: 0,
            frame_rate_ext_d: 0,
        };
        assert!(build_flow_description(&seq, Some(&ext), None).is_err());
    }

    #[test]
    fn aspect_ratio_4_3() {
        let sar = sample_aspect_ratio(2, 720, 576).unwrap();
        assert_eq!(sar, simplify(576 * 4, 720 * 3));
    }
}
