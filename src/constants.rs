//! MPEG-2 video start codes, extension identifiers, and the frame-rate
//! lookup table from ISO/IEC 13818-2 Table 6-2 / Table 6-4.

/// `picture_start_code`.
pub const PICTURE_START: u8 = 0x00;
/// First byte of the `slice_start_code` range (`0x01..=0xAF`).
pub const SLICE_START_MIN: u8 = 0x01;
pub const SLICE_START_MAX: u8 = 0xaf;
/// `user_data_start_code`.
pub const USER_DATA_START: u8 = 0xb2;
/// `sequence_header_code`.
pub const SEQUENCE_HEADER: u8 = 0xb3;
/// `extension_start_code`; the identifier nibble distinguishes the kind.
pub const EXTENSION_START: u8 = 0xb5;
/// `sequence_end_code`.
pub const SEQUENCE_END: u8 = 0xb7;
/// `group_start_code`.
pub const GOP_START: u8 = 0xb8;

pub fn is_slice_start(code: u8) -> bool {
    (SLICE_START_MIN..=SLICE_START_MAX).contains(&code)
}

/// `extension_start_code_identifier` values (Table 6-2).
pub const SEQUENCE_EXTENSION_ID: u8 = 0b0001;
pub const SEQUENCE_DISPLAY_EXTENSION_ID: u8 = 0b0010;
pub const PICTURE_CODING_EXTENSION_ID: u8 = 0b1000;

/// Reads the 4-bit extension identifier out of the byte following an
/// `EXTENSION_START` code, without consuming anything else.
pub fn extension_id(next_byte: u8) -> u8 {
    next_byte >> 4
}

/// `frame_rate_code` -> (numerator, denominator). Index 0 and 14/15 are
/// reserved/invalid. Codes 9-13 are outside the standard but accepted
/// for Xing/libmpeg3 interoperability, matching upstream behavior.
pub const FRAME_RATE_TABLE: [Option<(u32, u32)>; 16] = [
    None,
    Some((24000, 1001)),
    Some((24, 1)),
    Some((25, 1)),
    Some((30000, 1001)),
    Some((30, 1)),
    Some((50, 1)),
    Some((60000, 1001)),
    Some((60, 1)),
    Some((15000, 1001)),
    Some((5000, 1001)),
    Some((10000, 1001)),
    Some((12000, 1001)),
    Some((15000, 1001)),
    None,
    None,
];

pub fn frame_rate_from_code(code: u8) -> Option<(u32, u32)> {
    FRAME_RATE_TABLE.get(code as usize).copied().flatten()
}
