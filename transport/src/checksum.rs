//! Rolling 32-bit checksum for end-to-end payload integrity.
//!
//! The algorithm is CRC-32 with polynomial 0x04C11DB7, processed MSB first and without a final
//!  xor. That makes the raw checksum value identical to the internal register, so a checksum
//!  can be resumed from any previous result:
//!
//! ```ascii
//! checksum(checksum(seed, A), B) == checksum(seed, A || B)
//! ```
//!
//! Both sides of a connection rely on this to checksum the same logical message across
//!  arbitrarily many physical fragments.

use crc::{Crc, CRC_32_MPEG_2};

const CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

/// Starting value for every message checksum
pub const CHECKSUM_SEED: u32 = !0;

/// A checksum field of zero means 'not checksummed', so a genuine zero result is transmitted and
///  compared as this value instead.
pub const ZERO_CHECKSUM_SENTINEL: u32 = 1;

pub fn checksum(seed: u32, buf: &[u8]) -> u32 {
    let mut digest = CRC.digest_with_initial(seed);
    digest.update(buf);
    digest.finalize()
}

/// Turns an accumulated checksum into the value that goes on the wire
pub fn finalize(raw: u32) -> u32 {
    if raw == 0 {
        ZERO_CHECKSUM_SENTINEL
    }
    else {
        raw
    }
}
