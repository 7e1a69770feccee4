//! CRC32 (IEEE 802.3) of fragment payloads (spec §4.3 step 6, §6.1).
//!
//! `crc32fast` is the standard ecosystem crate for this polynomial — the
//! pack's closest precedent is `Achxy-serialwrap`'s use of the `crc32c`
//! crate for a *different* CRC-32 variant (Castagnoli); we need the plain
//! IEEE CRC-32 the spec's wire format calls for, so we reach for the
//! equivalent standard crate rather than hand-rolling the table.

pub fn crc32(payload: &[u8]) -> u32 {
    crc32fast::hash(payload)
}
