//! CRC-32 (IEEE 802.3) helper, used for the index header, each index
//! record, each cache record and the textual header file (§6.2, invariants
//! 2 and 4 of §8).

pub fn crc32(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vector() {
        // CRC-32/IEEE-802.3 of the empty string is 0.
        assert_eq!(crc32(b""), 0);
        // Standard check value for "123456789".
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }
}
