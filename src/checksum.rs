
// CRC-32, IEEE 802.3 polynomial, reflected form 0xEDB88320.
// Table-driven; the bitwise form is kept as the reference implementation for tests.

const POLYNOMIAL: u32 = 0xEDB88320;

const fn build_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut code = 0;
    while code < 256 {
        let mut reg = code as u32;
        let mut bit = 0;
        while bit < 8 {
            reg = if reg & 1 != 0 { (reg >> 1) ^ POLYNOMIAL } else { reg >> 1 };
            bit += 1;
        }
        table[code] = reg;
        code += 1;
    }
    table
}

static PARTIAL_RESULTS: [u32; 256] = build_table();

/// Computes the IEEE 802.3 CRC-32 of a sequence of byte ranges, as if they were one
/// contiguous buffer.
///
/// This is the checksum installed by
/// [`Host::use_crc32_checksum`](crate::Host::use_crc32_checksum).
pub fn crc32(buffers: &[&[u8]]) -> u32 {
    let mut reg = !0u32;
    for buffer in buffers.iter() {
        for &byte in buffer.iter() {
            reg = (reg >> 8) ^ PARTIAL_RESULTS[(reg as u8 ^ byte) as usize];
        }
    }
    !reg
}

#[cfg(test)]
fn compute_slow(data: &[u8]) -> u32 {
    let mut reg = !0u32;
    for &byte in data.iter() {
        reg ^= byte as u32;
        for _ in 0..8 {
            reg = if reg & 1 != 0 { (reg >> 1) ^ POLYNOMIAL } else { reg >> 1 };
        }
    }
    !reg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic() {
        // The standard check value for this polynomial.
        assert_eq!(compute_slow("123456789".as_bytes()), 0xCBF43926);
        assert_eq!(crc32(&["123456789".as_bytes()]), 0xCBF43926);
    }

    #[test]
    fn split_buffers_match_contiguous() {
        let data = (0..=255u8).collect::<Vec<_>>();
        for split in [0, 1, 17, 128, 255, 256] {
            let (a, b) = data.split_at(split);
            assert_eq!(crc32(&[a, b]), crc32(&[&data]));
        }
    }

    #[test]
    fn random() {
        for _ in 0..100 {
            let data = (0..1024).map(|_| rand::random::<u8>()).collect::<Vec<_>>();
            assert_eq!(crc32(&[&data]), compute_slow(&data));
        }
    }
}
