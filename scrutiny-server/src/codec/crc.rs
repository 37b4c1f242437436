use crc::{Crc, CRC_32_ISO_HDLC};

/// IEEE 802.3 CRC-32, big-endian appended to the wire payload it covers.
const CRC32_IEEE: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

pub fn crc32(data: &[u8]) -> u32 {
    CRC32_IEEE.checksum(data)
}

pub fn append_crc32(buf: &mut Vec<u8>) {
    let crc = crc32(buf);
    buf.extend_from_slice(&crc.to_be_bytes());
}

/// Splits a buffer into `(body, crc)` and checks it, returning the body on match.
pub fn split_and_check(buf: &[u8]) -> Option<&[u8]> {
    if buf.len() < 4 {
        return None;
    }
    let (body, tail) = buf.split_at(buf.len() - 4);
    let expected = u32::from_be_bytes(tail.try_into().ok()?);
    if crc32(body) == expected {
        Some(body)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let mut buf = vec![1, 2, 3, 4, 5];
        append_crc32(&mut buf);
        assert_eq!(split_and_check(&buf), Some(&[1u8, 2, 3, 4, 5][..]));
    }

    #[test]
    fn mismatch_is_rejected() {
        let mut buf = vec![1, 2, 3];
        append_crc32(&mut buf);
        let last = buf.len() - 1;
        buf[last] ^= 0xff;
        assert_eq!(split_and_check(&buf), None);
    }
}
