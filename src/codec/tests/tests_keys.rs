#[cfg(test)]
mod tests {
    use crate::codec::{
        compare_keys, key_with_ts, parse_key, parse_ts, put_uvarint, uvarint, uvarint_size,
        CodecError,
    };
    use std::cmp::Ordering;

    #[test]
    fn test_key_with_ts_layout() {
        let key = key_with_ts(b"user", 0x0102030405060708);
        assert_eq!(key.len(), 12);
        assert_eq!(&key[..4], b"user");
        assert_eq!(&key[4..], &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_parse_ts_roundtrip() {
        for ts in [0u64, 1, 42, u64::MAX] {
            assert_eq!(parse_ts(&key_with_ts(b"k", ts)), ts);
        }
        // Too short to carry a suffix.
        assert_eq!(parse_ts(b"abc"), 0);
    }

    #[test]
    fn test_parse_key_strips_suffix() {
        assert_eq!(parse_key(&key_with_ts(b"alpha", 7)), b"alpha");
        assert_eq!(parse_key(&key_with_ts(b"", 7)), b"");
    }

    #[test]
    fn test_compare_keys_user_key_first() {
        let a = key_with_ts(b"aaa", 9);
        let b = key_with_ts(b"bbb", 1);
        assert_eq!(compare_keys(&a, &b), Ordering::Less);
        assert_eq!(compare_keys(&b, &a), Ordering::Greater);
    }

    #[test]
    fn test_compare_keys_ts_breaks_ties() {
        // Same user key: the higher timestamp sorts after under
        // big-endian suffix comparison.
        let old = key_with_ts(b"key", 1);
        let new = key_with_ts(b"key", 2);
        assert_eq!(compare_keys(&old, &new), Ordering::Less);
        assert_eq!(compare_keys(&new, &old), Ordering::Greater);
        assert_eq!(compare_keys(&old, &old), Ordering::Equal);
    }

    #[test]
    fn test_uvarint_roundtrip() {
        for x in [
            0u64,
            1,
            127,
            128,
            300,
            16_383,
            16_384,
            u64::from(u32::MAX),
            u64::MAX,
        ] {
            let mut buf = Vec::new();
            let written = put_uvarint(&mut buf, x);
            assert_eq!(written, buf.len());
            assert_eq!(written, uvarint_size(x));
            let (decoded, consumed) = uvarint(&buf).unwrap();
            assert_eq!(decoded, x);
            assert_eq!(consumed, written);
        }
    }

    #[test]
    fn test_uvarint_truncated() {
        // A continuation bit with nothing after it.
        let res = uvarint(&[0x80]);
        assert!(matches!(res, Err(CodecError::Truncated { .. })));
        let res = uvarint(&[]);
        assert!(matches!(res, Err(CodecError::Truncated { .. })));
    }

    #[test]
    fn test_uvarint_overflow() {
        // 11 continuation bytes can never encode a u64.
        let buf = [0xffu8; 11];
        assert!(matches!(uvarint(&buf), Err(CodecError::VarintOverflow)));
    }
}
