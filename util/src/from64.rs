use std::convert::TryInto;

/// Conversions that are safe assuming that we are on LP64 (usize == u64)
pub trait From64<A> {
    fn from64(a: A) -> Self;
}

impl From64<u64> for usize {
    fn from64(a: u64) -> usize {
        a.try_into().unwrap()
    }
}

impl From64<i64> for usize {
    fn from64(a: i64) -> usize {
        a.try_into().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from64() {
        assert_eq!(usize::from64(12345u64), 12345usize);
        assert_eq!(usize::from64(0u64), 0usize);
    }

    #[test]
    #[should_panic]
    fn test_from64_negative() {
        usize::from64(-1i64);
    }
}
