//! Token scanning over the occupied region of a byte ring
//!
//! A token is a maximal run of non-terminator bytes. Scans walk the cursors
//! modulo the ring size, so a token may wrap around the end of storage.

/// Returns true for the bytes that end a token: NUL, LF and CR
#[inline]
pub fn is_terminator(byte: u8) -> bool {
    matches!(byte, 0 | b'\n' | b'\r')
}

/// Result of a single scan starting at the read cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TokenScan {
    /// Number of token bytes found after the leading terminators
    pub token_len: usize,
    /// Whether a terminator follows the token before the write cursor
    pub terminated: bool,
    /// Index of the first byte after the token (the terminator, or `push_idx`)
    pub end: usize,
}

impl TokenScan {
    /// A complete token is available for extraction
    pub fn is_complete(&self) -> bool {
        self.token_len > 0 && self.terminated
    }
}

/// Scan `[pop, push)` for the next token, handing each token byte to `sink`.
///
/// `at` reads the slot at an index inside the occupied region.
pub(crate) fn scan_token<const S: usize>(
    pop: usize,
    push: usize,
    at: impl Fn(usize) -> u8,
    mut sink: impl FnMut(u8),
) -> TokenScan {
    let next = |idx: usize| (idx + 1) % S;

    let mut idx = pop;
    while idx != push && is_terminator(at(idx)) {
        idx = next(idx);
    }

    let mut token_len = 0;
    while idx != push {
        let byte = at(idx);
        if is_terminator(byte) {
            break;
        }
        sink(byte);
        token_len += 1;
        idx = next(idx);
    }

    TokenScan {
        token_len,
        terminated: idx != push,
        end: idx,
    }
}

/// Cursor position after consuming a scanned token and at most one terminator
pub(crate) fn consume_end<const S: usize>(scan: &TokenScan) -> usize {
    if scan.terminated {
        (scan.end + 1) % S
    } else {
        scan.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan_slice<const S: usize>(data: &[u8; S], pop: usize, push: usize) -> (TokenScan, Vec<u8>) {
        let mut token = Vec::new();
        let scan = scan_token::<S>(pop, push, |i| data[i], |b| token.push(b));
        (scan, token)
    }

    #[test]
    fn test_terminator_set() {
        assert!(is_terminator(0));
        assert!(is_terminator(b'\n'));
        assert!(is_terminator(b'\r'));
        assert!(!is_terminator(b' '));
        assert!(!is_terminator(b'O'));
    }

    #[test]
    fn test_scan_skips_leading_terminators() {
        let data = *b"\r\nOK\r\0\0\0";
        let (scan, token) = scan_slice(&data, 0, 5);
        assert_eq!(token, b"OK");
        assert!(scan.is_complete());
        assert_eq!(scan.end, 4);
        assert_eq!(consume_end::<8>(&scan), 5);
    }

    #[test]
    fn test_scan_wraps_around_storage() {
        // "OK" spans indices 6, 7, 0 holds the CR
        let mut data = [0u8; 8];
        data[6] = b'O';
        data[7] = b'K';
        data[0] = b'\r';
        let (scan, token) = scan_slice(&data, 6, 1);
        assert_eq!(token, b"OK");
        assert!(scan.terminated);
        assert_eq!(consume_end::<8>(&scan), 1);
    }

    #[test]
    fn test_scan_partial_token() {
        let data = *b"\nAT\0\0\0\0\0";
        let (scan, token) = scan_slice(&data, 0, 3);
        assert_eq!(token, b"AT");
        assert!(!scan.terminated);
        assert!(!scan.is_complete());
        assert_eq!(consume_end::<8>(&scan), 3);
    }
}
