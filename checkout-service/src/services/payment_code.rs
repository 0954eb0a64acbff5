//! Payment code ("gencode") generation and memo extraction.
//!
//! A gencode is a short token embedded verbatim in a bank-transfer memo and
//! matched back by the webhook reconciler. Uniqueness is enforced at write
//! time against currently-open orders, not globally; a retired code may be
//! reused once its order is paid or cancelled.

use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;

pub const GENCODE_PREFIX: &str = "PAY";

/// Suffix alphabet without visually ambiguous characters (0/O, 1/I).
const SUFFIX_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const SUFFIX_LEN: usize = 5;

/// Memos arrive in free text; the token is the prefix followed by 4-6
/// alphanumerics, matched case-insensitively.
static GENCODE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bPAY[A-Z0-9]{4,6}\b").expect("gencode pattern must compile")
});

/// Generate a fresh candidate code, e.g. `PAYK7W2M`.
pub fn generate() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..SUFFIX_LEN)
        .map(|_| SUFFIX_ALPHABET[rng.gen_range(0..SUFFIX_ALPHABET.len())] as char)
        .collect();
    format!("{}{}", GENCODE_PREFIX, suffix)
}

/// Extract the first gencode token from a free-text memo, uppercased.
pub fn extract(memo: &str) -> Option<String> {
    GENCODE_PATTERN
        .find(memo)
        .map(|m| m.as_str().to_ascii_uppercase())
}

/// Check the shape of a stored code: prefix plus 4-6 alphanumerics.
pub fn is_valid(gencode: &str) -> bool {
    let Some(suffix) = gencode.strip_prefix(GENCODE_PREFIX) else {
        return false;
    };
    (4..=6).contains(&suffix.len()) && suffix.bytes().all(|b| b.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_codes_have_expected_shape() {
        for _ in 0..100 {
            let code = generate();
            assert!(is_valid(&code), "bad code: {}", code);
            assert_eq!(code.len(), GENCODE_PREFIX.len() + SUFFIX_LEN);
            for b in code.as_bytes()[GENCODE_PREFIX.len()..].iter() {
                assert!(SUFFIX_ALPHABET.contains(b));
            }
        }
    }

    #[test]
    fn extracts_code_embedded_in_memo() {
        assert_eq!(
            extract("chuyen tien PAYAB12 thang 10"),
            Some("PAYAB12".to_string())
        );
    }

    #[test]
    fn extracts_bare_code() {
        assert_eq!(extract("PAYAB12"), Some("PAYAB12".to_string()));
    }

    #[test]
    fn extraction_is_case_insensitive() {
        assert_eq!(extract("ck payab12 cam on"), Some("PAYAB12".to_string()));
    }

    #[test]
    fn memo_without_code_yields_none() {
        assert_eq!(extract("thanh toan don hang"), None);
        assert_eq!(extract(""), None);
    }

    #[test]
    fn validates_code_shape() {
        assert!(is_valid("PAYAB12"));
        assert!(is_valid("PAYK7W2M"));
        assert!(!is_valid("PAYAB"));
        assert!(!is_valid("ORDER_1_X"));
        assert!(!is_valid("PAY AB12"));
    }
}
