use rand::{thread_rng, Rng};

pub const CODE_LEN: usize = 6;

/// Fresh 6-digit code, never starting with zero.
pub fn generate_code() -> String {
    thread_rng().gen_range(100_000..1_000_000u32).to_string()
}

pub fn is_well_formed(code: &str) -> bool {
    code.len() == CODE_LEN && code.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_six_digits() {
        for _ in 0..1000 {
            let code = generate_code();
            assert!(is_well_formed(&code), "bad code {}", code);
            assert_ne!(code.as_bytes()[0], b'0');
        }
    }

    #[test]
    fn rejects_malformed_codes() {
        assert!(!is_well_formed("12345"));
        assert!(!is_well_formed("1234567"));
        assert!(!is_well_formed("12a456"));
        assert!(is_well_formed("000123"));
    }
}
