//! Printable, HMAC-secured server identifiers.
//!
//! The coordinator is stateless across restarts with respect to invite
//! codes: a server that reconnects with a valid `(code, secret)` pair
//! reclaims its identity even if this process has no memory of it, because
//! `secret` is just a keyed MAC over `code` under the deployment's shared
//! secret rather than anything this process stored.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::InviteCodeError;

type HmacSha256 = Hmac<Sha256>;

/// Crockford base32 minus `I`/`O` (easy to read aloud, no ambiguous glyphs).
const ALPHABET: &[u8] = b"0123456789ABCDEFGHJKLMNPQRSTUVWXYZ";
const CODE_WIDTH: usize = 7;
/// 128 bits of MAC output, hex-encoded.
const SECRET_HEX_LEN: usize = 32;

/// Deterministically derive a printable invite code from a monotonic
/// ordinal. `generate(1) == "+0000001"`, matching the fixed compatibility
/// table: small ordinals render as plain zero-padded decimal because the
/// alphabet's first ten symbols are the decimal digits in order.
pub fn generate(ordinal: u64) -> Result<String, InviteCodeError> {
    let mut digits = [ALPHABET[0]; CODE_WIDTH];
    let mut n = ordinal;
    let base = ALPHABET.len() as u64;
    for slot in digits.iter_mut().rev() {
        *slot = ALPHABET[(n % base) as usize];
        n /= base;
    }
    if n != 0 {
        return Err(InviteCodeError::OrdinalOverflow(ordinal));
    }
    let mut code = String::with_capacity(CODE_WIDTH + 1);
    code.push('+');
    code.push_str(std::str::from_utf8(&digits).expect("alphabet is ASCII"));
    Ok(code)
}

/// Keyed MAC over `code` under the deployment's shared secret, rendered as
/// lowercase hex and truncated to `SECRET_HEX_LEN` characters (>= 128 bits).
pub fn sign(shared_secret: &[u8], code: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(shared_secret).expect("HMAC accepts any key length");
    mac.update(code.as_bytes());
    let digest = mac.finalize().into_bytes();
    hex::encode(digest)[..SECRET_HEX_LEN].to_string()
}

/// Constant-time comparison of `sign(shared_secret, code)` to `secret`.
pub fn validate(shared_secret: &[u8], code: &str, secret: &str) -> bool {
    let expected = sign(shared_secret, code);
    if expected.len() != secret.len() {
        return false;
    }
    expected.as_bytes().ct_eq(secret.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_matches_compatibility_table() {
        assert_eq!(generate(1).unwrap(), "+0000001");
        assert_eq!(generate(0).unwrap(), "+0000000");
    }

    #[test]
    fn generate_overflows_past_capacity() {
        let max = 34u64.pow(CODE_WIDTH as u32) - 1;
        assert!(generate(max).is_ok());
        assert!(generate(max + 1).is_err());
    }

    #[test]
    fn round_trip_holds_for_many_ordinals() {
        let secret = b"deployment-shared-secret";
        for ordinal in [0u64, 1, 2, 34, 1000, 999_999] {
            let code = generate(ordinal).unwrap();
            let mac = sign(secret, &code);
            assert!(validate(secret, &code, &mac), "ordinal {ordinal}");
        }
    }

    #[test]
    fn tampering_any_bit_invalidates() {
        let secret = b"deployment-shared-secret";
        let code = generate(42).unwrap();
        let mac = sign(secret, &code);

        let mut tampered_code = code.clone();
        tampered_code.replace_range(1..2, "9");
        assert!(!validate(secret, &tampered_code, &mac));

        let mut tampered_mac = mac.clone();
        tampered_mac.replace_range(0..1, if &tampered_mac[0..1] == "a" { "b" } else { "a" });
        assert!(!validate(secret, &code, &tampered_mac));

        assert!(!validate(b"other-secret", &code, &mac));
    }
}
