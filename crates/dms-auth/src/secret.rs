//! Vérification des deux facteurs : secret statique et code TOTP (RFC 6238).
//!
//! Fonctions pures du matériel secret et de l'horloge : aucune entrée mal
//! formée ne produit d'erreur, elle est simplement refusée.

use ring::{digest, hmac};
use subtle::ConstantTimeEq;
use tracing::warn;

/// Pas de temps TOTP (secondes)
pub const TOTP_STEP_SECS: u64 = 30;
/// Nombre de chiffres d'un code
pub const TOTP_DIGITS: usize = 6;
/// Pas adjacents acceptés de part et d'autre du pas courant
const TOTP_SKEW_STEPS: u64 = 1;

pub struct SecretVerifier {
    /// Empreinte SHA-256 du secret statique (comparaison à longueur fixe)
    static_digest: Option<Vec<u8>>,
    totp_key: Option<hmac::Key>,
}

impl SecretVerifier {
    pub fn new(static_token: Option<&str>, totp_secret: Option<&str>) -> Self {
        let static_digest = static_token
            .filter(|t| !t.is_empty())
            .map(|t| digest::digest(&digest::SHA256, t.as_bytes()).as_ref().to_vec());

        let totp_key = totp_secret.and_then(|seed| match decode_base32(seed) {
            Some(bytes) if !bytes.is_empty() => {
                Some(hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, &bytes))
            }
            _ => {
                warn!("TOTP seed is not valid base32, one-time codes will be rejected");
                None
            }
        });

        if static_digest.is_none() {
            warn!("No static token configured, logins will be rejected");
        }

        Self {
            static_digest,
            totp_key,
        }
    }

    /// Compare le candidat au secret statique en temps constant
    pub fn verify_static_secret(&self, candidate: &str) -> bool {
        let Some(expected) = &self.static_digest else {
            return false;
        };
        let candidate = digest::digest(&digest::SHA256, candidate.trim().as_bytes());
        expected.as_slice().ct_eq(candidate.as_ref()).into()
    }

    /// Vérifie un code TOTP à l'instant présent
    pub fn verify_time_code(&self, candidate: &str) -> bool {
        self.verify_time_code_at(candidate, unix_now())
    }

    /// Vérifie un code TOTP pour l'instant `unix_secs`, pas courant ±1
    pub fn verify_time_code_at(&self, candidate: &str, unix_secs: u64) -> bool {
        let Some(key) = &self.totp_key else {
            return false;
        };
        let candidate = candidate.trim();
        if candidate.len() != TOTP_DIGITS || !candidate.bytes().all(|b| b.is_ascii_digit()) {
            return false;
        }

        let current = unix_secs / TOTP_STEP_SECS;
        let first = current.saturating_sub(TOTP_SKEW_STEPS);
        let last = current.saturating_add(TOTP_SKEW_STEPS);

        // Tous les pas sont évalués, sans sortie anticipée
        let mut matched = subtle::Choice::from(0u8);
        for counter in first..=last {
            let code = format_code(hotp(key, counter));
            matched |= code.as_bytes().ct_eq(candidate.as_bytes());
        }
        matched.into()
    }

    /// Code attendu pour l'instant `unix_secs` (outillage et tests)
    pub fn code_at(&self, unix_secs: u64) -> Option<String> {
        self.totp_key
            .as_ref()
            .map(|key| format_code(hotp(key, unix_secs / TOTP_STEP_SECS)))
    }

    pub fn is_configured(&self) -> bool {
        self.static_digest.is_some() && self.totp_key.is_some()
    }
}

fn hotp(key: &hmac::Key, counter: u64) -> u32 {
    let tag = hmac::sign(key, &counter.to_be_bytes());
    let mac = tag.as_ref();
    let offset = (mac[mac.len() - 1] & 0x0f) as usize;
    let binary = ((mac[offset] as u32 & 0x7f) << 24)
        | ((mac[offset + 1] as u32) << 16)
        | ((mac[offset + 2] as u32) << 8)
        | (mac[offset + 3] as u32);
    binary % 10u32.pow(TOTP_DIGITS as u32)
}

fn format_code(value: u32) -> String {
    format!("{:0width$}", value, width = TOTP_DIGITS)
}

/// Décode une graine base32 RFC 4648 (casse, espaces et padding tolérés)
fn decode_base32(input: &str) -> Option<Vec<u8>> {
    const ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

    let mut out = Vec::with_capacity(input.len() * 5 / 8);
    let mut buffer: u32 = 0;
    let mut bits: u32 = 0;

    for c in input.bytes() {
        if c == b'=' || c.is_ascii_whitespace() || c == b'-' {
            continue;
        }
        let c = c.to_ascii_uppercase();
        let value = ALPHABET.iter().position(|&a| a == c)? as u32;
        buffer = (buffer << 5) | value;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((buffer >> bits) as u8);
            buffer &= (1 << bits) - 1;
        }
    }

    Some(out)
}

fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Graine RFC 6238 "12345678901234567890" en base32
    const RFC_SEED: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";

    fn verifier() -> SecretVerifier {
        SecretVerifier::new(Some("static-token"), Some(RFC_SEED))
    }

    #[test]
    fn test_decode_base32() {
        assert_eq!(decode_base32(RFC_SEED).unwrap(), b"12345678901234567890");
        assert_eq!(decode_base32("mzxw6===").unwrap(), b"foo");
        assert_eq!(decode_base32("MZXW 6YQ").unwrap(), b"foob");
        assert!(decode_base32("not*base32").is_none());
    }

    #[test]
    fn test_rfc6238_vectors() {
        let v = verifier();
        assert_eq!(v.code_at(59).unwrap(), "287082");
        assert_eq!(v.code_at(1_111_111_109).unwrap(), "081804");
        assert_eq!(v.code_at(1_234_567_890).unwrap(), "005924");
    }

    #[test]
    fn test_static_secret() {
        let v = verifier();
        assert!(v.verify_static_secret("static-token"));
        assert!(v.verify_static_secret("  static-token\n"));
        assert!(!v.verify_static_secret("static-toke"));
        assert!(!v.verify_static_secret(""));
    }

    #[test]
    fn test_static_secret_unconfigured() {
        let v = SecretVerifier::new(None, Some(RFC_SEED));
        assert!(!v.verify_static_secret(""));
        assert!(!v.verify_static_secret("anything"));
    }

    #[test]
    fn test_time_code_accepts_adjacent_steps() {
        let v = verifier();
        let now = 1_000_000_000u64;
        let step = TOTP_STEP_SECS;

        let current = v.code_at(now).unwrap();
        let previous = v.code_at(now - step).unwrap();
        let next = v.code_at(now + step).unwrap();

        assert!(v.verify_time_code_at(&current, now));
        assert!(v.verify_time_code_at(&previous, now));
        assert!(v.verify_time_code_at(&next, now));
    }

    #[test]
    fn test_time_code_rejects_distant_steps() {
        let v = verifier();
        let now = 1_000_000_000u64;
        let step = TOTP_STEP_SECS;

        let current = v.code_at(now).unwrap();
        for distant in [now - 2 * step, now + 2 * step, now - 3 * step] {
            let code = v.code_at(distant).unwrap();
            // Collision improbable mais possible sur 6 chiffres
            if code != current
                && code != v.code_at(now - step).unwrap()
                && code != v.code_at(now + step).unwrap()
            {
                assert!(!v.verify_time_code_at(&code, now));
            }
        }
    }

    #[test]
    fn test_time_code_fails_closed() {
        let v = verifier();
        assert!(!v.verify_time_code_at("", 59));
        assert!(!v.verify_time_code_at("28708", 59));
        assert!(!v.verify_time_code_at("2870822", 59));
        assert!(!v.verify_time_code_at("28708a", 59));
        assert!(v.verify_time_code_at(" 287082 ", 59));

        let unconfigured = SecretVerifier::new(Some("x"), None);
        assert!(!unconfigured.verify_time_code_at("287082", 59));

        let invalid_seed = SecretVerifier::new(Some("x"), Some("!!!"));
        assert!(!invalid_seed.verify_time_code_at("287082", 59));
        assert!(!invalid_seed.is_configured());
    }
}
