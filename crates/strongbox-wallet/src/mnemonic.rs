//! BIP-39 mnemonic backup and restoration.
//!
//! Wallet bodies persist the raw mnemonic entropy (hex); the 64-byte BIP-39
//! seed is recomputed whenever keys must be derived.

use bip39::{Language, Mnemonic};
use rand::RngCore;
use zeroize::Zeroizing;

use strongbox_core::constants::SEED_ENTROPY_LEN;
use strongbox_core::error::DerivationError;

/// Fresh random entropy for a new HD wallet.
///
/// Fails instead of panicking when the OS entropy source is unavailable.
pub fn generate_entropy() -> Result<Zeroizing<Vec<u8>>, DerivationError> {
    let mut bytes = Zeroizing::new(vec![0u8; SEED_ENTROPY_LEN]);
    rand::rngs::OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| DerivationError::InvalidSeed(format!("entropy source: {e}")))?;
    Ok(bytes)
}

/// Convert entropy to its English mnemonic phrase.
pub fn entropy_to_mnemonic(entropy: &[u8]) -> Result<Zeroizing<String>, DerivationError> {
    let m = Mnemonic::from_entropy_in(Language::English, entropy)
        .map_err(|e| DerivationError::InvalidMnemonic(e.to_string()))?;
    Ok(Zeroizing::new(m.to_string()))
}

/// Parse a mnemonic phrase and extract its entropy.
///
/// Normalizes whitespace and converts to lowercase before parsing.
pub fn mnemonic_to_entropy(phrase: &str) -> Result<Zeroizing<Vec<u8>>, DerivationError> {
    let normalized = phrase
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    let m = Mnemonic::parse_in(Language::English, &normalized)
        .map_err(|e| DerivationError::InvalidMnemonic(e.to_string()))?;
    Ok(Zeroizing::new(m.to_entropy()))
}

/// BIP-39 seed (empty passphrase) for the given entropy.
pub fn seed_from_entropy(entropy: &[u8]) -> Result<Zeroizing<Vec<u8>>, DerivationError> {
    let m = Mnemonic::from_entropy_in(Language::English, entropy)
        .map_err(|e| DerivationError::InvalidSeed(e.to_string()))?;
    Ok(Zeroizing::new(m.to_seed("").to_vec()))
}

/// [`seed_from_entropy`] for hex-encoded entropy as stored in a wallet body.
pub fn seed_from_hex(entropy_hex: &str) -> Result<Zeroizing<Vec<u8>>, DerivationError> {
    let entropy = Zeroizing::new(
        hex::decode(entropy_hex).map_err(|e| DerivationError::InvalidSeed(e.to_string()))?,
    );
    seed_from_entropy(&entropy)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_entropy_has_expected_length() {
        let e = generate_entropy().unwrap();
        assert_eq!(e.len(), SEED_ENTROPY_LEN);
        assert_ne!(*generate_entropy().unwrap(), *e);
    }

    #[test]
    fn roundtrip_generate() {
        let entropy = generate_entropy().unwrap();
        let phrase = entropy_to_mnemonic(&entropy).unwrap();
        assert_eq!(phrase.split_whitespace().count(), 12);
        let restored = mnemonic_to_entropy(&phrase).unwrap();
        assert_eq!(*restored, *entropy);
    }

    /// Test vector from the BIP-39 reference list.
    #[test]
    fn known_vector_seed() {
        let entropy = [0u8; 16];
        let phrase = entropy_to_mnemonic(&entropy).unwrap();
        assert_eq!(
            phrase.as_str(),
            "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about"
        );
        let seed = seed_from_entropy(&entropy).unwrap();
        assert_eq!(seed.len(), 64);
    }

    #[test]
    fn whitespace_and_case_normalization() {
        let restored = mnemonic_to_entropy(
            "  Abandon abandon\tabandon abandon abandon abandon abandon abandon abandon abandon abandon ABOUT ",
        )
        .unwrap();
        assert_eq!(*restored, vec![0u8; 16]);
    }

    #[test]
    fn invalid_word_rejected() {
        let err = mnemonic_to_entropy("abandon abandon abandon invalidword").unwrap_err();
        assert!(err.to_string().contains("invalid mnemonic"), "error was: {err}");
    }

    #[test]
    fn bad_checksum_rejected() {
        let mut phrase = vec!["abandon"; 11].join(" ");
        phrase.push_str(" zoo");
        assert!(mnemonic_to_entropy(&phrase).is_err());
    }

    #[test]
    fn seed_from_hex_matches_raw() {
        let entropy = [0x42u8; 16];
        let a = seed_from_entropy(&entropy).unwrap();
        let b = seed_from_hex(&hex::encode(entropy)).unwrap();
        assert_eq!(*a, *b);
    }

    #[test]
    fn seed_from_bad_hex_rejected() {
        assert!(matches!(seed_from_hex("xyz").unwrap_err(), DerivationError::InvalidSeed(_)));
        // 5 bytes is not a valid BIP-39 entropy length
        assert!(matches!(
            seed_from_hex("0102030405").unwrap_err(),
            DerivationError::InvalidSeed(_)
        ));
    }
}
