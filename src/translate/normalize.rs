//! Phrase normalization and local language detection.
//! A phrase is the trimmed, NFC-normalized source text; its identity is the
//! SHA-256 of those bytes, so visually identical inputs share cache entries.

use serde::{Serialize, Serializer};
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

use crate::languages::{self, Language};

/// SHA-256 of a normalized phrase.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PhraseId([u8; 32]);

impl PhraseId {
    pub fn of(normalized: &str) -> Self {
        let digest = Sha256::digest(normalized.as_bytes());
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Self(out)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First 12 hex chars, for logs.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl std::fmt::Debug for PhraseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PhraseId({})", self.short())
    }
}

impl std::fmt::Display for PhraseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for PhraseId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

/// Normalized source text plus its identity. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Phrase {
    pub id: PhraseId,
    pub text: String,
}

impl Phrase {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Trim surrounding whitespace and apply Unicode NFC.
pub fn normalize_phrase(text: &str) -> Phrase {
    let normalized: String = text.trim().nfc().collect();
    Phrase {
        id: PhraseId::of(&normalized),
        text: normalized,
    }
}

/// Detects the dominant language of `text` using whatlang.
/// Returns a registry language, or None if detection is unreliable or the
/// language is not one the provider handles.
pub fn detect_language(text: &str) -> Option<&'static Language> {
    let info = whatlang::detect(text)?;
    if !info.is_reliable() {
        return None;
    }
    languages::lookup(lang_to_code(info.lang())?)
}

fn lang_to_code(lang: whatlang::Lang) -> Option<&'static str> {
    use whatlang::Lang::*;
    let code = match lang {
        Eng => "en",
        Cmn => "zh",
        Jpn => "ja",
        Kor => "ko",
        Fra => "fr",
        Deu => "de",
        Spa => "es",
        Rus => "ru",
        Por => "pt",
        Ita => "it",
        Ara => "ar",
        Tur => "tr",
        Nld => "nl",
        Pol => "pl",
        Ukr => "uk",
        Swe => "sv",
        Dan => "da",
        Fin => "fi",
        Nob => "nb",
        Ces => "cs",
        Ell => "el",
        Hun => "hu",
        Ron => "ro",
        Bul => "bg",
        Slv => "sl",
        Lit => "lt",
        Lav => "lv",
        Est => "et",
        Ind => "id",
        _ => return None,
    };
    Some(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_and_hashes_consistently() {
        let a = normalize_phrase("  hello world \n");
        let b = normalize_phrase("hello world");
        assert_eq!(a.text, "hello world");
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn nfc_unifies_composed_and_decomposed_forms() {
        let composed = normalize_phrase("caf\u{e9}");
        let decomposed = normalize_phrase("cafe\u{301}");
        assert_eq!(composed.text, decomposed.text);
        assert_eq!(composed.id, decomposed.id);
    }

    #[test]
    fn phrase_id_hex_round_trip() {
        let id = normalize_phrase("good night").id;
        let hex = id.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(PhraseId::from_hex(&hex), Some(id));
        assert_eq!(PhraseId::from_hex("zz"), None);
    }

    #[test]
    fn phrase_id_is_sha256() {
        // sha256("abc")
        assert_eq!(
            PhraseId::of("abc").to_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn detects_common_languages() {
        let lang = detect_language("Der schnelle braune Fuchs springt über den faulen Hund und läuft weiter");
        assert_eq!(lang.map(|l| l.code), Some("de"));
    }
}
