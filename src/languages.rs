//! Supported languages registry.
//! Static bidirectional map between the pipeline's internal lower-case codes
//! and the provider's upper-case target/source codes. Regional variants are
//! distinct keys; the bare code picks a default variant for targets.

use serde::{Serialize, Serializer};

/// One supported language.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct Language {
    /// Internal code, lower-case BCP-47-ish (`en-us`, `pt-br`, `zh-hant`).
    pub code: &'static str,
    /// Provider code used for `target_lang`.
    pub provider_target: &'static str,
    /// Provider code used for `source_lang` and reported on detection.
    pub provider_source: &'static str,
    pub name: &'static str,
}

impl Serialize for Language {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.code)
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code)
    }
}

macro_rules! lang {
    ($code:literal, $target:literal, $source:literal, $name:literal) => {
        Language {
            code: $code,
            provider_target: $target,
            provider_source: $source,
            name: $name,
        }
    };
}

/// Internal → provider mapping. The first entry for a given `provider_source`
/// is the canonical one returned by [`from_provider`].
pub static LANGUAGES: &[Language] = &[
    lang!("ar", "AR", "AR", "Arabic"),
    lang!("bg", "BG", "BG", "Bulgarian"),
    lang!("cs", "CS", "CS", "Czech"),
    lang!("da", "DA", "DA", "Danish"),
    lang!("de", "DE", "DE", "German"),
    lang!("el", "EL", "EL", "Greek"),
    lang!("en", "EN-US", "EN", "English"),
    lang!("en-us", "EN-US", "EN", "English (American)"),
    lang!("en-gb", "EN-GB", "EN", "English (British)"),
    lang!("es", "ES", "ES", "Spanish"),
    lang!("et", "ET", "ET", "Estonian"),
    lang!("fi", "FI", "FI", "Finnish"),
    lang!("fr", "FR", "FR", "French"),
    lang!("hu", "HU", "HU", "Hungarian"),
    lang!("id", "ID", "ID", "Indonesian"),
    lang!("it", "IT", "IT", "Italian"),
    lang!("ja", "JA", "JA", "Japanese"),
    lang!("ko", "KO", "KO", "Korean"),
    lang!("lt", "LT", "LT", "Lithuanian"),
    lang!("lv", "LV", "LV", "Latvian"),
    lang!("nb", "NB", "NB", "Norwegian (Bokmål)"),
    lang!("nl", "NL", "NL", "Dutch"),
    lang!("pl", "PL", "PL", "Polish"),
    lang!("pt", "PT-PT", "PT", "Portuguese"),
    lang!("pt-pt", "PT-PT", "PT", "Portuguese (European)"),
    lang!("pt-br", "PT-BR", "PT", "Portuguese (Brazilian)"),
    lang!("ro", "RO", "RO", "Romanian"),
    lang!("ru", "RU", "RU", "Russian"),
    lang!("sk", "SK", "SK", "Slovak"),
    lang!("sl", "SL", "SL", "Slovenian"),
    lang!("sv", "SV", "SV", "Swedish"),
    lang!("tr", "TR", "TR", "Turkish"),
    lang!("uk", "UK", "UK", "Ukrainian"),
    lang!("zh", "ZH-HANS", "ZH", "Chinese"),
    lang!("zh-hans", "ZH-HANS", "ZH", "Chinese (Simplified)"),
    lang!("zh-hant", "ZH-HANT", "ZH", "Chinese (Traditional)"),
];

/// Alternate spellings accepted on input, applied after case/underscore folding.
const SYNONYMS: &[(&str, &str)] = &[
    ("zh-cn", "zh-hans"),
    ("zh-sg", "zh-hans"),
    ("zh-tw", "zh-hant"),
    ("zh-hk", "zh-hant"),
    ("no", "nb"),
    ("nn", "nb"),
    ("in", "id"),
    ("jp", "ja"),
    ("en-uk", "en-gb"),
];

/// Result of normalizing a caller-supplied code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LanguageCode {
    Supported(&'static Language),
    /// Sentinel for anything not in the registry.
    Unsupported,
}

impl LanguageCode {
    pub fn language(self) -> Option<&'static Language> {
        match self {
            LanguageCode::Supported(lang) => Some(lang),
            LanguageCode::Unsupported => None,
        }
    }
}

/// Source language of a request: a known code, or ask the provider to detect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceLanguage {
    #[default]
    Auto,
    Known(&'static Language),
}

impl SourceLanguage {
    /// Parse a caller source code. `None`, empty and `auto` all mean detection.
    pub fn parse(code: Option<&str>) -> Result<Self, String> {
        let Some(code) = code else {
            return Ok(SourceLanguage::Auto);
        };
        let folded = fold(code);
        if folded.is_empty() || folded == "auto" {
            return Ok(SourceLanguage::Auto);
        }
        match normalize(code) {
            LanguageCode::Supported(lang) => Ok(SourceLanguage::Known(lang)),
            LanguageCode::Unsupported => Err(code.to_string()),
        }
    }
}

fn fold(code: &str) -> String {
    code.trim().to_lowercase().replace('_', "-")
}

/// Lower-case, trim, underscores to hyphens, then resolve synonyms.
pub fn normalize(code: &str) -> LanguageCode {
    let folded = fold(code);
    let resolved = SYNONYMS
        .iter()
        .find(|(alias, _)| *alias == folded)
        .map(|(_, canonical)| *canonical)
        .unwrap_or(folded.as_str());
    match LANGUAGES.iter().find(|l| l.code == resolved) {
        Some(lang) => LanguageCode::Supported(lang),
        None => LanguageCode::Unsupported,
    }
}

/// Shorthand for `normalize(code).language()`.
pub fn lookup(code: &str) -> Option<&'static Language> {
    normalize(code).language()
}

/// Map a provider-reported source code (e.g. `EN`, `pt`) back to the registry.
pub fn from_provider(code: &str) -> Option<&'static Language> {
    let upper = code.trim().to_uppercase();
    LANGUAGES
        .iter()
        .find(|l| l.provider_source == upper)
        .or_else(|| LANGUAGES.iter().find(|l| l.provider_target == upper))
}
