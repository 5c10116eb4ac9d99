//! Symbol-map front-end for pre-phonemized text
//!
//! Grapheme-to-phoneme conversion happens outside this crate; what arrives
//! here is already a phoneme string (one symbol per character) or a list of
//! phone symbols. [`SymbolTokenizer`] maps those to model ids through a JSON
//! symbol map and wraps them in `<s>` / `</s>`.

use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::path::Path;

use crate::error::DecodeError;
use crate::models::TextFrontEnd;

pub const BOS_SYMBOL: &str = "<s>";
pub const EOS_SYMBOL: &str = "</s>";

/// Default ids when the map does not carry `<s>` / `</s>`.
const DEFAULT_BOS: u32 = 1;
const DEFAULT_EOS: u32 = 2;

/// Phone symbol → token id lookup.
#[derive(Debug, Clone)]
pub struct SymbolTokenizer {
    symbols: HashMap<String, u32>,
    inverse: HashMap<u32, String>,
    /// Beginning of sequence token ID
    pub bos_token_id: u32,
    /// End of sequence token ID
    pub eos_token_id: u32,
}

impl SymbolTokenizer {
    pub fn new(symbols: HashMap<String, u32>) -> Self {
        let bos_token_id = symbols.get(BOS_SYMBOL).copied().unwrap_or(DEFAULT_BOS);
        let eos_token_id = symbols.get(EOS_SYMBOL).copied().unwrap_or(DEFAULT_EOS);
        let inverse = symbols.iter().map(|(s, &id)| (id, s.clone())).collect();
        Self {
            symbols,
            inverse,
            bos_token_id,
            eos_token_id,
        }
    }

    /// Load a `{"symbol": id, ...}` JSON map.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read symbol map from {}", path.display()))?;
        Self::from_json(&raw)
            .with_context(|| format!("Failed to parse symbol map {}", path.display()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let symbols: HashMap<String, u32> = serde_json::from_str(json)?;
        Ok(Self::new(symbols))
    }

    pub fn vocab_size(&self) -> usize {
        self.symbols.len()
    }

    pub fn token_to_id(&self, symbol: &str) -> Option<u32> {
        self.symbols.get(symbol).copied()
    }

    /// Map phone symbols to ids, wrapped in bos/eos. Empty phones stand for
    /// a word break and map to `" "`.
    pub fn encode_phones<S: AsRef<str>>(&self, phones: &[S]) -> Result<Vec<u32>> {
        let mut ids = Vec::with_capacity(phones.len() + 2);
        ids.push(self.bos_token_id);
        for phone in phones {
            let phone = match phone.as_ref() {
                "" => " ",
                p => p,
            };
            let Some(&id) = self.symbols.get(phone) else {
                bail!(DecodeError::InvalidInput(format!(
                    "phone {phone:?} is not in the symbol map"
                )));
            };
            ids.push(id);
        }
        ids.push(self.eos_token_id);
        tracing::trace!(n_phones = phones.len(), "encoded phones");
        Ok(ids)
    }

    /// Ids back to a phoneme string; bos/eos are dropped, unknown ids are
    /// skipped with a debug log.
    pub fn decode(&self, ids: &[u32]) -> String {
        let mut out = String::new();
        for &id in ids {
            if id == self.bos_token_id || id == self.eos_token_id {
                continue;
            }
            match self.inverse.get(&id) {
                Some(symbol) => out.push_str(symbol),
                None => tracing::debug!(id, "dropping id outside the symbol map"),
            }
        }
        out
    }
}

impl TextFrontEnd for SymbolTokenizer {
    /// `text` is an already phonemized string; each character is one phone.
    fn encode(&self, text: &str, language: &str) -> Result<Vec<u32>> {
        tracing::debug!(language, chars = text.chars().count(), "encoding text");
        let phones: Vec<String> = text.chars().map(String::from).collect();
        self.encode_phones(&phones)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn tokenizer() -> SymbolTokenizer {
        SymbolTokenizer::from_json(
            r#"{"<s>": 1, "</s>": 2, " ": 3, "h": 10, "ɛ": 11, "l": 12, "o": 13}"#,
        )
        .unwrap()
    }

    #[test]
    fn test_encode_wraps_bos_eos() {
        let tok = tokenizer();
        let ids = tok.encode("hɛlo", "en").unwrap();
        assert_eq!(ids, vec![1, 10, 11, 12, 13, 2]);
    }

    #[test]
    fn test_empty_phone_is_space() {
        let tok = tokenizer();
        let ids = tok.encode_phones(&["h", "", "o"]).unwrap();
        assert_eq!(ids, vec![1, 10, 3, 13, 2]);
    }

    #[test]
    fn test_unknown_symbol_rejected() {
        let err = tokenizer().encode("hx", "en").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DecodeError>(),
            Some(DecodeError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_default_special_ids() {
        let tok = SymbolTokenizer::from_json(r#"{"a": 5}"#).unwrap();
        assert_eq!(tok.bos_token_id, 1);
        assert_eq!(tok.eos_token_id, 2);
        assert_eq!(tok.encode("a", "en").unwrap(), vec![1, 5, 2]);
        assert_eq!(tok.vocab_size(), 1);
    }

    #[test]
    fn test_decode_skips_specials() {
        let tok = tokenizer();
        assert_eq!(tok.decode(&[1, 10, 3, 13, 2, 999]), "h o");
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"<s>": 7, "</s>": 8, "a": 9}}"#).unwrap();
        let tok = SymbolTokenizer::from_file(file.path()).unwrap();
        assert_eq!(tok.encode("a", "en").unwrap(), vec![7, 9, 8]);
        assert!(SymbolTokenizer::from_file("/nonexistent/symmap.json").is_err());
    }
}
