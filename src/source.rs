//! Loading Pro*C sources in their on-disk encoding.
use crate::extractor::ExtractError;
use encoding_rs::Encoding;
use std::path::Path;
use tracing::warn;

/// Reads `path` and decodes it with the WHATWG `encoding` label (`utf-8`,
/// `euc-kr`, `shift_jis`, ...). Malformed byte sequences become U+FFFD; only an
/// unreadable file or an unknown label is an error.
pub fn read_source(path: &Path, encoding: &str) -> Result<String, ExtractError> {
    let bytes = std::fs::read(path).map_err(|source| ExtractError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    decode(&bytes, encoding)
}

/// Decodes `bytes`, replacing invalid sequences. A UTF-8/UTF-16 BOM overrides the label.
pub fn decode(bytes: &[u8], encoding: &str) -> Result<String, ExtractError> {
    let encoding = Encoding::for_label(encoding.trim().as_bytes())
        .ok_or_else(|| ExtractError::Encoding(encoding.to_string()))?;
    let (text, used, had_errors) = encoding.decode(bytes);
    if had_errors {
        warn!(
            "Invalid {} byte sequences replaced while decoding source",
            used.name()
        );
    }
    Ok(text.into_owned())
}
