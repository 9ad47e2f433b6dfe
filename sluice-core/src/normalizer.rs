use std::{fmt::Display, str::FromStr};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::EncodingError;

/// A piece of serialized output on its way to a partition.
#[derive(Debug, Clone, PartialEq)]
pub enum Chunk {
    Text(String),
    Binary(Bytes),
}

impl From<String> for Chunk {
    fn from(text: String) -> Self {
        Chunk::Text(text)
    }
}

impl From<Bytes> for Chunk {
    fn from(bytes: Bytes) -> Self {
        Chunk::Binary(bytes)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TextEncoding {
    #[default]
    #[serde(rename = "utf-8", alias = "utf8")]
    Utf8,
    #[serde(rename = "utf-16le", alias = "utf16le")]
    Utf16Le,
    #[serde(rename = "utf-16be", alias = "utf16be")]
    Utf16Be,
    #[serde(rename = "iso-8859-1", alias = "latin1")]
    Latin1,
    #[serde(rename = "us-ascii", alias = "ascii")]
    Ascii,
}

impl Display for TextEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TextEncoding::Utf8 => "utf-8",
            TextEncoding::Utf16Le => "utf-16le",
            TextEncoding::Utf16Be => "utf-16be",
            TextEncoding::Latin1 => "iso-8859-1",
            TextEncoding::Ascii => "us-ascii",
        };
        f.write_str(name)
    }
}

impl FromStr for TextEncoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "utf-8" | "utf8" => Ok(TextEncoding::Utf8),
            "utf-16le" | "utf16le" => Ok(TextEncoding::Utf16Le),
            "utf-16be" | "utf16be" => Ok(TextEncoding::Utf16Be),
            "iso-8859-1" | "latin1" => Ok(TextEncoding::Latin1),
            "us-ascii" | "ascii" => Ok(TextEncoding::Ascii),
            other => Err(format!("Unsupported text encoding: {}", other)),
        }
    }
}

/// Converts text chunks to raw bytes; binary chunks pass through untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteNormalizer {
    encoding: TextEncoding,
}

impl ByteNormalizer {
    pub fn new(encoding: TextEncoding) -> Self {
        Self { encoding }
    }

    pub fn encoding(&self) -> TextEncoding {
        self.encoding
    }

    pub fn normalize(&self, chunk: Chunk) -> Result<Bytes, EncodingError> {
        match chunk {
            Chunk::Binary(bytes) => Ok(bytes),
            Chunk::Text(text) => self.encode(text),
        }
    }

    fn encode(&self, text: String) -> Result<Bytes, EncodingError> {
        match self.encoding {
            TextEncoding::Utf8 => Ok(Bytes::from(text.into_bytes())),
            TextEncoding::Utf16Le => Ok(text
                .encode_utf16()
                .flat_map(u16::to_le_bytes)
                .collect::<Vec<u8>>()
                .into()),
            TextEncoding::Utf16Be => Ok(text
                .encode_utf16()
                .flat_map(u16::to_be_bytes)
                .collect::<Vec<u8>>()
                .into()),
            TextEncoding::Latin1 => self.encode_single_byte(&text, 0xFF),
            TextEncoding::Ascii => self.encode_single_byte(&text, 0x7F),
        }
    }

    fn encode_single_byte(&self, text: &str, max: u32) -> Result<Bytes, EncodingError> {
        let mut out = Vec::with_capacity(text.len());
        for (offset, character) in text.char_indices() {
            let code = character as u32;
            if code > max {
                return Err(EncodingError::Unrepresentable {
                    character,
                    offset,
                    encoding: self.encoding,
                });
            }
            out.push(code as u8);
        }
        Ok(out.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_passes_through() {
        let normalizer = ByteNormalizer::new(TextEncoding::Ascii);
        let bytes = Bytes::from_static(&[0xff, 0x00, 0x80]);

        assert_eq!(normalizer.normalize(Chunk::Binary(bytes.clone())).unwrap(), bytes);
    }

    #[test]
    fn utf8_is_the_default() {
        let normalizer = ByteNormalizer::default();
        let out = normalizer.normalize("région,1\n".to_string().into()).unwrap();

        assert_eq!(normalizer.encoding(), TextEncoding::Utf8);
        assert_eq!(out.as_ref(), "région,1\n".as_bytes());
    }

    #[test]
    fn encodes_utf16_in_both_byte_orders() {
        let le = ByteNormalizer::new(TextEncoding::Utf16Le)
            .normalize("a€".to_string().into())
            .unwrap();
        let be = ByteNormalizer::new(TextEncoding::Utf16Be)
            .normalize("a€".to_string().into())
            .unwrap();

        assert_eq!(le.as_ref(), &[0x61, 0x00, 0xac, 0x20]);
        assert_eq!(be.as_ref(), &[0x00, 0x61, 0x20, 0xac]);
    }

    #[test]
    fn latin1_maps_code_points_and_rejects_the_rest() {
        let normalizer = ByteNormalizer::new(TextEncoding::Latin1);
        assert_eq!(
            normalizer.normalize("é".to_string().into()).unwrap().as_ref(),
            &[0xe9]
        );

        let err = normalizer
            .normalize("ok€".to_string().into())
            .unwrap_err();
        assert!(matches!(
            err,
            EncodingError::Unrepresentable {
                character: '€',
                offset: 2,
                ..
            }
        ));
    }

    #[test]
    fn parses_encoding_names() {
        assert_eq!("UTF8".parse::<TextEncoding>().unwrap(), TextEncoding::Utf8);
        assert_eq!("latin1".parse::<TextEncoding>().unwrap(), TextEncoding::Latin1);
        assert!("ebcdic".parse::<TextEncoding>().is_err());
    }
}
