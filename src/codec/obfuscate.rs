//! Alphabet obfuscation codecs.
//!
//! The digit codec turns signed 64-bit integers (and lists of them) into
//! short strings over a salted alphabet with a minimum length; the text
//! codec maps arbitrary strings (and lists) through a salted 64-character
//! alphabet. Both are symmetric: decode(encode(v)) == v for every
//! representable value.

use eyre::{bail, eyre, Result};
use sha1::{Digest, Sha1};

use crate::defs::Value;

/// Deterministically shuffle an alphabet with a salt-seeded generator, so
/// two processes sharing a salt agree on the permutation.
fn shuffle(alphabet: &str, salt: &str) -> Vec<char> {
    let mut chars: Vec<char> = alphabet.chars().collect();
    if salt.is_empty() {
        return chars;
    }

    let digest = Sha1::digest(salt.as_bytes());
    let mut seed = u64::from_be_bytes(digest[..8].try_into().unwrap()) | 1;

    for i in (1..chars.len()).rev() {
        // xorshift64
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        let j = (seed % (i as u64 + 1)) as usize;
        chars.swap(i, j);
    }
    chars
}

/// Salted base-N integer codec. The first two alphabet positions are
/// reserved: one separates the numbers of a list, the other marks padding
/// appended to reach the minimum length.
pub struct DigitCodec {
    sep: char,
    pad: char,
    table: Vec<char>,
    length: usize,
}

impl DigitCodec {
    pub fn new(alphabet: &str, salt: &str, length: usize) -> DigitCodec {
        let chars = shuffle(alphabet, salt);
        assert!(chars.len() >= 16, "digit alphabet too small");
        DigitCodec {
            sep: chars[0],
            pad: chars[1],
            table: chars[2..].to_vec(),
            length,
        }
    }

    pub fn encode(&self, value: &Value) -> Result<Value> {
        let numbers = match value {
            Value::Number(n) => vec![n
                .as_i64()
                .ok_or_else(|| eyre!("digit codec takes integers"))?],
            Value::String(s) => vec![s
                .parse::<i64>()
                .map_err(|_| eyre!("digit codec takes integers"))?],
            Value::Array(items) => items
                .iter()
                .map(|v| v.as_i64().ok_or_else(|| eyre!("digit codec takes integers")))
                .collect::<Result<Vec<_>>>()?,
            _ => bail!("digit codec takes integers"),
        };

        let mut out = String::new();
        for (i, n) in numbers.iter().enumerate() {
            if i > 0 {
                out.push(self.sep);
            }
            out.push_str(&self.encode_one(*n));
        }

        if out.chars().count() < self.length {
            out.push(self.pad);
            let mut filler = self.filler(&out);
            while out.chars().count() < self.length {
                out.push(filler.next().unwrap());
            }
        }

        Ok(Value::String(out))
    }

    pub fn decode(&self, value: &Value) -> Result<Value> {
        let text = value
            .as_str()
            .ok_or_else(|| eyre!("digit codec decodes strings"))?;
        let body: String = text.chars().take_while(|c| *c != self.pad).collect();

        let mut numbers = Vec::new();
        for part in body.split(self.sep) {
            numbers.push(self.decode_one(part)?);
        }

        if numbers.len() == 1 {
            Ok(Value::from(numbers[0]))
        } else {
            Ok(Value::from(numbers))
        }
    }

    fn encode_one(&self, n: i64) -> String {
        // zigzag keeps negatives representable without a sign character
        let mut m = ((n << 1) ^ (n >> 63)) as u64;
        let base = self.table.len() as u64;

        let mut digits = Vec::new();
        loop {
            digits.push(self.table[(m % base) as usize]);
            m /= base;
            if m == 0 {
                break;
            }
        }
        digits.into_iter().rev().collect()
    }

    fn decode_one(&self, text: &str) -> Result<i64> {
        if text.is_empty() {
            bail!("empty digit data");
        }
        let base = self.table.len() as u64;
        let mut m: u64 = 0;
        for c in text.chars() {
            let digit = self
                .table
                .iter()
                .position(|t| *t == c)
                .ok_or_else(|| eyre!("invalid digit character {c:?}"))? as u64;
            m = m
                .checked_mul(base)
                .and_then(|v| v.checked_add(digit))
                .ok_or_else(|| eyre!("digit overflow"))?;
        }
        Ok(((m >> 1) as i64) ^ -((m & 1) as i64))
    }

    fn filler(&self, seed: &str) -> impl Iterator<Item = char> + '_ {
        let digest = Sha1::digest(seed.as_bytes());
        let table = &self.table;
        digest
            .to_vec()
            .into_iter()
            .cycle()
            .map(move |b| table[b as usize % table.len()])
    }
}

/// Custom-alphabet base64 over UTF-8 bytes. Lists are joined with the unit
/// separator before encoding, so one wire string carries either form.
pub struct TextCodec {
    table: Vec<char>,
}

const LIST_SEP: char = '\u{1f}';

impl TextCodec {
    pub fn new(alphabet: &str, salt: &str) -> TextCodec {
        let chars = shuffle(alphabet, salt);
        assert!(chars.len() >= 64, "text alphabet needs 64 characters");
        TextCodec { table: chars[..64].to_vec() }
    }

    pub fn encode(&self, value: &Value) -> Result<Value> {
        let plain = match value {
            Value::String(s) => s.clone(),
            Value::Array(items) => items
                .iter()
                .map(|v| v.as_str().map(str::to_string))
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| eyre!("text codec takes strings"))?
                .join(&LIST_SEP.to_string()),
            other => crate::defs::text_of(other),
        };

        Ok(Value::String(self.encode_bytes(plain.as_bytes())))
    }

    pub fn decode(&self, value: &Value) -> Result<Value> {
        let text = value
            .as_str()
            .ok_or_else(|| eyre!("text codec decodes strings"))?;
        let bytes = self.decode_bytes(text)?;
        let plain = String::from_utf8(bytes)?;

        if plain.contains(LIST_SEP) {
            Ok(Value::from(
                plain.split(LIST_SEP).map(str::to_string).collect::<Vec<_>>(),
            ))
        } else {
            Ok(Value::String(plain))
        }
    }

    fn encode_bytes(&self, bytes: &[u8]) -> String {
        let mut out = String::with_capacity(bytes.len().div_ceil(3) * 4);
        for chunk in bytes.chunks(3) {
            let b0 = chunk[0] as u32;
            let b1 = chunk.get(1).copied().unwrap_or(0) as u32;
            let b2 = chunk.get(2).copied().unwrap_or(0) as u32;
            let n = (b0 << 16) | (b1 << 8) | b2;

            out.push(self.table[(n >> 18) as usize & 63]);
            out.push(self.table[(n >> 12) as usize & 63]);
            if chunk.len() > 1 {
                out.push(self.table[(n >> 6) as usize & 63]);
            }
            if chunk.len() > 2 {
                out.push(self.table[n as usize & 63]);
            }
        }
        out
    }

    fn decode_bytes(&self, text: &str) -> Result<Vec<u8>> {
        let mut indices = Vec::with_capacity(text.len());
        for c in text.chars() {
            let idx = self
                .table
                .iter()
                .position(|t| *t == c)
                .ok_or_else(|| eyre!("invalid text character {c:?}"))? as u32;
            indices.push(idx);
        }

        let mut out = Vec::with_capacity(indices.len() * 3 / 4);
        for chunk in indices.chunks(4) {
            match chunk.len() {
                4 => {
                    let n = (chunk[0] << 18) | (chunk[1] << 12) | (chunk[2] << 6) | chunk[3];
                    out.extend_from_slice(&[(n >> 16) as u8, (n >> 8) as u8, n as u8]);
                }
                3 => {
                    let n = (chunk[0] << 18) | (chunk[1] << 12) | (chunk[2] << 6);
                    out.extend_from_slice(&[(n >> 16) as u8, (n >> 8) as u8]);
                }
                2 => {
                    let n = (chunk[0] << 18) | (chunk[1] << 12);
                    out.push((n >> 16) as u8);
                }
                _ => bail!("truncated text data"),
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const DIGIT_ALPHABET: &str = "abcdefghijkmnpqrstuvwxyz123456789ACDEFGHJKLMNPQRSTUVWXYZ";
    const TEXT_ALPHABET: &str =
        "01234AaBbCcDdEeFfGgHhIiJjKkLlMmNnOoPpQqRrSsTtUuVvWwXxYyZz56789-_";

    #[test]
    fn digit_minimum_length_and_roundtrip() {
        let codec = DigitCodec::new(DIGIT_ALPHABET, "salty", 7);
        for n in [0i64, 5, 999, -3, i64::MIN + 1, i64::MAX] {
            let coded = codec.encode(&json!(n)).unwrap();
            let text = coded.as_str().unwrap();
            assert!(text.len() >= 7);
            assert_eq!(codec.decode(&coded).unwrap(), json!(n));
        }
    }

    #[test]
    fn digit_lists_roundtrip() {
        let codec = DigitCodec::new(DIGIT_ALPHABET, "salty", 7);
        let coded = codec.encode(&json!([7, 8, 9])).unwrap();
        assert_eq!(codec.decode(&coded).unwrap(), json!([7, 8, 9]));
    }

    #[test]
    fn different_salts_differ() {
        let a = DigitCodec::new(DIGIT_ALPHABET, "one", 7);
        let b = DigitCodec::new(DIGIT_ALPHABET, "two", 7);
        let ca = a.encode(&json!(12345)).unwrap();
        let cb = b.encode(&json!(12345)).unwrap();
        assert_ne!(ca, cb);
        assert!(b.decode(&ca).is_err() || b.decode(&ca).unwrap() != json!(12345));
    }

    #[test]
    fn text_roundtrip_all_lengths() {
        let codec = TextCodec::new(TEXT_ALPHABET, "salty");
        for s in ["", "a", "ab", "abc", "abcd", "hello world", "中文"] {
            let coded = codec.encode(&json!(s)).unwrap();
            assert_eq!(codec.decode(&coded).unwrap(), json!(s));
        }
    }

    #[test]
    fn text_output_is_url_safe() {
        let codec = TextCodec::new(TEXT_ALPHABET, "salty");
        let coded = codec.encode(&json!("{\"d\":\"x\",\"a\":true}")).unwrap();
        let text = coded.as_str().unwrap();
        assert!(text
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn text_lists_roundtrip() {
        let codec = TextCodec::new(TEXT_ALPHABET, "salty");
        let coded = codec.encode(&json!(["x", "y z"])).unwrap();
        assert_eq!(codec.decode(&coded).unwrap(), json!(["x", "y z"]));
    }
}
