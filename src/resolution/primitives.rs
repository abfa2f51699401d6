// the decode primitives, every one of these is a pure function over bytes so they can be chained in
// any order a provider needs. Text based ones fail with InvalidUtf8 instead of guessing an encoding.
use std::collections::HashMap;
use std::io::Read;

use cbc::cipher::{BlockDecryptMut, KeyIvInit, block_padding::Pkcs7};
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use chacha20::ChaCha20;
use chacha20::cipher::{StreamCipher, StreamCipherSeek};
use flate2::read::GzDecoder;
use serde::Deserialize;

use crate::resolution::error::{DecodeError, ResolutionError};

type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes192CbcDec = cbc::Decryptor<aes::Aes192>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const AES_BLOCK_SIZE: usize = 16;
const CHACHA_NONCE_LEN: usize = 12;

fn as_text(input: &[u8]) -> Result<&str, DecodeError> {
    std::str::from_utf8(input).map_err(|_| DecodeError::InvalidUtf8)
}

/// Base64 with re-padding. URL-safe input has `-` and `_` mapped back to `+` and `/`, standard input
/// rejects them. Whitespace is dropped since providers love wrapping long blobs.
pub fn base64_decode(input: &[u8], url_safe: bool) -> Result<Vec<u8>, DecodeError> {
    let mut normalized = Vec::with_capacity(input.len() + 3);
    for &byte in input {
        match byte {
            b' ' | b'\n' | b'\r' | b'\t' => continue,
            b'=' => continue,
            b'-' if url_safe => normalized.push(b'+'),
            b'_' if url_safe => normalized.push(b'/'),
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'+' | b'/' => normalized.push(byte),
            other => return Err(DecodeError::InvalidAlphabet(other as char)),
        }
    }

    if normalized.len() % 4 == 1 {
        return Err(DecodeError::Malformed(format!(
            "base64 length {} can't be padded to a 4 byte boundary",
            normalized.len()
        )));
    }
    while normalized.len() % 4 != 0 {
        normalized.push(b'=');
    }

    STANDARD.decode(&normalized).map_err(|e| match e {
        base64::DecodeError::InvalidByte(_, byte) => DecodeError::InvalidAlphabet(byte as char),
        other => DecodeError::Malformed(format!("base64: {}", other)),
    })
}

pub fn base64_encode(input: &[u8], url_safe: bool) -> String {
    if url_safe {
        URL_SAFE_NO_PAD.encode(input)
    } else {
        STANDARD.encode(input)
    }
}

/// Keeps base64-decoding while the output still looks like base64 text, up to `max_depth` layers.
/// At least one layer has to decode.
pub fn nested_base64(input: &[u8], max_depth: usize) -> Result<Vec<u8>, DecodeError> {
    let mut current = base64_decode(input, true)?;

    for _ in 1..max_depth.max(1) {
        if !looks_like_base64(&current) {
            break;
        }
        match base64_decode(&current, true) {
            Ok(next) => current = next,
            Err(_) => break,
        }
    }

    Ok(current)
}

fn looks_like_base64(candidate: &[u8]) -> bool {
    let trimmed: Vec<u8> = candidate
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();

    trimmed.len() >= 4
        && trimmed.len() % 4 != 1
        && trimmed
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'-' | b'_' | b'='))
}

/// XOR against a repeating key. Without `cycle` only the covered prefix is touched and the tail is
/// passed through as-is.
pub fn xor_keystream(input: &[u8], key: &[u8], cycle: bool) -> Result<Vec<u8>, DecodeError> {
    if key.is_empty() {
        return Err(DecodeError::KeyMismatch("empty keystream".to_string()));
    }

    Ok(input
        .iter()
        .enumerate()
        .map(|(i, byte)| {
            if cycle {
                byte ^ key[i % key.len()]
            } else if i < key.len() {
                byte ^ key[i]
            } else {
                *byte
            }
        })
        .collect())
}

/// Recovers a keystream from ciphertext and the plaintext prefix every response shares.
pub fn derive_keystream(ciphertext: &[u8], known_prefix: &[u8]) -> Result<Vec<u8>, DecodeError> {
    if known_prefix.is_empty() {
        return Err(DecodeError::KeyMismatch("empty known prefix".to_string()));
    }
    if ciphertext.len() < known_prefix.len() {
        return Err(DecodeError::Malformed(format!(
            "ciphertext ({} bytes) shorter than the known prefix ({} bytes)",
            ciphertext.len(),
            known_prefix.len()
        )));
    }

    Ok(ciphertext
        .iter()
        .zip(known_prefix.iter())
        .map(|(c, p)| c ^ p)
        .collect())
}

/// AES-CBC with PKCS#7. Key size picks the variant (128/192/256), a bad key or IV length is a
/// KeyMismatch while a bad unpad is PaddingInvalid.
pub fn aes_cbc_decrypt(input: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>, DecodeError> {
    if iv.len() != AES_BLOCK_SIZE {
        return Err(DecodeError::KeyMismatch(format!(
            "iv must be {} bytes, got {}",
            AES_BLOCK_SIZE,
            iv.len()
        )));
    }
    if input.is_empty() || input.len() % AES_BLOCK_SIZE != 0 {
        return Err(DecodeError::Malformed(format!(
            "ciphertext length {} is not a multiple of the block size",
            input.len()
        )));
    }

    let mut buffer = input.to_vec();
    let plaintext = match key.len() {
        16 => Aes128CbcDec::new_from_slices(key, iv)
            .map_err(|e| DecodeError::KeyMismatch(e.to_string()))?
            .decrypt_padded_mut::<Pkcs7>(&mut buffer)
            .map_err(|_| DecodeError::PaddingInvalid)?
            .to_vec(),
        24 => Aes192CbcDec::new_from_slices(key, iv)
            .map_err(|e| DecodeError::KeyMismatch(e.to_string()))?
            .decrypt_padded_mut::<Pkcs7>(&mut buffer)
            .map_err(|_| DecodeError::PaddingInvalid)?
            .to_vec(),
        32 => Aes256CbcDec::new_from_slices(key, iv)
            .map_err(|e| DecodeError::KeyMismatch(e.to_string()))?
            .decrypt_padded_mut::<Pkcs7>(&mut buffer)
            .map_err(|_| DecodeError::PaddingInvalid)?
            .to_vec(),
        other => {
            return Err(DecodeError::KeyMismatch(format!(
                "aes key must be 16, 24 or 32 bytes, got {}",
                other
            )));
        }
    };

    Ok(plaintext)
}

/// ChaCha20 where the first 12 bytes of the input are the nonce. `counter` is the starting block,
/// some players start at 1 instead of 0.
pub fn chacha20_decrypt(input: &[u8], key: &[u8], counter: u32) -> Result<Vec<u8>, DecodeError> {
    if key.len() != 32 {
        return Err(DecodeError::KeyMismatch(format!(
            "chacha20 key must be 32 bytes, got {}",
            key.len()
        )));
    }
    if input.len() < CHACHA_NONCE_LEN {
        return Err(DecodeError::Malformed(
            "input too short to contain a nonce".to_string(),
        ));
    }

    let (nonce, ciphertext) = input.split_at(CHACHA_NONCE_LEN);
    let mut cipher = ChaCha20::new(key.into(), nonce.into());
    cipher.seek(u64::from(counter) * 64);

    let mut buffer = ciphertext.to_vec();
    cipher.apply_keystream(&mut buffer);
    Ok(buffer)
}

/// 1:1 character remap, built from two equal length alphabets
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "AlphabetPair")]
pub struct SubstitutionMap(HashMap<char, char>);

#[derive(Debug, Clone, Deserialize)]
pub struct AlphabetPair {
    pub from: String,
    pub to: String,
}

impl TryFrom<AlphabetPair> for SubstitutionMap {
    type Error = String;

    fn try_from(pair: AlphabetPair) -> Result<Self, Self::Error> {
        Self::from_alphabets(&pair.from, &pair.to)
    }
}

impl SubstitutionMap {
    pub fn from_alphabets(from: &str, to: &str) -> Result<Self, String> {
        if from.chars().count() != to.chars().count() {
            return Err(format!(
                "substitution alphabets differ in length ({} vs {})",
                from.chars().count(),
                to.chars().count()
            ));
        }

        let mut map = HashMap::new();
        for (source, target) in from.chars().zip(to.chars()) {
            if map.insert(source, target).is_some() {
                return Err(format!("character {:?} mapped twice", source));
            }
        }
        Ok(Self(map))
    }

    /// inverse mapping, None when two sources share a target
    pub fn inverse(&self) -> Option<Self> {
        let mut inverse = HashMap::with_capacity(self.0.len());
        for (source, target) in &self.0 {
            if inverse.insert(*target, *source).is_some() {
                return None;
            }
        }
        Some(Self(inverse))
    }

    pub fn apply(&self, input: &str) -> String {
        input
            .chars()
            .map(|c| self.0.get(&c).copied().unwrap_or(c))
            .collect()
    }
}

pub fn char_substitution(input: &[u8], map: &SubstitutionMap) -> Result<Vec<u8>, DecodeError> {
    Ok(map.apply(as_text(input)?).into_bytes())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlphabetClass {
    Lower,
    Upper,
    Digit,
}

impl AlphabetClass {
    fn bounds(&self) -> (u32, u32) {
        match self {
            AlphabetClass::Lower => ('a' as u32, 26),
            AlphabetClass::Upper => ('A' as u32, 26),
            AlphabetClass::Digit => ('0' as u32, 10),
        }
    }

    fn contains(&self, c: char) -> bool {
        match self {
            AlphabetClass::Lower => c.is_ascii_lowercase(),
            AlphabetClass::Upper => c.is_ascii_uppercase(),
            AlphabetClass::Digit => c.is_ascii_digit(),
        }
    }
}

pub fn caesar_shift(input: &[u8], amount: i32, classes: &[AlphabetClass]) -> Result<Vec<u8>, DecodeError> {
    let shifted: String = as_text(input)?
        .chars()
        .map(|c| match classes.iter().find(|class| class.contains(c)) {
            Some(class) => {
                let (base, size) = class.bounds();
                let offset = (c as i64 - base as i64 + amount as i64).rem_euclid(size as i64);
                char::from_u32(base + offset as u32).unwrap_or(c)
            }
            None => c,
        })
        .collect();

    Ok(shifted.into_bytes())
}

/// Rotation over the 94 printable ASCII characters `!`..=`~`.
pub fn printable_rotate(input: &[u8], amount: i32) -> Result<Vec<u8>, DecodeError> {
    let rotated: String = as_text(input)?
        .chars()
        .map(|c| {
            let code = c as u32;
            if (33..=126).contains(&code) {
                let offset = (code as i64 - 33 + amount as i64).rem_euclid(94);
                char::from_u32(33 + offset as u32).unwrap_or(c)
            } else {
                c
            }
        })
        .collect();

    Ok(rotated.into_bytes())
}

/// Splits on `delimiter`, reads each entry as a numeral over `alphabet` (decimal when empty),
/// subtracts `char_offset`, optionally XORs with a repeating key, and joins the characters.
pub fn split_join_lookup(
    input: &[u8],
    delimiter: char,
    alphabet: &str,
    char_offset: i64,
    xor_key: Option<&[u8]>,
) -> Result<Vec<u8>, DecodeError> {
    let digits: Vec<char> = if alphabet.is_empty() {
        "0123456789".chars().collect()
    } else {
        alphabet.chars().collect()
    };
    if digits.len() < 2 {
        return Err(DecodeError::Malformed(
            "lookup alphabet needs at least two digits".to_string(),
        ));
    }
    let radix = digits.len() as i64;

    let mut output = String::new();
    for (index, entry) in as_text(input)?
        .split(delimiter)
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .enumerate()
    {
        let mut value: i64 = 0;
        for c in entry.chars() {
            let digit = digits
                .iter()
                .position(|d| *d == c)
                .ok_or(DecodeError::InvalidAlphabet(c))?;
            value = value
                .checked_mul(radix)
                .and_then(|v| v.checked_add(digit as i64))
                .ok_or_else(|| DecodeError::Malformed(format!("entry {:?} overflows", entry)))?;
        }

        let mut code = value - char_offset;
        if let Some(key) = xor_key.filter(|k| !k.is_empty()) {
            code ^= i64::from(key[index % key.len()]);
        }

        let c = u32::try_from(code)
            .ok()
            .and_then(char::from_u32)
            .ok_or_else(|| DecodeError::Malformed(format!("{} is not a character", code)))?;
        output.push(c);
    }

    Ok(output.into_bytes())
}

/// Longest prefix ending in `}` that parses as JSON. Anything after it is noise from a keystream that
/// ran out.
pub fn json_boundary_scan(input: &[u8]) -> Result<Vec<u8>, ResolutionError> {
    let mut end = input.len();

    while let Some(position) = input[..end].iter().rposition(|b| *b == b'}') {
        let candidate = &input[..=position];
        if serde_json::from_slice::<serde_json::Value>(candidate).is_ok() {
            return Ok(candidate.to_vec());
        }
        end = position;
    }

    Err(ResolutionError::validation(
        "no valid json prefix ending in '}'",
    ))
}

pub fn hex_decode(input: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let text = as_text(input)?.trim();
    hex::decode(text).map_err(|e| DecodeError::Malformed(format!("hex: {}", e)))
}

pub fn reverse(input: &[u8]) -> Result<Vec<u8>, DecodeError> {
    Ok(as_text(input)?.chars().rev().collect::<String>().into_bytes())
}

pub fn byte_shift(input: &[u8], amount: i16) -> Result<Vec<u8>, DecodeError> {
    Ok(input
        .iter()
        .map(|b| (i32::from(*b) + i32::from(amount)).rem_euclid(256) as u8)
        .collect())
}

pub fn strip_markers(input: &[u8], markers: &[String]) -> Result<Vec<u8>, DecodeError> {
    let stripped = markers
        .iter()
        .filter(|m| !m.is_empty())
        .fold(as_text(input)?.to_string(), |acc, m| acc.replace(m.as_str(), ""));
    Ok(stripped.into_bytes())
}

pub fn slice(input: &[u8], skip_prefix: usize, skip_suffix: usize) -> Result<Vec<u8>, DecodeError> {
    let chars: Vec<char> = as_text(input)?.chars().collect();
    let skipped = skip_prefix.checked_add(skip_suffix);
    if skipped.is_none_or(|skipped| skipped > chars.len()) {
        return Err(DecodeError::Malformed(format!(
            "can't skip {} + {} characters of a {} character input",
            skip_prefix,
            skip_suffix,
            chars.len()
        )));
    }

    Ok(chars[skip_prefix..chars.len() - skip_suffix]
        .iter()
        .collect::<String>()
        .into_bytes())
}

pub fn take_every(input: &[u8], step: usize, offset: usize) -> Result<Vec<u8>, DecodeError> {
    if step == 0 {
        return Err(DecodeError::Malformed("take_every step must be positive".to_string()));
    }

    Ok(as_text(input)?
        .chars()
        .skip(offset)
        .step_by(step)
        .collect::<String>()
        .into_bytes())
}

pub fn gzip_inflate(input: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let mut decoder = GzDecoder::new(input);
    let mut inflated = Vec::new();
    decoder
        .read_to_end(&mut inflated)
        .map_err(|e| DecodeError::Malformed(format!("gzip: {}", e)))?;
    Ok(inflated)
}
