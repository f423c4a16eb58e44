//! Lenient deserializers for the interpreter's JSON output, which emits words as short hex
//! strings (`"0x00"`) and registers as either numbers or hex strings.

use ethers::types::{H256, U256};
use serde::{de::Error, Deserialize, Deserializer};

#[derive(Deserialize)]
#[serde(untagged)]
enum Word {
    Num(u64),
    Str(String),
}

/// Parses a hex string of up to 32 bytes into a left-padded [H256].
pub fn parse_h256(raw: &str) -> Result<H256, String> {
    let digits = raw.strip_prefix("0x").unwrap_or(raw);
    if digits.len() > 64 {
        return Err(format!("word `{raw}` is longer than 32 bytes"));
    }
    let padded = format!("{digits:0>64}");
    let bytes = hex::decode(padded).map_err(|e| format!("word `{raw}`: {e}"))?;
    Ok(H256::from_slice(&bytes))
}

fn parse_u256(word: Word) -> Result<U256, String> {
    match word {
        Word::Num(n) => Ok(U256::from(n)),
        Word::Str(s) => match s.strip_prefix("0x") {
            Some(digits) if digits.is_empty() => Ok(U256::zero()),
            Some(digits) => U256::from_str_radix(digits, 16).map_err(|e| format!("`{s}`: {e}")),
            None => U256::from_dec_str(&s).map_err(|e| format!("`{s}`: {e}")),
        },
    }
}

pub fn h256<'de, D: Deserializer<'de>>(d: D) -> Result<H256, D::Error> {
    let raw = String::deserialize(d)?;
    parse_h256(&raw).map_err(D::Error::custom)
}

pub fn h256_vec<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<H256>, D::Error> {
    Vec::<String>::deserialize(d)?
        .iter()
        .map(|raw| parse_h256(raw))
        .collect::<Result<_, _>>()
        .map_err(D::Error::custom)
}

pub fn opt_h256_vec<'de, D: Deserializer<'de>>(
    d: D,
) -> Result<Option<Vec<H256>>, D::Error> {
    Option::<Vec<String>>::deserialize(d)?
        .map(|list| list.iter().map(|raw| parse_h256(raw)).collect())
        .transpose()
        .map_err(D::Error::custom)
}

pub fn opt_h256<'de, D: Deserializer<'de>>(d: D) -> Result<Option<H256>, D::Error> {
    Option::<String>::deserialize(d)?
        .map(|raw| parse_h256(&raw))
        .transpose()
        .map_err(D::Error::custom)
}

pub fn u256<'de, D: Deserializer<'de>>(d: D) -> Result<U256, D::Error> {
    parse_u256(Word::deserialize(d)?).map_err(D::Error::custom)
}

pub fn opt_u256<'de, D: Deserializer<'de>>(d: D) -> Result<Option<U256>, D::Error> {
    Option::<Word>::deserialize(d)?
        .map(parse_u256)
        .transpose()
        .map_err(D::Error::custom)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn short_words_are_left_padded() {
        assert_eq!(parse_h256("0x00").unwrap(), H256::zero());
        assert_eq!(parse_h256("0x1").unwrap(), H256::from_low_u64_be(1));
        assert_eq!(
            parse_h256(&format!("0x{}", "ff".repeat(32))).unwrap(),
            H256::repeat_byte(0xff)
        );
        assert!(parse_h256(&format!("0x{}", "f".repeat(65))).is_err());
        assert!(parse_h256("0xzz").is_err());
    }

    #[test]
    fn registers_accept_numbers_and_strings() {
        assert_eq!(parse_u256(Word::Num(7)).unwrap(), U256::from(7));
        assert_eq!(parse_u256(Word::Str("0x10".into())).unwrap(), U256::from(16));
        assert_eq!(parse_u256(Word::Str("0x".into())).unwrap(), U256::zero());
        assert_eq!(parse_u256(Word::Str("42".into())).unwrap(), U256::from(42));
    }
}
