//! Minimal contract ABI support: function selectors, argument encoding for
//! the static types plus `string`, and decoding of single-word returns.

use sha3::{Digest, Keccak256};

use crate::address::Address;

/// An ABI-encodable argument value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbiValue {
    Address(Address),
    /// Big-endian 256-bit unsigned integer.
    Uint([u8; 32]),
    Bool(bool),
    Bytes32([u8; 32]),
    String(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AbiError {
    #[error("invalid function signature '{0}'")]
    InvalidSignature(String),

    #[error("unsupported ABI type '{0}'")]
    UnsupportedType(String),

    #[error("{signature} takes {expected} argument(s), got {found}")]
    ArityMismatch {
        signature: String,
        expected: usize,
        found: usize,
    },

    #[error("argument {index} of {signature}: expected {expected}, got {found}")]
    TypeMismatch {
        signature: String,
        index: usize,
        expected: String,
        found: &'static str,
    },

    #[error("invalid {ty} literal '{value}'")]
    InvalidLiteral { ty: String, value: String },

    #[error("return data too short: {0} bytes")]
    ShortReturn(usize),
}

impl AbiValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Address(_) => "address",
            Self::Uint(_) => "uint256",
            Self::Bool(_) => "bool",
            Self::Bytes32(_) => "bytes32",
            Self::String(_) => "string",
        }
    }

    pub fn uint(value: u128) -> Self {
        Self::Uint(uint_word(value))
    }

    /// Parse a literal for the given ABI type (`address`, `uintN`, `bool`,
    /// `bytes32`, `string`).
    pub fn from_literal(ty: &str, raw: &str) -> Result<Self, AbiError> {
        let invalid = || AbiError::InvalidLiteral {
            ty: ty.to_string(),
            value: raw.to_string(),
        };
        match canonical_type(ty)? {
            "address" => raw.parse().map(Self::Address).map_err(|_| invalid()),
            "uint256" => parse_uint256(raw).map(Self::Uint).map_err(|_| invalid()),
            "bool" => match raw.trim() {
                "true" => Ok(Self::Bool(true)),
                "false" => Ok(Self::Bool(false)),
                _ => Err(invalid()),
            },
            "bytes32" => parse_bytes32(raw).map(Self::Bytes32).map_err(|_| invalid()),
            _ => Ok(Self::String(raw.to_string())),
        }
    }

    fn matches(&self, ty: &str) -> bool {
        matches!(
            (self, canonical_type(ty)),
            (Self::Address(_), Ok("address"))
                | (Self::Uint(_), Ok("uint256"))
                | (Self::Bool(_), Ok("bool"))
                | (Self::Bytes32(_), Ok("bytes32"))
                | (Self::String(_), Ok("string"))
        )
    }
}

/// Map a Solidity type name onto the subset this module encodes. Every
/// `uintN` shares the 256-bit word encoding.
pub fn canonical_type(ty: &str) -> Result<&'static str, AbiError> {
    let ty = ty.trim();
    match ty {
        "address" => Ok("address"),
        "bool" => Ok("bool"),
        "bytes32" => Ok("bytes32"),
        "string" => Ok("string"),
        "uint" => Ok("uint256"),
        _ => match ty.strip_prefix("uint").map(str::parse::<u16>) {
            Some(Ok(bits)) if bits % 8 == 0 && (8..=256).contains(&bits) => Ok("uint256"),
            _ => Err(AbiError::UnsupportedType(ty.to_string())),
        },
    }
}

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    Keccak256::digest(data).into()
}

/// First four bytes of the keccak-256 hash of the canonical signature.
pub fn selector(signature: &str) -> [u8; 4] {
    let canonical: String = signature.chars().filter(|c| !c.is_whitespace()).collect();
    let hash = keccak256(canonical.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Split `name(t1,t2)` into its parameter types.
pub fn param_types(signature: &str) -> Result<Vec<String>, AbiError> {
    let invalid = || AbiError::InvalidSignature(signature.to_string());
    let open = signature.find('(').ok_or_else(invalid)?;
    let inner = signature[open + 1..].strip_suffix(')').ok_or_else(invalid)?;
    if open == 0 || inner.contains('(') {
        return Err(invalid());
    }
    if inner.trim().is_empty() {
        return Ok(Vec::new());
    }
    inner
        .split(',')
        .map(|t| {
            let t = t.trim();
            canonical_type(t)?;
            Ok(t.to_string())
        })
        .collect()
}

/// Encode a call: selector followed by the checked, encoded arguments.
pub fn encode_call(signature: &str, args: &[AbiValue]) -> Result<Vec<u8>, AbiError> {
    let types = param_types(signature)?;
    if types.len() != args.len() {
        return Err(AbiError::ArityMismatch {
            signature: signature.to_string(),
            expected: types.len(),
            found: args.len(),
        });
    }
    for (index, (ty, value)) in types.iter().zip(args).enumerate() {
        if !value.matches(ty) {
            return Err(AbiError::TypeMismatch {
                signature: signature.to_string(),
                index,
                expected: ty.clone(),
                found: value.type_name(),
            });
        }
    }
    let mut data = selector(signature).to_vec();
    data.extend(encode(args));
    Ok(data)
}

/// Head/tail encoding of a value tuple.
pub fn encode(values: &[AbiValue]) -> Vec<u8> {
    let head_len = 32 * values.len();
    let mut head = Vec::with_capacity(head_len);
    let mut tail = Vec::new();

    for value in values {
        match value {
            AbiValue::String(s) => {
                head.extend_from_slice(&uint_word((head_len + tail.len()) as u128));
                tail.extend_from_slice(&uint_word(s.len() as u128));
                tail.extend_from_slice(s.as_bytes());
                let rem = s.len() % 32;
                if rem != 0 {
                    tail.resize(tail.len() + 32 - rem, 0);
                }
            }
            AbiValue::Address(addr) => {
                let mut word = [0u8; 32];
                word[12..].copy_from_slice(addr.as_bytes());
                head.extend_from_slice(&word);
            }
            AbiValue::Uint(word) | AbiValue::Bytes32(word) => head.extend_from_slice(word),
            AbiValue::Bool(b) => head.extend_from_slice(&uint_word(u128::from(*b))),
        }
    }

    head.extend(tail);
    head
}

pub fn uint_word(value: u128) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[16..].copy_from_slice(&value.to_be_bytes());
    word
}

/// Parse a decimal or `0x` hex literal into a 256-bit big-endian word.
pub fn parse_uint256(raw: &str) -> Result<[u8; 32], AbiError> {
    let invalid = || AbiError::InvalidLiteral {
        ty: "uint256".into(),
        value: raw.to_string(),
    };
    let cleaned: String = raw.trim().chars().filter(|c| *c != '_').collect();
    if cleaned.is_empty() {
        return Err(invalid());
    }

    if let Some(digits) = cleaned.strip_prefix("0x") {
        if digits.is_empty() || digits.len() > 64 {
            return Err(invalid());
        }
        let padded = format!("{digits:0>64}");
        let mut word = [0u8; 32];
        hex::decode_to_slice(padded, &mut word).map_err(|_| invalid())?;
        return Ok(word);
    }

    let mut word = [0u8; 32];
    for ch in cleaned.chars() {
        let mut carry = ch.to_digit(10).ok_or_else(invalid)?;
        for byte in word.iter_mut().rev() {
            let v = u32::from(*byte) * 10 + carry;
            *byte = (v & 0xff) as u8;
            carry = v >> 8;
        }
        if carry != 0 {
            return Err(invalid());
        }
    }
    Ok(word)
}

/// Parse exactly 32 bytes of `0x` hex.
pub fn parse_bytes32(raw: &str) -> Result<[u8; 32], AbiError> {
    let invalid = || AbiError::InvalidLiteral {
        ty: "bytes32".into(),
        value: raw.to_string(),
    };
    let digits = raw.trim().strip_prefix("0x").ok_or_else(invalid)?;
    if digits.len() != 64 {
        return Err(invalid());
    }
    let mut word = [0u8; 32];
    hex::decode_to_slice(digits, &mut word).map_err(|_| invalid())?;
    Ok(word)
}

pub fn first_word(data: &[u8]) -> Result<[u8; 32], AbiError> {
    if data.len() < 32 {
        return Err(AbiError::ShortReturn(data.len()));
    }
    let mut word = [0u8; 32];
    word.copy_from_slice(&data[..32]);
    Ok(word)
}

pub fn decode_bool(data: &[u8]) -> Result<bool, AbiError> {
    Ok(first_word(data)?.iter().any(|b| *b != 0))
}

pub fn decode_address(data: &[u8]) -> Result<Address, AbiError> {
    Ok(Address::from_word(&first_word(data)?))
}
