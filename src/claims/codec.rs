// src/claims/codec.rs
//! Claim Codec: credentials as fixed-width claim entries.
//!
//! A claim entry is eight field elements, an index quartet `i0..i3` and a
//! value quartet `v0..v3`. The Claims tree stores `H(i0..i3) → H(v0..v3)`.
//!
//! ```text
//! i0  header, little-endian bytes:
//!       [0..16)  schema hash
//!       [16]     flags: bits 0-2 subject position (0 self, 2 index, 3 value)
//!                       bit 3    expiration present
//!                       bits 5-7 merklized root position (0 none, 1 index, 2 value)
//!       [20..24) version (u32)
//! i1  subject id           (subject position = index)
//! i2  index data slot A    (merklized root when position = index)
//! i3  index data slot B
//! v0  [0..8) revocation nonce (u64), [8..16) expiration unix seconds (u64)
//! v1  subject id           (subject position = value)
//! v2  value data slot A    (merklized root when position = value)
//! v3  value data slot B
//! ```
//!
//! All unused bytes and slots are zero, and decoding rejects entries where
//! they are not, so `encode(decode(e)) == e` for every entry `decode` accepts.

use crate::claims::merklize::merklize;
use crate::models::credential::{CredentialSubject, ScalarValue};
use crate::models::did::Did;
use crate::models::schema::{AttributeType, Schema};
use crate::models::state::KeyType;
use crate::utils::crypto::{field_from_le_bytes, field_to_le_bytes, hash_data, poseidon_hashes, Hash};
use crate::wallet::{babyjubjub, key_management};
use ark_bn254::Fr;
use ark_ff::PrimeField;
use chrono::{DateTime, TimeZone, Utc};
use ethers_core::utils::hex;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// Schema hash of the issuer authentication claim.
pub const AUTH_SCHEMA_HASH: [u8; 16] = [
    0xca, 0x93, 0x88, 0x57, 0x24, 0x1d, 0xb9, 0x45, 0x1e, 0xa3, 0x29, 0x25, 0x6b, 0x9c, 0x06, 0xe5,
];

const FLAGS_BYTE: usize = 16;
const SUBJECT_MASK: u8 = 0b0000_0111;
const EXPIRATION_BIT: u8 = 0b0000_1000;
const MERKLIZED_SHIFT: u8 = 5;
const RESERVED_MASK: u8 = 0b0001_0000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("cannot parse claim: {0}")]
    ParseClaim(String),
    #[error("malformed claim entry: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimEntry {
    pub index: [Hash; 4],
    pub value: [Hash; 4],
}

impl ClaimEntry {
    /// Tree key.
    pub fn index_hash(&self) -> Hash {
        poseidon_hashes(&self.index)
    }

    /// Tree value.
    pub fn value_hash(&self) -> Hash {
        poseidon_hashes(&self.value)
    }

    /// `H(indexHash, valueHash)`, the message the issuer signs.
    pub fn signing_message(&self) -> Hash {
        poseidon_hashes(&[self.index_hash(), self.value_hash()])
    }

    pub fn to_hex(&self) -> String {
        let mut bytes = Vec::with_capacity(256);
        for slot in self.index.iter().chain(self.value.iter()) {
            bytes.extend_from_slice(&slot.0);
        }
        hex::encode(bytes)
    }

    pub fn from_hex(text: &str) -> Result<Self, CodecError> {
        let bytes = hex::decode(text.strip_prefix("0x").unwrap_or(text))
            .map_err(|e| CodecError::Malformed(e.to_string()))?;
        if bytes.len() != 256 {
            return Err(CodecError::Malformed(format!("expected 256 bytes, got {}", bytes.len())));
        }
        let mut slots = [Hash::ZERO; 8];
        for (slot, chunk) in slots.iter_mut().zip(bytes.chunks(32)) {
            let mut raw = [0u8; 32];
            raw.copy_from_slice(chunk);
            *slot = canonical(Hash(raw))?;
        }
        Ok(Self {
            index: [slots[0], slots[1], slots[2], slots[3]],
            value: [slots[4], slots[5], slots[6], slots[7]],
        })
    }
}

impl Serialize for ClaimEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ClaimEntry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        ClaimEntry::from_hex(&text).map_err(de::Error::custom)
    }
}

fn canonical(hash: Hash) -> Result<Hash, CodecError> {
    if Hash::from_field(hash.to_field()) != hash {
        return Err(CodecError::Malformed(format!("{} is not a field element", hash)));
    }
    Ok(hash)
}

/// Where the subject identifier lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubjectSlot {
    /// Self-claim; no subject.
    SelfSubject,
    Index(Hash),
    Value(Hash),
}

/// Where the merklized subject root lives (always the first data slot).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MerklizedSlot {
    #[default]
    None,
    Index,
    Value,
}

/// Decoded claim entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimFields {
    pub schema_hash: [u8; 16],
    pub subject: SubjectSlot,
    pub merklized: MerklizedSlot,
    pub version: u32,
    pub revocation_nonce: u64,
    /// Unix seconds.
    pub expiration: Option<u64>,
    pub index_data: [Hash; 2],
    pub value_data: [Hash; 2],
}

pub fn encode(fields: &ClaimFields) -> Result<ClaimEntry, CodecError> {
    for slot in fields.index_data.iter().chain(fields.value_data.iter()) {
        canonical(*slot)?;
    }

    let mut header = [0u8; 32];
    header[..16].copy_from_slice(&fields.schema_hash);
    let (subject_bits, index_subject, value_subject) = match fields.subject {
        SubjectSlot::SelfSubject => (0u8, Hash::ZERO, Hash::ZERO),
        SubjectSlot::Index(id) => (2, canonical(id)?, Hash::ZERO),
        SubjectSlot::Value(id) => (3, Hash::ZERO, canonical(id)?),
    };
    let merklized_bits: u8 = match fields.merklized {
        MerklizedSlot::None => 0,
        MerklizedSlot::Index => 1,
        MerklizedSlot::Value => 2,
    };
    let mut flags = subject_bits | (merklized_bits << MERKLIZED_SHIFT);
    if fields.expiration.is_some() {
        flags |= EXPIRATION_BIT;
    }
    header[FLAGS_BYTE] = flags;
    header[20..24].copy_from_slice(&fields.version.to_le_bytes());

    let mut v0 = [0u8; 32];
    v0[..8].copy_from_slice(&fields.revocation_nonce.to_le_bytes());
    v0[8..16].copy_from_slice(&fields.expiration.unwrap_or(0).to_le_bytes());

    Ok(ClaimEntry {
        index: [
            Hash::from_field(field_from_le_bytes(&header)),
            index_subject,
            fields.index_data[0],
            fields.index_data[1],
        ],
        value: [
            Hash::from_field(field_from_le_bytes(&v0)),
            value_subject,
            fields.value_data[0],
            fields.value_data[1],
        ],
    })
}

pub fn decode(entry: &ClaimEntry) -> Result<ClaimFields, CodecError> {
    let header = field_to_le_bytes(&entry.index[0].to_field());
    if header[17..20].iter().chain(header[24..].iter()).any(|b| *b != 0) {
        return Err(CodecError::Malformed("reserved header bytes are set".into()));
    }
    let flags = header[FLAGS_BYTE];
    if flags & RESERVED_MASK != 0 {
        return Err(CodecError::Malformed("reserved flag bit is set".into()));
    }

    let subject = match flags & SUBJECT_MASK {
        0 => SubjectSlot::SelfSubject,
        2 => SubjectSlot::Index(entry.index[1]),
        3 => SubjectSlot::Value(entry.value[1]),
        other => return Err(CodecError::Malformed(format!("unknown subject position {}", other))),
    };
    if !matches!(subject, SubjectSlot::Index(_)) && !entry.index[1].is_zero() {
        return Err(CodecError::Malformed("subject slot i1 set without index subject".into()));
    }
    if !matches!(subject, SubjectSlot::Value(_)) && !entry.value[1].is_zero() {
        return Err(CodecError::Malformed("subject slot v1 set without value subject".into()));
    }

    let merklized = match flags >> MERKLIZED_SHIFT {
        0 => MerklizedSlot::None,
        1 => MerklizedSlot::Index,
        2 => MerklizedSlot::Value,
        other => return Err(CodecError::Malformed(format!("unknown merklized position {}", other))),
    };

    let v0 = field_to_le_bytes(&entry.value[0].to_field());
    if v0[16..].iter().any(|b| *b != 0) {
        return Err(CodecError::Malformed("reserved bytes of v0 are set".into()));
    }
    let mut word = [0u8; 8];
    word.copy_from_slice(&v0[..8]);
    let revocation_nonce = u64::from_le_bytes(word);
    word.copy_from_slice(&v0[8..16]);
    let expiration_raw = u64::from_le_bytes(word);
    let expiration = if flags & EXPIRATION_BIT != 0 {
        Some(expiration_raw)
    } else if expiration_raw != 0 {
        return Err(CodecError::Malformed("expiration set without expiration flag".into()));
    } else {
        None
    };

    let mut schema_hash = [0u8; 16];
    schema_hash.copy_from_slice(&header[..16]);
    let mut version = [0u8; 4];
    version.copy_from_slice(&header[20..24]);

    Ok(ClaimFields {
        schema_hash,
        subject,
        merklized,
        version: u32::from_le_bytes(version),
        revocation_nonce,
        expiration,
        index_data: [entry.index[2], entry.index[3]],
        value_data: [entry.value[2], entry.value[3]],
    })
}

/// Last 16 bytes of `keccak256("<schemaUrl>#<credentialType>")`.
pub fn schema_hash(schema_url: &str, credential_type: &str) -> [u8; 16] {
    let digest = hash_data(format!("{}#{}", schema_url, credential_type).as_bytes());
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest[16..]);
    out
}

pub fn string_to_field(value: &str) -> Fr {
    Fr::from_be_bytes_mod_order(&hash_data(value.as_bytes()))
}

/// Field element of an attribute value. Negative integers map to their
/// field negation.
pub fn scalar_to_field(value: &ScalarValue) -> Fr {
    match value {
        ScalarValue::Int(i) if *i >= 0 => Fr::from(*i as u64),
        ScalarValue::Int(i) => -Fr::from(i.unsigned_abs()),
        ScalarValue::Bool(b) => Fr::from(*b as u64),
        ScalarValue::String(s) => string_to_field(s),
        ScalarValue::Bytes(b) => Fr::from_be_bytes_mod_order(&hash_data(b)),
    }
}

/// Checks `raw` against the schema and converts values to the schema types.
///
/// An `id` attribute, if present, must name the credential subject.
pub fn coerce_subject(schema: &Schema, subject: Option<&Did>, raw: &CredentialSubject) -> Result<CredentialSubject, CodecError> {
    let mut coerced = CredentialSubject::new();
    for (name, value) in raw {
        if name == "id" {
            match (subject, value) {
                (Some(did), ScalarValue::String(text)) if text == did.as_str() => continue,
                _ => return Err(CodecError::ParseClaim("attribute 'id' does not match the credential subject".into())),
            }
        }
        let expected = schema
            .attributes
            .get(name)
            .ok_or_else(|| CodecError::ParseClaim(format!("attribute '{}' is not in schema {}", name, schema.url)))?;
        let value = match (expected, value) {
            (AttributeType::String, ScalarValue::String(_))
            | (AttributeType::Integer | AttributeType::Number, ScalarValue::Int(_))
            | (AttributeType::Boolean, ScalarValue::Bool(_))
            | (AttributeType::Bytes, ScalarValue::Bytes(_)) => value.clone(),
            (AttributeType::Bytes, ScalarValue::String(text)) => ScalarValue::Bytes(
                base64::decode(text)
                    .map_err(|e| CodecError::ParseClaim(format!("attribute '{}' is not base64: {}", name, e)))?,
            ),
            (expected, _) => {
                return Err(CodecError::ParseClaim(format!("attribute '{}' expects {:?}", name, expected)));
            }
        };
        coerced.insert(name.clone(), value);
    }
    if let Some(missing) = schema.required.iter().find(|name| !coerced.contains_key(*name)) {
        return Err(CodecError::ParseClaim(format!("required attribute '{}' is missing", missing)));
    }
    Ok(coerced)
}

/// Slot for the subject of a non-self claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubjectPosition {
    #[default]
    Index,
    Value,
}

/// Slot for the merklized root when the schema is merklized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MerklizedPosition {
    #[default]
    Index,
    Value,
}

/// Logical inputs of one claim.
#[derive(Debug, Clone)]
pub struct ClaimRequest<'a> {
    pub schema: &'a Schema,
    pub credential_type: &'a str,
    /// `None` for a self-claim.
    pub subject: Option<&'a Did>,
    pub credential_subject: &'a CredentialSubject,
    pub revocation_nonce: u64,
    pub expiration: Option<DateTime<Utc>>,
    pub version: u32,
    pub subject_position: SubjectPosition,
    pub merklized_position: MerklizedPosition,
}

#[derive(Debug, Clone)]
pub struct EncodedClaim {
    pub entry: ClaimEntry,
    pub fields: ClaimFields,
    pub index_hash: Hash,
    pub value_hash: Hash,
    /// Subject after schema coercion.
    pub credential_subject: CredentialSubject,
}

fn data_slot(subject: &CredentialSubject, name: &Option<String>) -> Hash {
    name.as_ref()
        .and_then(|n| subject.get(n))
        .map(|v| Hash::from_field(scalar_to_field(v)))
        .unwrap_or(Hash::ZERO)
}

pub fn build_claim(request: &ClaimRequest<'_>) -> Result<EncodedClaim, CodecError> {
    let credential_subject = coerce_subject(request.schema, request.subject, request.credential_subject)?;

    let subject = match (request.subject, request.subject_position) {
        (None, _) => SubjectSlot::SelfSubject,
        (Some(did), SubjectPosition::Index) => SubjectSlot::Index(Hash::from_field(did.subject_id())),
        (Some(did), SubjectPosition::Value) => SubjectSlot::Value(Hash::from_field(did.subject_id())),
    };

    let (merklized, index_data, value_data) = match &request.schema.serialization {
        None => {
            let root = merklize(request.credential_type, &credential_subject)?;
            match request.merklized_position {
                MerklizedPosition::Index => (MerklizedSlot::Index, [root, Hash::ZERO], [Hash::ZERO; 2]),
                MerklizedPosition::Value => (MerklizedSlot::Value, [Hash::ZERO; 2], [root, Hash::ZERO]),
            }
        }
        Some(slots) => (
            MerklizedSlot::None,
            [data_slot(&credential_subject, &slots.index_data_slot_a), data_slot(&credential_subject, &slots.index_data_slot_b)],
            [data_slot(&credential_subject, &slots.value_data_slot_a), data_slot(&credential_subject, &slots.value_data_slot_b)],
        ),
    };

    let expiration = match request.expiration {
        Some(at) => Some(
            u64::try_from(at.timestamp())
                .map_err(|_| CodecError::ParseClaim("expiration precedes the unix epoch".into()))?,
        ),
        None => None,
    };

    let fields = ClaimFields {
        schema_hash: schema_hash(&request.schema.url, request.credential_type),
        subject,
        merklized,
        version: request.version,
        revocation_nonce: request.revocation_nonce,
        expiration,
        index_data,
        value_data,
    };
    let entry = encode(&fields)?;
    Ok(EncodedClaim {
        index_hash: entry.index_hash(),
        value_hash: entry.value_hash(),
        entry,
        fields,
        credential_subject,
    })
}

/// Credential metadata recovered from a stored entry and its off-chain subject.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconstructedClaim {
    pub fields: ClaimFields,
    pub credential_subject: CredentialSubject,
    pub expiration: Option<DateTime<Utc>>,
}

/// Rebuilds credential metadata from `entry` plus the auxiliary data kept
/// off-chain. The auxiliary data must re-encode to exactly `entry`.
pub fn reconstruct(
    entry: &ClaimEntry,
    schema: &Schema,
    credential_type: &str,
    subject: Option<&Did>,
    credential_subject: &CredentialSubject,
) -> Result<ReconstructedClaim, CodecError> {
    let fields = decode(entry)?;
    let expiration = match fields.expiration {
        Some(secs) => Some(
            i64::try_from(secs)
                .ok()
                .and_then(|s| Utc.timestamp_opt(s, 0).single())
                .ok_or_else(|| CodecError::Malformed(format!("expiration {} out of range", secs)))?,
        ),
        None => None,
    };
    let request = ClaimRequest {
        schema,
        credential_type,
        subject,
        credential_subject,
        revocation_nonce: fields.revocation_nonce,
        expiration,
        version: fields.version,
        subject_position: match fields.subject {
            SubjectSlot::Value(_) => SubjectPosition::Value,
            _ => SubjectPosition::Index,
        },
        merklized_position: match fields.merklized {
            MerklizedSlot::Value => MerklizedPosition::Value,
            _ => MerklizedPosition::Index,
        },
    };
    let rebuilt = build_claim(&request)?;
    if &rebuilt.entry != entry {
        return Err(CodecError::ParseClaim("auxiliary data does not match the claim entry".into()));
    }
    Ok(ReconstructedClaim { fields, credential_subject: rebuilt.credential_subject, expiration })
}

/// Authentication claim binding the issuer's public key.
pub fn auth_claim(key_type: KeyType, public_key: &[u8], revocation_nonce: u64) -> Result<ClaimEntry, CodecError> {
    let index_data = match key_type {
        KeyType::BabyJubJub => {
            let (x, y) = babyjubjub::public_key_coordinates(public_key)
                .map_err(|e| CodecError::ParseClaim(e.to_string()))?;
            [Hash::from_field(x), Hash::from_field(y)]
        }
        KeyType::Ethereum => {
            let address = key_management::ethereum_address(public_key)
                .map_err(|e| CodecError::ParseClaim(e.to_string()))?;
            [Hash::from_field(Fr::from_be_bytes_mod_order(&address)), Hash::ZERO]
        }
    };
    encode(&ClaimFields {
        schema_hash: AUTH_SCHEMA_HASH,
        subject: SubjectSlot::SelfSubject,
        merklized: MerklizedSlot::None,
        version: 0,
        revocation_nonce,
        expiration: None,
        index_data,
        value_data: [Hash::ZERO; 2],
    })
}
