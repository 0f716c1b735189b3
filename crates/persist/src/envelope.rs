use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::io::{Read, Write};

/// Current envelope layout version.
pub const ENVELOPE_SCHEMA_VERSION: u32 = 1;

/// zstd frame magic number, used to tell the two codecs apart.
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// Errors from encoding or decoding a persistence envelope.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("CBOR serialization error: {0}")]
    CborEncode(String),
    #[error("CBOR deserialization error: {0}")]
    CborDecode(String),
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("envelope schema mismatch: record has v{found}, expected v{expected}")]
    SchemaMismatch { found: u32, expected: u32 },
}

/// The durable record for one persisted partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub schema: u32,
    pub storage_key: String,
    /// Partition state version, compared against the configured version on
    /// rehydration.
    pub version: i64,
    pub state: Value,
    /// SHA-256 over the canonical JSON encoding of `state`.
    pub checksum: String,
}

impl Envelope {
    /// Wrap a partition state, computing its checksum.
    pub fn new(storage_key: impl Into<String>, version: i64, state: Value) -> Self {
        let checksum = state_checksum(&state);
        Self {
            schema: ENVELOPE_SCHEMA_VERSION,
            storage_key: storage_key.into(),
            version,
            state,
            checksum,
        }
    }

    /// Recompute the checksum and compare it with the stored one.
    pub fn verify(&self) -> Result<(), EnvelopeError> {
        if self.schema != ENVELOPE_SCHEMA_VERSION {
            return Err(EnvelopeError::SchemaMismatch {
                found: self.schema,
                expected: ENVELOPE_SCHEMA_VERSION,
            });
        }
        let actual = state_checksum(&self.state);
        if actual != self.checksum {
            return Err(EnvelopeError::ChecksumMismatch {
                expected: self.checksum.clone(),
                actual,
            });
        }
        Ok(())
    }
}

/// Byte encoding of envelopes in the storage backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Codec {
    /// Plain JSON, readable with any text tool.
    #[default]
    Json,
    /// CBOR compressed with zstd.
    CompressedCbor,
}

impl Codec {
    pub fn encode(self, envelope: &Envelope) -> Result<Vec<u8>, EnvelopeError> {
        match self {
            Self::Json => Ok(serde_json::to_vec(envelope)?),
            Self::CompressedCbor => zstd_compress(&cbor_serialize(envelope)?),
        }
    }

    /// Decode and verify an envelope.
    pub fn decode(self, bytes: &[u8]) -> Result<Envelope, EnvelopeError> {
        let envelope: Envelope = match self {
            Self::Json => serde_json::from_slice(bytes)?,
            Self::CompressedCbor => cbor_deserialize(&zstd_decompress(bytes)?)?,
        };
        envelope.verify()?;
        Ok(envelope)
    }

    /// Guess the codec that produced `bytes`.
    pub fn detect(bytes: &[u8]) -> Self {
        if bytes.starts_with(&ZSTD_MAGIC) {
            Self::CompressedCbor
        } else {
            Self::Json
        }
    }
}

fn state_checksum(state: &Value) -> String {
    // serde_json objects are BTreeMap-backed, so the encoding is canonical.
    // Floats re-encode to the same digits only with `float_roundtrip` parsing.
    let bytes = serde_json::to_vec(state).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    format!("{:x}", hasher.finalize())
}

fn cbor_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, EnvelopeError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| EnvelopeError::CborEncode(e.to_string()))?;
    Ok(buf)
}

fn cbor_deserialize<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, EnvelopeError> {
    ciborium::from_reader(data).map_err(|e| EnvelopeError::CborDecode(e.to_string()))
}

fn zstd_compress(data: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    let mut encoder = zstd::Encoder::new(Vec::new(), 3)?;
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn zstd_decompress(data: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    let mut decoder = zstd::Decoder::new(data)?;
    let mut buf = Vec::new();
    decoder.read_to_end(&mut buf)?;
    Ok(buf)
}
