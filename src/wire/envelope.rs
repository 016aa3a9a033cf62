use crate::core::{ProxyError, Result};
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::io::{Read, Write};
use std::sync::OnceLock;

pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CompressionMode {
    None,
    #[default]
    BestSpeed,
    Default,
    BestCompression,
}

impl CompressionMode {
    fn level(&self) -> Option<Compression> {
        match self {
            Self::None => None,
            Self::BestSpeed => Some(Compression::fast()),
            Self::Default => Some(Compression::default()),
            Self::BestCompression => Some(Compression::best()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionSettings {
    pub mode: CompressionMode,
    /// Serialized payloads at least this large are compressed.
    pub threshold: usize,
}

impl CompressionSettings {
    pub fn new(mode: CompressionMode, threshold: usize) -> Self {
        Self { mode, threshold }
    }

    pub fn disabled() -> Self {
        Self::new(CompressionMode::None, usize::MAX)
    }
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self::new(CompressionMode::default(), DEFAULT_COMPRESSION_THRESHOLD)
    }
}

/// A serialized, optionally zlib-compressed value.
///
/// The decoded value is cached: `unwrap` inflates and deserializes at most
/// once per envelope instance.
pub struct Envelope<T> {
    compressed: bool,
    payload: Vec<u8>,
    cache: OnceLock<T>,
}

impl<T> Envelope<T> {
    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    /// Size of the payload as carried on the wire.
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }
}

impl<T: Serialize + DeserializeOwned> Envelope<T> {
    pub fn wrap(value: T, settings: &CompressionSettings) -> Result<Self> {
        let raw = rmp_serde::to_vec_named(&value)?;

        let (compressed, payload) = match settings.mode.level() {
            Some(level) if raw.len() >= settings.threshold => {
                let mut encoder = ZlibEncoder::new(Vec::with_capacity(raw.len() / 2), level);
                encoder.write_all(&raw)?;
                (true, encoder.finish()?)
            }
            _ => (false, raw),
        };

        let cache = OnceLock::new();
        let _ = cache.set(value);
        Ok(Self {
            compressed,
            payload,
            cache,
        })
    }

    pub fn unwrap(&self) -> Result<&T> {
        if let Some(value) = self.cache.get() {
            return Ok(value);
        }
        let value = self.decode()?;
        Ok(self.cache.get_or_init(|| value))
    }

    pub fn into_inner(self) -> Result<T> {
        if let Some(value) = self.cache.into_inner() {
            return Ok(value);
        }
        decode_payload(self.compressed, &self.payload)
    }

    fn decode(&self) -> Result<T> {
        decode_payload(self.compressed, &self.payload)
    }
}

fn decode_payload<T: DeserializeOwned>(compressed: bool, payload: &[u8]) -> Result<T> {
    if !compressed {
        return Ok(rmp_serde::from_slice(payload)?);
    }
    let mut raw = Vec::with_capacity(payload.len() * 2);
    ZlibDecoder::new(payload)
        .read_to_end(&mut raw)
        .map_err(|e| ProxyError::Codec(format!("inflate failed: {}", e)))?;
    Ok(rmp_serde::from_slice(&raw)?)
}

impl<T: Clone> Clone for Envelope<T> {
    fn clone(&self) -> Self {
        Self {
            compressed: self.compressed,
            payload: self.payload.clone(),
            cache: self.cache.clone(),
        }
    }
}

impl<T> fmt::Debug for Envelope<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("compressed", &self.compressed)
            .field("payload_len", &self.payload.len())
            .field("cached", &self.cache.get().is_some())
            .finish()
    }
}

#[derive(Serialize)]
struct RawEnvelopeRef<'a> {
    compressed: bool,
    #[serde(serialize_with = "serialize_bytes")]
    payload: &'a [u8],
}

#[derive(Deserialize)]
struct RawEnvelope {
    compressed: bool,
    #[serde(deserialize_with = "deserialize_bytes")]
    payload: Vec<u8>,
}

impl<T> Serialize for Envelope<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        RawEnvelopeRef {
            compressed: self.compressed,
            payload: &self.payload,
        }
        .serialize(serializer)
    }
}

impl<'de, T> Deserialize<'de> for Envelope<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = RawEnvelope::deserialize(deserializer)?;
        Ok(Self {
            compressed: raw.compressed,
            payload: raw.payload,
            cache: OnceLock::new(),
        })
    }
}

fn serialize_bytes<S: Serializer>(bytes: &&[u8], serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_bytes(bytes)
}

fn deserialize_bytes<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<u8>, D::Error> {
    struct BytesVisitor;

    impl<'de> serde::de::Visitor<'de> for BytesVisitor {
        type Value = Vec<u8>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a byte payload")
        }

        fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> std::result::Result<Vec<u8>, E> {
            Ok(v.to_vec())
        }

        fn visit_byte_buf<E: serde::de::Error>(self, v: Vec<u8>) -> std::result::Result<Vec<u8>, E> {
            Ok(v)
        }

        fn visit_seq<A: serde::de::SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Vec<u8>, A::Error> {
            let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
            while let Some(byte) = seq.next_element::<u8>()? {
                out.push(byte);
            }
            Ok(out)
        }
    }

    deserializer.deserialize_byte_buf(BytesVisitor)
}
