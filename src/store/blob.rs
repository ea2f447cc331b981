//! Blob type - the unit of persisted state

use crate::model::Hash;
use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Type tag for blobs
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlobType {
    /// Collection metadata and other small records
    Meta,
    /// One non-empty Merkle node
    Nodes,
    /// One action log entry
    Log,
    /// One document payload
    Documents,
    /// One proof task
    Tasks,
    /// Rollup processor state and history
    Rollup,
    /// Local settlement chain
    Chain,
}

impl BlobType {
    pub fn as_byte(&self) -> u8 {
        match self {
            BlobType::Meta => 0,
            BlobType::Nodes => 1,
            BlobType::Log => 2,
            BlobType::Documents => 3,
            BlobType::Tasks => 4,
            BlobType::Rollup => 5,
            BlobType::Chain => 6,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(BlobType::Meta),
            1 => Some(BlobType::Nodes),
            2 => Some(BlobType::Log),
            3 => Some(BlobType::Documents),
            4 => Some(BlobType::Tasks),
            5 => Some(BlobType::Rollup),
            6 => Some(BlobType::Chain),
            _ => None,
        }
    }
}

/// A blob is a typed, compressed chunk of data
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Blob {
    /// Type of content
    pub blob_type: BlobType,
    /// Raw data (uncompressed)
    pub data: Vec<u8>,
}

impl Blob {
    /// Create a new blob
    pub fn new(blob_type: BlobType, data: Vec<u8>) -> Self {
        Blob { blob_type, data }
    }

    /// Serialize a value into a typed blob
    pub fn encode<T: Serialize>(blob_type: BlobType, value: &T) -> Result<Self> {
        Ok(Blob::new(blob_type, bincode::serialize(value)?))
    }

    /// Deserialize the payload, checking the type tag first
    pub fn decode<T: DeserializeOwned>(&self, expected: BlobType) -> Result<T> {
        if self.blob_type != expected {
            return Err(Error::Corruption(format!(
                "Expected {:?}, got {:?}",
                expected, self.blob_type
            )));
        }
        Ok(bincode::deserialize(&self.data)?)
    }

    /// Content hash, type included
    pub fn hash(&self) -> Hash {
        Hash::digest_many(&[&[self.blob_type.as_byte()], &self.data])
    }

    /// Compress the blob for storage
    pub fn compress(&self) -> Result<Vec<u8>> {
        let mut output = Vec::new();
        output.push(self.blob_type.as_byte());
        let compressed = zstd::encode_all(self.data.as_slice(), 3)?;
        output.extend(compressed);
        Ok(output)
    }

    /// Decompress a blob from storage
    pub fn decompress(data: &[u8]) -> Result<Self> {
        let (&tag, body) = data
            .split_first()
            .ok_or_else(|| Error::Corruption("Empty blob data".into()))?;

        let blob_type = BlobType::from_byte(tag)
            .ok_or_else(|| Error::Corruption(format!("Invalid blob type: {}", tag)))?;

        let decompressed = zstd::decode_all(body)?;

        Ok(Blob {
            blob_type,
            data: decompressed,
        })
    }
}
