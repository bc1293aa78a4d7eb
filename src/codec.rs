//! Wire codec: canonical JSON, raw-deflate compressed.
//!
//! The binary pair ([`serialize`]/[`deserialize`]) is used for handshake
//! payloads and data-channel frames; a preset dictionary shaped like a
//! typical payload materially improves the ratio on the small, highly
//! repetitive handshake descriptions. The same dictionary must be applied
//! on both ends of a given message type. The text pair
//! ([`stringify`]/[`parse`]) backs contexts that need a transport-native
//! text body, such as signaling frames.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Error, display_value};

/// Compression tuning for one message shape.
#[derive(Debug, Clone, Copy)]
pub struct WireOptions<'a> {
    /// Deflate level, 0..=9
    pub level: u32,
    /// Preset dictionary; both ends of a message type must agree on it
    pub dictionary: Option<&'a [u8]>,
}

impl Default for WireOptions<'_> {
    fn default() -> Self {
        Self {
            level: 1,
            dictionary: None,
        }
    }
}

/// Encode a value into a compressed binary payload.
///
/// `None` takes the fast path: a zero-length payload, no compression.
pub fn serialize<T: Serialize>(
    value: Option<&T>,
    options: Option<&WireOptions<'_>>,
) -> Result<Vec<u8>, Error> {
    let Some(value) = value else {
        return Ok(Vec::new());
    };

    let text = serde_json::to_string(value).map_err(|_| {
        Error::serialize(format!(
            "could not serialize a {} value",
            std::any::type_name::<T>()
        ))
    })?;

    let options = options.copied().unwrap_or_default();
    match deflate_raw(text.as_bytes(), options.level, options.dictionary) {
        Some(compressed) => Ok(compressed),
        None => Err(Error::serialize(format!(
            "could not compress {}",
            display_value(&text)
        ))),
    }
}

/// Decode a compressed binary payload back into a value.
///
/// A zero-length payload decodes to `None`, mirroring the serialize fast
/// path.
pub fn deserialize<T: DeserializeOwned>(
    bytes: &[u8],
    options: Option<&WireOptions<'_>>,
) -> Result<Option<T>, Error> {
    if bytes.is_empty() {
        return Ok(None);
    }

    let options = options.copied().unwrap_or_default();
    let Some(inflated) = inflate_raw(bytes, options.dictionary) else {
        return Err(Error::deserialize(format!(
            "could not decompress {} bytes of data",
            bytes.len()
        )));
    };

    let text = String::from_utf8(inflated)
        .map_err(|_| Error::deserialize("the decompressed data is not valid text"))?;

    match serde_json::from_str(&text) {
        Ok(value) => Ok(Some(value)),
        Err(_) => Err(Error::deserialize(format!(
            "could not parse {}",
            display_value(&text)
        ))),
    }
}

/// Encode a value as plain text. Same taxonomy as [`serialize`], no
/// compression.
pub fn stringify<T: Serialize>(value: &T) -> Result<String, Error> {
    serde_json::to_string(value).map_err(|_| {
        Error::serialize(format!(
            "could not encode a {} value as text",
            std::any::type_name::<T>()
        ))
    })
}

/// Decode plain text back into a value. Same taxonomy as [`deserialize`],
/// no decompression.
pub fn parse<T: DeserializeOwned>(text: &str) -> Result<T, Error> {
    serde_json::from_str(text)
        .map_err(|_| Error::deserialize(format!("could not parse {}", display_value(text))))
}

// The compression primitive reports failure as `None`; the callers above
// turn that into a tagged error.

fn deflate_raw(data: &[u8], level: u32, dictionary: Option<&[u8]>) -> Option<Vec<u8>> {
    let mut deflate = Compress::new(Compression::new(level.min(9)), false);
    if let Some(dictionary) = dictionary {
        deflate.set_dictionary(dictionary).ok()?;
    }

    let mut output = Vec::with_capacity(data.len() / 2 + 64);
    loop {
        let consumed = deflate.total_in() as usize;
        let produced = deflate.total_out();
        let status = deflate
            .compress_vec(&data[consumed..], &mut output, FlushCompress::Finish)
            .ok()?;
        match status {
            Status::StreamEnd => return Some(output),
            Status::Ok | Status::BufError => {
                if output.len() == output.capacity() {
                    output.reserve(output.capacity().max(64));
                } else if deflate.total_in() as usize == consumed && deflate.total_out() == produced
                {
                    // no forward progress and room to spare: give up
                    return None;
                }
            }
        }
    }
}

fn inflate_raw(data: &[u8], dictionary: Option<&[u8]>) -> Option<Vec<u8>> {
    let mut inflate = Decompress::new(false);
    if let Some(dictionary) = dictionary {
        inflate.set_dictionary(dictionary).ok()?;
    }

    let mut output = Vec::with_capacity(data.len().saturating_mul(4).max(64));
    loop {
        let consumed = inflate.total_in() as usize;
        let produced = inflate.total_out();
        let status = inflate
            .decompress_vec(&data[consumed..], &mut output, FlushDecompress::Finish)
            .ok()?;
        match status {
            Status::StreamEnd => return Some(output),
            Status::Ok | Status::BufError => {
                if output.len() == output.capacity() {
                    output.reserve(output.capacity().max(64));
                } else if inflate.total_in() as usize == consumed && inflate.total_out() == produced
                {
                    // truncated or corrupt stream
                    return None;
                }
            }
        }
    }
}
