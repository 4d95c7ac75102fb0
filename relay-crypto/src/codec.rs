//! Wire-frame encode/decode.
//!
//! A frame is either a websocket *text* frame (always plain JSON) or a
//! websocket *binary* frame. Binary frames come in two shapes:
//!
//! * an unencrypted frame: a single format byte followed by the payload for
//!   that format ([`FrameFormat::Json`], [`FrameFormat::BinaryUploadChunk`],
//!   [`FrameFormat::CompressedJson`]);
//! * an encrypted envelope: the envelope version byte, a 24-byte nonce, the
//!   format byte of the *decrypted* payload, then the ciphertext.
//!
//! Authenticated connections that predate the binary envelope may instead
//! send a JSON object with `{"type":"encrypted","nonce":...,"ciphertext":...}`
//! over a text frame; [`decode_legacy_encrypted_envelope`] recognizes that
//! shape.

use std::io::{Read, Write};

use relay_types::api::{ENVELOPE_VERSION, FrameFormat, message::UploadChunkHeader};
use serde::{Deserialize, Serialize};

/// Errors produced while decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The binary frame was shorter than any known layout requires.
    #[error("frame too short")]
    FrameTooShort,
    /// The format byte did not match any known [`FrameFormat`].
    #[error("unknown frame format byte {0:#04x}")]
    UnknownFormat(u8),
    /// The envelope version byte did not match [`ENVELOPE_VERSION`].
    #[error("unknown envelope version {0:#04x}")]
    UnknownVersion(u8),
    /// The upload-chunk header could not be parsed.
    #[error("malformed upload-chunk header")]
    MalformedUploadHeader,
    /// JSON decoding failed.
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    /// Gzip decompression failed.
    #[error("gzip decompression failed: {0}")]
    Gzip(#[from] std::io::Error),
}

/// A decoded, not-yet-authenticated-or-decrypted frame.
#[derive(Debug)]
pub enum DecodedFrame {
    /// A plain JSON payload, from a text frame or an unencrypted `Json`
    /// binary frame.
    Json(serde_json::Value),
    /// An upload chunk sent as a raw binary frame rather than as JSON.
    UploadChunk {
        /// The parsed header.
        header: UploadChunkHeader,
        /// The chunk bytes that followed the header.
        bytes: Vec<u8>,
    },
    /// An unencrypted gzip-compressed JSON payload, already decompressed.
    CompressedJson(serde_json::Value),
    /// An encrypted binary envelope; the caller must decrypt it with the
    /// connection's session key before it can be interpreted.
    EncryptedEnvelope {
        /// The nonce used to encrypt the payload.
        nonce: [u8; 24],
        /// The raw ciphertext; decrypting it yields a format byte followed
        /// by a payload in that format.
        ciphertext: Vec<u8>,
    },
    /// The legacy JSON-shaped encrypted envelope.
    LegacyEncryptedEnvelope {
        /// The nonce used to encrypt the payload, base64-decoded.
        nonce: [u8; 24],
        /// The raw ciphertext, base64-decoded.
        ciphertext: Vec<u8>,
    },
}

/// Decodes a websocket text frame.
pub fn decode_text_frame(text: &str) -> Result<DecodedFrame, CodecError> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    if let Some(frame) = try_decode_legacy_envelope(&value)? {
        return Ok(frame);
    }
    Ok(DecodedFrame::Json(value))
}

fn try_decode_legacy_envelope(
    value: &serde_json::Value,
) -> Result<Option<DecodedFrame>, CodecError> {
    use base64::Engine as _;

    let Some(obj) = value.as_object() else {
        return Ok(None);
    };
    if obj.get("type").and_then(|v| v.as_str()) != Some("encrypted") {
        return Ok(None);
    }
    let nonce_b64 = obj
        .get("nonce")
        .and_then(|v| v.as_str())
        .ok_or(CodecError::FrameTooShort)?;
    let ciphertext_b64 = obj
        .get("ciphertext")
        .and_then(|v| v.as_str())
        .ok_or(CodecError::FrameTooShort)?;
    let nonce_bytes = base64::engine::general_purpose::STANDARD
        .decode(nonce_b64)
        .map_err(|_| CodecError::FrameTooShort)?;
    let nonce: [u8; 24] = nonce_bytes
        .try_into()
        .map_err(|_| CodecError::FrameTooShort)?;
    let ciphertext = base64::engine::general_purpose::STANDARD
        .decode(ciphertext_b64)
        .map_err(|_| CodecError::FrameTooShort)?;
    Ok(Some(DecodedFrame::LegacyEncryptedEnvelope { nonce, ciphertext }))
}

/// Decodes a websocket binary frame.
pub fn decode_binary_frame(bytes: &[u8]) -> Result<DecodedFrame, CodecError> {
    let (&first, rest) = bytes.split_first().ok_or(CodecError::FrameTooShort)?;

    if first == ENVELOPE_VERSION && bytes.len() >= 1 + 24 {
        let nonce: [u8; 24] = rest[..24].try_into().expect("checked length above");
        let ciphertext = rest[24..].to_vec();
        return Ok(DecodedFrame::EncryptedEnvelope { nonce, ciphertext });
    }

    match FrameFormat::from_byte(first) {
        Some(FrameFormat::Json) => {
            let value = serde_json::from_slice(rest)?;
            Ok(DecodedFrame::Json(value))
        }
        Some(FrameFormat::BinaryUploadChunk) => {
            let (header, chunk) =
                UploadChunkHeader::decode(rest).ok_or(CodecError::MalformedUploadHeader)?;
            Ok(DecodedFrame::UploadChunk {
                header,
                bytes: chunk.to_vec(),
            })
        }
        Some(FrameFormat::CompressedJson) => {
            let value = decompress_json(rest)?;
            Ok(DecodedFrame::CompressedJson(value))
        }
        None => Err(CodecError::UnknownFormat(first)),
    }
}

/// Decodes the plaintext recovered from inside an encrypted envelope: a
/// format byte followed by a payload in that format (never another
/// encrypted envelope, never an upload chunk header — uploads are never
/// sent inside the encrypted binary envelope).
pub fn decode_decrypted_payload(bytes: &[u8]) -> Result<serde_json::Value, CodecError> {
    let (&first, rest) = bytes.split_first().ok_or(CodecError::FrameTooShort)?;
    match FrameFormat::from_byte(first) {
        Some(FrameFormat::Json) => Ok(serde_json::from_slice(rest)?),
        Some(FrameFormat::CompressedJson) => decompress_json(rest),
        Some(FrameFormat::BinaryUploadChunk) | None => Err(CodecError::UnknownFormat(first)),
    }
}

fn decompress_json(bytes: &[u8]) -> Result<serde_json::Value, CodecError> {
    let mut decoder = flate2::read::GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(serde_json::from_slice(&out)?)
}

fn compress_json(value: &serde_json::Value) -> std::io::Result<Vec<u8>> {
    let json = serde_json::to_vec(value).expect("value is always serializable");
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(&json)?;
    encoder.finish()
}

/// Encodes a JSON value as a plain (unencrypted) binary frame payload.
pub fn encode_json_frame(value: &serde_json::Value) -> Vec<u8> {
    let mut buf = vec![FrameFormat::Json.as_byte()];
    serde_json::to_writer(&mut buf, value).expect("value is always serializable");
    buf
}

/// Encodes a JSON value as a gzip-compressed binary frame payload.
pub fn encode_compressed_json_frame(value: &serde_json::Value) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![FrameFormat::CompressedJson.as_byte()];
    buf.extend(compress_json(value)?);
    Ok(buf)
}

/// Encodes an upload chunk as a raw binary frame payload.
pub fn encode_upload_chunk_frame(header: UploadChunkHeader, chunk: &[u8]) -> Vec<u8> {
    let mut buf = vec![FrameFormat::BinaryUploadChunk.as_byte()];
    buf.extend(header.encode());
    buf.extend_from_slice(chunk);
    buf
}

/// Encodes an encrypted binary envelope: version byte, nonce, ciphertext
/// (the ciphertext already contains the inner format byte, encrypted).
pub fn encode_encrypted_envelope(nonce: &[u8; 24], ciphertext: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + 24 + ciphertext.len());
    buf.push(ENVELOPE_VERSION);
    buf.extend_from_slice(nonce);
    buf.extend_from_slice(ciphertext);
    buf
}

/// Encodes a plaintext payload for placement inside an encrypted envelope:
/// a format byte followed by the JSON bytes.
pub fn encode_inner_json(value: &serde_json::Value) -> Vec<u8> {
    let mut buf = vec![FrameFormat::Json.as_byte()];
    serde_json::to_writer(&mut buf, value).expect("value is always serializable");
    buf
}

/// A self-describing wrapper used when serializing the legacy JSON-shaped
/// encrypted envelope.
#[derive(Serialize, Deserialize)]
struct LegacyEnvelope<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    nonce: String,
    ciphertext: String,
}

/// Encodes the legacy JSON-shaped encrypted envelope.
pub fn encode_legacy_encrypted_envelope(nonce: &[u8; 24], ciphertext: &[u8]) -> String {
    use base64::Engine as _;
    let envelope = LegacyEnvelope {
        kind: "encrypted",
        nonce: base64::engine::general_purpose::STANDARD.encode(nonce),
        ciphertext: base64::engine::general_purpose::STANDARD.encode(ciphertext),
    };
    serde_json::to_string(&envelope).expect("envelope is always serializable")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_frame_round_trips() {
        let value = serde_json::json!({"type": "ping", "id": "abc"});
        let encoded = encode_json_frame(&value);
        let decoded = decode_binary_frame(&encoded).unwrap();
        match decoded {
            DecodedFrame::Json(v) => assert_eq!(v, value),
            other => panic!("unexpected decode result: {other:?}"),
        }
    }

    #[test]
    fn compressed_json_frame_round_trips() {
        let value = serde_json::json!({"type": "event", "payload": "x".repeat(200)});
        let encoded = encode_compressed_json_frame(&value).unwrap();
        let decoded = decode_binary_frame(&encoded).unwrap();
        match decoded {
            DecodedFrame::CompressedJson(v) => assert_eq!(v, value),
            other => panic!("unexpected decode result: {other:?}"),
        }
    }

    #[test]
    fn upload_chunk_frame_round_trips() {
        let header = UploadChunkHeader {
            upload_id: uuid::Uuid::new_v4(),
            offset: 4096,
        };
        let chunk = vec![7u8; 32];
        let encoded = encode_upload_chunk_frame(header, &chunk);
        let decoded = decode_binary_frame(&encoded).unwrap();
        match decoded {
            DecodedFrame::UploadChunk { header: h, bytes } => {
                assert_eq!(h, header);
                assert_eq!(bytes, chunk);
            }
            other => panic!("unexpected decode result: {other:?}"),
        }
    }

    #[test]
    fn unknown_format_byte_is_rejected() {
        let err = decode_binary_frame(&[0xee, 1, 2, 3]).unwrap_err();
        assert!(matches!(err, CodecError::UnknownFormat(0xee)));
    }

    #[test]
    fn legacy_json_envelope_round_trips() {
        let nonce = [9u8; 24];
        let ciphertext = vec![1, 2, 3, 4];
        let text = encode_legacy_encrypted_envelope(&nonce, &ciphertext);
        let decoded = decode_text_frame(&text).unwrap();
        match decoded {
            DecodedFrame::LegacyEncryptedEnvelope {
                nonce: n,
                ciphertext: c,
            } => {
                assert_eq!(n, nonce);
                assert_eq!(c, ciphertext);
            }
            other => panic!("unexpected decode result: {other:?}"),
        }
    }
}
