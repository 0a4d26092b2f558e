//! Length-prefixed message framing.
//!
//! Every message travels as one frame:
//!
//! ```text
//! +----------------+---------------------------------------------+
//! | length: u32 BE | payload (`length` bytes)                    |
//! +----------------+---------------------------------------------+
//! ```
//!
//! The payload is written with bincode (big-endian, fixed-width integers):
//!
//! - `client_id`: string (u64 length + UTF-8 bytes)
//! - `type`: i32
//! - `message_id`: string, empty when unassigned
//! - `reply_message_id`: option tag (u8 0/1) followed by a string
//! - parameter count: u64, then per parameter `key` string, `tag` u8 and the value
//!   (`0` string, `1` bytes, `2` i64)
//!
//! Keys are free-form, so a peer adding a parameter does not break decoding of
//! the keys this side knows about. An unrecognized value tag does.
use std::{collections::BTreeMap, fmt};

use bincode::{
    Decode, Encode,
    config::{BigEndian, Configuration, Fixint},
    de::{Decoder, DecoderImpl, read::Reader, read::SliceReader},
    enc::Encoder,
    error::{DecodeError, EncodeError},
};

use crate::message::{Message, MessageType, Value};

use super::error::CodecError;

/// Size of the frame length prefix.
pub const LENGTH_PREFIX: usize = size_of::<u32>();

/// Default upper bound on a frame payload.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 32 * 1024 * 1024;

const TAG_STRING: u8 = 0;
const TAG_BYTES: u8 = 1;
const TAG_LONG: u8 = 2;

/// Converts messages to and from frames.
#[derive(Clone, Copy)]
pub struct FrameCodec {
    config: Configuration<BigEndian, Fixint>,
    max_frame_length: usize,
}

impl fmt::Debug for FrameCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameCodec")
            .field("max_frame_length", &self.max_frame_length)
            .finish_non_exhaustive()
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LENGTH)
    }
}

impl FrameCodec {
    pub fn new(max_frame_length: usize) -> Self {
        let config = bincode::config::standard()
            .with_big_endian()
            .with_fixed_int_encoding();
        Self {
            config,
            max_frame_length: max_frame_length.min(u32::MAX as usize),
        }
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }

    /// Encodes `message` into a complete frame, length prefix included.
    pub fn encode(&self, message: &Message) -> Result<Vec<u8>, CodecError> {
        if !message.kind().is_known() {
            return Err(CodecError::UnknownMessageType(message.kind().code()));
        }

        let payload = bincode::encode_to_vec(Payload(message), self.config)?;
        if payload.len() > self.max_frame_length {
            return Err(CodecError::FrameTooLarge {
                length: payload.len(),
                max: self.max_frame_length,
            });
        }

        let mut frame = Vec::with_capacity(LENGTH_PREFIX + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Decodes a single payload, without its length prefix.
    pub fn decode_payload(&self, payload: &[u8]) -> Result<Message, CodecError> {
        let mut decoder = DecoderImpl::new(SliceReader::new(payload), self.config, ());

        let client_id = decode_string(&mut decoder)?;
        let kind = MessageType::from_code(i32::decode(&mut decoder)?);
        if !kind.is_known() {
            return Err(CodecError::UnknownMessageType(kind.code()));
        }

        let message_id = decode_string(&mut decoder)?;
        let reply_message_id = match u8::decode(&mut decoder)? {
            0 => None,
            1 => Some(decode_string(&mut decoder)?),
            other => {
                return Err(DecodeError::OtherString(format!(
                    "invalid option tag {other} for reply message id"
                ))
                .into());
            }
        };

        let count = u64::decode(&mut decoder)?;
        let mut parameters = BTreeMap::new();
        for _ in 0..count {
            let key = decode_string(&mut decoder)?;
            let value = match u8::decode(&mut decoder)? {
                TAG_STRING => Value::String(decode_string(&mut decoder)?),
                TAG_BYTES => Value::Bytes(decode_bytes(&mut decoder)?),
                TAG_LONG => Value::Long(i64::decode(&mut decoder)?),
                tag => return Err(CodecError::UnknownValueTag { key, tag }),
            };
            parameters.insert(key, value);
        }

        if decoder.reader().peek_read(1).is_some() {
            return Err(CodecError::TrailingBytes);
        }

        let mut message = Message::new(client_id, kind, parameters);
        if !message_id.is_empty() {
            message.set_message_id(message_id);
        }
        if let Some(reply) = reply_message_id {
            message.set_reply_message_id(reply);
        }
        Ok(message)
    }
}

struct Payload<'a>(&'a Message);

impl Encode for Payload<'_> {
    fn encode<E: Encoder>(&self, encoder: &mut E) -> Result<(), EncodeError> {
        let message = self.0;
        message.client_id().encode(encoder)?;
        message.kind().code().encode(encoder)?;
        message.message_id().unwrap_or_default().encode(encoder)?;
        message.reply_message_id().encode(encoder)?;

        (message.parameters().len() as u64).encode(encoder)?;
        for (key, value) in message.parameters() {
            key.encode(encoder)?;
            match value {
                Value::String(s) => {
                    TAG_STRING.encode(encoder)?;
                    s.encode(encoder)?;
                }
                Value::Bytes(b) => {
                    TAG_BYTES.encode(encoder)?;
                    b.encode(encoder)?;
                }
                Value::Long(v) => {
                    TAG_LONG.encode(encoder)?;
                    v.encode(encoder)?;
                }
            }
        }
        Ok(())
    }
}

/// Reads a length-prefixed byte string, refusing lengths the remaining payload
/// cannot satisfy before allocating anything.
fn decode_bytes<D: Decoder>(decoder: &mut D) -> Result<Vec<u8>, DecodeError> {
    let len = u64::decode(decoder)?;
    let len = usize::try_from(len).map_err(|_| DecodeError::OutsideUsizeRange(len))?;
    let bytes = decoder
        .reader()
        .peek_read(len)
        .ok_or(DecodeError::UnexpectedEnd { additional: len })?
        .to_vec();
    decoder.reader().consume(len);
    Ok(bytes)
}

fn decode_string<D: Decoder>(decoder: &mut D) -> Result<String, DecodeError> {
    let bytes = decode_bytes(decoder)?;
    String::from_utf8(bytes).map_err(|e| DecodeError::Utf8 {
        inner: e.utf8_error(),
    })
}

/// Streaming frame decoder. Bytes are appended as they arrive from the socket and
/// complete messages are pulled out one at a time; a frame split across any number
/// of reads decodes the same as one delivered whole.
#[derive(Debug)]
pub struct FrameDecoder {
    codec: FrameCodec,
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new(codec: FrameCodec) -> Self {
        Self {
            codec,
            buffer: Vec::new(),
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Number of bytes waiting for the rest of their frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Returns the next complete message, or `None` when more bytes are needed.
    ///
    /// The declared length is checked against the maximum as soon as the prefix is
    /// available, so an oversized frame is rejected without buffering its body.
    pub fn decode_next(&mut self) -> Result<Option<Message>, CodecError> {
        let Some(prefix) = self.buffer.first_chunk::<LENGTH_PREFIX>() else {
            return Ok(None);
        };

        let length = u32::from_be_bytes(*prefix) as usize;
        if length > self.codec.max_frame_length() {
            return Err(CodecError::FrameTooLarge {
                length,
                max: self.codec.max_frame_length(),
            });
        }

        let end = LENGTH_PREFIX + length;
        if self.buffer.len() < end {
            return Ok(None);
        }

        let message = self.codec.decode_payload(&self.buffer[LENGTH_PREFIX..end])?;
        self.buffer.drain(..end);
        Ok(Some(message))
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    fn with_ids(mut message: Message, id: &str, reply: Option<&str>) -> Message {
        message.set_message_id(id);
        if let Some(reply) = reply {
            message.set_reply_message_id(reply);
        }
        message
    }

    fn factory_messages() -> Vec<Message> {
        vec![
            with_ids(Message::ack("clientA"), "1", Some("0")),
            with_ids(Message::fetch_entry("clientA", "k1"), "2", None),
            with_ids(
                Message::put_entry("clientA", "k1", vec![0, 1, 2, 255], -4),
                "3",
                Some("2"),
            ),
            with_ids(Message::unregister_entry("clientA", "k1"), "4", None),
            with_ids(
                Message::error("clientA", &io::Error::other("boom")),
                "5",
                Some("4"),
            ),
            with_ids(Message::client_connection_request("clientA", "pw"), "6", None),
            with_ids(Message::client_shutdown("clientA"), "7", None),
            with_ids(Message::invalidate("clientA", "k1"), "8", None),
            with_ids(Message::invalidate_by_prefix("clientA", "k"), "9", None),
        ]
    }

    fn decode_all(decoder: &mut FrameDecoder) -> Vec<Message> {
        let mut out = Vec::new();
        while let Some(msg) = decoder.decode_next().unwrap() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn factory_messages_survive_the_wire() {
        let codec = FrameCodec::default();
        let mut decoder = FrameDecoder::new(codec);

        for message in factory_messages() {
            let frame = codec.encode(&message).unwrap();
            decoder.extend(&frame);
            let decoded = decoder.decode_next().unwrap().unwrap();
            assert_eq!(decoded, message);
        }
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn unassigned_message_id_stays_unassigned() {
        let codec = FrameCodec::default();
        let frame = codec.encode(&Message::ack("c")).unwrap();
        let decoded = codec.decode_payload(&frame[LENGTH_PREFIX..]).unwrap();

        assert_eq!(decoded.message_id(), None);
        assert_eq!(decoded.reply_message_id(), None);
    }

    #[test]
    fn length_prefix_is_big_endian_payload_size() {
        let codec = FrameCodec::default();
        let frame = codec.encode(&Message::ack("c")).unwrap();
        let declared = u32::from_be_bytes(frame[..4].try_into().unwrap()) as usize;

        assert_eq!(declared, frame.len() - LENGTH_PREFIX);
    }

    #[test]
    fn split_frames_decode_like_whole_frames() {
        let codec = FrameCodec::default();
        let messages = factory_messages();
        let stream: Vec<u8> = messages
            .iter()
            .flat_map(|m| codec.encode(m).unwrap())
            .collect();

        let mut whole = FrameDecoder::new(codec);
        whole.extend(&stream);
        let expected = decode_all(&mut whole);
        assert_eq!(expected, messages);

        // three chunks at arbitrary boundaries, including inside the length prefix
        let cuts = [(1, 2), (3, 37), (5, stream.len() / 2)];
        for (a, b) in cuts {
            let mut split = FrameDecoder::new(codec);
            let mut out = Vec::new();
            for chunk in [&stream[..a], &stream[a..b], &stream[b..]] {
                split.extend(chunk);
                out.extend(decode_all(&mut split));
            }
            assert_eq!(out, expected);
        }
    }

    #[test]
    fn byte_at_a_time() {
        let codec = FrameCodec::default();
        let message = with_ids(Message::put_entry("c", "k", vec![9; 100], 1), "1", None);
        let frame = codec.encode(&message).unwrap();

        let mut decoder = FrameDecoder::new(codec);
        for (i, byte) in frame.iter().enumerate() {
            decoder.extend(std::slice::from_ref(byte));
            let res = decoder.decode_next().unwrap();
            if i + 1 < frame.len() {
                assert!(res.is_none());
            } else {
                assert_eq!(res, Some(message.clone()));
            }
        }
    }

    #[test]
    fn oversized_frame_rejected_from_prefix_alone() {
        let mut decoder = FrameDecoder::new(FrameCodec::new(1024));
        decoder.extend(&(u32::MAX).to_be_bytes());

        match decoder.decode_next() {
            Err(CodecError::FrameTooLarge { length, max }) => {
                assert_eq!(length, u32::MAX as usize);
                assert_eq!(max, 1024);
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn oversized_message_not_encoded() {
        let codec = FrameCodec::new(64);
        let message = Message::put_entry("c", "k", vec![0; 128], 0);

        assert!(matches!(
            codec.encode(&message),
            Err(CodecError::FrameTooLarge { max: 64, .. })
        ));
    }

    #[test]
    fn unknown_type_rejected_both_ways() {
        let codec = FrameCodec::default();
        let unknown = Message::new("c", MessageType::Unknown(77), BTreeMap::new());
        assert!(matches!(
            codec.encode(&unknown),
            Err(CodecError::UnknownMessageType(77))
        ));

        let mut frame = codec.encode(&Message::ack("c")).unwrap();
        // type follows the client id: 8 byte length + 1 byte of "c"
        let type_at = LENGTH_PREFIX + 8 + 1;
        frame[type_at..type_at + 4].copy_from_slice(&77i32.to_be_bytes());
        assert!(matches!(
            codec.decode_payload(&frame[LENGTH_PREFIX..]),
            Err(CodecError::UnknownMessageType(77))
        ));
    }

    #[test]
    fn unknown_value_tag_rejected() {
        let codec = FrameCodec::default();
        let frame = codec
            .encode(&Message::new("c", MessageType::Ack, BTreeMap::new()).with_parameter("n", 1i64))
            .unwrap();

        let mut payload = frame[LENGTH_PREFIX..].to_vec();
        // the tag sits right before the trailing 8 byte integer
        let tag_at = payload.len() - 9;
        assert_eq!(payload[tag_at], TAG_LONG);
        payload[tag_at] = 9;

        match codec.decode_payload(&payload) {
            Err(CodecError::UnknownValueTag { key, tag }) => {
                assert_eq!(key, "n");
                assert_eq!(tag, 9);
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn lying_string_length_does_not_allocate() {
        let codec = FrameCodec::default();
        let mut payload = Vec::new();
        payload.extend_from_slice(&u64::MAX.to_be_bytes());

        assert!(matches!(
            codec.decode_payload(&payload),
            Err(CodecError::Deserialize(_))
        ));
    }

    #[test]
    fn unknown_keys_are_preserved() {
        let codec = FrameCodec::default();
        let message = with_ids(
            Message::fetch_entry("c", "k").with_parameter("added-later", vec![1u8, 2]),
            "1",
            None,
        );
        let frame = codec.encode(&message).unwrap();
        let decoded = codec.decode_payload(&frame[LENGTH_PREFIX..]).unwrap();

        assert_eq!(decoded.key(), Some("k"));
        assert_eq!(
            decoded.parameter("added-later"),
            Some(&Value::Bytes(vec![1, 2]))
        );
    }

    #[test]
    fn debug_shows_frame_limit() {
        let codec = FrameCodec::new(4096);
        assert_eq!(
            format!("{codec:?}"),
            "FrameCodec { max_frame_length: 4096, .. }"
        );

        let decoder = FrameDecoder::new(codec);
        assert!(format!("{decoder:?}").contains("max_frame_length: 4096"));
    }
}
