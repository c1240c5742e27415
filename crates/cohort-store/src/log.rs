//! Message log files.
//!
//! A message log is a write-once, read-once file holding group messages that
//! were buffered while a snapshot was captured. The producer ships it to a
//! joining node which replays it and deletes it.
//!
//! # File Format
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ MAGIC: u16 = 0x1717                          │
//! ├──────────────────────────────────────────────┤
//! │ LENGTH: u32 (payload bytes)                  │
//! ├──────────────────────────────────────────────┤
//! │ COUNT: u32 (messages in payload)             │
//! ├──────────────────────────────────────────────┤
//! │ CRC32: u32 (IEEE, over the payload)          │
//! ├──────────────────────────────────────────────┤
//! │ PAYLOAD                                      │
//! │  ┌────────────────────────────────────────┐  │
//! │  │ Frame length: u32                      │  │
//! │  │ Serialized message: [u8]               │  │
//! │  ├────────────────────────────────────────┤  │
//! │  │ ...                                    │  │
//! │  └────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────┘
//!
//! All integers big-endian. Header size: 14 bytes
//! ```

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;

use cohort_core::Message;
use crc::{Crc, CRC_32_ISO_HDLC};

use crate::codec::MessageSerializer;
use crate::error::{Result, StoreError};

/// Magic number opening every message log file.
pub const MAGIC: u16 = 0x1717;

/// Header size in bytes.
pub const HEADER_SIZE: usize = 14;

/// CRC-32 calculator (IEEE polynomial)
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Message log header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageLogHeader {
    /// Payload length in bytes
    pub length: u32,
    /// Number of messages in the payload
    pub count: u32,
    /// CRC32 of the payload
    pub crc32: u32,
}

impl MessageLogHeader {
    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..2].copy_from_slice(&MAGIC.to_be_bytes());
        buf[2..6].copy_from_slice(&self.length.to_be_bytes());
        buf[6..10].copy_from_slice(&self.count.to_be_bytes());
        buf[10..14].copy_from_slice(&self.crc32.to_be_bytes());
        buf
    }

    /// Parse header from bytes
    pub fn from_bytes(buf: &[u8; HEADER_SIZE]) -> Result<Self> {
        let magic = u16::from_be_bytes([buf[0], buf[1]]);
        if magic != MAGIC {
            return Err(StoreError::InvalidFormat(format!(
                "bad magic {:#06x}",
                magic
            )));
        }

        Ok(Self {
            length: u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]),
            count: u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]),
            crc32: u32::from_be_bytes([buf[10], buf[11], buf[12], buf[13]]),
        })
    }
}

/// Writes and reads message log files.
#[derive(Clone)]
pub struct MessageLogCodec {
    serializer: Arc<dyn MessageSerializer>,
}

impl MessageLogCodec {
    pub fn new(serializer: Arc<dyn MessageSerializer>) -> Self {
        Self { serializer }
    }

    /// Write `messages` to `path`.
    ///
    /// The payload is fully built in memory first: its length and checksum are
    /// part of the header.
    pub fn save(&self, messages: &[Message], path: impl AsRef<Path>) -> Result<()> {
        let (header, payload) = self.encode_payload(messages)?;

        let mut writer = BufWriter::new(File::create(path.as_ref())?);
        writer.write_all(&header.to_bytes())?;
        writer.write_all(&payload)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;

        tracing::debug!(
            path = %path.as_ref().display(),
            count = header.count,
            length = header.length,
            "saved message log"
        );
        Ok(())
    }

    /// Read every message stored in `path`.
    ///
    /// A checksum mismatch fails the whole load; no message is returned.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<Vec<Message>> {
        let mut reader = BufReader::new(File::open(path.as_ref())?);

        let mut header_bytes = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header_bytes).map_err(truncated)?;
        let header = MessageLogHeader::from_bytes(&header_bytes)?;

        // Never trust the header for the allocation size.
        let mut payload = Vec::new();
        reader
            .by_ref()
            .take(u64::from(header.length))
            .read_to_end(&mut payload)?;
        if payload.len() != header.length as usize {
            return Err(StoreError::InvalidFormat(format!(
                "payload truncated: {} of {} bytes",
                payload.len(),
                header.length
            )));
        }

        self.decode_payload(&header, &payload)
    }

    /// Encode messages into a complete in-memory log image.
    pub fn encode(&self, messages: &[Message]) -> Result<Vec<u8>> {
        let (header, payload) = self.encode_payload(messages)?;
        let mut image = Vec::with_capacity(HEADER_SIZE + payload.len());
        image.extend_from_slice(&header.to_bytes());
        image.extend_from_slice(&payload);
        Ok(image)
    }

    /// Decode a complete in-memory log image.
    pub fn decode(&self, image: &[u8]) -> Result<Vec<Message>> {
        let header_bytes: &[u8; HEADER_SIZE] = image
            .get(..HEADER_SIZE)
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| StoreError::InvalidFormat("header too short".into()))?;
        let header = MessageLogHeader::from_bytes(header_bytes)?;

        let end = HEADER_SIZE + header.length as usize;
        let payload = image
            .get(HEADER_SIZE..end)
            .ok_or_else(|| StoreError::InvalidFormat("payload truncated".into()))?;

        self.decode_payload(&header, payload)
    }

    fn encode_payload(&self, messages: &[Message]) -> Result<(MessageLogHeader, Vec<u8>)> {
        let mut payload = Vec::new();
        for message in messages {
            let bytes = self.serializer.serialize(message)?;
            let frame_len = u32::try_from(bytes.len())
                .map_err(|_| StoreError::InvalidFormat("message too large".into()))?;
            payload.extend_from_slice(&frame_len.to_be_bytes());
            payload.extend_from_slice(&bytes);
        }

        let header = MessageLogHeader {
            length: u32::try_from(payload.len())
                .map_err(|_| StoreError::InvalidFormat("log too large".into()))?,
            count: u32::try_from(messages.len())
                .map_err(|_| StoreError::InvalidFormat("too many messages".into()))?,
            crc32: CRC32.checksum(&payload),
        };
        Ok((header, payload))
    }

    fn decode_payload(&self, header: &MessageLogHeader, payload: &[u8]) -> Result<Vec<Message>> {
        let actual = CRC32.checksum(payload);
        if actual != header.crc32 {
            return Err(StoreError::ChecksumMismatch {
                expected: header.crc32,
                actual,
            });
        }

        // Every frame needs at least its length prefix.
        let mut messages = Vec::with_capacity((header.count as usize).min(payload.len() / 4));
        let mut rest = payload;
        for index in 0..header.count {
            let (len_bytes, tail) = split(rest, 4, index)?;
            let frame_len =
                u32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]);
            let (frame, tail) = split(tail, frame_len as usize, index)?;
            messages.push(self.serializer.deserialize(frame)?);
            rest = tail;
        }

        if !rest.is_empty() {
            return Err(StoreError::InvalidFormat(format!(
                "{} trailing bytes after {} messages",
                rest.len(),
                header.count
            )));
        }

        Ok(messages)
    }
}

fn split(bytes: &[u8], at: usize, index: u32) -> Result<(&[u8], &[u8])> {
    if bytes.len() < at {
        return Err(StoreError::InvalidFormat(format!(
            "message {} truncated",
            index
        )));
    }
    Ok(bytes.split_at(at))
}

fn truncated(e: std::io::Error) -> StoreError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        StoreError::InvalidFormat("file truncated".into())
    } else {
        StoreError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CborSerializer;
    use cohort_core::{ApplicationPart, GroupId, MessagePart, NodeId};
    use proptest::prelude::*;

    fn codec() -> MessageLogCodec {
        MessageLogCodec::new(Arc::new(CborSerializer))
    }

    fn app_message(n: u32, payload: Vec<u8>) -> Message {
        Message::to_group(
            NodeId::from_u128(n as u128 % 3),
            GroupId::new("core"),
            MessagePart::Application(ApplicationPart::new(format!("op-{}", n), payload)),
        )
    }

    fn sample(count: u32) -> Vec<Message> {
        (0..count)
            .map(|n| app_message(n, n.to_be_bytes().to_vec()))
            .collect()
    }

    #[test]
    fn test_header_layout() {
        let header = MessageLogHeader {
            length: 0x0102_0304,
            count: 7,
            crc32: 0xdead_beef,
        };
        let bytes = header.to_bytes();
        assert_eq!(&bytes[0..2], &[0x17, 0x17]);
        assert_eq!(&bytes[2..6], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&bytes[6..10], &[0, 0, 0, 7]);
        assert_eq!(&bytes[10..14], &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(MessageLogHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn test_save_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.log");
        let messages = sample(25);

        codec().save(&messages, &path).unwrap();
        let loaded = codec().load(&path).unwrap();

        assert_eq!(loaded, messages);
    }

    #[test]
    fn test_oversized_length_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hostile.log");
        let header = MessageLogHeader {
            length: u32::MAX,
            count: u32::MAX,
            crc32: 0,
        };
        std::fs::write(&path, header.to_bytes()).unwrap();

        let err = codec().load(&path).unwrap_err();
        assert!(matches!(err, StoreError::InvalidFormat(_)), "{err:?}");
    }

    #[test]
    fn test_empty_log() {
        let image = codec().encode(&[]).unwrap();
        assert_eq!(image.len(), HEADER_SIZE);
        assert!(codec().decode(&image).unwrap().is_empty());
    }

    #[test]
    fn test_bad_magic() {
        let mut image = codec().encode(&sample(2)).unwrap();
        image[0] = 0x18;
        assert!(matches!(
            codec().decode(&image),
            Err(StoreError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_corrupted_payload_fails_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.log");
        codec().save(&sample(10), &path).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        std::fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            codec().load(&path),
            Err(StoreError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_truncated_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.log");
        codec().save(&sample(4), &path).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();

        assert!(matches!(
            codec().load(&path),
            Err(StoreError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_count_mismatch_is_format_error() {
        let mut image = codec().encode(&sample(3)).unwrap();
        // Claim one fewer message than the payload holds; checksum still matches.
        image[9] = 2;
        assert!(matches!(
            codec().decode(&image),
            Err(StoreError::InvalidFormat(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_roundtrip_preserves_order(
            payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 1..40)
        ) {
            let messages: Vec<Message> = payloads
                .into_iter()
                .enumerate()
                .map(|(n, payload)| app_message(n as u32, payload))
                .collect();
            let image = codec().encode(&messages).unwrap();
            prop_assert_eq!(codec().decode(&image).unwrap(), messages);
        }

        #[test]
        fn prop_any_payload_flip_is_detected(count in 1u32..20, offset in any::<prop::sample::Index>(), bit in 0u8..8) {
            let mut image = codec().encode(&sample(count)).unwrap();
            let payload_len = image.len() - HEADER_SIZE;
            let at = HEADER_SIZE + offset.index(payload_len);
            image[at] ^= 1 << bit;

            let result = codec().decode(&image);
            let is_checksum_error = matches!(result, Err(StoreError::ChecksumMismatch { .. }));
            prop_assert!(is_checksum_error);
        }
    }
}
