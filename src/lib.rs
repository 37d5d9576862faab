#![feature(likely_unlikely, allocator_api)]

//! A small, arena-based protobuf wire-format codec: runtime-built
//! [`MiniTable`] descriptors drive a recursive-descent decoder and a
//! two-pass size-then-write encoder, with no generated code required.

pub mod arena;
pub mod containers;
pub mod decoding;
pub mod encoding;
pub mod error;
pub mod message;
pub mod minitable;
pub mod wire;

pub use arena::Arena;
pub use error::{DecodeOptions, EncodeOptions, Status};
pub use message::Message;
pub use minitable::{ExtensionRegistry, MiniTable};

/// Reads `reader` to completion and decodes it per [`decoding::decode`].
///
/// The decoder has no suspend point (unlike the teacher's chunked
/// `ResumeableParse`), so streaming input is buffered in full before
/// parsing begins.
pub fn decode_from_bufread(
    reader: &mut impl std::io::BufRead,
    message: &mut Message,
    mini_table: &MiniTable,
    extension_registry: Option<&ExtensionRegistry>,
    options: DecodeOptions,
    arena: &mut Arena<'_>,
) -> anyhow::Result<()> {
    use std::io::Read;
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf)?;
    let status = decoding::decode(&buf, message, mini_table, extension_registry, options, arena);
    if status.is_ok() {
        Ok(())
    } else {
        Err(anyhow::anyhow!("decode failed: {status}"))
    }
}

pub fn decode_from_read(
    reader: &mut impl std::io::Read,
    message: &mut Message,
    mini_table: &MiniTable,
    extension_registry: Option<&ExtensionRegistry>,
    options: DecodeOptions,
    arena: &mut Arena<'_>,
) -> anyhow::Result<()> {
    let mut buf_reader = std::io::BufReader::new(reader);
    decode_from_bufread(&mut buf_reader, message, mini_table, extension_registry, options, arena)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::minitable::MiniTableSub;
    use std::alloc::Global;

    fn scalar_token(ty: wire::DescriptorType) -> char {
        (b'!' + ty.index()) as char
    }

    #[test]
    fn decodes_and_re_encodes_a_nested_message_via_the_public_api() {
        let inner = MiniTable::build(&format!("!{}E", scalar_token(wire::DescriptorType::Int32)), vec![]).unwrap();
        let outer = MiniTable::build(
            &format!("!{}E", scalar_token(wire::DescriptorType::Message)),
            vec![MiniTableSub::Message(inner.clone())],
        )
        .unwrap();

        // field 1 (message): field 1 (int32) = 150, per the protobuf
        // encoding spec's worked varint example.
        let buffer: &[u8] = &[0x0A, 0x03, 0x08, 0x96, 0x01];

        let mut arena = Arena::new(&Global);
        let mut msg = Message::new(&outer, &mut arena);
        let mut reader = std::io::Cursor::new(buffer);
        decode_from_read(&mut reader, &mut msg, &outer, None, DecodeOptions::default(), &mut arena).unwrap();

        let (bytes, status) = encoding::encode(&msg, &outer, EncodeOptions::default(), &mut arena);
        assert_eq!(status, Status::Ok);
        assert_eq!(&*bytes, buffer);
    }

    #[test]
    fn decode_from_read_surfaces_malformed_input_as_an_error() {
        let table = MiniTable::build(&format!("!{}E", scalar_token(wire::DescriptorType::Int32)), vec![]).unwrap();
        let mut arena = Arena::new(&Global);
        let mut msg = Message::new(&table, &mut arena);
        // Varint for field 1 with the continuation bit set on every byte up
        // to the 10-byte limit: malformed.
        let buffer: &[u8] = &[0x08, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff];
        let mut reader = std::io::Cursor::new(buffer);
        let result = decode_from_read(&mut reader, &mut msg, &table, None, DecodeOptions::default(), &mut arena);
        assert!(result.is_err());
    }
}
