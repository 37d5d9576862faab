//! End-to-end decode/encode scenarios exercised through the public API only.

use std::alloc::Global;

use minicodec::decoding::decode;
use minicodec::encoding::encode;
use minicodec::minitable::{MiniTable, MiniTableSub};
use minicodec::wire::DescriptorType;
use minicodec::{Arena, DecodeOptions, EncodeOptions, Message, Status};

fn scalar_token(ty: DescriptorType) -> char {
    (b'!' + ty.index()) as char
}

fn repeated_token(ty: DescriptorType) -> char {
    (b'!' + 18 + ty.index()) as char
}

fn modifier_prefix() -> char {
    (b'!' + 38) as char
}

fn digit(n: u8) -> char {
    (b'!' + 41 + n) as char
}

const MOD_REQUIRED: u8 = 1 << 3;

#[test]
fn simple_scalar_field() {
    let table = MiniTable::build(&format!("!{}E", scalar_token(DescriptorType::Int32)), vec![]).unwrap();
    let mut arena = Arena::new(&Global);
    let mut msg = Message::new(&table, &mut arena);

    let status = decode(&[0x08, 0x96, 0x01], &mut msg, &table, None, DecodeOptions::default(), &mut arena);
    assert_eq!(status, Status::Ok);

    let field = table.find_field_by_number(1).unwrap();
    assert!(msg.has_field(field));
    assert_eq!(unsafe { msg.get::<u32>(field.offset) }, 150);
}

#[test]
fn packed_repeated_field() {
    let descriptor = format!("!{}{}E", scalar_token(DescriptorType::Int32), repeated_token(DescriptorType::Int32));
    let table = MiniTable::build(&descriptor, vec![]).unwrap();
    let field = table.find_field_by_number(2).unwrap();

    let mut arena = Arena::new(&Global);
    let mut msg = Message::new(&table, &mut arena);
    let status = decode(&[0x12, 0x03, 0x01, 0x02, 0x03], &mut msg, &table, None, DecodeOptions::default(), &mut arena);
    assert_eq!(status, Status::Ok);

    let arr: *mut minicodec::message::ArrayHeader = unsafe { msg.get(field.offset) };
    assert_eq!(unsafe { (*arr).as_slice::<u32>() }, &[1, 2, 3]);
}

#[test]
fn unpacked_form_of_a_packed_field_decodes_to_the_same_array() {
    let descriptor = format!("!{}{}E", scalar_token(DescriptorType::Int32), repeated_token(DescriptorType::Int32));
    let table = MiniTable::build(&descriptor, vec![]).unwrap();
    let field = table.find_field_by_number(2).unwrap();

    let mut arena = Arena::new(&Global);
    let mut msg = Message::new(&table, &mut arena);
    let status = decode(
        &[0x10, 0x01, 0x10, 0x02, 0x10, 0x03],
        &mut msg,
        &table,
        None,
        DecodeOptions::default(),
        &mut arena,
    );
    assert_eq!(status, Status::Ok);

    let arr: *mut minicodec::message::ArrayHeader = unsafe { msg.get(field.offset) };
    assert_eq!(unsafe { (*arr).as_slice::<u32>() }, &[1, 2, 3]);
}

#[test]
fn submessage_scoped_by_its_length_limit() {
    let inner = MiniTable::build(&format!("!{}E", scalar_token(DescriptorType::Int32)), vec![]).unwrap();
    let outer = MiniTable::build(
        &format!("!{}E", scalar_token(DescriptorType::Message)),
        vec![MiniTableSub::Message(inner.clone())],
    )
    .unwrap();

    let mut arena = Arena::new(&Global);
    let mut msg = Message::new(&outer, &mut arena);
    let status = decode(&[0x0A, 0x03, 0x08, 0x96, 0x01], &mut msg, &outer, None, DecodeOptions::default(), &mut arena);
    assert_eq!(status, Status::Ok);

    let field = outer.find_field_by_number(1).unwrap();
    let bits: usize = unsafe { msg.get(field.offset) };
    let inner_msg = minicodec::message::TaggedMessagePtr::from_bits(bits).unwrap().message();
    let inner_field = inner.find_field_by_number(1).unwrap();
    assert_eq!(unsafe { inner_msg.get::<u32>(inner_field.offset) }, 150);
}

#[test]
fn unknown_field_is_preserved_verbatim() {
    let table = MiniTable::build(&format!("!{}E", scalar_token(DescriptorType::Int32)), vec![]).unwrap();
    let mut arena = Arena::new(&Global);
    let mut msg = Message::new(&table, &mut arena);

    let status = decode(&[0x10, 0x07], &mut msg, &table, None, DecodeOptions::default(), &mut arena);
    assert_eq!(status, Status::Ok);
    assert_eq!(msg.unknown_bytes(), &[0x10, 0x07]);
}

#[test]
fn oneof_transition_replaces_the_earlier_member() {
    let skip_token = format!("{}{}", (b'!' + 37) as char, digit(2));
    let descriptor = format!(
        "!{}{}{}E{}{}{}",
        skip_token,
        scalar_token(DescriptorType::Int32),
        scalar_token(DescriptorType::Int32),
        digit(3),
        (b'!' + 39) as char,
        digit(4),
    );
    let table = MiniTable::build(&descriptor, vec![]).unwrap();
    let field3 = table.find_field_by_number(3).unwrap().clone();
    let field4 = table.find_field_by_number(4).unwrap().clone();

    let mut arena = Arena::new(&Global);
    let mut msg = Message::new(&table, &mut arena);
    let status = decode(&[0x18, 0x05, 0x20, 0x09], &mut msg, &table, None, DecodeOptions::default(), &mut arena);
    assert_eq!(status, Status::Ok);
    assert!(!msg.has_field(&field3));
    assert!(msg.has_field(&field4));
    assert_eq!(unsafe { msg.get::<u32>(field4.offset) }, 9);
}

#[test]
fn arena_fusion_keeps_allocations_from_every_fused_arena_alive() {
    let mut a = Arena::new(&Global);
    let b = Arena::new(&Global);
    let p: *mut u64 = a.alloc();
    unsafe { p.write(0xdead_beef) };
    a.fuse(&b);
    assert_eq!(unsafe { *p }, 0xdead_beef);
    drop(a);
    assert_eq!(unsafe { *p }, 0xdead_beef);
    drop(b);
}

#[test]
fn decode_then_encode_round_trips_a_well_formed_message() {
    let descriptor = format!("!{}{}E", scalar_token(DescriptorType::Int32), repeated_token(DescriptorType::Int32));
    let table = MiniTable::build(&descriptor, vec![]).unwrap();
    let input: &[u8] = &[0x08, 0x2a, 0x12, 0x03, 0x01, 0x02, 0x03];

    let mut arena = Arena::new(&Global);
    let mut msg = Message::new(&table, &mut arena);
    let status = decode(input, &mut msg, &table, None, DecodeOptions::default(), &mut arena);
    assert_eq!(status, Status::Ok);

    let (bytes, status) = encode(&msg, &table, EncodeOptions::default(), &mut arena);
    assert_eq!(status, Status::Ok);
    assert_eq!(&*bytes, input);
}

#[test]
fn encode_decode_encode_is_a_fixed_point() {
    let descriptor = format!("!{}E", scalar_token(DescriptorType::Int32));
    let table = MiniTable::build(&descriptor, vec![]).unwrap();
    let input: &[u8] = &[0x08, 0x01];

    let mut arena = Arena::new(&Global);
    let mut msg = Message::new(&table, &mut arena);
    decode(input, &mut msg, &table, None, DecodeOptions::default(), &mut arena);
    let (first, _) = encode(&msg, &table, EncodeOptions::default(), &mut arena);

    let mut msg2 = Message::new(&table, &mut arena);
    decode(&first, &mut msg2, &table, None, DecodeOptions::default(), &mut arena);
    let (second, _) = encode(&msg2, &table, EncodeOptions::default(), &mut arena);
    assert_eq!(first, second);
}

#[test]
fn ten_byte_varint_is_accepted_and_eleven_bytes_is_malformed() {
    let table = MiniTable::build(&format!("!{}E", scalar_token(DescriptorType::Int64)), vec![]).unwrap();

    let mut ten_byte = vec![0x08u8];
    ten_byte.extend(std::iter::repeat(0xffu8).take(9));
    ten_byte.push(0x01);
    let mut arena = Arena::new(&Global);
    let mut msg = Message::new(&table, &mut arena);
    let status = decode(&ten_byte, &mut msg, &table, None, DecodeOptions::default(), &mut arena);
    assert_eq!(status, Status::Ok);

    let mut eleven_byte = vec![0x08u8];
    eleven_byte.extend(std::iter::repeat(0xffu8).take(10));
    eleven_byte.push(0x01);
    let mut msg = Message::new(&table, &mut arena);
    let status = decode(&eleven_byte, &mut msg, &table, None, DecodeOptions::default(), &mut arena);
    assert_eq!(status, Status::Malformed);
}

#[test]
fn submessage_length_past_the_enclosing_limit_is_malformed() {
    let inner = MiniTable::build(&format!("!{}E", scalar_token(DescriptorType::Int32)), vec![]).unwrap();
    let outer = MiniTable::build(
        &format!("!{}E", scalar_token(DescriptorType::Message)),
        vec![MiniTableSub::Message(inner)],
    )
    .unwrap();

    // Declares a length of 5 but only 2 bytes remain.
    let mut arena = Arena::new(&Global);
    let mut msg = Message::new(&outer, &mut arena);
    let status = decode(&[0x0A, 0x05, 0x08, 0x01], &mut msg, &outer, None, DecodeOptions::default(), &mut arena);
    assert_eq!(status, Status::Malformed);
}

#[test]
fn mismatched_end_group_field_number_is_malformed() {
    let inner = MiniTable::build(&format!("!{}E", scalar_token(DescriptorType::Int32)), vec![]).unwrap();
    let outer = MiniTable::build(
        &format!("!{}E", scalar_token(DescriptorType::Group)),
        vec![MiniTableSub::Message(inner)],
    )
    .unwrap();

    // Opens group field 1 (tag 0x0B = (1<<3)|3) but closes with field 2's
    // end-group tag (0x14 = (2<<3)|4) instead of field 1's (0x0C).
    let mut arena = Arena::new(&Global);
    let mut msg = Message::new(&outer, &mut arena);
    let status = decode(&[0x0B, 0x14], &mut msg, &outer, None, DecodeOptions::default(), &mut arena);
    assert_eq!(status, Status::Malformed);
}

fn varint(mut v: u64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let mut byte = (v & 0x7f) as u8;
        v >>= 7;
        if v != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if v == 0 {
            return out;
        }
    }
}

/// Builds a `MiniTable`/byte-buffer pair that nests a field-1 submessage
/// `levels` deep around a field-1 int32 payload of 150.
fn nested_message_fixture(levels: u32) -> (std::sync::Arc<MiniTable>, Vec<u8>) {
    let mut table = MiniTable::build(&format!("!{}E", scalar_token(DescriptorType::Int32)), vec![]).unwrap();
    for _ in 0..levels {
        table = MiniTable::build(
            &format!("!{}E", scalar_token(DescriptorType::Message)),
            vec![MiniTableSub::Message(table)],
        )
        .unwrap();
    }

    let mut payload = vec![0x08u8, 0x96, 0x01];
    for _ in 0..levels {
        let mut wrapped = vec![0x0Au8];
        wrapped.extend(varint(payload.len() as u64));
        wrapped.extend_from_slice(&payload);
        payload = wrapped;
    }
    (table, payload)
}

#[test]
fn depth_exactly_at_the_cap_parses_one_deeper_is_rejected() {
    let (table, payload) = nested_message_fixture(minicodec::error::DEFAULT_MAX_DEPTH);
    let mut arena = Arena::new(&Global);
    let mut msg = Message::new(&table, &mut arena);
    let status = decode(&payload, &mut msg, &table, None, DecodeOptions::default(), &mut arena);
    assert_eq!(status, Status::Ok);

    let (table, payload) = nested_message_fixture(minicodec::error::DEFAULT_MAX_DEPTH + 1);
    let mut msg = Message::new(&table, &mut arena);
    let status = decode(&payload, &mut msg, &table, None, DecodeOptions::default(), &mut arena);
    assert_eq!(status, Status::MaxDepthExceeded);
}

#[test]
fn empty_input_decodes_successfully_into_the_zero_message() {
    let table = MiniTable::build(&format!("!{}E", scalar_token(DescriptorType::Int32)), vec![]).unwrap();
    let mut arena = Arena::new(&Global);
    let mut msg = Message::new(&table, &mut arena);
    let status = decode(&[], &mut msg, &table, None, DecodeOptions::default(), &mut arena);
    assert_eq!(status, Status::Ok);

    let field = table.find_field_by_number(1).unwrap();
    assert!(!msg.has_field(field));
}

#[test]
fn missing_required_field_is_rejected_and_present_one_round_trips() {
    let descriptor = format!(
        "!{}{}{}E",
        scalar_token(DescriptorType::Int32),
        modifier_prefix(),
        digit(MOD_REQUIRED)
    );
    let table = MiniTable::build(&descriptor, vec![]).unwrap();

    let mut arena = Arena::new(&Global);
    let mut msg = Message::new(&table, &mut arena);
    let status = decode(&[], &mut msg, &table, None, DecodeOptions::default(), &mut arena);
    assert_eq!(status, Status::MissingRequired);

    let mut msg = Message::new(&table, &mut arena);
    let status = decode(&[0x08, 0x05], &mut msg, &table, None, DecodeOptions::default(), &mut arena);
    assert_eq!(status, Status::Ok);
    let (bytes, status) = encode(&msg, &table, EncodeOptions::CHECK_REQUIRED, &mut arena);
    assert_eq!(status, Status::Ok);
    assert_eq!(&*bytes, &[0x08, 0x05]);
}

#[test]
fn map_field_round_trips_through_decode_and_encode() {
    let entry = MiniTable::build(
        &format!("\"{}{}E", scalar_token(DescriptorType::String), scalar_token(DescriptorType::Int32)),
        vec![],
    )
    .unwrap();
    let table = MiniTable::build(
        &format!("!{}E", repeated_token(DescriptorType::Message)),
        vec![MiniTableSub::Message(entry)],
    )
    .unwrap();

    // Two map entries: {"a": 1, "bb": 2}.
    let input: &[u8] = &[
        0x0A, 0x05, 0x0A, 0x01, b'a', 0x10, 0x01, // entry 1
        0x0A, 0x06, 0x0A, 0x02, b'b', b'b', 0x10, 0x02, // entry 2
    ];

    let mut arena = Arena::new(&Global);
    let mut msg = Message::new(&table, &mut arena);
    let status = decode(input, &mut msg, &table, None, DecodeOptions::default(), &mut arena);
    assert_eq!(status, Status::Ok);

    let field = table.find_field_by_number(1).unwrap();
    assert_eq!(field.mode.cardinality, minicodec::minitable::Cardinality::Map);

    let (bytes, status) = encode(&msg, &table, EncodeOptions::default(), &mut arena);
    assert_eq!(status, Status::Ok);
    assert_eq!(&*bytes, input);
}

#[test]
fn duplicate_map_keys_on_the_wire_keep_only_the_last_value() {
    let entry = MiniTable::build(
        &format!("\"{}{}E", scalar_token(DescriptorType::Int32), scalar_token(DescriptorType::Int32)),
        vec![],
    )
    .unwrap();
    let table = MiniTable::build(
        &format!("!{}E", repeated_token(DescriptorType::Message)),
        vec![MiniTableSub::Message(entry)],
    )
    .unwrap();

    // Two entries with the same key (1): {1: 10} then {1: 20} — last wins.
    let input: &[u8] = &[
        0x0A, 0x04, 0x08, 0x01, 0x10, 0x0A, // entry {1: 10}
        0x0A, 0x04, 0x08, 0x01, 0x10, 0x14, // entry {1: 20}
    ];

    let mut arena = Arena::new(&Global);
    let mut msg = Message::new(&table, &mut arena);
    let status = decode(input, &mut msg, &table, None, DecodeOptions::default(), &mut arena);
    assert_eq!(status, Status::Ok);

    let field = table.find_field_by_number(1).unwrap();
    let arr: *mut minicodec::message::ArrayHeader = unsafe { msg.get(field.offset) };
    assert_eq!(unsafe { (*arr).len }, 1);

    let (bytes, status) = encode(&msg, &table, EncodeOptions::default(), &mut arena);
    assert_eq!(status, Status::Ok);
    assert_eq!(&*bytes, &[0x0A, 0x04, 0x08, 0x01, 0x10, 0x14]);
}

#[test]
fn unlinked_submessage_field_defers_status_but_continues_decoding_known_fields() {
    let descriptor = format!("!{}{}E", scalar_token(DescriptorType::Message), scalar_token(DescriptorType::Int32));
    let table = MiniTable::build(&descriptor, vec![MiniTableSub::Unlinked]).unwrap();

    // field 1 (message, unlinked, arbitrary payload), field 2 (int32) = 42.
    let input: &[u8] = &[0x0A, 0x01, 0x00, 0x10, 0x2A];
    let mut arena = Arena::new(&Global);
    let mut msg = Message::new(&table, &mut arena);
    let status = decode(input, &mut msg, &table, None, DecodeOptions::default(), &mut arena);
    assert_eq!(status, Status::Unlinked);

    let field1 = table.find_field_by_number(1).unwrap();
    let field2 = table.find_field_by_number(2).unwrap();
    assert!(msg.has_field(field1));
    let bits: usize = unsafe { msg.get(field1.offset) };
    assert!(minicodec::message::TaggedMessagePtr::from_bits(bits).unwrap().is_empty());
    assert!(msg.has_field(field2));
    assert_eq!(unsafe { msg.get::<u32>(field2.offset) }, 42);
    assert_eq!(msg.unknown_bytes(), &[0x0A, 0x01, 0x00]);
}

#[test]
fn promote_unknown_upgrades_a_buffered_scalar_submessage_and_is_idempotent() {
    let inner = MiniTable::build(&format!("!{}E", scalar_token(DescriptorType::Int32)), vec![]).unwrap();
    let descriptor = format!("!{}E", scalar_token(DescriptorType::Message));
    let unlinked_table = MiniTable::build(&descriptor, vec![MiniTableSub::Unlinked]).unwrap();
    let linked_table = MiniTable::build(&descriptor, vec![MiniTableSub::Message(inner.clone())]).unwrap();

    // field 1 (message, unlinked): inner payload is field 1 (int32) = 150.
    let input: &[u8] = &[0x0A, 0x03, 0x08, 0x96, 0x01];
    let mut arena = Arena::new(&Global);
    let mut msg = Message::new(&unlinked_table, &mut arena);
    let status = decode(input, &mut msg, &unlinked_table, None, DecodeOptions::default(), &mut arena);
    assert_eq!(status, Status::Unlinked);

    let field = linked_table.find_field_by_number(1).unwrap();
    let promote_status =
        minicodec::decoding::promote_unknown(&mut msg, &linked_table, field, DecodeOptions::default(), &mut arena);
    assert_eq!(promote_status, Status::Ok);
    assert!(msg.unknown_bytes().is_empty());

    let bits: usize = unsafe { msg.get(field.offset) };
    let tagged = minicodec::message::TaggedMessagePtr::from_bits(bits).unwrap();
    assert!(!tagged.is_empty());
    let inner_field = inner.find_field_by_number(1).unwrap();
    assert_eq!(unsafe { tagged.message().get::<u32>(inner_field.offset) }, 150);

    // Idempotent: a second call finds nothing left to promote.
    let second =
        minicodec::decoding::promote_unknown(&mut msg, &linked_table, field, DecodeOptions::default(), &mut arena);
    assert_eq!(second, Status::Ok);
    let bits_after: usize = unsafe { msg.get(field.offset) };
    assert_eq!(bits_after, bits);
}

#[test]
fn promote_extension_moves_a_buffered_unknown_entry_into_the_extension_region() {
    let table = MiniTable::build("$E", vec![]).unwrap();
    let mut arena = Arena::new(&Global);
    let mut msg = Message::new(&table, &mut arena);

    // Field 9, varint, value 7, with no registry entry: lands in the
    // generic unknown buffer instead of the extension region.
    let input: &[u8] = &[0x48, 0x07];
    let status = decode(input, &mut msg, &table, None, DecodeOptions::default(), &mut arena);
    assert_eq!(status, Status::Ok);
    assert_eq!(msg.unknown_bytes(), &[0x48, 0x07]);

    let ext_field = minicodec::minitable::MiniTableField {
        number: 9,
        ty: DescriptorType::Int32,
        mode: minicodec::minitable::FieldMode {
            cardinality: minicodec::minitable::Cardinality::Scalar,
            presence_kind: minicodec::minitable::PresenceKind::Implicit,
            packed: false,
            is_extension: true,
            alternate_type: false,
            validate_utf8: false,
        },
        offset: 0,
        presence: minicodec::minitable::Presence::None,
        submsg_index: None,
    };
    let ext = minicodec::minitable::MiniTableExtension {
        field: ext_field,
        extendee: table.clone(),
        sub: None,
    };

    let promote_status = minicodec::decoding::promote_extension(&mut msg, &ext, &mut arena);
    assert_eq!(promote_status, Status::Ok);
    assert!(msg.unknown_bytes().is_empty());
    assert_eq!(msg.extension_bytes(), &[0x48, 0x07]);
}
