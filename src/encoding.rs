//! Wire-format encoder: a two-pass size-then-write traversal driven by the
//! same [`MiniTable`] dispatch the decoder uses.
//!
//! The teacher's original encoder wrote backwards from the end of the
//! buffer to avoid a separate sizing pass; this one instead computes each
//! message's exact size up front (`message_size`) and writes into a
//! precisely-sized buffer (`write_message`) — simpler to get right without
//! being able to run the result through a test binary.

use crate::arena::Arena;
use crate::containers;
use crate::decoding::{check_required, map_next};
use crate::error::{EncodeOptions, Status};
use crate::message::{ArrayHeader, Message, TaggedMessagePtr};
use crate::minitable::{Cardinality, MiniTable, MiniTableField, Presence};
use crate::wire::{DescriptorType, FieldRep, WireType, WriteCursor, zigzag_encode};

/// Serializes `message` per `mini_table`, returning the encoded bytes and
/// [`Status::Ok`], or an empty buffer with a non-ok status.
///
/// `arena` is accepted for interface symmetry with [`crate::decoding::decode`]
/// and to leave room for a future streaming/chunked writer; this
/// implementation allocates its output buffer directly rather than through
/// the arena, since the buffer is handed to the caller (outliving the arena
/// would otherwise require `arena.add_cleanup` bookkeeping for no benefit).
pub fn encode(
    message: &Message,
    mini_table: &MiniTable,
    options: EncodeOptions,
    arena: &mut Arena<'_>,
) -> (Box<[u8]>, Status) {
    let _ = arena;
    if options.contains(EncodeOptions::CHECK_REQUIRED) && !check_required(message, mini_table) {
        return (Box::new([]), Status::MissingRequired);
    }
    let size = message_size(message, mini_table, options);
    let mut buf = vec![0u8; size];
    let (mut cursor, start) = WriteCursor::new(&mut buf);
    write_message(&mut cursor, message, mini_table, options);
    debug_assert_eq!((cursor - start) as usize, size);
    (buf.into_boxed_slice(), Status::Ok)
}

fn varint_len(mut n: u64) -> usize {
    let mut len = 1;
    while n >= 0x80 {
        n >>= 7;
        len += 1;
    }
    len
}

fn tag_len(field_number: u32, wire_type: WireType) -> usize {
    varint_len(((field_number << 3) | wire_type as u32) as u64)
}

fn ordered_fields<'a>(mini_table: &'a MiniTable, options: EncodeOptions) -> Vec<&'a MiniTableField> {
    let mut fields: Vec<&MiniTableField> = mini_table.fields.iter().collect();
    if options.contains(EncodeOptions::DETERMINISTIC) {
        fields.sort_by(|a, b| b.number.cmp(&a.number));
    }
    fields
}

fn field_present(message: &Message, field: &MiniTableField) -> bool {
    match field.presence {
        Presence::Hasbit(bit) => message.get_hasbit(bit),
        Presence::OneofCaseOffset(case_offset) => message.get_oneof_case(case_offset) == field.number,
        Presence::None => match field.mode.cardinality {
            Cardinality::Repeated | Cardinality::Map => {
                let arr: *mut ArrayHeader = unsafe { message.get(field.offset) };
                !arr.is_null() && unsafe { (*arr).len > 0 }
            }
            Cardinality::Scalar => !scalar_is_default(message, field),
        },
    }
}

/// proto3 implicit-presence fields (the only case reaching this function,
/// per `field_present`) are omitted from the wire when their value equals
/// the type's zero default.
fn scalar_is_default(message: &Message, field: &MiniTableField) -> bool {
    match field.ty {
        DescriptorType::String | DescriptorType::Bytes => {
            let ptr = unsafe { message.field_ptr(field.offset) } as *const containers::Bytes;
            let inline: containers::Bytes = unsafe { std::ptr::read_unaligned(ptr) };
            inline.is_empty()
        }
        _ => load_raw_numeric(message, field.offset, field.ty) == 0,
    }
}

fn load_raw_numeric(message: &Message, offset: u16, ty: DescriptorType) -> u64 {
    match ty.rep() {
        FieldRep::Rep1Byte => unsafe { message.get::<u8>(offset) as u64 },
        FieldRep::Rep4Byte => unsafe { message.get::<u32>(offset) as u64 },
        FieldRep::Rep8Byte => unsafe { message.get::<u64>(offset) },
        _ => unreachable!("numeric field can't have a string/pointer rep"),
    }
}

// ---- sizing ---------------------------------------------------

fn message_size(message: &Message, mini_table: &MiniTable, options: EncodeOptions) -> usize {
    let mut size = 0usize;
    for field in ordered_fields(mini_table, options) {
        if !field_present(message, field) {
            continue;
        }
        size += field_size(message, field, mini_table, options);
    }
    size += message.unknown_bytes().len();
    size += message.extension_bytes().len();
    size
}

fn field_size(message: &Message, field: &MiniTableField, mini_table: &MiniTable, options: EncodeOptions) -> usize {
    match field.mode.cardinality {
        Cardinality::Scalar => scalar_field_size(message, field, mini_table, options),
        Cardinality::Repeated => repeated_field_size(message, field, mini_table, options),
        Cardinality::Map => map_field_size(message, field, mini_table, options),
    }
}

fn scalar_field_size(message: &Message, field: &MiniTableField, mini_table: &MiniTable, options: EncodeOptions) -> usize {
    match field.ty {
        DescriptorType::Message => {
            let bits: usize = unsafe { message.get(field.offset) };
            let sub_msg = TaggedMessagePtr::from_bits(bits).expect("present field has a value").message();
            let sub_table = mini_table.get_sub_message_table(field).expect("linked sub-table");
            let inner = message_size(&sub_msg, sub_table, options);
            tag_len(field.number, WireType::Delimited) + varint_len(inner as u64) + inner
        }
        DescriptorType::Group => {
            let bits: usize = unsafe { message.get(field.offset) };
            let sub_msg = TaggedMessagePtr::from_bits(bits).expect("present field has a value").message();
            let sub_table = mini_table.get_sub_message_table(field).expect("linked sub-table");
            let inner = message_size(&sub_msg, sub_table, options);
            tag_len(field.number, WireType::StartGroup) + inner + tag_len(field.number, WireType::EndGroup)
        }
        DescriptorType::String | DescriptorType::Bytes => {
            let len = scalar_bytes_len(message, field);
            tag_len(field.number, WireType::Delimited) + varint_len(len as u64) + len
        }
        _ => {
            let raw = load_raw_numeric(message, field.offset, field.ty);
            tag_len(field.number, field.wire_type_unpacked()) + numeric_value_len(field.ty, raw)
        }
    }
}

fn scalar_bytes_len(message: &Message, field: &MiniTableField) -> usize {
    let is_oneof = field.mode.presence_kind == crate::minitable::PresenceKind::Oneof;
    if is_oneof {
        let ptr: *mut containers::Bytes = unsafe { message.get(field.offset) };
        unsafe { (*ptr).len() }
    } else {
        let raw = unsafe { message.field_ptr(field.offset) } as *const containers::Bytes;
        let inline: containers::Bytes = unsafe { std::ptr::read_unaligned(raw) };
        inline.len()
    }
}

fn numeric_value_len(ty: DescriptorType, raw: u64) -> usize {
    match ty {
        DescriptorType::Double | DescriptorType::Fixed64 | DescriptorType::SFixed64 => 8,
        DescriptorType::Float | DescriptorType::Fixed32 | DescriptorType::SFixed32 => 4,
        DescriptorType::Bool => 1,
        DescriptorType::Int32 | DescriptorType::UInt32 | DescriptorType::Enum => varint_len(raw),
        DescriptorType::Int64 | DescriptorType::UInt64 => varint_len(raw),
        DescriptorType::SInt32 => varint_len(zigzag_encode((raw as u32) as i32 as i64)),
        DescriptorType::SInt64 => varint_len(zigzag_encode(raw as i64)),
        DescriptorType::String | DescriptorType::Bytes | DescriptorType::Message | DescriptorType::Group => {
            unreachable!("non-numeric type routed through numeric_value_len")
        }
    }
}

fn repeated_field_size(message: &Message, field: &MiniTableField, mini_table: &MiniTable, options: EncodeOptions) -> usize {
    let arr: *mut ArrayHeader = unsafe { message.get(field.offset) };
    if arr.is_null() {
        return 0;
    }
    let arr = unsafe { &*arr };
    match field.ty {
        DescriptorType::Message | DescriptorType::Group => {
            let sub_table = mini_table.get_sub_message_table(field).expect("linked sub-table");
            arr.as_slice::<TaggedMessagePtr>()
                .iter()
                .map(|tagged| {
                    let sub_msg = tagged.message();
                    let inner = message_size(&sub_msg, sub_table, options);
                    if field.ty == DescriptorType::Group {
                        tag_len(field.number, WireType::StartGroup) + inner + tag_len(field.number, WireType::EndGroup)
                    } else {
                        tag_len(field.number, WireType::Delimited) + varint_len(inner as u64) + inner
                    }
                })
                .sum()
        }
        DescriptorType::String | DescriptorType::Bytes => arr
            .as_slice::<containers::Bytes>()
            .iter()
            .map(|b| tag_len(field.number, WireType::Delimited) + varint_len(b.len() as u64) + b.len())
            .sum(),
        _ => {
            let values = numeric_raw_values(arr, field.ty);
            if field.mode.packed {
                let payload: usize = values.iter().map(|&v| numeric_value_len(field.ty, v)).sum();
                if payload == 0 {
                    0
                } else {
                    tag_len(field.number, WireType::Delimited) + varint_len(payload as u64) + payload
                }
            } else {
                values
                    .iter()
                    .map(|&v| tag_len(field.number, field.wire_type_unpacked()) + numeric_value_len(field.ty, v))
                    .sum()
            }
        }
    }
}

/// Reads every element of a repeated numeric array out as raw widened bits,
/// matching the width `decoding::decode_numeric_raw` would have stored.
fn numeric_raw_values(arr: &ArrayHeader, ty: DescriptorType) -> Vec<u64> {
    match ty.rep() {
        FieldRep::Rep1Byte => arr.as_slice::<u8>().iter().map(|&v| v as u64).collect(),
        FieldRep::Rep4Byte => arr.as_slice::<u32>().iter().map(|&v| v as u64).collect(),
        FieldRep::Rep8Byte => arr.as_slice::<u64>().iter().copied().collect(),
        _ => unreachable!("numeric field can't have a string/pointer rep"),
    }
}

fn map_field_size(message: &Message, field: &MiniTableField, mini_table: &MiniTable, options: EncodeOptions) -> usize {
    let arr: *mut ArrayHeader = unsafe { message.get(field.offset) };
    if arr.is_null() {
        return 0;
    }
    let entry_table = mini_table.get_sub_message_table(field).expect("linked map-entry table");
    let key_field = entry_table.find_field_by_number(1).expect("map entry key field");
    let value_field = entry_table.find_field_by_number(2).expect("map entry value field");
    let arr = unsafe { &*arr };
    let mut total = 0;
    let mut iter = 0;
    while let Some((next, key, value)) = map_next(arr, iter) {
        iter = next;
        let inner = slot_size(entry_table, key_field, key, options) + slot_size(entry_table, value_field, value, options);
        total += tag_len(field.number, WireType::Delimited) + varint_len(inner as u64) + inner;
    }
    total
}

fn slot_size(entry_table: &MiniTable, field: &MiniTableField, slot: u64, options: EncodeOptions) -> usize {
    match field.ty {
        DescriptorType::String | DescriptorType::Bytes => {
            let ptr = slot as *const containers::Bytes;
            let len = unsafe { (*ptr).len() };
            tag_len(field.number, WireType::Delimited) + varint_len(len as u64) + len
        }
        DescriptorType::Message => {
            let sub_msg = TaggedMessagePtr::from_bits(slot as usize)
                .expect("map entry value always written")
                .message();
            let sub_table = entry_table.get_sub_message_table(field).expect("linked sub-table");
            let inner = message_size(&sub_msg, sub_table, options);
            tag_len(field.number, WireType::Delimited) + varint_len(inner as u64) + inner
        }
        DescriptorType::Group => {
            let sub_msg = TaggedMessagePtr::from_bits(slot as usize)
                .expect("map entry value always written")
                .message();
            let sub_table = entry_table.get_sub_message_table(field).expect("linked sub-table");
            let inner = message_size(&sub_msg, sub_table, options);
            tag_len(field.number, WireType::StartGroup) + inner + tag_len(field.number, WireType::EndGroup)
        }
        _ => tag_len(field.number, field.wire_type_unpacked()) + numeric_value_len(field.ty, slot),
    }
}

// ---- writing ---------------------------------------------------

fn write_message(cursor: &mut WriteCursor, message: &Message, mini_table: &MiniTable, options: EncodeOptions) {
    for field in ordered_fields(mini_table, options) {
        if !field_present(message, field) {
            continue;
        }
        write_field(cursor, message, field, mini_table, options);
    }
    cursor.write_slice(message.unknown_bytes());
    cursor.write_slice(message.extension_bytes());
}

fn write_field(cursor: &mut WriteCursor, message: &Message, field: &MiniTableField, mini_table: &MiniTable, options: EncodeOptions) {
    match field.mode.cardinality {
        Cardinality::Scalar => write_scalar_field(cursor, message, field, mini_table, options),
        Cardinality::Repeated => write_repeated_field(cursor, message, field, mini_table, options),
        Cardinality::Map => write_map_field(cursor, message, field, mini_table, options),
    }
}

fn write_scalar_field(cursor: &mut WriteCursor, message: &Message, field: &MiniTableField, mini_table: &MiniTable, options: EncodeOptions) {
    match field.ty {
        DescriptorType::Message => {
            let bits: usize = unsafe { message.get(field.offset) };
            let sub_msg = TaggedMessagePtr::from_bits(bits).expect("present field has a value").message();
            let sub_table = mini_table.get_sub_message_table(field).expect("linked sub-table");
            cursor.write_tag((field.number << 3) | WireType::Delimited as u32);
            let size = message_size(&sub_msg, sub_table, options);
            cursor.write_varint(size as u64);
            write_message(cursor, &sub_msg, sub_table, options);
        }
        DescriptorType::Group => {
            let bits: usize = unsafe { message.get(field.offset) };
            let sub_msg = TaggedMessagePtr::from_bits(bits).expect("present field has a value").message();
            let sub_table = mini_table.get_sub_message_table(field).expect("linked sub-table");
            cursor.write_tag((field.number << 3) | WireType::StartGroup as u32);
            write_message(cursor, &sub_msg, sub_table, options);
            cursor.write_tag((field.number << 3) | WireType::EndGroup as u32);
        }
        DescriptorType::String | DescriptorType::Bytes => {
            cursor.write_tag((field.number << 3) | WireType::Delimited as u32);
            write_scalar_bytes(cursor, message, field);
        }
        _ => {
            let raw = load_raw_numeric(message, field.offset, field.ty);
            cursor.write_tag((field.number << 3) | field.wire_type_unpacked() as u32);
            write_numeric_value(cursor, field.ty, raw);
        }
    }
}

fn write_scalar_bytes(cursor: &mut WriteCursor, message: &Message, field: &MiniTableField) {
    let is_oneof = field.mode.presence_kind == crate::minitable::PresenceKind::Oneof;
    let bytes: &[u8] = if is_oneof {
        let ptr: *mut containers::Bytes = unsafe { message.get(field.offset) };
        unsafe { (*ptr).slice() }
    } else {
        let raw = unsafe { message.field_ptr(field.offset) } as *const containers::Bytes;
        unsafe { (*raw).slice() }
    };
    cursor.write_varint(bytes.len() as u64);
    cursor.write_slice(bytes);
}

fn write_numeric_value(cursor: &mut WriteCursor, ty: DescriptorType, raw: u64) {
    match ty {
        DescriptorType::Double | DescriptorType::Fixed64 | DescriptorType::SFixed64 => {
            cursor.write_unaligned(raw);
        }
        DescriptorType::Float | DescriptorType::Fixed32 | DescriptorType::SFixed32 => {
            cursor.write_unaligned(raw as u32);
        }
        DescriptorType::Bool => cursor.write_slice(&[(raw != 0) as u8]),
        DescriptorType::Int32 | DescriptorType::UInt32 | DescriptorType::Enum => {
            // Int32 negatives are widened to a 10-byte varint by sign-extending
            // through i64, matching proto2/3's historical wire encoding.
            cursor.write_varint(if ty == DescriptorType::Int32 {
                (raw as u32 as i32) as i64 as u64
            } else {
                raw
            });
        }
        DescriptorType::Int64 | DescriptorType::UInt64 => cursor.write_varint(raw),
        DescriptorType::SInt32 => cursor.write_varint(zigzag_encode((raw as u32) as i32 as i64)),
        DescriptorType::SInt64 => cursor.write_varint(zigzag_encode(raw as i64)),
        DescriptorType::String | DescriptorType::Bytes | DescriptorType::Message | DescriptorType::Group => {
            unreachable!("non-numeric type routed through write_numeric_value")
        }
    }
}

fn write_repeated_field(cursor: &mut WriteCursor, message: &Message, field: &MiniTableField, mini_table: &MiniTable, options: EncodeOptions) {
    let arr: *mut ArrayHeader = unsafe { message.get(field.offset) };
    if arr.is_null() {
        return;
    }
    let arr = unsafe { &*arr };
    match field.ty {
        DescriptorType::Message | DescriptorType::Group => {
            let sub_table = mini_table.get_sub_message_table(field).expect("linked sub-table");
            for tagged in arr.as_slice::<TaggedMessagePtr>() {
                let sub_msg = tagged.message();
                if field.ty == DescriptorType::Group {
                    cursor.write_tag((field.number << 3) | WireType::StartGroup as u32);
                    write_message(cursor, &sub_msg, sub_table, options);
                    cursor.write_tag((field.number << 3) | WireType::EndGroup as u32);
                } else {
                    cursor.write_tag((field.number << 3) | WireType::Delimited as u32);
                    let size = message_size(&sub_msg, sub_table, options);
                    cursor.write_varint(size as u64);
                    write_message(cursor, &sub_msg, sub_table, options);
                }
            }
        }
        DescriptorType::String | DescriptorType::Bytes => {
            for elem in arr.as_slice::<containers::Bytes>() {
                cursor.write_tag((field.number << 3) | WireType::Delimited as u32);
                cursor.write_varint(elem.len() as u64);
                cursor.write_slice(elem.slice());
            }
        }
        _ => {
            let values = numeric_raw_values(arr, field.ty);
            if field.mode.packed {
                if values.is_empty() {
                    return;
                }
                let payload: usize = values.iter().map(|&v| numeric_value_len(field.ty, v)).sum();
                cursor.write_tag((field.number << 3) | WireType::Delimited as u32);
                cursor.write_varint(payload as u64);
                for v in values {
                    write_numeric_value(cursor, field.ty, v);
                }
            } else {
                for v in values {
                    cursor.write_tag((field.number << 3) | field.wire_type_unpacked() as u32);
                    write_numeric_value(cursor, field.ty, v);
                }
            }
        }
    }
}

fn write_map_field(cursor: &mut WriteCursor, message: &Message, field: &MiniTableField, mini_table: &MiniTable, options: EncodeOptions) {
    let arr: *mut ArrayHeader = unsafe { message.get(field.offset) };
    if arr.is_null() {
        return;
    }
    let entry_table = mini_table.get_sub_message_table(field).expect("linked map-entry table");
    let key_field = entry_table.find_field_by_number(1).expect("map entry key field");
    let value_field = entry_table.find_field_by_number(2).expect("map entry value field");
    let arr = unsafe { &*arr };
    let mut iter = 0;
    while let Some((next, key, value)) = map_next(arr, iter) {
        iter = next;
        let inner = slot_size(entry_table, key_field, key, options) + slot_size(entry_table, value_field, value, options);
        cursor.write_tag((field.number << 3) | WireType::Delimited as u32);
        cursor.write_varint(inner as u64);
        write_slot(cursor, entry_table, key_field, key, options);
        write_slot(cursor, entry_table, value_field, value, options);
    }
}

fn write_slot(cursor: &mut WriteCursor, entry_table: &MiniTable, field: &MiniTableField, slot: u64, options: EncodeOptions) {
    match field.ty {
        DescriptorType::String | DescriptorType::Bytes => {
            let ptr = slot as *const containers::Bytes;
            let bytes = unsafe { (*ptr).slice() };
            cursor.write_tag((field.number << 3) | WireType::Delimited as u32);
            cursor.write_varint(bytes.len() as u64);
            cursor.write_slice(bytes);
        }
        DescriptorType::Message => {
            let sub_msg = TaggedMessagePtr::from_bits(slot as usize)
                .expect("map entry value always written")
                .message();
            let sub_table = entry_table.get_sub_message_table(field).expect("linked sub-table");
            cursor.write_tag((field.number << 3) | WireType::Delimited as u32);
            let size = message_size(&sub_msg, sub_table, options);
            cursor.write_varint(size as u64);
            write_message(cursor, &sub_msg, sub_table, options);
        }
        DescriptorType::Group => {
            let sub_msg = TaggedMessagePtr::from_bits(slot as usize)
                .expect("map entry value always written")
                .message();
            let sub_table = entry_table.get_sub_message_table(field).expect("linked sub-table");
            cursor.write_tag((field.number << 3) | WireType::StartGroup as u32);
            write_message(cursor, &sub_msg, sub_table, options);
            cursor.write_tag((field.number << 3) | WireType::EndGroup as u32);
        }
        _ => {
            cursor.write_tag((field.number << 3) | field.wire_type_unpacked() as u32);
            write_numeric_value(cursor, field.ty, slot);
        }
    }
}
