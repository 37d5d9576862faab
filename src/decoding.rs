//! Wire-format decoder: a recursive-descent loop driven by [`MiniTable`],
//! dispatching each field by number/wire-type into scalar, repeated, map, or
//! unknown/extension storage.
//!
//! Unlike the teacher's original chunked/resumable decoder, this one always
//! operates over a single caller-supplied buffer — there is no suspend point
//! between calls. [`EpsCopyInputStream`] is still used for its bounded
//! look-ahead and limit-stack bookkeeping, but `set_next_chunk` is never
//! called from here.

use std::sync::Arc;

use crate::arena::Arena;
use crate::containers;
use crate::error::{DEFAULT_MAX_DEPTH, DecodeOptions, Status};
use crate::message::{ArrayHeader, Message, TaggedMessagePtr, find_field_entry};
use crate::minitable::{
    Cardinality, ExtensionMode, ExtensionRegistry, MiniTable, MiniTableExtension, MiniTableField,
    PresenceKind,
};
use crate::wire::{DescriptorType, DoneState, EpsCopyInputStream, FieldRep, ReadCursor, SLOP_SIZE, WireType, zigzag_decode};

/// Per-call decoder state: the eps-copy stream, the extension registry (if
/// any) and options the caller supplied, the recursion budget, and the first
/// error encountered (the recursive-descent loop unwinds on the first `false`
/// return, but the specific [`Status`] travels out-of-band here).
struct DecodeContext<'r> {
    stream: EpsCopyInputStream,
    extension_registry: Option<&'r ExtensionRegistry>,
    options: DecodeOptions,
    depth_remaining: u32,
    error: Option<Status>,
    /// Set when a submessage/group/map field's sub-table wasn't linked and
    /// its occurrence(s) were buffered as unknown bytes instead. Checked
    /// only after the rest of decode succeeds, mirroring how
    /// `MissingRequired` is deferred to the end of `decode` rather than
    /// aborting the walk immediately.
    saw_unlinked: bool,
}

/// Decodes `buffer` into `message` according to `mini_table`.
///
/// Buffers shorter than [`SLOP_SIZE`] are padded into a local scratch array
/// before [`EpsCopyInputStream`] sees them — its `new` requires at least
/// `SLOP_SIZE` physically-present bytes. Either way the stream's limit is
/// then pinned to `buffer.len()`, so padding never leaks into parsed data.
pub fn decode(
    buffer: &[u8],
    message: &mut Message,
    mini_table: &MiniTable,
    extension_registry: Option<&ExtensionRegistry>,
    options: DecodeOptions,
    arena: &mut Arena<'_>,
) -> Status {
    let mut scratch = [0u8; SLOP_SIZE];
    let padded: &[u8] = if buffer.len() < SLOP_SIZE {
        scratch[..buffer.len()].copy_from_slice(buffer);
        &scratch
    } else {
        buffer
    };

    let (mut stream, mut cursor) =
        EpsCopyInputStream::new(padded, options.contains(DecodeOptions::ALIAS_STRING));
    stream.push_limit(cursor, buffer.len() as isize);

    let mut ctx = DecodeContext {
        stream,
        extension_registry,
        options,
        depth_remaining: DEFAULT_MAX_DEPTH,
        error: None,
        saw_unlinked: false,
    };

    let ok = decode_message(&mut ctx, &mut cursor, message, mini_table, None, arena);
    if let Some(status) = ctx.error {
        return status;
    }
    if !ok {
        return Status::Malformed;
    }
    if options.contains(DecodeOptions::CHECK_REQUIRED) && !check_required(message, mini_table) {
        return Status::MissingRequired;
    }
    if ctx.saw_unlinked {
        return Status::Unlinked;
    }
    Status::Ok
}

/// The recursive-descent loop shared by top-level messages and group bodies.
/// `group_field` is `Some(n)` when parsing the body of group field `n`
/// (terminated by a matching `EndGroup`); `None` for an ordinary
/// length-delimited or top-level message (terminated by running out of
/// input).
fn decode_message(
    ctx: &mut DecodeContext,
    cursor: &mut ReadCursor,
    message: &mut Message,
    mini_table: &MiniTable,
    group_field: Option<u32>,
    arena: &mut Arena<'_>,
) -> bool {
    loop {
        match ctx.stream.is_done(*cursor) {
            DoneState::Done => {
                if group_field.is_some() {
                    ctx.error = Some(Status::Malformed);
                    return false;
                }
                return true;
            }
            DoneState::NeedFallback => match ctx.stream.fallback(*cursor) {
                Some(c) => {
                    *cursor = c;
                    continue;
                }
                None => {
                    ctx.error = Some(Status::Malformed);
                    return false;
                }
            },
            DoneState::NotDone => {}
        }

        let Some(tag) = cursor.read_tag() else {
            ctx.error = Some(Status::Malformed);
            return false;
        };
        let field_number = tag >> 3;
        let Some(wire_type) = WireType::from_tag(tag) else {
            ctx.error = Some(Status::Malformed);
            return false;
        };
        if wire_type == WireType::EndGroup {
            if group_field == Some(field_number) {
                return true;
            }
            ctx.error = Some(Status::Malformed);
            return false;
        }

        if !decode_one_field(ctx, cursor, field_number, wire_type, message, mini_table, arena) {
            return false;
        }
    }
}

fn decode_one_field(
    ctx: &mut DecodeContext,
    cursor: &mut ReadCursor,
    field_number: u32,
    wire_type: WireType,
    message: &mut Message,
    mini_table: &MiniTable,
    arena: &mut Arena<'_>,
) -> bool {
    if let Some(field) = mini_table.find_field_by_number(field_number) {
        let field = field.clone();
        return decode_known_field(ctx, cursor, &field, wire_type, message, mini_table, arena);
    }
    if wire_type == WireType::StartGroup && mini_table.ext == ExtensionMode::IsMessageSet {
        return decode_message_set_item(ctx, cursor, field_number, message, mini_table, arena);
    }
    if wire_type == WireType::StartGroup {
        return match decode_unknown_group_bytes(ctx, cursor, field_number) {
            Some(bytes) => {
                if !ctx.options.contains(DecodeOptions::DISCARD_UNKNOWN) {
                    message.add_unknown(&bytes, arena);
                }
                true
            }
            None => false,
        };
    }
    if mini_table.is_extendable() {
        decode_extension_field(ctx, cursor, field_number, wire_type, message, mini_table, arena)
    } else {
        store_unknown_field(ctx, cursor, field_number, wire_type, message, arena)
    }
}

fn decode_known_field(
    ctx: &mut DecodeContext,
    cursor: &mut ReadCursor,
    field: &MiniTableField,
    wire_type: WireType,
    message: &mut Message,
    mini_table: &MiniTable,
    arena: &mut Arena<'_>,
) -> bool {
    match field.mode.cardinality {
        Cardinality::Scalar => decode_scalar_field(ctx, cursor, field, wire_type, message, mini_table, arena),
        Cardinality::Repeated => {
            decode_repeated_field(ctx, cursor, field, wire_type, message, mini_table, arena)
        }
        Cardinality::Map => decode_map_entry(ctx, cursor, field, wire_type, message, mini_table, arena),
    }
}

fn mark_present(message: &mut Message, field: &MiniTableField) {
    match field.presence {
        crate::minitable::Presence::Hasbit(_) => message.set_hasbit_for(field),
        crate::minitable::Presence::OneofCaseOffset(_) => message.set_oneof_active(field),
        crate::minitable::Presence::None => {}
    }
}

fn requires_utf8_validation(ctx: &DecodeContext, field: &MiniTableField) -> bool {
    field.mode.validate_utf8 || ctx.options.contains(DecodeOptions::ALWAYS_VALIDATE_UTF8)
}

// ---- scalar fields ---------------------------------------------------

fn decode_scalar_field(
    ctx: &mut DecodeContext,
    cursor: &mut ReadCursor,
    field: &MiniTableField,
    wire_type: WireType,
    message: &mut Message,
    mini_table: &MiniTable,
    arena: &mut Arena<'_>,
) -> bool {
    match field.ty {
        DescriptorType::Message | DescriptorType::Group => {
            decode_scalar_submessage(ctx, cursor, field, wire_type, message, mini_table, arena)
        }
        DescriptorType::String | DescriptorType::Bytes => {
            decode_scalar_bytes(ctx, cursor, field, wire_type, message, arena)
        }
        _ => {
            if wire_type != field.wire_type_unpacked() {
                return store_unknown_field(ctx, cursor, field.number, wire_type, message, arena);
            }
            let Some(raw) = decode_numeric_raw(cursor, field.ty) else {
                ctx.error = Some(Status::Malformed);
                return false;
            };
            store_raw_numeric(message, field.offset, field.ty, raw);
            mark_present(message, field);
            true
        }
    }
}

fn decode_scalar_bytes(
    ctx: &mut DecodeContext,
    cursor: &mut ReadCursor,
    field: &MiniTableField,
    wire_type: WireType,
    message: &mut Message,
    arena: &mut Arena<'_>,
) -> bool {
    if wire_type != WireType::Delimited {
        return store_unknown_field(ctx, cursor, field.number, wire_type, message, arena);
    }
    let Some(len) = cursor.read_size() else {
        ctx.error = Some(Status::Malformed);
        return false;
    };
    let Some(bytes) = read_delimited_bytes(ctx, cursor, len) else {
        return false;
    };
    if field.ty == DescriptorType::String
        && requires_utf8_validation(ctx, field)
        && std::str::from_utf8(&bytes).is_err()
    {
        ctx.error = Some(Status::BadUtf8);
        return false;
    }

    if field.mode.presence_kind == PresenceKind::Oneof {
        let slot: *mut containers::Bytes = arena.alloc();
        let mut owned = containers::Bytes::new();
        owned.append(&bytes, arena);
        unsafe {
            slot.write(owned);
            message.set(field.offset, slot);
        }
    } else {
        let mut owned = containers::Bytes::new();
        owned.append(&bytes, arena);
        unsafe { message.set(field.offset, owned) };
    }
    mark_present(message, field);
    true
}

fn decode_scalar_submessage(
    ctx: &mut DecodeContext,
    cursor: &mut ReadCursor,
    field: &MiniTableField,
    wire_type: WireType,
    message: &mut Message,
    mini_table: &MiniTable,
    arena: &mut Arena<'_>,
) -> bool {
    let Some(sub_table) = mini_table.get_sub_message_table(field).cloned() else {
        return decode_unlinked_scalar_submessage(ctx, cursor, field, wire_type, message, arena);
    };

    if field.ty == DescriptorType::Group {
        if wire_type != WireType::StartGroup {
            return store_unknown_field(ctx, cursor, field.number, wire_type, message, arena);
        }
        if ctx.depth_remaining == 0 {
            ctx.error = Some(Status::MaxDepthExceeded);
            return false;
        }
        let mut sub_msg = get_or_create_submessage(message, field, &sub_table, arena);
        ctx.depth_remaining -= 1;
        let ok = decode_message(ctx, cursor, &mut sub_msg, &sub_table, Some(field.number), arena);
        ctx.depth_remaining += 1;
        if !ok {
            return false;
        }
        mark_present(message, field);
        true
    } else {
        if wire_type != WireType::Delimited {
            return store_unknown_field(ctx, cursor, field.number, wire_type, message, arena);
        }
        let Some(len) = cursor.read_size() else {
            ctx.error = Some(Status::Malformed);
            return false;
        };
        if ctx.depth_remaining == 0 {
            ctx.error = Some(Status::MaxDepthExceeded);
            return false;
        }
        let delta = ctx.stream.push_limit(*cursor, len);
        let mut sub_msg = get_or_create_submessage(message, field, &sub_table, arena);
        ctx.depth_remaining -= 1;
        let ok = decode_message(ctx, cursor, &mut sub_msg, &sub_table, None, arena);
        ctx.depth_remaining += 1;
        ctx.stream.pop_limit(delta);
        if !ok {
            return false;
        }
        mark_present(message, field);
        true
    }
}

/// Buffers an occurrence of a scalar submessage/group field whose sub-table
/// isn't linked: the verbatim wire bytes go into the parent's unknown buffer
/// (so [`promote_unknown`] can find them later by field number) and an empty
/// tagged pointer marks the field present, installed once and shared across
/// further occurrences — proto merges multiple occurrences of a singular
/// embedded-message field by concatenating their bytes and decoding once.
fn decode_unlinked_scalar_submessage(
    ctx: &mut DecodeContext,
    cursor: &mut ReadCursor,
    field: &MiniTableField,
    wire_type: WireType,
    message: &mut Message,
    arena: &mut Arena<'_>,
) -> bool {
    if field.ty == DescriptorType::Group {
        if wire_type != WireType::StartGroup {
            return store_unknown_field(ctx, cursor, field.number, wire_type, message, arena);
        }
        let Some(bytes) = decode_unknown_group_bytes(ctx, cursor, field.number) else {
            return false;
        };
        if !ctx.options.contains(DecodeOptions::DISCARD_UNKNOWN) {
            message.add_unknown(&bytes, arena);
        }
    } else {
        if wire_type != WireType::Delimited {
            return store_unknown_field(ctx, cursor, field.number, wire_type, message, arena);
        }
        if !store_unknown_field(ctx, cursor, field.number, wire_type, message, arena) {
            return false;
        }
    }
    get_or_create_unlinked_marker(message, field, arena);
    mark_present(message, field);
    ctx.saw_unlinked = true;
    true
}

/// Installs an empty tagged pointer at `field`'s slot the first time an
/// unlinked occurrence is seen, so later occurrences of the same scalar
/// field reuse the marker instead of clobbering it.
fn get_or_create_unlinked_marker(message: &mut Message, field: &MiniTableField, arena: &mut Arena<'_>) {
    let bits: usize = unsafe { message.get(field.offset) };
    if TaggedMessagePtr::from_bits(bits).is_some() {
        return;
    }
    let placeholder = crate::minitable::placeholder_table();
    let empty_msg = Message::new(&placeholder, arena);
    let tagged = TaggedMessagePtr::new_empty(empty_msg);
    unsafe { message.set(field.offset, tagged.to_bits()) };
}

/// Reads the tagged pointer at `field`'s slot, creating and installing a new
/// (full) sub-message the first time the field is seen. Only reached once
/// `sub_table` is known to be linked; an unlinked field takes
/// [`decode_unlinked_scalar_submessage`] instead.
fn get_or_create_submessage(
    message: &mut Message,
    field: &MiniTableField,
    sub_table: &Arc<MiniTable>,
    arena: &mut Arena<'_>,
) -> Message {
    let bits: usize = unsafe { message.get(field.offset) };
    if let Some(tagged) = TaggedMessagePtr::from_bits(bits) {
        tagged.message()
    } else {
        let sub_msg = Message::new(sub_table, arena);
        let tagged = TaggedMessagePtr::new_full(sub_msg);
        unsafe { message.set(field.offset, tagged.to_bits()) };
        sub_msg
    }
}

// ---- repeated fields ---------------------------------------------------

fn decode_repeated_field(
    ctx: &mut DecodeContext,
    cursor: &mut ReadCursor,
    field: &MiniTableField,
    wire_type: WireType,
    message: &mut Message,
    mini_table: &MiniTable,
    arena: &mut Arena<'_>,
) -> bool {
    match field.ty {
        DescriptorType::Message | DescriptorType::Group => {
            decode_repeated_submessage(ctx, cursor, field, wire_type, message, mini_table, arena)
        }
        DescriptorType::String | DescriptorType::Bytes => {
            decode_repeated_bytes(ctx, cursor, field, wire_type, message, arena)
        }
        _ => decode_repeated_numeric(ctx, cursor, field, wire_type, message, arena),
    }
}

fn decode_repeated_numeric(
    ctx: &mut DecodeContext,
    cursor: &mut ReadCursor,
    field: &MiniTableField,
    wire_type: WireType,
    message: &mut Message,
    arena: &mut Arena<'_>,
) -> bool {
    let arr = get_or_create_array(message, field.offset, arena);
    if wire_type == WireType::Delimited {
        // Accepted regardless of the field's own `packed` flag (duality).
        let Some(len) = cursor.read_size() else {
            ctx.error = Some(Status::Malformed);
            return false;
        };
        let delta = ctx.stream.push_limit(*cursor, len);
        loop {
            match ctx.stream.is_done(*cursor) {
                DoneState::Done => break,
                DoneState::NeedFallback => match ctx.stream.fallback(*cursor) {
                    Some(c) => {
                        *cursor = c;
                        continue;
                    }
                    None => {
                        ctx.error = Some(Status::Malformed);
                        return false;
                    }
                },
                DoneState::NotDone => {}
            }
            let Some(raw) = decode_numeric_raw(cursor, field.ty) else {
                ctx.error = Some(Status::Malformed);
                return false;
            };
            append_raw_numeric(unsafe { &mut *arr }, field.ty, raw, arena);
        }
        ctx.stream.pop_limit(delta);
    } else if wire_type == field.wire_type_unpacked() {
        let Some(raw) = decode_numeric_raw(cursor, field.ty) else {
            ctx.error = Some(Status::Malformed);
            return false;
        };
        append_raw_numeric(unsafe { &mut *arr }, field.ty, raw, arena);
    } else {
        return store_unknown_field(ctx, cursor, field.number, wire_type, message, arena);
    }
    mark_present(message, field);
    true
}

fn decode_repeated_bytes(
    ctx: &mut DecodeContext,
    cursor: &mut ReadCursor,
    field: &MiniTableField,
    wire_type: WireType,
    message: &mut Message,
    arena: &mut Arena<'_>,
) -> bool {
    if wire_type != WireType::Delimited {
        return store_unknown_field(ctx, cursor, field.number, wire_type, message, arena);
    }
    let Some(len) = cursor.read_size() else {
        ctx.error = Some(Status::Malformed);
        return false;
    };
    let Some(bytes) = read_delimited_bytes(ctx, cursor, len) else {
        return false;
    };
    if field.ty == DescriptorType::String
        && requires_utf8_validation(ctx, field)
        && std::str::from_utf8(&bytes).is_err()
    {
        ctx.error = Some(Status::BadUtf8);
        return false;
    }

    let arr = get_or_create_array(message, field.offset, arena);
    let mut elem = containers::Bytes::new();
    elem.append(&bytes, arena);
    unsafe {
        (*arr).append_raw(&elem as *const containers::Bytes as *const u8, 24, 8, arena);
    }
    mark_present(message, field);
    true
}

fn decode_repeated_submessage(
    ctx: &mut DecodeContext,
    cursor: &mut ReadCursor,
    field: &MiniTableField,
    wire_type: WireType,
    message: &mut Message,
    mini_table: &MiniTable,
    arena: &mut Arena<'_>,
) -> bool {
    let Some(sub_table) = mini_table.get_sub_message_table(field).cloned() else {
        return decode_unlinked_repeated_submessage(ctx, cursor, field, wire_type, message, arena);
    };
    if ctx.depth_remaining == 0 {
        ctx.error = Some(Status::MaxDepthExceeded);
        return false;
    }

    let (ok, sub_msg) = if field.ty == DescriptorType::Group {
        if wire_type != WireType::StartGroup {
            return store_unknown_field(ctx, cursor, field.number, wire_type, message, arena);
        }
        let mut sub_msg = Message::new(&sub_table, arena);
        ctx.depth_remaining -= 1;
        let ok = decode_message(ctx, cursor, &mut sub_msg, &sub_table, Some(field.number), arena);
        ctx.depth_remaining += 1;
        (ok, sub_msg)
    } else {
        if wire_type != WireType::Delimited {
            return store_unknown_field(ctx, cursor, field.number, wire_type, message, arena);
        }
        let Some(len) = cursor.read_size() else {
            ctx.error = Some(Status::Malformed);
            return false;
        };
        let delta = ctx.stream.push_limit(*cursor, len);
        let mut sub_msg = Message::new(&sub_table, arena);
        ctx.depth_remaining -= 1;
        let ok = decode_message(ctx, cursor, &mut sub_msg, &sub_table, None, arena);
        ctx.depth_remaining += 1;
        ctx.stream.pop_limit(delta);
        (ok, sub_msg)
    };
    if !ok {
        return false;
    }

    let arr = get_or_create_array(message, field.offset, arena);
    let tagged = TaggedMessagePtr::new_full(sub_msg);
    unsafe {
        (*arr).append_raw(&tagged as *const TaggedMessagePtr as *const u8, 8, 8, arena);
    }
    mark_present(message, field);
    true
}

/// Buffers an occurrence of a repeated submessage/group field whose
/// sub-table isn't linked: verbatim bytes go to the parent's unknown buffer
/// and a fresh empty tagged pointer is pushed for this occurrence. Unlike
/// the scalar case, each repetition is its own array element, so nothing is
/// merged here — [`promote_repeated_submessage`] fills each slot in
/// encounter order once the sub-table links.
fn decode_unlinked_repeated_submessage(
    ctx: &mut DecodeContext,
    cursor: &mut ReadCursor,
    field: &MiniTableField,
    wire_type: WireType,
    message: &mut Message,
    arena: &mut Arena<'_>,
) -> bool {
    if field.ty == DescriptorType::Group {
        if wire_type != WireType::StartGroup {
            return store_unknown_field(ctx, cursor, field.number, wire_type, message, arena);
        }
        let Some(bytes) = decode_unknown_group_bytes(ctx, cursor, field.number) else {
            return false;
        };
        if !ctx.options.contains(DecodeOptions::DISCARD_UNKNOWN) {
            message.add_unknown(&bytes, arena);
        }
    } else {
        if wire_type != WireType::Delimited {
            return store_unknown_field(ctx, cursor, field.number, wire_type, message, arena);
        }
        if !store_unknown_field(ctx, cursor, field.number, wire_type, message, arena) {
            return false;
        }
    }

    let placeholder = crate::minitable::placeholder_table();
    let empty_msg = Message::new(&placeholder, arena);
    let tagged = TaggedMessagePtr::new_empty(empty_msg);
    let arr = get_or_create_array(message, field.offset, arena);
    unsafe {
        (*arr).append_raw(&tagged as *const TaggedMessagePtr as *const u8, 8, 8, arena);
    }
    mark_present(message, field);
    ctx.saw_unlinked = true;
    true
}

fn get_or_create_array(message: &mut Message, offset: u16, arena: &mut Arena<'_>) -> *mut ArrayHeader {
    let existing: *mut ArrayHeader = unsafe { message.get(offset) };
    if !existing.is_null() {
        return existing;
    }
    let slot: *mut ArrayHeader = arena.alloc();
    unsafe {
        slot.write(ArrayHeader::empty());
        message.set(offset, slot);
    }
    slot
}

// ---- map fields ---------------------------------------------------

/// Raw 8-byte slots for a decoded map entry's key and value, matched in
/// layout to whatever [`ArrayHeader::append_raw`] with `elem_size = 16`
/// expects: two back-to-back `u64`s. Shared with [`crate::encoding`], which
/// reads the same layout back out when serializing map fields.
#[repr(C)]
pub(crate) struct MapEntryPair {
    pub(crate) key: u64,
    pub(crate) value: u64,
}

/// Find-or-insert a map entry by key, against the flat
/// `ArrayHeader<MapEntryPair>` representation map fields actually use
/// (spec.md §4.5's `map_set` primitive). Last-write-wins on a duplicate
/// key, matching proto's map merge semantics.
pub(crate) fn map_set(arr: &mut ArrayHeader, key: u64, value: u64, arena: &mut Arena<'_>) {
    if let Some(slot) = arr.as_slice_mut::<MapEntryPair>().iter_mut().find(|p| p.key == key) {
        slot.value = value;
    } else {
        let pair = MapEntryPair { key, value };
        arr.append_raw(&pair as *const MapEntryPair as *const u8, 16, 8, arena);
    }
}

pub(crate) fn map_get(arr: &ArrayHeader, key: u64) -> Option<u64> {
    arr.as_slice::<MapEntryPair>().iter().find(|p| p.key == key).map(|p| p.value)
}

pub(crate) fn map_next(arr: &ArrayHeader, iter: usize) -> Option<(usize, u64, u64)> {
    arr.as_slice::<MapEntryPair>().get(iter).map(|p| (iter + 1, p.key, p.value))
}

fn decode_map_entry(
    ctx: &mut DecodeContext,
    cursor: &mut ReadCursor,
    field: &MiniTableField,
    wire_type: WireType,
    message: &mut Message,
    mini_table: &MiniTable,
    arena: &mut Arena<'_>,
) -> bool {
    if wire_type != WireType::Delimited {
        return store_unknown_field(ctx, cursor, field.number, wire_type, message, arena);
    }
    let Some(entry_table) = mini_table.get_sub_message_table(field).cloned() else {
        // The flat key/value array representation has no placeholder-entry
        // analog, so an unlinked map field falls back entirely to unknown-
        // byte storage; `promote_unknown` drains and re-decodes it once the
        // entry table links.
        if !store_unknown_field(ctx, cursor, field.number, wire_type, message, arena) {
            return false;
        }
        ctx.saw_unlinked = true;
        return true;
    };
    let Some(len) = cursor.read_size() else {
        ctx.error = Some(Status::Malformed);
        return false;
    };
    if ctx.depth_remaining == 0 {
        ctx.error = Some(Status::MaxDepthExceeded);
        return false;
    }
    let delta = ctx.stream.push_limit(*cursor, len);
    let mut entry_msg = Message::new(&entry_table, arena);
    ctx.depth_remaining -= 1;
    let ok = decode_message(ctx, cursor, &mut entry_msg, &entry_table, None, arena);
    ctx.depth_remaining += 1;
    ctx.stream.pop_limit(delta);
    if !ok {
        return false;
    }

    let key_field = entry_table.find_field_by_number(1).expect("map entry always has a key field");
    let value_field = entry_table
        .find_field_by_number(2)
        .expect("map entry always has a value field");
    let key = read_entry_slot(&entry_msg, key_field, arena);
    let value = read_entry_slot(&entry_msg, value_field, arena);

    let arr = get_or_create_array(message, field.offset, arena);
    unsafe { map_set(&mut *arr, key, value, arena) };
    mark_present(message, field);
    true
}

/// Widens a map-entry key or value into a raw `u64` slot: numeric fields
/// widen their bits directly; message/group fields are already pointer-sized
/// so their natural storage bits are used as-is; string/bytes fields (stored
/// inline at their natural 24-byte representation) are boxed into a fresh
/// arena allocation so an 8-byte pointer can stand in for them.
fn read_entry_slot(msg: &Message, field: &MiniTableField, arena: &mut Arena<'_>) -> u64 {
    match field.ty {
        DescriptorType::String | DescriptorType::Bytes => {
            let src = unsafe { msg.field_ptr(field.offset) } as *const containers::Bytes;
            let inline: containers::Bytes = unsafe { std::ptr::read_unaligned(src) };
            let boxed: *mut containers::Bytes = arena.alloc();
            unsafe { boxed.write(inline) };
            boxed as u64
        }
        DescriptorType::Message | DescriptorType::Group => unsafe { msg.get(field.offset) },
        _ => match field.ty.rep() {
            FieldRep::Rep1Byte => unsafe { msg.get::<u8>(field.offset) as u64 },
            FieldRep::Rep4Byte => unsafe { msg.get::<u32>(field.offset) as u64 },
            FieldRep::Rep8Byte => unsafe { msg.get::<u64>(field.offset) },
            _ => unreachable!("map entry scalar can't have a string/pointer rep"),
        },
    }
}

// ---- numeric raw read/store/append ---------------------------------------------------

fn decode_numeric_raw(cursor: &mut ReadCursor, ty: DescriptorType) -> Option<u64> {
    Some(match ty {
        DescriptorType::Double | DescriptorType::Fixed64 | DescriptorType::SFixed64 => {
            cursor.read_unaligned::<u64>()
        }
        DescriptorType::Float | DescriptorType::Fixed32 | DescriptorType::SFixed32 => {
            cursor.read_unaligned::<u32>() as u64
        }
        DescriptorType::Bool => (cursor.read_varint()? != 0) as u64,
        DescriptorType::Int32 | DescriptorType::UInt32 | DescriptorType::Enum => {
            cursor.read_varint()? as u32 as u64
        }
        DescriptorType::Int64 | DescriptorType::UInt64 => cursor.read_varint()?,
        DescriptorType::SInt32 => {
            let v = zigzag_decode(cursor.read_varint()?);
            (v as i32) as u32 as u64
        }
        DescriptorType::SInt64 => zigzag_decode(cursor.read_varint()?) as u64,
        DescriptorType::String | DescriptorType::Bytes | DescriptorType::Message | DescriptorType::Group => {
            unreachable!("non-numeric type routed through decode_numeric_raw")
        }
    })
}

fn store_raw_numeric(message: &mut Message, offset: u16, ty: DescriptorType, raw: u64) {
    match ty.rep() {
        FieldRep::Rep1Byte => unsafe { message.set::<u8>(offset, raw as u8) },
        FieldRep::Rep4Byte => unsafe { message.set::<u32>(offset, raw as u32) },
        FieldRep::Rep8Byte => unsafe { message.set::<u64>(offset, raw) },
        _ => unreachable!("numeric field can't have a string/pointer rep"),
    }
}

fn append_raw_numeric(arr: &mut ArrayHeader, ty: DescriptorType, raw: u64, arena: &mut Arena<'_>) {
    match ty.rep() {
        FieldRep::Rep1Byte => {
            let v = raw as u8;
            arr.append_raw(&v as *const u8, 1, 1, arena);
        }
        FieldRep::Rep4Byte => {
            let v = raw as u32;
            arr.append_raw(&v as *const u32 as *const u8, 4, 4, arena);
        }
        FieldRep::Rep8Byte => {
            arr.append_raw(&raw as *const u64 as *const u8, 8, 8, arena);
        }
        _ => unreachable!("numeric field can't have a string/pointer rep"),
    }
}

// ---- unknown fields, extensions, message-set legacy encoding ---------------------------------------------------

/// Reads `len` bytes starting at `*cursor`, stepping across chunk/fallback
/// boundaries as needed. Always copies rather than aliasing the input
/// buffer — true zero-copy string aliasing is not implemented (see
/// DESIGN.md).
fn read_delimited_bytes(ctx: &mut DecodeContext, cursor: &mut ReadCursor, len: isize) -> Option<Vec<u8>> {
    if len < 0 {
        ctx.error = Some(Status::Malformed);
        return None;
    }
    let mut out = Vec::with_capacity(len as usize);
    let mut remaining = len;
    while remaining > 0 {
        match ctx.stream.is_done(*cursor) {
            DoneState::Done => {
                ctx.error = Some(Status::Malformed);
                return None;
            }
            DoneState::NeedFallback => match ctx.stream.fallback(*cursor) {
                Some(c) => {
                    *cursor = c;
                    continue;
                }
                None => {
                    ctx.error = Some(Status::Malformed);
                    return None;
                }
            },
            DoneState::NotDone => {}
        }
        let chunk = (SLOP_SIZE as isize).min(remaining);
        out.extend_from_slice(cursor.read_slice(chunk));
        remaining -= chunk;
    }
    Some(out)
}

fn write_varint_to_vec(buf: &mut Vec<u8>, mut n: u64) {
    loop {
        let byte = (n & 0x7f) as u8;
        n >>= 7;
        if n == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

/// Re-serializes one non-group field (tag already consumed) into its
/// verbatim wire bytes, used for both unknown-field and extension storage.
/// Values are re-encoded from what the cursor methods read rather than
/// sliced directly from the input buffer, since a raw byte span can't
/// survive `EpsCopyInputStream::fallback`'s buffer-patching relocation.
fn reserialize_field(
    ctx: &mut DecodeContext,
    cursor: &mut ReadCursor,
    field_number: u32,
    wire_type: WireType,
) -> Option<Vec<u8>> {
    let mut buf = Vec::new();
    let tag = (field_number << 3) | wire_type as u32;
    write_varint_to_vec(&mut buf, tag as u64);
    match wire_type {
        WireType::Varint => {
            let v = cursor.read_varint()?;
            write_varint_to_vec(&mut buf, v);
        }
        WireType::Fixed64 => {
            let v: u64 = cursor.read_unaligned();
            buf.extend_from_slice(&v.to_le_bytes());
        }
        WireType::Fixed32 => {
            let v: u32 = cursor.read_unaligned();
            buf.extend_from_slice(&v.to_le_bytes());
        }
        WireType::Delimited => {
            let len = cursor.read_size()?;
            let bytes = read_delimited_bytes(ctx, cursor, len)?;
            write_varint_to_vec(&mut buf, len as u64);
            buf.extend_from_slice(&bytes);
        }
        WireType::StartGroup | WireType::EndGroup => return None,
    }
    Some(buf)
}

fn store_unknown_field(
    ctx: &mut DecodeContext,
    cursor: &mut ReadCursor,
    field_number: u32,
    wire_type: WireType,
    message: &mut Message,
    arena: &mut Arena<'_>,
) -> bool {
    let Some(bytes) = reserialize_field(ctx, cursor, field_number, wire_type) else {
        return false;
    };
    if !ctx.options.contains(DecodeOptions::DISCARD_UNKNOWN) {
        message.add_unknown(&bytes, arena);
    }
    true
}

fn decode_extension_field(
    ctx: &mut DecodeContext,
    cursor: &mut ReadCursor,
    field_number: u32,
    wire_type: WireType,
    message: &mut Message,
    mini_table: &MiniTable,
    arena: &mut Arena<'_>,
) -> bool {
    let known = ctx
        .extension_registry
        .and_then(|r| r.find(mini_table, field_number))
        .is_some();
    let Some(bytes) = reserialize_field(ctx, cursor, field_number, wire_type) else {
        return false;
    };
    if known {
        message.add_extension(&bytes, arena);
    } else if !ctx.options.contains(DecodeOptions::DISCARD_UNKNOWN) {
        message.add_unknown(&bytes, arena);
    }
    true
}

/// Recursively reconstructs the verbatim wire bytes of an unrecognized group
/// field, including its `StartGroup`/`EndGroup` tags, so it can be stored the
/// same way a scalar unknown field is.
fn decode_unknown_group_bytes(
    ctx: &mut DecodeContext,
    cursor: &mut ReadCursor,
    field_number: u32,
) -> Option<Vec<u8>> {
    if ctx.depth_remaining == 0 {
        ctx.error = Some(Status::MaxDepthExceeded);
        return None;
    }
    ctx.depth_remaining -= 1;
    let result = decode_unknown_group_bytes_inner(ctx, cursor, field_number);
    ctx.depth_remaining += 1;
    result
}

fn decode_unknown_group_bytes_inner(
    ctx: &mut DecodeContext,
    cursor: &mut ReadCursor,
    field_number: u32,
) -> Option<Vec<u8>> {
    let mut buf = Vec::new();
    write_varint_to_vec(&mut buf, ((field_number << 3) | WireType::StartGroup as u32) as u64);
    loop {
        match ctx.stream.is_done(*cursor) {
            DoneState::Done => {
                ctx.error = Some(Status::Malformed);
                return None;
            }
            DoneState::NeedFallback => {
                *cursor = ctx.stream.fallback(*cursor)?;
                continue;
            }
            DoneState::NotDone => {}
        }
        let tag = cursor.read_tag()?;
        let number = tag >> 3;
        let wt = WireType::from_tag(tag)?;
        if wt == WireType::EndGroup {
            if number != field_number {
                ctx.error = Some(Status::Malformed);
                return None;
            }
            write_varint_to_vec(&mut buf, ((field_number << 3) | WireType::EndGroup as u32) as u64);
            return Some(buf);
        }
        if wt == WireType::StartGroup {
            let nested = decode_unknown_group_bytes(ctx, cursor, number)?;
            buf.extend_from_slice(&nested);
        } else {
            let field_bytes = reserialize_field(ctx, cursor, number, wt)?;
            buf.extend_from_slice(&field_bytes);
        }
    }
}

/// Parses a legacy `proto2` message-set group item (field 1 = `type_id`,
/// field 3 = `message`) and re-stores it as a synthetic extension entry
/// keyed on `type_id`, matching how a normal extension field would be
/// recorded.
fn decode_message_set_item(
    ctx: &mut DecodeContext,
    cursor: &mut ReadCursor,
    group_number: u32,
    message: &mut Message,
    mini_table: &MiniTable,
    arena: &mut Arena<'_>,
) -> bool {
    if ctx.depth_remaining == 0 {
        ctx.error = Some(Status::MaxDepthExceeded);
        return false;
    }
    ctx.depth_remaining -= 1;
    let mut type_id: Option<u32> = None;
    let mut payload: Option<Vec<u8>> = None;

    let ok = 'outer: loop {
        match ctx.stream.is_done(*cursor) {
            DoneState::Done => {
                ctx.error = Some(Status::Malformed);
                break 'outer false;
            }
            DoneState::NeedFallback => match ctx.stream.fallback(*cursor) {
                Some(c) => {
                    *cursor = c;
                    continue;
                }
                None => {
                    ctx.error = Some(Status::Malformed);
                    break 'outer false;
                }
            },
            DoneState::NotDone => {}
        }
        let Some(tag) = cursor.read_tag() else {
            ctx.error = Some(Status::Malformed);
            break 'outer false;
        };
        let number = tag >> 3;
        let Some(wt) = WireType::from_tag(tag) else {
            ctx.error = Some(Status::Malformed);
            break 'outer false;
        };
        if wt == WireType::EndGroup {
            if number == group_number {
                break 'outer true;
            }
            ctx.error = Some(Status::Malformed);
            break 'outer false;
        }
        match (number, wt) {
            (1, WireType::Varint) => {
                let Some(v) = cursor.read_varint() else {
                    ctx.error = Some(Status::Malformed);
                    break 'outer false;
                };
                type_id = Some(v as u32);
            }
            (3, WireType::Delimited) => {
                let Some(len) = cursor.read_size() else {
                    ctx.error = Some(Status::Malformed);
                    break 'outer false;
                };
                let Some(bytes) = read_delimited_bytes(ctx, cursor, len) else {
                    break 'outer false;
                };
                payload = Some(bytes);
            }
            _ if wt == WireType::StartGroup => {
                if decode_unknown_group_bytes(ctx, cursor, number).is_none() {
                    break 'outer false;
                }
            }
            _ => {
                if reserialize_field(ctx, cursor, number, wt).is_none() {
                    break 'outer false;
                }
            }
        }
    };
    ctx.depth_remaining += 1;
    if !ok {
        return false;
    }

    if let (Some(type_id), Some(payload)) = (type_id, payload) {
        let mut buf = Vec::new();
        write_varint_to_vec(&mut buf, ((type_id << 3) | WireType::Delimited as u32) as u64);
        write_varint_to_vec(&mut buf, payload.len() as u64);
        buf.extend_from_slice(&payload);

        let known = ctx
            .extension_registry
            .and_then(|r| r.find(mini_table, type_id))
            .is_some();
        if known {
            message.add_extension(&buf, arena);
        } else if !ctx.options.contains(DecodeOptions::DISCARD_UNKNOWN) {
            message.add_unknown(&buf, arena);
        }
    }
    true
}

pub(crate) fn check_required(message: &Message, mini_table: &MiniTable) -> bool {
    mini_table
        .fields
        .iter()
        .filter(|f| f.mode.presence_kind == PresenceKind::Required)
        .all(|f| message.has_field(f))
}

// ---- promotion ---------------------------------------------------

/// Pulls every buffered occurrence of `field_number` out of `message`'s
/// generic unknown-byte region, in encounter order, removing each entry as
/// it's found. Returned values are the bare payload bytes `find_field_entry`
/// already stripped of tag/length/group wrapper.
fn drain_unknown_entries(message: &mut Message, field_number: u32) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        let found = {
            let bytes = message.unknown_bytes();
            find_field_entry(bytes, field_number).map(|(entry_range, value_range)| (entry_range, bytes[value_range].to_vec()))
        };
        let Some((entry_range, value)) = found else {
            break;
        };
        out.push(value);
        message.remove_unknown_range(entry_range.start, entry_range.len());
    }
    out
}

/// Re-homes buffered occurrences of `field` out of `message`'s unknown-byte
/// region into their proper typed storage now that `mini_table` resolves its
/// sub-table. A no-op, and idempotent, once there's nothing left to
/// promote: re-running it after a prior successful promotion finds no more
/// matching unknown entries and returns `Status::Ok` unchanged.
pub fn promote_unknown(
    message: &mut Message,
    mini_table: &MiniTable,
    field: &MiniTableField,
    options: DecodeOptions,
    arena: &mut Arena<'_>,
) -> Status {
    if field.ty != DescriptorType::Message && field.ty != DescriptorType::Group {
        return Status::Ok;
    }
    let Some(sub_table) = mini_table.get_sub_message_table(field).cloned() else {
        return Status::Unlinked;
    };
    match field.mode.cardinality {
        Cardinality::Scalar => promote_scalar_submessage(message, field, &sub_table, options, arena),
        Cardinality::Repeated => promote_repeated_submessage(message, field, &sub_table, options, arena),
        Cardinality::Map => promote_map_field(message, field, &sub_table, options, arena),
    }
}

/// Concatenates every buffered occurrence (proto's merge-by-concatenation
/// rule for a singular embedded-message field) and decodes the result once.
fn promote_scalar_submessage(
    message: &mut Message,
    field: &MiniTableField,
    sub_table: &Arc<MiniTable>,
    options: DecodeOptions,
    arena: &mut Arena<'_>,
) -> Status {
    let buffered = drain_unknown_entries(message, field.number);
    if buffered.is_empty() {
        return Status::Ok;
    }
    let mut concatenated = Vec::new();
    for chunk in &buffered {
        concatenated.extend_from_slice(chunk);
    }
    let mut sub_msg = Message::new(sub_table, arena);
    let status = decode(&concatenated, &mut sub_msg, sub_table, None, options, arena);
    if !status.is_ok() {
        return status;
    }
    let tagged = TaggedMessagePtr::new_full(sub_msg);
    unsafe { message.set(field.offset, tagged.to_bits()) };
    Status::Ok
}

/// Decodes each buffered occurrence independently and fills it into the
/// next still-empty array slot, in the order both were produced — matching
/// decode's own append order for the repeated field.
fn promote_repeated_submessage(
    message: &mut Message,
    field: &MiniTableField,
    sub_table: &Arc<MiniTable>,
    options: DecodeOptions,
    arena: &mut Arena<'_>,
) -> Status {
    let buffered = drain_unknown_entries(message, field.number);
    if buffered.is_empty() {
        return Status::Ok;
    }
    let arr: *mut ArrayHeader = unsafe { message.get(field.offset) };
    if arr.is_null() {
        return Status::Ok;
    }
    let mut buffered = buffered.into_iter();
    for slot in unsafe { (*arr).as_slice_mut::<TaggedMessagePtr>() } {
        if !slot.is_empty() {
            continue;
        }
        let Some(bytes) = buffered.next() else {
            break;
        };
        let mut sub_msg = Message::new(sub_table, arena);
        let status = decode(&bytes, &mut sub_msg, sub_table, None, options, arena);
        if !status.is_ok() {
            return status;
        }
        *slot = TaggedMessagePtr::new_full(sub_msg);
    }
    Status::Ok
}

/// Decodes each buffered map entry independently and folds it into the real
/// map array via [`map_set`] — unlinked map occurrences never get a
/// placeholder marker, so everything comes from the unknown-byte buffer.
fn promote_map_field(
    message: &mut Message,
    field: &MiniTableField,
    entry_table: &Arc<MiniTable>,
    options: DecodeOptions,
    arena: &mut Arena<'_>,
) -> Status {
    let buffered = drain_unknown_entries(message, field.number);
    if buffered.is_empty() {
        return Status::Ok;
    }
    let key_field = entry_table.find_field_by_number(1).expect("map entry always has a key field");
    let value_field = entry_table.find_field_by_number(2).expect("map entry always has a value field");
    let arr = get_or_create_array(message, field.offset, arena);
    for bytes in buffered {
        let mut entry_msg = Message::new(entry_table, arena);
        let status = decode(&bytes, &mut entry_msg, entry_table, None, options, arena);
        if !status.is_ok() {
            return status;
        }
        let key = read_entry_slot(&entry_msg, key_field, arena);
        let value = read_entry_slot(&entry_msg, value_field, arena);
        unsafe { map_set(&mut *arr, key, value, arena) };
    }
    Status::Ok
}

/// Re-homes a buffered unknown extension entry into `message`'s extension
/// region now that `ext` is recognized by the caller. A no-op if nothing
/// buffered matches `ext.field.number`.
pub fn promote_extension(message: &mut Message, ext: &MiniTableExtension, arena: &mut Arena<'_>) -> Status {
    let found = {
        let bytes = message.unknown_bytes();
        find_field_entry(bytes, ext.field.number).map(|(entry_range, _)| (entry_range.clone(), bytes[entry_range].to_vec()))
    };
    let Some((entry_range, verbatim)) = found else {
        return Status::Ok;
    };
    message.remove_unknown_range(entry_range.start, entry_range.len());
    message.add_extension(&verbatim, arena);
    Status::Ok
}
