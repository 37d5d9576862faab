//! Runtime type descriptors (`MiniTable`) and the textual mini-descriptor
//! encoding they're built from.
//!
//! A mini-descriptor is a compact, printable-ASCII serialization of a
//! message's shape: field numbers, types, modifiers, and oneof membership.
//! [`MiniTable::build`] turns one into the dense, offset-assigned runtime
//! table the decoder and encoder dispatch against.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use crate::wire::{DescriptorType, FieldRep, WireType};

/// Size in bytes of the internal header that precedes every message's
/// user-visible field region: a nullable pointer to the extension+unknown
/// block plus two u32 lengths, 8-byte aligned.
pub const MESSAGE_HEADER_SIZE: u16 = 16;

/// The alphabet mini-descriptors are drawn from: the 92 printable bytes
/// `'!'..='|'`. `token_value` maps a byte back to `0..=91`.
const ALPHABET_START: u8 = b'!';
const ALPHABET_LEN: u8 = 92;

fn token_value(b: u8) -> Option<u8> {
    let v = b.checked_sub(ALPHABET_START)?;
    if v < ALPHABET_LEN { Some(v) } else { None }
}

const TOKEN_END_OF_FIELDS: u8 = 36;
const TOKEN_SKIP_PREFIX: u8 = 37;
const TOKEN_MODIFIER_PREFIX: u8 = 38;
const TOKEN_ONEOF_FIELD_SEP: u8 = 39;
const TOKEN_ONEOF_GROUP_SEP: u8 = 40;
const DIGIT_BASE: u8 = 41;
const DIGIT_CONTINUE: u8 = 50;

const MOD_DEFAULT_PACKED: u32 = 1 << 0;
const MOD_PROTO3_SINGULAR: u32 = 1 << 1;
const MOD_VALIDATE_UTF8: u32 = 1 << 2;
const MOD_REQUIRED: u32 = 1 << 3;
const MOD_EXTENDABLE: u32 = 1 << 4;
const MOD_FLIP_PACKED: u32 = 1 << 5;

/// Extension-mode flag recorded on a [`MiniTable`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ExtensionMode {
    NonExtendable,
    Extendable,
    IsMessageSet,
    IsMapEntry,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Cardinality {
    Scalar,
    Repeated,
    Map,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PresenceKind {
    Implicit,
    Explicit,
    Oneof,
    Required,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FieldMode {
    pub cardinality: Cardinality,
    pub presence_kind: PresenceKind,
    pub packed: bool,
    pub is_extension: bool,
    pub alternate_type: bool,
    /// MOD_VALIDATE_UTF8: string fields must reject non-UTF-8 bytes at
    /// decode time instead of accepting them (proto2 `string` fields leave
    /// this unset and tolerate invalid bytes, matching their "bytes with a
    /// string-typed accessor" semantics).
    pub validate_utf8: bool,
}

/// The three meanings a field's presence token carries, distinguished by
/// which variant is populated rather than by sign bit (spec.md's C-oriented
/// packed encoding isn't needed in Rust).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Presence {
    None,
    /// Global bit index into the message's hasbit region.
    Hasbit(u16),
    /// Byte offset of this field's oneof's 4-byte case word.
    OneofCaseOffset(u16),
}

#[derive(Clone, Debug)]
pub struct MiniTableField {
    pub number: u32,
    pub ty: DescriptorType,
    pub mode: FieldMode,
    /// In-message byte offset of this field's value storage.
    pub offset: u16,
    pub presence: Presence,
    /// Index into the parent `MiniTable::subs` array, for submessage/enum
    /// fields.
    pub submsg_index: Option<u16>,
}

impl MiniTableField {
    pub fn is_packable(&self) -> bool {
        self.mode.cardinality != Cardinality::Scalar && self.ty.is_packable()
    }

    pub fn wire_type_unpacked(&self) -> WireType {
        self.ty.wire_type_unpacked()
    }
}

/// Tagged reference to either a child message table or a closed enum's
/// declared value set. `Unlinked` fills a sub slot whose real table isn't
/// available to the builder yet (a forward-declared or not-yet-generated
/// type); fields pointing at it decode as far as possible and come back
/// `Status::Unlinked`, per spec.md's error taxonomy.
#[derive(Clone)]
pub enum MiniTableSub {
    Message(Arc<MiniTable>),
    Enum(Arc<EnumMiniTable>),
    Unlinked,
}

/// The closed set of values declared for a proto2 enum. Decoding always
/// stores the raw `int32` regardless (proto3 open-enum semantics); this
/// table exists only to answer `is_closed`/validity questions.
#[derive(Clone, Debug)]
pub struct EnumMiniTable {
    pub values: Box<[i32]>,
}

impl EnumMiniTable {
    pub fn is_valid(&self, v: i32) -> bool {
        self.values.contains(&v)
    }
}

/// Immutable description of a message type.
pub struct MiniTable {
    pub fields: Box<[MiniTableField]>,
    pub subs: Box<[MiniTableSub]>,
    pub size: u16,
    /// Count of leading fields (by sorted position) packed densely by field
    /// number starting at 1: `fields[i].number == i + 1` for `i <
    /// dense_below`.
    pub dense_below: u16,
    /// Precomputed for a future fast dispatch table; not consulted by the
    /// decoder unless the `fasttable` feature's hook is wired up.
    pub table_mask: u32,
    pub required_count: u16,
    pub ext: ExtensionMode,
}

// Safety: a built MiniTable (and the Arc<MiniTable>/Arc<EnumMiniTable> trees
// it owns) is never mutated after `build` returns, so sharing it across
// threads is sound.
unsafe impl Send for MiniTable {}
unsafe impl Sync for MiniTable {}

impl MiniTable {
    /// Exhaustive linear scan specialized for `dense_below`: numbers at or
    /// below it sit at `number - 1`.
    pub fn find_field_by_number(&self, number: u32) -> Option<&MiniTableField> {
        if number >= 1 && number as u16 <= self.dense_below {
            let field = &self.fields[(number - 1) as usize];
            if field.number == number {
                return Some(field);
            }
        }
        self.fields.iter().find(|f| f.number == number)
    }

    pub fn get_sub_message_table(&self, field: &MiniTableField) -> Option<&Arc<MiniTable>> {
        let idx = field.submsg_index?;
        match &self.subs[idx as usize] {
            MiniTableSub::Message(m) => Some(m),
            MiniTableSub::Enum(_) | MiniTableSub::Unlinked => None,
        }
    }

    pub fn get_sub_enum(&self, field: &MiniTableField) -> Option<&Arc<EnumMiniTable>> {
        let idx = field.submsg_index?;
        match &self.subs[idx as usize] {
            MiniTableSub::Enum(e) => Some(e),
            MiniTableSub::Message(_) | MiniTableSub::Unlinked => None,
        }
    }

    pub fn is_map_entry(&self) -> bool {
        self.ext == ExtensionMode::IsMapEntry
    }

    pub fn is_extendable(&self) -> bool {
        matches!(self.ext, ExtensionMode::Extendable | ExtensionMode::IsMessageSet)
    }
}

/// The fieldless table backing every empty [`crate::message::TaggedMessagePtr`]
/// created for an unlinked submessage/group field — a shared placeholder
/// rather than one built per occurrence, since its only job is to give
/// [`crate::message::Message::new`] a size/layout to allocate against.
pub(crate) fn placeholder_table() -> Arc<MiniTable> {
    static TABLE: OnceLock<Arc<MiniTable>> = OnceLock::new();
    TABLE.get_or_init(|| MiniTable::build("!E", vec![]).unwrap()).clone()
}

/// A field living outside its extendee's dense field array, looked up by
/// `(extendee, number)` at decode time.
pub struct MiniTableExtension {
    pub field: MiniTableField,
    pub extendee: Arc<MiniTable>,
    pub sub: Option<MiniTableSub>,
}

/// Extensions known to a decoder invocation, looked up by `(extendee,
/// field number)`. Unlike a message's own dense field array, this is just a
/// flat list handed in by the caller (generated code registers every
/// extension it links against); linear scan is fine at the scale extensions
/// appear in practice.
#[derive(Default)]
pub struct ExtensionRegistry {
    extensions: Vec<Arc<MiniTableExtension>>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        ExtensionRegistry::default()
    }

    pub fn register(&mut self, ext: Arc<MiniTableExtension>) {
        self.extensions.push(ext);
    }

    pub fn find(&self, extendee: &MiniTable, number: u32) -> Option<&Arc<MiniTableExtension>> {
        self.extensions
            .iter()
            .find(|e| std::ptr::eq(e.extendee.as_ref(), extendee) && e.field.number == number)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum MiniTableError {
    Empty,
    UnknownVersionTag(u8),
    Truncated,
    InvalidToken(u8),
    SubsCountMismatch { expected: usize, got: usize },
    MessageTooLarge,
    InvalidMapEntry,
    InvalidPacked,
}

impl std::fmt::Display for MiniTableError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MiniTableError::Empty => write!(f, "empty mini-descriptor"),
            MiniTableError::UnknownVersionTag(b) => write!(f, "unknown version tag {b:#x}"),
            MiniTableError::Truncated => write!(f, "truncated mini-descriptor"),
            MiniTableError::InvalidToken(b) => write!(f, "invalid token byte {b:#x}"),
            MiniTableError::SubsCountMismatch { expected, got } => write!(
                f,
                "expected {expected} sub-table(s), got {got}"
            ),
            MiniTableError::MessageTooLarge => write!(f, "message size exceeds 65535 bytes"),
            MiniTableError::InvalidMapEntry => write!(f, "invalid map-entry shape"),
            MiniTableError::InvalidPacked => write!(f, "packed modifier on unpackable type"),
        }
    }
}

impl std::error::Error for MiniTableError {}

/// A field as parsed, before sorting and offset assignment.
struct ParsedField {
    number: u32,
    ty: DescriptorType,
    cardinality: Cardinality,
    packed: bool,
    required: bool,
    validate_utf8: bool,
    alternate_type: bool,
    oneof_group: Option<u32>,
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn next_byte(&mut self) -> Option<u8> {
        let b = *self.bytes.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn peek_token(&self) -> Option<u8> {
        token_value(*self.bytes.get(self.pos)?)
    }

    /// Reads a base-92 digit varint (tokens `41..=91`).
    fn read_varint(&mut self) -> Result<u32, MiniTableError> {
        let mut acc = 0u32;
        loop {
            let b = self.next_byte().ok_or(MiniTableError::Truncated)?;
            let v = token_value(b).ok_or(MiniTableError::InvalidToken(b))?;
            if !(DIGIT_BASE..DIGIT_BASE + 51).contains(&v) {
                return Err(MiniTableError::InvalidToken(b));
            }
            let digit = v - DIGIT_BASE;
            acc += digit as u32;
            if digit != DIGIT_CONTINUE - DIGIT_BASE {
                return Ok(acc);
            }
        }
    }
}

impl MiniTable {
    /// Parses `descriptor` and assigns `subs` (one entry per submessage/enum
    /// field, in encounter order) to build a fully offset-resolved table.
    pub fn build(
        descriptor: &str,
        subs: Vec<MiniTableSub>,
    ) -> Result<Arc<MiniTable>, MiniTableError> {
        let bytes = descriptor.as_bytes();
        if bytes.is_empty() {
            return Err(MiniTableError::Empty);
        }
        let mut ext = match bytes[0] {
            b'!' => ExtensionMode::NonExtendable,
            b'"' => ExtensionMode::IsMapEntry,
            b'#' => ExtensionMode::IsMessageSet,
            b'$' => ExtensionMode::Extendable,
            other => return Err(MiniTableError::UnknownVersionTag(other)),
        };

        let mut parser = Parser { bytes, pos: 1 };
        let mut fields: Vec<ParsedField> = Vec::with_capacity(bytes.len());
        let mut next_number: u32 = 1;
        let mut saw_field = false;

        loop {
            let Some(token) = parser.peek_token() else {
                return Err(MiniTableError::Truncated);
            };
            match token {
                t if t <= 35 => {
                    parser.pos += 1;
                    let (ty_idx, cardinality) = if t <= 17 {
                        (t, Cardinality::Scalar)
                    } else {
                        (t - 18, Cardinality::Repeated)
                    };
                    let ty = DescriptorType::from_index(ty_idx)
                        .ok_or(MiniTableError::InvalidToken(t))?;
                    fields.push(ParsedField {
                        number: next_number,
                        ty,
                        cardinality,
                        packed: ty.is_packable() && cardinality == Cardinality::Repeated,
                        required: false,
                        validate_utf8: false,
                        alternate_type: false,
                        oneof_group: None,
                    });
                    next_number += 1;
                    saw_field = true;
                }
                TOKEN_SKIP_PREFIX => {
                    parser.pos += 1;
                    let n = parser.read_varint()?;
                    next_number += n;
                }
                TOKEN_MODIFIER_PREFIX => {
                    parser.pos += 1;
                    let bits = parser.read_varint()?;
                    if !saw_field {
                        if bits & MOD_EXTENDABLE != 0 && ext == ExtensionMode::NonExtendable {
                            ext = ExtensionMode::Extendable;
                        }
                    } else {
                        let field = fields.last_mut().unwrap();
                        if bits & MOD_FLIP_PACKED != 0 {
                            field.packed = !field.packed;
                        } else if bits & MOD_DEFAULT_PACKED != 0 {
                            field.packed = true;
                        }
                        if bits & MOD_PROTO3_SINGULAR != 0 {
                            field.alternate_type = true;
                        }
                        if bits & MOD_VALIDATE_UTF8 != 0 {
                            field.validate_utf8 = true;
                        }
                        if bits & MOD_REQUIRED != 0 {
                            field.required = true;
                        }
                        if field.packed && !field.ty.is_packable() {
                            return Err(MiniTableError::InvalidPacked);
                        }
                    }
                }
                TOKEN_END_OF_FIELDS => {
                    parser.pos += 1;
                    break;
                }
                _ => {
                    let b = parser.next_byte().ok_or(MiniTableError::Truncated)?;
                    return Err(MiniTableError::InvalidToken(b));
                }
            }
        }

        // Oneof groups: sequences of field-number varints, field-separator
        // within a group, group-separator between groups, until input ends.
        let mut oneof_id: u32 = 0;
        if parser.pos < bytes.len() {
            loop {
                let number = parser.read_varint()?;
                if let Some(f) = fields.iter_mut().find(|f| f.number == number) {
                    f.oneof_group = Some(oneof_id);
                }
                match parser.next_byte() {
                    None => break,
                    Some(b) => {
                        let t = token_value(b).ok_or(MiniTableError::InvalidToken(b))?;
                        if t == TOKEN_ONEOF_GROUP_SEP {
                            oneof_id += 1;
                        } else if t != TOKEN_ONEOF_FIELD_SEP {
                            return Err(MiniTableError::InvalidToken(b));
                        }
                    }
                }
            }
        }

        // Step 5: count submessage/enum fields in encounter order, assign
        // subs indices.
        let mut submsg_count: u16 = 0;
        let mut subenum_count: u16 = 0;
        let mut provisional: Vec<Option<u16>> = vec![None; fields.len()];
        for (i, f) in fields.iter().enumerate() {
            match f.ty {
                DescriptorType::Message | DescriptorType::Group => {
                    provisional[i] = Some(submsg_count);
                    submsg_count += 1;
                }
                DescriptorType::Enum => {
                    provisional[i] = Some(subenum_count);
                    subenum_count += 1;
                }
                _ => {}
            }
        }
        let total_subs = submsg_count as usize + subenum_count as usize;
        if subs.len() != total_subs {
            return Err(MiniTableError::SubsCountMismatch {
                expected: total_subs,
                got: subs.len(),
            });
        }
        for (i, f) in fields.iter().enumerate() {
            if f.ty == DescriptorType::Enum {
                if let Some(idx) = provisional[i] {
                    provisional[i] = Some(submsg_count + idx);
                }
            }
        }

        // Build MiniTableField list (still in encounter order) then sort.
        let mut built: Vec<MiniTableField> = fields
            .iter()
            .zip(provisional.iter())
            .map(|(f, sub_idx)| {
                // A repeated message field whose sub-table is itself a
                // map-entry shape (built with the `"` version tag) is a map,
                // not a plain repeated submessage.
                let cardinality = if f.cardinality == Cardinality::Repeated
                    && f.ty == DescriptorType::Message
                    && sub_idx
                        .and_then(|idx| subs.get(idx as usize))
                        .is_some_and(|sub| matches!(sub, MiniTableSub::Message(m) if m.is_map_entry()))
                {
                    Cardinality::Map
                } else {
                    f.cardinality
                };
                let presence_kind = if f.oneof_group.is_some() {
                    PresenceKind::Oneof
                } else if f.required {
                    PresenceKind::Required
                } else if cardinality != Cardinality::Scalar {
                    PresenceKind::Implicit
                } else if f.ty == DescriptorType::Message || f.ty == DescriptorType::Group {
                    PresenceKind::Explicit
                } else if f.alternate_type {
                    // is-proto3-singular modifier: implicit presence.
                    PresenceKind::Implicit
                } else {
                    PresenceKind::Explicit
                };
                MiniTableField {
                    number: f.number,
                    ty: f.ty,
                    mode: FieldMode {
                        cardinality,
                        presence_kind,
                        packed: f.packed,
                        is_extension: false,
                        alternate_type: f.alternate_type,
                        validate_utf8: f.validate_utf8,
                    },
                    offset: 0,
                    presence: match f.oneof_group {
                        Some(g) => Presence::OneofCaseOffset(g as u16), // temp: holds group id
                        None => Presence::None,
                    },
                    submsg_index: *sub_idx,
                }
            })
            .collect();

        // Step 6: sort required-first, then by field number ascending.
        built.sort_by(|a, b| {
            let a_req = a.mode.presence_kind == PresenceKind::Required;
            let b_req = b.mode.presence_kind == PresenceKind::Required;
            b_req.cmp(&a_req).then(a.number.cmp(&b.number))
        });
        let required_count = built
            .iter()
            .filter(|f| f.mode.presence_kind == PresenceKind::Required)
            .count() as u16;

        // Step 7: hasbits, oneof case words, field storage offsets.
        let mut hasbit_count: u16 = 0;
        let mut oneof_case_offsets: HashMap<u16, u16> = HashMap::new();
        let mut oneof_order: Vec<u16> = Vec::new();
        for f in &built {
            match f.presence {
                Presence::OneofCaseOffset(group_id) => {
                    if !oneof_case_offsets.contains_key(&group_id) {
                        oneof_case_offsets.insert(group_id, oneof_order.len() as u16);
                        oneof_order.push(group_id);
                    }
                }
                _ => {
                    if matches!(
                        f.mode.presence_kind,
                        PresenceKind::Explicit | PresenceKind::Required
                    ) {
                        hasbit_count += 1;
                    }
                }
            }
        }
        let hasbit_bytes = hasbit_count.div_ceil(8);
        let after_hasbits = align_up(MESSAGE_HEADER_SIZE + hasbit_bytes, 4);
        let case_word_base = after_hasbits;
        let oneof_count = oneof_order.len() as u16;
        let mut msg_size: u32 = (case_word_base as u32) + (oneof_count as u32) * 4;

        let mut hasbit_idx: u16 = 0;
        for f in &mut built {
            match f.presence {
                Presence::OneofCaseOffset(group_id) => {
                    let slot = oneof_case_offsets[&group_id];
                    f.presence = Presence::OneofCaseOffset(case_word_base + slot * 4);
                }
                _ => {
                    if matches!(
                        f.mode.presence_kind,
                        PresenceKind::Explicit | PresenceKind::Required
                    ) {
                        f.presence = Presence::Hasbit(hasbit_idx);
                        hasbit_idx += 1;
                    }
                }
            }
        }

        let mut oneof_value_offset: HashMap<u16, u16> = HashMap::new();
        for rep in FieldRep::ROUNDS {
            for f in &mut built {
                if assignment_rep(f) != rep {
                    continue;
                }
                if let Presence::OneofCaseOffset(case_offset) = f.presence {
                    if let Some(&off) = oneof_value_offset.get(&case_offset) {
                        f.offset = off;
                        continue;
                    }
                    let (size, align) = rep.size_align();
                    msg_size = align_up32(msg_size, align);
                    f.offset = msg_size as u16;
                    oneof_value_offset.insert(case_offset, f.offset);
                    msg_size += size;
                } else {
                    let (size, align) = rep.size_align();
                    msg_size = align_up32(msg_size, align);
                    f.offset = msg_size as u16;
                    msg_size += size;
                }
            }
        }
        msg_size = align_up32(msg_size, 8);
        if msg_size > u16::MAX as u32 {
            return Err(MiniTableError::MessageTooLarge);
        }

        if ext == ExtensionMode::IsMapEntry {
            if built.len() != 2 || built[0].number != 1 || built[1].number != 2 {
                return Err(MiniTableError::InvalidMapEntry);
            }
            if matches!(built[0].ty, DescriptorType::Group | DescriptorType::Message) {
                return Err(MiniTableError::InvalidMapEntry);
            }
        }

        let dense_below = built
            .iter()
            .enumerate()
            .take_while(|(i, f)| f.number == *i as u32 + 1)
            .count() as u16;

        let table_mask = (built.len().next_power_of_two().max(1) - 1) as u32 & 0xff;

        Ok(Arc::new(MiniTable {
            fields: built.into_boxed_slice(),
            subs: subs.into_boxed_slice(),
            size: msg_size as u16,
            dense_below,
            table_mask,
            required_count,
            ext,
        }))
    }
}

/// The storage rep used for *assignment* purposes: repeated/map fields and
/// oneof members all occupy a uniform pointer-sized slot (an array/map
/// header pointer, or a oneof union arm wide enough for any member type),
/// regardless of their declared descriptor type's natural rep.
fn assignment_rep(f: &MiniTableField) -> FieldRep {
    if f.mode.presence_kind == PresenceKind::Oneof || f.mode.cardinality != Cardinality::Scalar {
        FieldRep::RepPointer
    } else {
        f.ty.rep()
    }
}

fn align_up(v: u16, align: u16) -> u16 {
    (v + align - 1) & !(align - 1)
}

fn align_up32(v: u32, align: u32) -> u32 {
    (v + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalar_token(ty: DescriptorType) -> char {
        (b'!' + ty.index()) as char
    }

    #[test]
    fn builds_simple_scalar_message() {
        // "!" version tag, one scalar int32 field, end-of-fields (token 36,
        // byte '!' + 36 = 'E').
        let descriptor = format!("!{}E", scalar_token(DescriptorType::Int32));
        let table = MiniTable::build(&descriptor, vec![]).unwrap();
        assert_eq!(table.fields.len(), 1);
        assert_eq!(table.fields[0].number, 1);
        assert_eq!(table.fields[0].ty, DescriptorType::Int32);
    }

    #[test]
    fn rejects_unknown_version_tag() {
        let err = MiniTable::build("Z", vec![]).unwrap_err();
        assert_eq!(err, MiniTableError::UnknownVersionTag(b'Z'));
    }

    #[test]
    fn rejects_wrong_subs_count() {
        // One message-typed field (token index 10) needs exactly one sub.
        let descriptor = format!("!{}E", scalar_token(DescriptorType::Message));
        let err = MiniTable::build(&descriptor, vec![]).unwrap_err();
        assert_eq!(
            err,
            MiniTableError::SubsCountMismatch {
                expected: 1,
                got: 0
            }
        );
    }

    #[test]
    fn map_entry_requires_two_fields() {
        let descriptor = format!(
            "\"{}{}E",
            scalar_token(DescriptorType::String),
            scalar_token(DescriptorType::Int32)
        );
        let table = MiniTable::build(&descriptor, vec![]).unwrap();
        assert!(table.is_map_entry());
        assert_eq!(table.fields.len(), 2);
    }

    #[test]
    fn repeated_message_field_over_a_map_entry_sub_table_is_classified_as_map() {
        fn repeated_token(ty: DescriptorType) -> char {
            (b'!' + 18 + ty.index()) as char
        }

        let entry_descriptor = format!(
            "\"{}{}E",
            scalar_token(DescriptorType::String),
            scalar_token(DescriptorType::Int32)
        );
        let entry = MiniTable::build(&entry_descriptor, vec![]).unwrap();

        let outer_descriptor = format!("!{}E", repeated_token(DescriptorType::Message));
        let outer = MiniTable::build(&outer_descriptor, vec![MiniTableSub::Message(entry)]).unwrap();

        let field = outer.find_field_by_number(1).unwrap();
        assert_eq!(field.mode.cardinality, Cardinality::Map);
    }

    #[test]
    fn unlinked_sub_resolves_to_neither_message_nor_enum() {
        let descriptor = format!("!{}E", scalar_token(DescriptorType::Message));
        let table = MiniTable::build(&descriptor, vec![MiniTableSub::Unlinked]).unwrap();
        let field = table.find_field_by_number(1).unwrap();
        assert!(table.get_sub_message_table(field).is_none());
        assert!(table.get_sub_enum(field).is_none());
    }

    #[test]
    fn placeholder_table_is_memoized_and_fieldless() {
        let a = placeholder_table();
        let b = placeholder_table();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.fields.len(), 0);
    }

    #[test]
    fn dense_below_counts_leading_contiguous_numbers() {
        let descriptor = format!(
            "!{}{}E",
            scalar_token(DescriptorType::Int32),
            scalar_token(DescriptorType::Int32)
        );
        let table = MiniTable::build(&descriptor, vec![]).unwrap();
        assert_eq!(table.dense_below, 2);
        assert!(table.find_field_by_number(1).is_some());
        assert!(table.find_field_by_number(2).is_some());
        assert!(table.find_field_by_number(3).is_none());
    }
}
