//! Journal record model.
//!
//! A journal record is keyed by a three-part **journal key** — a strictly
//! increasing sequence number ([`Sqn`]), a record kind, and an opaque ledger
//! key — and carries opaque value bytes. The serialized key bytes double as
//! the hash input for the segment hash index, so the wire format here is
//! byte-stable by construction (see [`crate::encoding`]).
//!
//! # Key wire format
//!
//! ```text
//! [u64 sqn LE][4B kind tag][4B key tag][u32 len LE][ledger key bytes]
//! ```
//!
//! Kind tags are `b"stnd"` (standard value), `b"tomb"` (tombstone) and
//! `b"keyd"` (key-deltas only). The 4-byte [`KeyTag`] classifies the logical
//! object and selects the compaction reload strategy for it.
//!
//! # Values
//!
//! - `stnd` values are a [`StandardValue`] — `(object, key deltas)`, each a
//!   length-prefixed byte string.
//! - `keyd` values are raw delta bytes (what remains after the object has
//!   been stripped by a `Retain` compaction).
//! - `tomb` values are empty.
//!
//! # Hashing
//!
//! [`magic_hash`] is 32-bit DJB2 (`h = 5381; h = (h * 33) ^ byte`) over the
//! serialized key. The low 8 bits of the hash select one of the 256 hash
//! subtables in a sealed segment.


use crate::encoding::{self, Decode, Encode, EncodingError};

// ------------------------------------------------------------------------------------------------
// Sequence numbers
// ------------------------------------------------------------------------------------------------

/// Journal sequence number. Strictly monotonically increasing within a
/// segment and across the manifest; assigned by the producer.
pub type Sqn = u64;

// ------------------------------------------------------------------------------------------------
// Key kinds
// ------------------------------------------------------------------------------------------------

/// The kind of payload a journal record carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyKind {
    /// A full value: `(object, key deltas)`.
    Standard,

    /// A deletion marker. Never reaped by journal compaction.
    Tombstone,

    /// Key deltas only — the residue of a `Retain`-strategy rewrite.
    KeyDelta,
}

impl KeyKind {
    /// 4-byte on-disk tag for this kind.
    pub fn wire_tag(self) -> [u8; 4] {
        match self {
            KeyKind::Standard => *b"stnd",
            KeyKind::Tombstone => *b"tomb",
            KeyKind::KeyDelta => *b"keyd",
        }
    }

    /// Parse a 4-byte on-disk tag.
    pub fn from_wire_tag(tag: [u8; 4]) -> Option<Self> {
        match &tag {
            b"stnd" => Some(KeyKind::Standard),
            b"tomb" => Some(KeyKind::Tombstone),
            b"keyd" => Some(KeyKind::KeyDelta),
            _ => None,
        }
    }
}

impl Encode for KeyKind {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.wire_tag().encode_to(buf)
    }
}

impl Decode for KeyKind {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (tag, consumed) = <[u8; 4]>::decode_from(buf)?;
        match KeyKind::from_wire_tag(tag) {
            Some(kind) => Ok((kind, consumed)),
            None => Err(EncodingError::InvalidTag {
                tag: tag[0],
                type_name: "KeyKind",
            }),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Ledger keys and tags
// ------------------------------------------------------------------------------------------------

/// Object-class tag carried by every ledger key.
///
/// Tags are opaque to the journal; the compactor maps them to reload
/// strategies through a [`ReloadPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyTag(pub [u8; 4]);

impl KeyTag {
    /// Plain object tag — the common case.
    pub const OBJECT: KeyTag = KeyTag(*b"obj0");

    /// Secondary-index entry tag.
    pub const INDEX: KeyTag = KeyTag(*b"idx0");
}

/// Opaque identifier of a logical object, as understood by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LedgerKey {
    /// Object-class tag.
    pub tag: KeyTag,

    /// Opaque key bytes.
    pub bytes: Vec<u8>,
}

impl LedgerKey {
    /// Construct a plain-object ledger key.
    pub fn object(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            tag: KeyTag::OBJECT,
            bytes: bytes.into(),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Journal keys
// ------------------------------------------------------------------------------------------------

/// The full key of one journal record: `(sqn, kind, ledger key)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JournalKey {
    /// Sequence number assigned by the producer.
    pub sqn: Sqn,

    /// Payload kind.
    pub kind: KeyKind,

    /// The logical object this record belongs to.
    pub ledger_key: LedgerKey,
}

impl JournalKey {
    /// Construct a standard-value key.
    pub fn standard(sqn: Sqn, ledger_key: LedgerKey) -> Self {
        Self {
            sqn,
            kind: KeyKind::Standard,
            ledger_key,
        }
    }

    /// Construct a tombstone key.
    pub fn tombstone(sqn: Sqn, ledger_key: LedgerKey) -> Self {
        Self {
            sqn,
            kind: KeyKind::Tombstone,
            ledger_key,
        }
    }

    /// Construct a key-deltas key.
    pub fn key_delta(sqn: Sqn, ledger_key: LedgerKey) -> Self {
        Self {
            sqn,
            kind: KeyKind::KeyDelta,
            ledger_key,
        }
    }

    /// Serialize to the byte-stable wire format (the hash input).
    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodingError> {
        encoding::encode_to_vec(self)
    }

    /// Deserialize from the wire format, requiring the whole slice to be
    /// consumed.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EncodingError> {
        let (key, consumed) = Self::decode_from(bytes)?;
        if consumed != bytes.len() {
            return Err(EncodingError::LengthOverflow {
                len: bytes.len() as u64,
                limit: consumed as u64,
                type_name: "JournalKey",
            });
        }
        Ok(key)
    }
}

impl Encode for JournalKey {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.sqn.encode_to(buf)?;
        self.kind.encode_to(buf)?;
        self.ledger_key.tag.0.encode_to(buf)?;
        self.ledger_key.bytes.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for JournalKey {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (sqn, n) = Sqn::decode_from(&buf[offset..])?;
        offset += n;
        let (kind, n) = KeyKind::decode_from(&buf[offset..])?;
        offset += n;
        let (tag, n) = <[u8; 4]>::decode_from(&buf[offset..])?;
        offset += n;
        let (bytes, n) = Vec::<u8>::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                sqn,
                kind,
                ledger_key: LedgerKey {
                    tag: KeyTag(tag),
                    bytes,
                },
            },
            offset,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// Standard values
// ------------------------------------------------------------------------------------------------

/// Payload of a `stnd` record: the object itself plus the key deltas that
/// accompany it (e.g. secondary-index changes derived from the write).
///
/// A `Retain` rewrite discards `object` and re-emits `deltas` under a
/// `keyd` key of the same SQN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StandardValue {
    /// The stored object bytes.
    pub object: Vec<u8>,

    /// Key-delta bytes derived from the write.
    pub deltas: Vec<u8>,
}

impl StandardValue {
    /// Serialize as two length-prefixed byte strings.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodingError> {
        encoding::encode_to_vec(self)
    }

    /// Deserialize a `stnd` value.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EncodingError> {
        let (value, _) = Self::decode_from(bytes)?;
        Ok(value)
    }
}

impl Encode for StandardValue {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.object.encode_to(buf)?;
        self.deltas.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for StandardValue {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (object, n) = Vec::<u8>::decode_from(&buf[offset..])?;
        offset += n;
        let (deltas, n) = Vec::<u8>::decode_from(&buf[offset..])?;
        offset += n;
        Ok((Self { object, deltas }, offset))
    }
}

// ------------------------------------------------------------------------------------------------
// Reload strategies
// ------------------------------------------------------------------------------------------------

/// How the compactor may treat superseded records of a given object class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadStrategy {
    /// Strip the object but retain the key deltas as a `keyd` record.
    Retain,

    /// Drop outright; the ledger can recalculate derived state.
    Recalc,

    /// Drop outright; recovery reloads from an external source.
    Recover,
}

/// Tag → strategy table consulted per record during a rewrite.
///
/// Unlisted tags fall back to [`ReloadStrategy::Retain`], the conservative
/// default: key deltas always survive.
#[derive(Debug, Clone)]
pub struct ReloadPolicy {
    overrides: Vec<(KeyTag, ReloadStrategy)>,
}

impl ReloadPolicy {
    /// Policy with no overrides — every tag retains.
    pub fn retain_all() -> Self {
        Self {
            overrides: Vec::new(),
        }
    }

    /// Policy applying `strategy` to every tag.
    pub fn uniform(strategy: ReloadStrategy) -> Self {
        Self::retain_all().with(KeyTag::OBJECT, strategy).with(
            KeyTag::INDEX,
            strategy,
        )
    }

    /// Add or replace the strategy for one tag.
    pub fn with(mut self, tag: KeyTag, strategy: ReloadStrategy) -> Self {
        self.overrides.retain(|(t, _)| *t != tag);
        self.overrides.push((tag, strategy));
        self
    }

    /// Strategy for the given tag.
    pub fn strategy_for(&self, tag: KeyTag) -> ReloadStrategy {
        self.overrides
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, s)| *s)
            .unwrap_or(ReloadStrategy::Retain)
    }
}

impl Default for ReloadPolicy {
    fn default() -> Self {
        Self::retain_all()
    }
}

// ------------------------------------------------------------------------------------------------
// Hashing
// ------------------------------------------------------------------------------------------------

/// 32-bit DJB2 (xor variant) over arbitrary bytes.
///
/// `h₀ = 5381; h = (h · 33) XOR byte`, wrapping at 32 bits. The low 8 bits
/// of the result select the segment hash subtable; the remaining bits drive
/// slot placement within it.
pub fn magic_hash(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 5381;
    for &byte in bytes {
        hash = hash.wrapping_mul(33) ^ u32::from(byte);
    }
    hash
}

/// Hash of a journal key's wire bytes.
pub fn hash_journal_key(key: &JournalKey) -> Result<u32, EncodingError> {
    Ok(magic_hash(&key.to_bytes()?))
}

/// Subtable index for a hash — its low 8 bits.
#[inline]
pub fn subtable_index(hash: u32) -> usize {
    (hash & 0xFF) as usize
}
