//! Sort orders and the keys extracted for them.
//!
//! Keys are small owned values compared instead of records so the merge heap
//! and the in-memory sort never re-parse record bytes.

use bstr::BString;

use crate::record::Record;

/// Sort order of a record stream.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SortOrder {
    /// Sorted by `(ref_id, position)`, unmapped records last.
    Coordinate,
    /// Sorted by query name, mates ordered first-in-pair first.
    Queryname,
    /// No known order.
    Unknown,
}

impl SortOrder {
    /// The `@HD SO:` value for this order.
    #[must_use]
    pub const fn as_sam_str(self) -> &'static str {
        match self {
            Self::Coordinate => "coordinate",
            Self::Queryname => "queryname",
            Self::Unknown => "unknown",
        }
    }
}

/// A comparator key extractable from a record.
pub trait SortKey: Ord + Clone + Send + 'static {
    /// Extract the key for one record.
    fn from_record(record: &Record) -> Self;
}

/// Key for coordinate order: `(ref_id, position)` with unmapped records
/// (`ref_id = -1`) sorting after every valid reference.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct CoordinateKey {
    tid: u32,
    pos: i32,
}

impl SortKey for CoordinateKey {
    fn from_record(record: &Record) -> Self {
        let tid = if record.ref_id() < 0 { u32::MAX } else { record.ref_id() as u32 };
        Self { tid, pos: record.position() }
    }
}

/// Key for queryname order: name bytes, then the first-in-pair flag bit so
/// mates with equal names come out first-mate first.
#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct QuerynameKey {
    name: BString,
    mate_rank: u8,
}

impl SortKey for QuerynameKey {
    fn from_record(record: &Record) -> Self {
        let mate_rank = u8::from(!record.is_first_in_pair());
        Self { name: BString::from(record.name().to_owned()), mate_rank }
    }
}
