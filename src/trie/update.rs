//! Update intent records (§3 "Update").
//!
//! Re-expressed over owned `Vec`s rather than the original's intrusive
//! linked list (see DESIGN NOTES §9): no performance requirement in this
//! crate forces intrusion, and ownership is clearer with plain vectors.

/// A single intent: write (or nested-update, or erase) at `key_nibbles` for
/// `version`.
///
/// - `value = Some(_)`, `nested.is_empty()`: a leaf write.
/// - `value = None`, `nested` non-empty: updates live further down the
///   subtrie rooted at this key; this node itself is untouched.
/// - `value = None`, `nested.is_empty()`: an erase.
#[derive(Clone, Debug)]
pub struct Update {
    pub key_nibbles: Vec<u8>,
    pub value: Option<Vec<u8>>,
    /// If set, the child subtrie at this key is replaced wholesale by the
    /// nested updates rather than merged with whatever is already there.
    pub incarnation: bool,
    pub nested: Vec<Update>,
    pub version: u64,
}

impl Update {
    pub fn write(key_nibbles: Vec<u8>, value: Vec<u8>, version: u64) -> Self {
        Update {
            key_nibbles,
            value: Some(value),
            incarnation: false,
            nested: Vec::new(),
            version,
        }
    }

    pub fn erase(key_nibbles: Vec<u8>, version: u64) -> Self {
        Update {
            key_nibbles,
            value: None,
            incarnation: false,
            nested: Vec::new(),
            version,
        }
    }

    pub fn nested(key_nibbles: Vec<u8>, nested: Vec<Update>, incarnation: bool, version: u64) -> Self {
        Update {
            key_nibbles,
            value: None,
            incarnation,
            nested,
            version,
        }
    }

    pub fn is_deletion(&self) -> bool {
        self.value.is_none() && self.nested.is_empty()
    }
}

/// A batch of updates for one version, flattened into independent leaf
/// writes/erases each carrying its full key — the shape `upsert` consumes
/// directly (see [`crate::trie::requests::Requests::split_into_sublists`]).
pub type UpdateBatch = Vec<Update>;
