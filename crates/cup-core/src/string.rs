//! Interned byte strings.
//!
//! Strings are owned by the interner for the runtime's whole life and are not
//! collector-managed. Short strings are deduplicated so equal names compare by
//! id; long strings get a fresh id on every creation unless interned through
//! `intern_reused`.

use std::borrow::Cow;
use std::collections::HashMap;

/// Strings up to this many bytes are deduplicated.
pub const MAX_SHORT_LEN: usize = 40;

/// Opaque handle to a string in the interner.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct StringId(pub u32);

/// Seeded variant of the classic shift-add-xor string hash. Long inputs are
/// sampled with a stride so hashing stays cheap.
pub fn str_hash(bytes: &[u8], seed: u32) -> u32 {
    let len = bytes.len();
    let mut h = seed ^ len as u32;
    let step = (len >> 5) + 1;
    let mut i = len;
    while i >= step {
        h ^= (h << 5).wrapping_add(h >> 2).wrapping_add(bytes[i - 1] as u32);
        i -= step;
    }
    h
}

#[derive(Debug)]
pub struct StringInterner {
    strings: Vec<Box<[u8]>>,
    /// hash -> ids of short strings with that hash
    short_lookup: HashMap<u32, Vec<u32>>,
    /// hash -> ids of long strings created by `intern_reused`
    long_lookup: HashMap<u32, Vec<u32>>,
    seed: u32,
}

impl StringInterner {
    pub fn new() -> Self {
        Self::with_seed(0x2c9d_1a53)
    }

    pub fn with_seed(seed: u32) -> Self {
        StringInterner {
            strings: Vec::new(),
            short_lookup: HashMap::new(),
            long_lookup: HashMap::new(),
            seed,
        }
    }

    /// Intern `bytes`. Short strings return the existing id when present.
    pub fn intern(&mut self, bytes: &[u8]) -> StringId {
        if bytes.len() > MAX_SHORT_LEN {
            return self.push(bytes);
        }
        let hash = str_hash(bytes, self.seed);
        if let Some(ids) = self.short_lookup.get(&hash) {
            if let Some(&id) = ids.iter().find(|&&id| &*self.strings[id as usize] == bytes) {
                return StringId(id);
            }
        }
        let id = self.push(bytes);
        self.short_lookup.entry(hash).or_default().push(id.0);
        id
    }

    /// Intern `bytes`, sharing long strings too. Returns the id and whether
    /// it was created by this call.
    pub fn intern_reused(&mut self, bytes: &[u8]) -> (StringId, bool) {
        let before = self.strings.len();
        if bytes.len() <= MAX_SHORT_LEN {
            let id = self.intern(bytes);
            return (id, self.strings.len() > before);
        }
        let hash = str_hash(bytes, self.seed);
        if let Some(ids) = self.long_lookup.get(&hash) {
            if let Some(&id) = ids.iter().find(|&&id| &*self.strings[id as usize] == bytes) {
                return (StringId(id), false);
            }
        }
        let id = self.push(bytes);
        self.long_lookup.entry(hash).or_default().push(id.0);
        (id, true)
    }

    pub fn intern_str(&mut self, s: &str) -> StringId {
        self.intern(s.as_bytes())
    }

    /// Look up a short string without creating it.
    pub fn find(&self, bytes: &[u8]) -> Option<StringId> {
        if bytes.len() > MAX_SHORT_LEN {
            return None;
        }
        let hash = str_hash(bytes, self.seed);
        self.short_lookup
            .get(&hash)?
            .iter()
            .find(|&&id| &*self.strings[id as usize] == bytes)
            .map(|&id| StringId(id))
    }

    fn push(&mut self, bytes: &[u8]) -> StringId {
        let id = self.strings.len() as u32;
        self.strings.push(bytes.into());
        StringId(id)
    }

    pub fn get_bytes(&self, id: StringId) -> &[u8] {
        &self.strings[id.0 as usize]
    }

    /// UTF-8 view, replacing invalid sequences.
    pub fn get_str(&self, id: StringId) -> Cow<'_, str> {
        String::from_utf8_lossy(self.get_bytes(id))
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}

impl Default for StringInterner {
    fn default() -> Self {
        Self::new()
    }
}
