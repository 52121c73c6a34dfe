const WORD_BITS: u32 = u64::BITS;

/// Used-id bitset for the free-id search.
///
/// With `n` existing records at most `n` ids are taken, so the smallest free
/// positive id is always within `1..=n + 1`. The set is bounded to that range:
/// larger ids are accepted but not stored, since they can never be the
/// answer. Storage grows word by word as ids inside the bound arrive.
#[derive(Debug, Clone)]
pub struct FreeIdSet {
    words: Vec<u64>,
    limit: u32,
}

impl FreeIdSet {
    pub fn with_record_count(records: usize) -> Self {
        let limit = u32::try_from(records)
            .unwrap_or(u32::MAX - 1)
            .saturating_add(1);

        Self {
            words: Vec::new(),
            limit,
        }
    }

    /// Highest id this set can report as free
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Mark `id` as used; ids outside `1..=limit` are ignored
    pub fn insert(&mut self, id: u32) {
        if id == 0 || id > self.limit {
            return;
        }

        let word = (id / WORD_BITS) as usize;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1u64 << (id % WORD_BITS);
    }

    pub fn contains(&self, id: u32) -> bool {
        let word = (id / WORD_BITS) as usize;
        self.words
            .get(word)
            .is_some_and(|bits| *bits & (1u64 << (id % WORD_BITS)) != 0)
    }

    /// Smallest positive id not marked as used
    pub fn smallest_free(&self) -> u32 {
        (1..=self.limit)
            .find(|id| !self.contains(*id))
            .unwrap_or(self.limit)
    }
}

impl FromIterator<u32> for FreeIdSet {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        let ids: Vec<u32> = iter.into_iter().collect();
        let mut set = FreeIdSet::with_record_count(ids.len());
        for id in ids {
            set.insert(id);
        }
        set
    }
}
