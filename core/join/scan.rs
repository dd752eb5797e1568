use super::hash_table::{EntryLocation, HashTable};

/// Resumable position in one bucket chain. The join keeps one cursor per
/// probing direction; neither ever touches the other's position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketScanCursor {
    hash: u32,
    bucket: usize,
    /// Next chain index to look at, `None` once the chain is consumed.
    position: Option<usize>,
}

impl BucketScanCursor {
    /// Points the cursor at the start of `bucket`, matching entries with `hash`.
    pub fn reset(&mut self, hash: u32, bucket: usize) {
        self.hash = hash;
        self.bucket = bucket;
        self.position = Some(0);
    }

    /// Returns the next entry of the bucket whose stored hash equals the
    /// cursor's, in chain order. Marks the cursor exhausted at the end.
    pub fn next(&mut self, table: &HashTable) -> Option<EntryLocation> {
        let mut index = self.position?;
        let entries = table.bucket(self.bucket);
        while index < entries.len() {
            if entries[index].hash == self.hash {
                self.position = Some(index + 1);
                return Some(EntryLocation {
                    bucket: self.bucket,
                    index,
                });
            }
            index += 1;
        }
        self.position = None;
        None
    }

    /// Abandons the rest of the chain.
    pub fn finish(&mut self) {
        self.position = None;
    }

    pub fn is_exhausted(&self) -> bool {
        self.position.is_none()
    }

    pub fn hash(&self) -> u32 {
        self.hash
    }
}

/// Walks every resident entry whose matched flag is clear.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnmatchedCursor {
    bucket: usize,
    index: usize,
}

impl UnmatchedCursor {
    pub fn next(&mut self, table: &HashTable) -> Option<EntryLocation> {
        while self.bucket < table.bucket_count() {
            let entries = table.bucket(self.bucket);
            while self.index < entries.len() {
                let index = self.index;
                self.index += 1;
                if !entries[index].matched {
                    return Some(EntryLocation {
                        bucket: self.bucket,
                        index,
                    });
                }
            }
            self.bucket += 1;
            self.index = 0;
        }
        None
    }
}
