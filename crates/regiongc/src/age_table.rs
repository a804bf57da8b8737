//! Survivor age histogram

use serde::Serialize;

use crate::object::MAX_AGE;

/// Words copied to survivor space, by object age
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AgeTable {
    sizes: [usize; MAX_AGE as usize + 1],
}

impl AgeTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `words` of survivors with age `age`
    pub fn add(&mut self, age: u8, words: usize) {
        self.sizes[age.min(MAX_AGE) as usize] += words;
    }

    /// Words recorded for `age`
    pub fn words(&self, age: u8) -> usize {
        self.sizes[age.min(MAX_AGE) as usize]
    }

    /// Total words recorded
    pub fn total(&self) -> usize {
        self.sizes.iter().sum()
    }

    /// Add another table into this one
    pub fn merge(&mut self, other: &AgeTable) {
        for (mine, theirs) in self.sizes.iter_mut().zip(other.sizes.iter()) {
            *mine += theirs;
        }
    }

    /// Forget all samples
    pub fn clear(&mut self) {
        self.sizes = [0; MAX_AGE as usize + 1];
    }

    /// Smallest age at which cumulative survivor volume exceeds
    /// `desired_survivor_words`, capped at `max_threshold`
    pub fn compute_tenuring_threshold(&self, desired_survivor_words: usize, max_threshold: u8) -> u8 {
        let mut total = 0;
        let mut age = 1;
        while age <= MAX_AGE {
            total += self.sizes[age as usize];
            if total > desired_survivor_words {
                break;
            }
            age += 1;
        }
        age.min(max_threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_drops_when_survivors_overflow() {
        let mut table = AgeTable::new();
        table.add(1, 100);
        table.add(2, 100);
        table.add(3, 100);
        assert_eq!(table.compute_tenuring_threshold(1000, 15), 15);
        assert_eq!(table.compute_tenuring_threshold(150, 15), 2);
        assert_eq!(table.compute_tenuring_threshold(50, 15), 1);
        assert_eq!(table.compute_tenuring_threshold(1000, 6), 6);
    }

    #[test]
    fn test_merge() {
        let mut a = AgeTable::new();
        let mut b = AgeTable::new();
        a.add(1, 5);
        b.add(1, 7);
        b.add(40, 3);
        a.merge(&b);
        assert_eq!(a.words(1), 12);
        assert_eq!(a.words(MAX_AGE), 3);
        assert_eq!(a.total(), 15);
    }
}
