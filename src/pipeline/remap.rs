//! Page-index drift correction.
//!
//! Each image sent to the oracle is labelled with its original document
//! index, but models sometimes ignore the labels and count the attached
//! images from 0 instead. [`PageIndexRemapper`] undoes that per entry.

use std::collections::HashSet;

/// Maps an index returned by the oracle back to an original page index.
#[derive(Debug, Clone)]
pub struct PageIndexRemapper {
    sent: Vec<usize>,
    members: HashSet<usize>,
}

impl PageIndexRemapper {
    /// `sent` is the ordered list of original indices, one per attached image.
    pub fn new(sent: &[usize]) -> Self {
        Self {
            sent: sent.to_vec(),
            members: sent.iter().copied().collect(),
        }
    }

    /// Remap a single returned index.
    ///
    /// An index that is already one of the sent originals is kept. Anything
    /// else is read as a position into the sent list. Returns `None` when the
    /// position is out of range, so every `Some` is a member of the sent set.
    pub fn remap(&self, returned: usize) -> Option<usize> {
        if self.members.contains(&returned) {
            Some(returned)
        } else {
            self.sent.get(returned).copied()
        }
    }

    pub fn sent(&self) -> &[usize] {
        &self.sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labelled_indices_pass_through() {
        let r = PageIndexRemapper::new(&[4, 5, 6]);
        assert_eq!(r.remap(4), Some(4));
        assert_eq!(r.remap(6), Some(6));
    }

    #[test]
    fn positional_indices_are_translated() {
        let r = PageIndexRemapper::new(&[4, 5, 6]);
        assert_eq!(r.remap(0), Some(4));
        assert_eq!(r.remap(1), Some(5));
        assert_eq!(r.remap(2), Some(6));
    }

    #[test]
    fn overlapping_position_prefers_membership() {
        // 1 is both a position and a sent original: the label wins.
        let r = PageIndexRemapper::new(&[1, 2, 7]);
        assert_eq!(r.remap(1), Some(1));
        assert_eq!(r.remap(0), Some(1));
    }

    #[test]
    fn out_of_range_is_dropped() {
        let r = PageIndexRemapper::new(&[10, 11]);
        assert_eq!(r.remap(5), None);
        assert_eq!(PageIndexRemapper::new(&[]).remap(0), None);
    }
}
