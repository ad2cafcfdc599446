//! Filename normalization for key comparison and dentry hashing.
//!
//! APFS stores filenames as UTF-8 but compares and hashes them by their
//! NFD-normalized code points, case-folded on case-insensitive volumes.

use std::str::Chars;

use unicode_normalization::{Decompositions, UnicodeNormalization};

/// A cursor yielding the normalized code points of a filename, one at a time.
pub struct Unicursor<'a> {
    decomp: Decompositions<Chars<'a>>,
    // Case folding can expand one code point into several.
    folded: Vec<char>,
}

impl<'a> Unicursor<'a> {
    pub fn new(name: &'a str) -> Self {
        Unicursor {
            decomp: name.chars().nfd(),
            folded: Vec::new(),
        }
    }

    /// The next normalized code point, or 0 once the name is exhausted.
    pub fn normalize_next(&mut self, case_fold: bool) -> u32 {
        if let Some(c) = self.folded.pop() {
            return c as u32;
        }

        let c = match self.decomp.next() {
            Some(c) => c,
            None => return 0,
        };

        if !case_fold {
            return c as u32;
        }

        let mut lower = c.to_lowercase();
        let first = match lower.next() {
            Some(c) => c,
            None => return 0,
        };
        // Stash the rest in reverse so pop() yields them in order.
        let rest: Vec<char> = lower.collect();
        self.folded.extend(rest.into_iter().rev());
        first as u32
    }
}
