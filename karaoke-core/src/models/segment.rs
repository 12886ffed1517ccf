//! KaraokeSegment: a line of lyric with per-word timing (§3).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Word {
    pub text: String,
    pub start: f64,
    pub end: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KaraokeSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
    pub words: Vec<Word>,
    pub aligned: bool,
    pub confidence: Option<f64>,
}

impl KaraokeSegment {
    /// Checks the invariants named in §3: `end >= start`, non-empty
    /// words, each word within segment bounds, monotonic non-overlapping
    /// words, and segment bounds equal to first/last word bounds.
    pub fn is_valid(&self) -> bool {
        if self.end < self.start || self.words.is_empty() {
            return false;
        }
        let first = &self.words[0];
        let last = &self.words[self.words.len() - 1];
        if (self.start - first.start).abs() > f64::EPSILON * 4.0 {
            return false;
        }
        if (self.end - last.end).abs() > f64::EPSILON * 4.0 {
            return false;
        }
        for w in &self.words {
            if w.end < w.start || w.start < self.start || w.end > self.end {
                return false;
            }
        }
        for pair in self.words.windows(2) {
            if pair[1].start < pair[0].end {
                return false;
            }
        }
        true
    }

    /// Clamp `start`/`end` to the bounds implied by the first/last word,
    /// the repair step used by the no-official-lyrics alignment path (§4.8).
    pub fn clamp_bounds_to_words(&mut self) {
        if let (Some(first), Some(last)) = (self.words.first(), self.words.last()) {
            self.start = first.start;
            self.end = last.end;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(text: &str, start: f64, end: f64) -> Word {
        Word { text: text.to_string(), start, end }
    }

    #[test]
    fn valid_segment_passes() {
        let seg = KaraokeSegment {
            start: 0.0,
            end: 2.0,
            text: "hi there".to_string(),
            words: vec![word("hi", 0.0, 1.0), word("there", 1.0, 2.0)],
            aligned: true,
            confidence: Some(0.9),
        };
        assert!(seg.is_valid());
    }

    #[test]
    fn overlapping_words_are_invalid() {
        let seg = KaraokeSegment {
            start: 0.0,
            end: 2.0,
            text: "hi there".to_string(),
            words: vec![word("hi", 0.0, 1.5), word("there", 1.0, 2.0)],
            aligned: true,
            confidence: None,
        };
        assert!(!seg.is_valid());
    }

    #[test]
    fn empty_words_is_invalid() {
        let seg = KaraokeSegment {
            start: 0.0,
            end: 1.0,
            text: String::new(),
            words: vec![],
            aligned: false,
            confidence: None,
        };
        assert!(!seg.is_valid());
    }

    #[test]
    fn clamp_bounds_pulls_start_end_from_words() {
        let mut seg = KaraokeSegment {
            start: -1.0,
            end: 10.0,
            text: "hi".to_string(),
            words: vec![word("hi", 0.5, 1.0)],
            aligned: true,
            confidence: None,
        };
        seg.clamp_bounds_to_words();
        assert_eq!(seg.start, 0.5);
        assert_eq!(seg.end, 1.0);
    }
}
