//! Alignment engine (C9): produces word-timed karaoke segments from
//! recognized speech, optionally guided by an official lyric text.
//!
//! This is the most elaborate component in the pipeline (§4.8). The
//! two-phase match-then-interpolate algorithm here supersedes the
//! single-pass 20-word-window version found in one revision of
//! `original_source` — per Design Note 3, the latest-described
//! behavior (moving window, temporal priors, interpolation,
//! overlap-splitting) is authoritative.

use crate::models::{KaraokeSegment, Word};
use crate::pipeline::lyrics::normalize_text;

pub const MIN_MATCH_THRESHOLD: f64 = 50.0;
const BASE_WINDOW: usize = 50;
const SHRUNK_WINDOW: usize = 35;
const EXTENDED_WINDOW: usize = 100;
const BASE_TOLERANCE_SECS: f64 = 5.0;
const EXTENDED_TOLERANCE_SECS: f64 = 15.0;
const WORD_GAP_SECS: f64 = 0.02;
const OVERLAP_SPLIT_GAP_SECS: f64 = 0.05;

#[derive(Debug, Clone)]
struct FlatWord {
    normalized: String,
    start: f64,
    end: f64,
}

fn flatten_words(segments: &[KaraokeSegment]) -> Vec<FlatWord> {
    let mut flat: Vec<FlatWord> = segments
        .iter()
        .flat_map(|seg| seg.words.iter())
        .map(|w| FlatWord { normalized: normalize_text(&w.text), start: w.start, end: w.end })
        .collect();
    flat.sort_by(|a, b| a.start.partial_cmp(&b.start).unwrap_or(std::cmp::Ordering::Equal));
    flat
}

/// Approximates rapidfuzz's `partial_ratio`: the best alignment of the
/// shorter string against any equal-length window of the longer one.
fn partial_ratio(a: &str, b: &str) -> f64 {
    let (shorter, longer) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    if shorter.is_empty() || longer.is_empty() {
        return 0.0;
    }
    if longer.contains(shorter) {
        return 100.0;
    }
    let longer_chars: Vec<char> = longer.chars().collect();
    let shorter_len = shorter.chars().count();
    if shorter_len >= longer_chars.len() {
        return strsim::normalized_levenshtein(shorter, longer) * 100.0;
    }
    let mut best = 0.0f64;
    for window_start in 0..=(longer_chars.len() - shorter_len) {
        let window: String = longer_chars[window_start..window_start + shorter_len].iter().collect();
        let score = strsim::normalized_levenshtein(shorter, &window) * 100.0;
        if score > best {
            best = score;
        }
    }
    best
}

/// Text similarity in `[0, 100]`: max of ratio/partial-ratio, weighted
/// more generously for short words (§4.8).
fn text_similarity(candidate: &str, target: &str) -> f64 {
    let ratio = strsim::normalized_levenshtein(candidate, target) * 100.0;
    let partial = partial_ratio(candidate, target);
    let mut score = ratio.max(partial);
    if target.chars().count() <= 4 {
        score = (score + 10.0).min(100.0);
    }
    score
}

struct Candidate {
    index: usize,
    score: f64,
}

fn find_best_candidate(
    flat: &[FlatWord],
    used: &[bool],
    start: usize,
    end: usize,
    normalized_target: &str,
    expected_time: f64,
    tolerance: f64,
) -> Option<Candidate> {
    let end = end.min(flat.len());
    let mut best: Option<Candidate> = None;
    for (offset, index) in (start..end).enumerate() {
        if used[index] {
            continue;
        }
        let text_score = text_similarity(&flat[index].normalized, normalized_target);
        let temporal_bonus =
            if (flat[index].start - expected_time).abs() <= tolerance { 20.0 } else { 0.0 };
        let positional_bonus = (end.saturating_sub(start).saturating_sub(offset)) as f64 * 0.01;
        let score = text_score + temporal_bonus + positional_bonus;
        if score >= MIN_MATCH_THRESHOLD && best.as_ref().map_or(true, |b| score > b.score) {
            best = Some(Candidate { index, score });
        }
    }
    best
}

fn default_word_duration(word: &str) -> f64 {
    (word.chars().count() as f64 * 0.06).clamp(0.15, 0.5)
}

/// Fills timing for every word in a line given the subset that matched
/// an anchor in `flat` (§4.8 Phase 2): linear interpolation between two
/// anchors, extrapolation at either end, or uniform spacing when no
/// anchor exists at all.
fn interpolate_line(
    words: &[String],
    anchor_times: &[Option<(f64, f64)>],
    expected_time: f64,
) -> Vec<(f64, f64)> {
    let n = words.len();
    let mut times = vec![(0.0, 0.0); n];
    let anchor_idxs: Vec<usize> =
        (0..n).filter(|&i| anchor_times[i].is_some()).collect();

    if anchor_idxs.is_empty() {
        let mut t = expected_time;
        for (i, word) in words.iter().enumerate() {
            let dur = default_word_duration(word);
            times[i] = (t, t + dur);
            t += dur + WORD_GAP_SECS;
        }
        return times;
    }

    for &i in &anchor_idxs {
        times[i] = anchor_times[i].unwrap();
    }

    let first = anchor_idxs[0];
    if first > 0 {
        let mut t = times[first].0;
        for i in (0..first).rev() {
            let dur = default_word_duration(&words[i]);
            t -= dur + WORD_GAP_SECS;
            times[i] = (t, t + dur);
        }
    }

    for pair in anchor_idxs.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        if b == a + 1 {
            continue;
        }
        let span_start = times[a].1;
        let span_end = times[b].0;
        let gap_count = (b - a - 1) as f64;
        let span = (span_end - span_start).max(0.0);
        let slot = if gap_count > 0.0 { span / gap_count } else { 0.0 };
        let mut t = span_start;
        for i in (a + 1)..b {
            let dur = slot.max(0.05).min(default_word_duration(&words[i]).max(0.05));
            times[i] = (t, t + dur);
            t += dur;
        }
    }

    let last = *anchor_idxs.last().unwrap();
    if last < n - 1 {
        let mut t = times[last].1;
        for i in (last + 1)..n {
            let dur = default_word_duration(&words[i]);
            t += WORD_GAP_SECS;
            times[i] = (t, t + dur);
            t += dur;
        }
    }

    times
}

/// Validation/repair pass for the no-official-lyrics path (§4.8):
/// filter invalid words, clamp segment bounds to the surviving first
/// and last word.
fn repair_pass(segments: &[KaraokeSegment]) -> Vec<KaraokeSegment> {
    segments
        .iter()
        .filter_map(|seg| {
            let mut repaired = seg.clone();
            repaired.words.retain(|w| w.end >= w.start && !w.text.trim().is_empty());
            if repaired.words.is_empty() {
                return None;
            }
            repaired.clamp_bounds_to_words();
            Some(repaired)
        })
        .collect()
}

fn split_into_lines(text: &str) -> Vec<Vec<String>> {
    text.lines()
        .map(|line| line.split_whitespace().map(str::to_string).collect::<Vec<_>>())
        .filter(|words: &Vec<String>| !words.is_empty())
        .collect()
}

/// Aligns `lyric_text` against `recognized` (§4.8). Used for both the
/// official-lyrics path and the custom-lyric path — the two share the
/// same algorithm, differing only in where the text comes from.
pub fn align(lyric_text: &str, recognized: &[KaraokeSegment]) -> Vec<KaraokeSegment> {
    let flat = flatten_words(recognized);
    let lines = split_into_lines(lyric_text);
    if flat.is_empty() || lines.is_empty() {
        return repair_pass(recognized);
    }

    let total_duration = flat.last().map(|w| w.end).unwrap_or(0.0);
    let mut used = vec![false; flat.len()];
    let mut window_base = 0usize;
    let mut segments = Vec::with_capacity(lines.len());

    for (line_idx, words) in lines.iter().enumerate() {
        let expected_time = if lines.len() > 1 {
            total_duration * (line_idx as f64 / (lines.len() - 1) as f64)
        } else {
            0.0
        };

        let mut anchor_times: Vec<Option<(f64, f64)>> = Vec::with_capacity(words.len());
        let mut matched_in_line = false;

        for (word_idx, word) in words.iter().enumerate() {
            let normalized_target = normalize_text(word);
            let window_size = if matched_in_line { SHRUNK_WINDOW } else { BASE_WINDOW };
            let lookback = if word_idx == 0 { 5 } else { 0 };
            let start = window_base.saturating_sub(lookback);

            let mut found = find_best_candidate(
                &flat,
                &used,
                start,
                start + window_size,
                &normalized_target,
                expected_time,
                BASE_TOLERANCE_SECS,
            );
            if found.is_none() {
                found = find_best_candidate(
                    &flat,
                    &used,
                    start,
                    start + EXTENDED_WINDOW,
                    &normalized_target,
                    expected_time,
                    EXTENDED_TOLERANCE_SECS,
                );
            }

            match found {
                Some(candidate) => {
                    used[candidate.index] = true;
                    anchor_times.push(Some((flat[candidate.index].start, flat[candidate.index].end)));
                    window_base = candidate.index + 1;
                    matched_in_line = true;
                }
                None => anchor_times.push(None),
            }
        }

        let anchor_count = anchor_times.iter().filter(|t| t.is_some()).count();
        let times = interpolate_line(words, &anchor_times, expected_time);
        let line_words: Vec<Word> = words
            .iter()
            .zip(times.iter())
            .map(|(text, (start, end))| Word { text: text.clone(), start: *start, end: *end })
            .collect();

        let start = line_words.first().map(|w| w.start).unwrap_or(expected_time);
        let end = line_words.last().map(|w| w.end).unwrap_or(expected_time);

        segments.push(KaraokeSegment {
            start,
            end,
            text: words.join(" "),
            words: line_words,
            aligned: true,
            confidence: Some(anchor_count as f64 / words.len() as f64),
        });
    }

    if segments.is_empty() {
        return repair_pass(recognized);
    }

    split_overlaps(&mut segments);
    segments
}

/// Post-pass (§4.8): consecutive overlapping segments are split at
/// their midpoint with a small gap, with boundary words adjusted to
/// match.
fn split_overlaps(segments: &mut [KaraokeSegment]) {
    for i in 0..segments.len().saturating_sub(1) {
        if segments[i].end <= segments[i + 1].start {
            continue;
        }
        let midpoint = (segments[i].end + segments[i + 1].start) / 2.0;
        let new_end = midpoint - OVERLAP_SPLIT_GAP_SECS / 2.0;
        let new_start = midpoint + OVERLAP_SPLIT_GAP_SECS / 2.0;

        segments[i].end = new_end;
        if let Some(last_word) = segments[i].words.last_mut() {
            last_word.end = last_word.end.min(new_end).max(last_word.start + 0.01);
        }

        segments[i + 1].start = new_start;
        if let Some(first_word) = segments[i + 1].words.first_mut() {
            first_word.start = first_word.start.max(new_start).min(first_word.end - 0.01);
        }
    }
}

/// Runs [`align`], falling back to the recognized segments directly
/// (after the repair pass) if alignment produced nothing despite
/// non-empty recognized input (§4.8 failure semantics).
pub fn align_or_fallback(lyric_text: Option<&str>, recognized: &[KaraokeSegment]) -> Vec<KaraokeSegment> {
    let Some(text) = lyric_text else {
        return repair_pass(recognized);
    };
    let aligned = align(text, recognized);
    if aligned.is_empty() && !recognized.is_empty() {
        tracing::warn!("alignment produced no segments, falling back to recognized speech");
        return repair_pass(recognized);
    }
    aligned
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(start: f64, end: f64, words: &[(&str, f64, f64)]) -> KaraokeSegment {
        KaraokeSegment {
            start,
            end,
            text: words.iter().map(|w| w.0).collect::<Vec<_>>().join(" "),
            words: words
                .iter()
                .map(|(t, s, e)| Word { text: t.to_string(), start: *s, end: *e })
                .collect(),
            aligned: false,
            confidence: None,
        }
    }

    #[test]
    fn no_lyrics_path_clamps_and_filters() {
        let recognized = vec![seg(
            -1.0,
            10.0,
            &[("hello", 0.0, 0.5), ("", 0.5, 0.6), ("there", 0.6, 1.0)],
        )];
        let result = align_or_fallback(None, &recognized);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].words.len(), 2);
        assert_eq!(result[0].start, 0.0);
        assert_eq!(result[0].end, 1.0);
    }

    #[test]
    fn identical_lyrics_align_every_word_with_zero_interpolation() {
        let recognized = vec![seg(0.0, 2.0, &[("hello", 0.0, 1.0), ("there", 1.0, 2.0)])];
        let result = align("hello there", &recognized);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].confidence, Some(1.0));
        assert_eq!(result[0].words[0].start, 0.0);
        assert_eq!(result[0].words[1].end, 2.0);
    }

    #[test]
    fn lines_with_no_matching_words_are_still_produced_via_uniform_interpolation() {
        let recognized = vec![seg(0.0, 1.0, &[("hello", 0.0, 1.0)])];
        let result = align("hello\ncompletely unrelated text here", &recognized);
        assert_eq!(result.len(), 2);
        assert!(result[1].words.iter().all(|w| w.end >= w.start));
    }

    #[test]
    fn overlapping_segments_are_split_with_a_gap() {
        let mut segments = vec![
            seg(0.0, 2.0, &[("a", 0.0, 2.0)]),
            seg(1.5, 3.0, &[("b", 1.5, 3.0)]),
        ];
        split_overlaps(&mut segments);
        assert!(segments[0].end < segments[1].start);
        assert!(segments[1].start - segments[0].end >= OVERLAP_SPLIT_GAP_SECS - 1e-9);
    }

    #[test]
    fn custom_lyric_path_reuses_the_same_algorithm() {
        let recognized = vec![seg(0.0, 1.0, &[("test", 0.0, 1.0)])];
        let via_align = align("test", &recognized);
        let via_fallback = align_or_fallback(Some("test"), &recognized);
        assert_eq!(via_align.len(), via_fallback.len());
    }

    #[test]
    fn empty_recognized_input_falls_back_to_empty_repair_pass() {
        let result = align_or_fallback(Some("some lyrics"), &[]);
        assert!(result.is_empty());
    }
}
