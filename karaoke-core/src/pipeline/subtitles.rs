//! Subtitle emitter (C10): serializes aligned segments to a styled,
//! karaoke-tagged subtitle track (§4.9).

use crate::models::{KaraokeSegment, SubtitlePosition};

pub const VALID_FONT_SIZES: [u32; 4] = [24, 30, 36, 42];
const MIN_HIGHLIGHT_CS: u32 = 5;
const MAX_HIGHLIGHT_CS: u32 = 350;
const LEAD_IN_SECS: f64 = 0.35;
const PERSIST_SECS: f64 = 0.6;
const MIN_EVENT_DURATION_SECS: f64 = 1.1;
const SILENT_GAP_THRESHOLD_SECS: f64 = 4.0;
const NEXT_UP_DURATION_SECS: f64 = 0.6;
const COUNTDOWN_STEP_SECS: f64 = 1.0;

/// ASS numeric alignment: 8 = top-center, 2 = bottom-center.
fn ass_alignment(position: SubtitlePosition) -> u8 {
    match position {
        SubtitlePosition::Top => 8,
        SubtitlePosition::Bottom => 2,
    }
}

#[derive(Debug, Clone)]
pub struct SubtitleStyle {
    pub font: String,
    pub size: u32,
    pub position: SubtitlePosition,
    pub primary_color_rrggbb: String,
    pub highlight_color_rrggbb: String,
    pub outline_color_rrggbb: String,
    pub back_color_rrggbb: String,
    pub primary_alpha: u8,
    pub back_alpha: u8,
}

impl Default for SubtitleStyle {
    fn default() -> Self {
        Self {
            font: "DejaVu Sans".to_string(),
            size: 36,
            position: SubtitlePosition::Bottom,
            primary_color_rrggbb: "FFFFFF".to_string(),
            highlight_color_rrggbb: "FFD700".to_string(),
            outline_color_rrggbb: "000000".to_string(),
            back_color_rrggbb: "000000".to_string(),
            primary_alpha: 0,
            back_alpha: 128,
        }
    }
}

impl SubtitleStyle {
    pub fn validate(&self) -> Result<(), String> {
        if !VALID_FONT_SIZES.contains(&self.size) {
            return Err(format!("font size must be one of {VALID_FONT_SIZES:?}, got {}", self.size));
        }
        Ok(())
    }

    fn outline_thickness(&self) -> f64 {
        (self.size as f64 / 18.0).max(1.0)
    }

    fn shadow(&self) -> f64 {
        (self.size as f64 / 36.0).max(0.0)
    }
}

/// `RRGGBB` → the emitter's native `&HAABBGGRR` ordering.
pub fn rrggbb_to_ass_color(rrggbb: &str, alpha: u8) -> String {
    let rr = &rrggbb[0..2];
    let gg = &rrggbb[2..4];
    let bb = &rrggbb[4..6];
    format!("&H{alpha:02X}{bb}{gg}{rr}")
}

/// Escapes `{` and `}` in event text, since they are the format's
/// control-tag delimiters (§4.9).
pub fn escape_text(text: &str) -> String {
    text.replace('{', r"\{").replace('}', r"\}")
}

fn format_time(seconds: f64) -> String {
    let seconds = seconds.max(0.0);
    let total_cs = (seconds * 100.0).round() as i64;
    let hours = total_cs / 360_000;
    let minutes = (total_cs / 6_000) % 60;
    let secs = (total_cs / 100) % 60;
    let cs = total_cs % 100;
    format!("{hours}:{minutes:02}:{secs:02}.{cs:02}")
}

/// Word highlight duration in centiseconds, clamped `[5, 350]` (§4.9).
fn highlight_cs(word_duration_secs: f64) -> u32 {
    let cs = (word_duration_secs * 100.0).round() as i64;
    cs.clamp(MIN_HIGHLIGHT_CS as i64, MAX_HIGHLIGHT_CS as i64) as u32
}

/// Raw, unclamped centiseconds for a silent gap (lead-in or inter-word),
/// since `\k` tags accumulate sequentially from the event's start time
/// and a clamped gap would desync every following word (§4.9).
fn delay_cs(seconds: f64) -> i64 {
    (seconds.max(0.0) * 100.0).round() as i64
}

fn build_header(style: &SubtitleStyle) -> String {
    let primary = rrggbb_to_ass_color(&style.primary_color_rrggbb, style.primary_alpha);
    let highlight = rrggbb_to_ass_color(&style.highlight_color_rrggbb, style.primary_alpha);
    let outline = rrggbb_to_ass_color(&style.outline_color_rrggbb, 0);
    let back = rrggbb_to_ass_color(&style.back_color_rrggbb, style.back_alpha);

    format!(
        "[Script Info]\n\
         ScriptType: v4.00+\n\
         WrapStyle: 0\n\
         ScaledBorderAndShadow: yes\n\
         YCbCr Matrix: TV.601\n\n\
         [V4+ Styles]\n\
         Format: Name, Fontname, Fontsize, PrimaryColour, SecondaryColour, OutlineColour, BackColour, Bold, Italic, Underline, StrikeOut, ScaleX, ScaleY, Spacing, Angle, BorderStyle, Outline, Shadow, Alignment, MarginL, MarginR, MarginV, Encoding\n\
         Style: Karaoke,{font},{size},{primary},{highlight},{outline},{back},0,0,0,0,100,100,0,0,1,{outline_w:.1},{shadow:.1},{alignment},10,10,20,1\n\n\
         [Events]\n\
         Format: Layer, Start, End, Style, Name, MarginL, MarginR, MarginV, Effect, Text\n",
        font = style.font,
        size = style.size,
        primary = primary,
        highlight = highlight,
        outline = outline,
        back = back,
        outline_w = style.outline_thickness(),
        shadow = style.shadow(),
        alignment = ass_alignment(style.position),
    )
}

fn dialogue_line(start: f64, end: f64, style_name: &str, text: &str) -> String {
    format!(
        "Dialogue: 0,{},{},{},,0,0,0,,{}\n",
        format_time(start),
        format_time(end),
        style_name,
        text
    )
}

/// Builds the per-word `\k` karaoke text for one segment. Since `\k`
/// tags accumulate sequentially from the event's own start time, a
/// leading-delay tag covers the silence from `event_start` to the
/// first word, and a gap tag precedes any word whose start trails the
/// previous word's end, so each word's highlight still lands at its
/// real audio position (§4.9).
fn karaoke_text(segment: &KaraokeSegment, event_start: f64) -> String {
    let mut text = String::new();
    let mut prev_end: Option<f64> = None;

    if let Some(first) = segment.words.first() {
        let lead_in_cs = delay_cs(first.start - event_start);
        if lead_in_cs > 0 {
            text.push_str(&format!(r"{{\k{lead_in_cs}}}"));
        }
    }

    for word in &segment.words {
        if let Some(prev) = prev_end {
            let gap_cs = delay_cs(word.start - prev);
            if gap_cs > 0 {
                text.push_str(&format!(r"{{\k{gap_cs}}}"));
            }
        }
        let duration = (word.end - word.start).max(0.0);
        text.push_str(&format!(r"{{\k{}}}", highlight_cs(duration)));
        text.push_str(&escape_text(&word.text));
        text.push(' ');
        prev_end = Some(word.end);
    }
    text.trim_end().to_string()
}

/// Emits the full subtitle document for `segments` (§4.9): lead-in,
/// persist, and minimum-duration padding per event; "next up"
/// preview + 3-2-1 countdown injected into silent stretches ≥ 4s.
pub fn emit(segments: &[KaraokeSegment], style: &SubtitleStyle) -> Result<String, String> {
    style.validate()?;
    let mut out = build_header(style);

    for (i, segment) in segments.iter().enumerate() {
        let event_start = (segment.start - LEAD_IN_SECS).max(0.0);
        let mut event_end = segment.end + PERSIST_SECS;
        if event_end - event_start < MIN_EVENT_DURATION_SECS {
            event_end = event_start + MIN_EVENT_DURATION_SECS;
        }

        out.push_str(&dialogue_line(event_start, event_end, "Karaoke", &karaoke_text(segment, event_start)));

        if let Some(next) = segments.get(i + 1) {
            let gap = next.start - event_end;
            if gap >= SILENT_GAP_THRESHOLD_SECS {
                let next_up_start = event_end;
                out.push_str(&dialogue_line(
                    next_up_start,
                    next_up_start + NEXT_UP_DURATION_SECS,
                    "NextUp",
                    &format!("Next up: {}", escape_text(&next.text)),
                ));

                let countdown_start = next.start - 3.0 * COUNTDOWN_STEP_SECS;
                for (step, label) in ["3", "2", "1"].iter().enumerate() {
                    let step_start = countdown_start + step as f64 * COUNTDOWN_STEP_SECS;
                    out.push_str(&dialogue_line(
                        step_start,
                        step_start + COUNTDOWN_STEP_SECS,
                        "Countdown",
                        label,
                    ));
                }
            }
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Word;

    fn seg(start: f64, end: f64, words: &[(&str, f64, f64)]) -> KaraokeSegment {
        KaraokeSegment {
            start,
            end,
            text: words.iter().map(|w| w.0).collect::<Vec<_>>().join(" "),
            words: words
                .iter()
                .map(|(t, s, e)| Word { text: t.to_string(), start: *s, end: *e })
                .collect(),
            aligned: true,
            confidence: Some(1.0),
        }
    }

    #[test]
    fn rrggbb_reorders_to_bbggrr() {
        assert_eq!(rrggbb_to_ass_color("FFD700", 0), "&H0000D7FF");
        assert_eq!(rrggbb_to_ass_color("000000", 128), "&H80000000");
    }

    #[test]
    fn escape_text_escapes_braces() {
        assert_eq!(escape_text("a{b}c"), r"a\{b\}c");
    }

    #[test]
    fn font_size_validator_rejects_non_member_sizes() {
        let mut style = SubtitleStyle::default();
        style.size = 33;
        assert!(style.validate().is_err());
        style.size = 42;
        assert!(style.validate().is_ok());
    }

    #[test]
    fn highlight_duration_sum_matches_segment_span() {
        let segment = seg(0.0, 2.0, &[("hello", 0.0, 0.8), ("there", 0.8, 2.0)]);
        let sum_cs: u32 = segment.words.iter().map(|w| highlight_cs(w.end - w.start)).sum();
        let total_cs = ((segment.end - segment.start) * 100.0).round() as u32;
        assert!((sum_cs as i64 - total_cs as i64).unsigned_abs() <= 1);
    }

    #[test]
    fn highlight_cs_is_clamped() {
        assert_eq!(highlight_cs(0.001), MIN_HIGHLIGHT_CS);
        assert_eq!(highlight_cs(10.0), MAX_HIGHLIGHT_CS);
    }

    #[test]
    fn karaoke_text_includes_lead_in_tag_before_first_word() {
        let segment = seg(0.5, 1.5, &[("hello", 0.5, 1.5)]);
        let text = karaoke_text(&segment, 0.0);
        assert!(text.starts_with(r"{\k50}{\k"), "expected a 50cs lead-in tag, got {text}");
    }

    #[test]
    fn karaoke_text_omits_lead_in_tag_when_word_starts_at_event_start() {
        let segment = seg(0.0, 1.0, &[("hello", 0.0, 1.0)]);
        let text = karaoke_text(&segment, 0.0);
        assert!(text.starts_with(r"{\k100}hello"));
    }

    #[test]
    fn karaoke_text_inserts_gap_tag_between_words_with_silence() {
        let segment = seg(0.0, 2.0, &[("hello", 0.0, 0.5), ("there", 1.5, 2.0)]);
        let text = karaoke_text(&segment, 0.0);
        assert_eq!(text, r"{\k50}hello {\k100}{\k50}there");
    }

    #[test]
    fn emit_rejects_invalid_style() {
        let mut style = SubtitleStyle::default();
        style.size = 99;
        let result = emit(&[], &style);
        assert!(result.is_err());
    }

    #[test]
    fn long_gap_between_segments_injects_next_up_and_countdown() {
        let segments = vec![
            seg(0.0, 1.0, &[("hello", 0.0, 1.0)]),
            seg(10.0, 11.0, &[("world", 10.0, 11.0)]),
        ];
        let style = SubtitleStyle::default();
        let doc = emit(&segments, &style).unwrap();
        assert!(doc.contains("Next up:"));
        assert!(doc.contains(",Countdown,"));
    }

    #[test]
    fn short_gap_does_not_inject_auxiliary_events() {
        let segments = vec![
            seg(0.0, 1.0, &[("hello", 0.0, 1.0)]),
            seg(2.0, 3.0, &[("world", 2.0, 3.0)]),
        ];
        let style = SubtitleStyle::default();
        let doc = emit(&segments, &style).unwrap();
        assert!(!doc.contains("Next up:"));
    }

    #[test]
    fn format_time_produces_ass_timestamp_shape() {
        assert_eq!(format_time(0.0), "0:00:00.00");
        assert_eq!(format_time(3661.5), "1:01:01.50");
    }
}
