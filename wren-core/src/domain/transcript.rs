//! Transcript domain types and text renderings

use serde::{Deserialize, Serialize};
use std::fmt::Write;

use crate::domain::options::SubtitleLayout;

/// One timed piece of recognized speech
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    /// Start time in seconds from the beginning of the audio
    pub start: f64,
    /// End time in seconds from the beginning of the audio
    pub end: f64,
    pub text: String,
}

impl Segment {
    pub fn new(start: f64, end: f64, text: impl Into<String>) -> Self {
        Self {
            start,
            end,
            text: text.into(),
        }
    }
}

/// Result of a successful transcription
///
/// Produced once per job and never modified afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub segments: Vec<Segment>,
    pub text: String,
    pub language: String,
}

impl Transcript {
    /// Builds a transcript, deriving the full text from the segments
    pub fn new(segments: Vec<Segment>, language: impl Into<String>) -> Self {
        let text = segments
            .iter()
            .map(|s| s.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ");

        Self {
            segments,
            text,
            language: language.into(),
        }
    }

    /// Plain text, one segment per line
    pub fn to_txt(&self) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            out.push_str(segment.text.trim());
            out.push('\n');
        }
        out
    }

    /// SubRip subtitles, one cue per segment
    pub fn to_srt(&self) -> String {
        self.to_srt_with(&SubtitleLayout::default())
    }

    /// SubRip subtitles with cues shaped by `layout`
    pub fn to_srt_with(&self, layout: &SubtitleLayout) -> String {
        let mut out = String::new();
        for (idx, cue) in self.cues(layout).iter().enumerate() {
            if idx > 0 {
                out.push('\n');
            }
            let _ = writeln!(
                out,
                "{}\n{} --> {}\n{}",
                idx + 1,
                format_timestamp(cue.start, true, ','),
                format_timestamp(cue.end, true, ','),
                cue.text
            );
        }
        out
    }

    /// WebVTT subtitles, one cue per segment
    pub fn to_vtt(&self) -> String {
        self.to_vtt_with(&SubtitleLayout::default())
    }

    /// WebVTT subtitles with cues shaped by `layout`
    pub fn to_vtt_with(&self, layout: &SubtitleLayout) -> String {
        let mut out = String::from("WEBVTT\n");
        for cue in self.cues(layout) {
            let _ = writeln!(
                out,
                "\n{} --> {}\n{}",
                format_timestamp(cue.start, false, '.'),
                format_timestamp(cue.end, false, '.'),
                cue.text
            );
        }
        out
    }

    /// Splits the segments into subtitle cues
    ///
    /// Text is wrapped at `max_line_width` characters. With `max_line_count`
    /// a segment longer than that many lines becomes several cues, and its
    /// time span is shared out in proportion to each cue's characters.
    pub fn cues(&self, layout: &SubtitleLayout) -> Vec<Segment> {
        let mut cues = Vec::with_capacity(self.segments.len());

        for segment in &self.segments {
            let text = segment.text.trim();
            let Some(width) = layout.max_line_width else {
                cues.push(Segment::new(segment.start, segment.end, text));
                continue;
            };

            let lines = wrap_words(text, width as usize);
            let per_cue = layout
                .max_line_count
                .map_or(lines.len(), |count| count as usize)
                .max(1);
            let groups: Vec<&[String]> = lines.chunks(per_cue).collect();
            if groups.len() <= 1 {
                cues.push(Segment::new(segment.start, segment.end, lines.join("\n")));
                continue;
            }

            let total_chars: usize = lines.iter().map(|l| l.chars().count()).sum();
            let duration = (segment.end - segment.start).max(0.0);
            let mut consumed = 0usize;
            for (idx, group) in groups.iter().enumerate() {
                let start = segment.start + duration * consumed as f64 / total_chars as f64;
                consumed += group.iter().map(|l| l.chars().count()).sum::<usize>();
                let end = if idx + 1 == groups.len() {
                    segment.end
                } else {
                    segment.start + duration * consumed as f64 / total_chars as f64
                };
                cues.push(Segment::new(start, end, group.join("\n")));
            }
        }

        cues
    }

    /// Tab separated values with millisecond offsets
    pub fn to_tsv(&self) -> String {
        let mut out = String::from("start\tend\ttext\n");
        for segment in &self.segments {
            let _ = writeln!(
                out,
                "{}\t{}\t{}",
                to_millis(segment.start),
                to_millis(segment.end),
                segment.text.trim().replace('\t', " ")
            );
        }
        out
    }
}

/// Greedy word wrap; a word longer than `width` gets a line of its own
fn wrap_words(text: &str, width: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();

    for word in text.split_whitespace() {
        if current.is_empty() {
            current.push_str(word);
        } else if current.chars().count() + 1 + word.chars().count() <= width {
            current.push(' ');
            current.push_str(word);
        } else {
            lines.push(std::mem::take(&mut current));
            current.push_str(word);
        }
    }
    if !current.is_empty() || lines.is_empty() {
        lines.push(current);
    }

    lines
}

fn to_millis(seconds: f64) -> u64 {
    (seconds.max(0.0) * 1000.0).round() as u64
}

/// Formats seconds as `HH:MM:SS<sep>mmm`
///
/// The hour field is omitted when zero unless `always_hours` is set.
fn format_timestamp(seconds: f64, always_hours: bool, sep: char) -> String {
    let total_ms = to_millis(seconds);
    let hours = total_ms / 3_600_000;
    let minutes = (total_ms % 3_600_000) / 60_000;
    let secs = (total_ms % 60_000) / 1000;
    let millis = total_ms % 1000;

    if always_hours || hours > 0 {
        format!("{hours:02}:{minutes:02}:{secs:02}{sep}{millis:03}")
    } else {
        format!("{minutes:02}:{secs:02}{sep}{millis:03}")
    }
}
