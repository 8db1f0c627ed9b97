//! Transcription options attached to a job

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// What the engine should do with the audio
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Task {
    #[default]
    Transcribe,
    Translate,
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Transcribe => write!(f, "transcribe"),
            Task::Translate => write!(f, "translate"),
        }
    }
}

/// Whisper model variant requested for a job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelVariant {
    #[serde(rename = "tiny")]
    Tiny,
    #[serde(rename = "tiny.en")]
    TinyEn,
    #[serde(rename = "base")]
    Base,
    #[serde(rename = "base.en")]
    BaseEn,
    #[serde(rename = "small")]
    Small,
    #[serde(rename = "small.en")]
    SmallEn,
    #[serde(rename = "medium")]
    Medium,
    #[serde(rename = "medium.en")]
    MediumEn,
    #[serde(rename = "turbo")]
    Turbo,
    #[default]
    #[serde(rename = "large")]
    Large,
}

impl ModelVariant {
    pub const ALL: [ModelVariant; 10] = [
        ModelVariant::Tiny,
        ModelVariant::TinyEn,
        ModelVariant::Base,
        ModelVariant::BaseEn,
        ModelVariant::Small,
        ModelVariant::SmallEn,
        ModelVariant::Medium,
        ModelVariant::MediumEn,
        ModelVariant::Turbo,
        ModelVariant::Large,
    ];

    /// Name of the model as used by the engine and in model files
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelVariant::Tiny => "tiny",
            ModelVariant::TinyEn => "tiny.en",
            ModelVariant::Base => "base",
            ModelVariant::BaseEn => "base.en",
            ModelVariant::Small => "small",
            ModelVariant::SmallEn => "small.en",
            ModelVariant::Medium => "medium",
            ModelVariant::MediumEn => "medium.en",
            ModelVariant::Turbo => "turbo",
            ModelVariant::Large => "large",
        }
    }

    /// English-only variants cannot handle any other language
    pub fn is_english_only(&self) -> bool {
        matches!(
            self,
            ModelVariant::TinyEn
                | ModelVariant::BaseEn
                | ModelVariant::SmallEn
                | ModelVariant::MediumEn
        )
    }
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoding parameters for the recognizer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AsrSettings {
    pub beam_size: u32,
    pub temperature: f32,
    /// Added to the temperature each time decoding falls back
    pub temperature_increment_on_fallback: f32,
    /// Segments above this compression (entropy) threshold are decoded again
    pub compression_ratio_threshold: f32,
    pub log_prob_threshold: f32,
    pub no_speech_threshold: f32,
    /// Text fed to the decoder as context before the first segment
    pub initial_prompt: Option<String>,
    /// Keep digits and currency symbols out of the output
    pub suppress_numerals: bool,
}

impl Default for AsrSettings {
    fn default() -> Self {
        Self {
            beam_size: 5,
            temperature: 0.0,
            temperature_increment_on_fallback: 0.2,
            compression_ratio_threshold: 2.4,
            log_prob_threshold: -1.0,
            no_speech_threshold: 0.6,
            initial_prompt: None,
            suppress_numerals: false,
        }
    }
}

/// Voice activity detection ahead of recognition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VadSettings {
    /// Speech probability above which a frame counts as speech
    pub vad_onset: f32,
    /// Longest stretch of speech handed to the recognizer at once, in seconds
    pub chunk_size: u32,
}

impl Default for VadSettings {
    fn default() -> Self {
        Self {
            vad_onset: 0.5,
            chunk_size: 30,
        }
    }
}

/// Speaker labelling
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiarizationSettings {
    pub min_speakers: Option<u32>,
    pub max_speakers: Option<u32>,
}

/// How subtitle cues are laid out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubtitleLayout {
    /// Wrap cue text at this many characters
    pub max_line_width: Option<u32>,
    /// Start a new cue after this many lines; needs `max_line_width`
    pub max_line_count: Option<u32>,
    /// Mark each word as it is spoken (needs word timings)
    pub highlight_words: bool,
}

/// Post-processing of the recognized segments
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignmentSettings {
    pub processing: SubtitleLayout,
}

/// Options controlling how a job is transcribed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionOptions {
    #[serde(default)]
    pub task: Task,
    #[serde(default)]
    pub model: ModelVariant,
    /// ISO 639 language hint, `None` means automatic detection
    #[serde(default)]
    pub language: Option<String>,
    /// `None` keeps one cue per recognized segment
    #[serde(default)]
    pub alignment: Option<AlignmentSettings>,
    #[serde(default)]
    pub diarization: Option<DiarizationSettings>,
    /// `None` disables voice activity detection
    #[serde(default, rename = "vad_settings")]
    pub vad: Option<VadSettings>,
    #[serde(default, rename = "asr_settings")]
    pub asr: AsrSettings,
}

/// Reasons a set of options cannot be processed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OptionsError {
    #[error("model '{model}' only supports English, but language is {language}")]
    EnglishOnlyModel { model: ModelVariant, language: String },

    #[error("cannot translate English into English")]
    TranslateEnglish,

    #[error("invalid language code '{0}'")]
    InvalidLanguage(String),

    #[error("alignment is not supported for translation")]
    AlignmentWithTranslation,

    #[error("max_line_count requires max_line_width")]
    LineCountWithoutWidth,

    #[error("max_speakers ({max}) is smaller than min_speakers ({min})")]
    SpeakerRange { min: u32, max: u32 },

    #[error("{field} is out of range: {reason}")]
    OutOfRange { field: &'static str, reason: &'static str },
}

const MAX_PROMPT_CHARS: usize = 2000;

fn negative_or_nan(value: f32) -> bool {
    value.is_nan() || value < 0.0
}

impl TranscriptionOptions {
    /// Subtitle layout requested for the rendered formats
    pub fn subtitle_layout(&self) -> SubtitleLayout {
        self.alignment
            .map(|alignment| alignment.processing)
            .unwrap_or_default()
    }

    /// Checks the combination of options before any work is started
    pub fn validate(&self) -> Result<(), OptionsError> {
        if let Some(language) = &self.language {
            let valid = (2..=3).contains(&language.len())
                && language.chars().all(|c| c.is_ascii_lowercase());
            if !valid {
                return Err(OptionsError::InvalidLanguage(language.clone()));
            }
        }

        if self.model.is_english_only() && self.language.as_deref() != Some("en") {
            return Err(OptionsError::EnglishOnlyModel {
                model: self.model,
                language: self
                    .language
                    .clone()
                    .unwrap_or_else(|| "auto".to_string()),
            });
        }

        if self.task == Task::Translate && self.language.as_deref() == Some("en") {
            return Err(OptionsError::TranslateEnglish);
        }

        if let Some(alignment) = &self.alignment {
            if self.task == Task::Translate {
                return Err(OptionsError::AlignmentWithTranslation);
            }
            let layout = alignment.processing;
            if layout.max_line_count.is_some() && layout.max_line_width.is_none() {
                return Err(OptionsError::LineCountWithoutWidth);
            }
            if layout.max_line_width == Some(0) || layout.max_line_count == Some(0) {
                return Err(OptionsError::OutOfRange {
                    field: "alignment.processing",
                    reason: "line width and count must be at least 1",
                });
            }
        }

        if let Some(DiarizationSettings {
            min_speakers: Some(min),
            max_speakers: Some(max),
        }) = self.diarization
        {
            if max < min {
                return Err(OptionsError::SpeakerRange { min, max });
            }
        }

        if let Some(vad) = &self.vad {
            if !(0.0..=1.0).contains(&vad.vad_onset) {
                return Err(OptionsError::OutOfRange {
                    field: "vad_settings.vad_onset",
                    reason: "must be between 0 and 1",
                });
            }
            if !(1..=30).contains(&vad.chunk_size) {
                return Err(OptionsError::OutOfRange {
                    field: "vad_settings.chunk_size",
                    reason: "must be between 1 and 30 seconds",
                });
            }
        }

        self.asr.validate()
    }
}

impl AsrSettings {
    fn validate(&self) -> Result<(), OptionsError> {
        let out_of_range = |field, reason| Err(OptionsError::OutOfRange { field, reason });

        if self.beam_size == 0 {
            return out_of_range("asr_settings.beam_size", "must be at least 1");
        }
        if negative_or_nan(self.temperature) {
            return out_of_range("asr_settings.temperature", "must not be negative");
        }
        if negative_or_nan(self.temperature_increment_on_fallback) {
            return out_of_range(
                "asr_settings.temperature_increment_on_fallback",
                "must not be negative",
            );
        }
        if negative_or_nan(self.compression_ratio_threshold) {
            return out_of_range(
                "asr_settings.compression_ratio_threshold",
                "must not be negative",
            );
        }
        if !self.log_prob_threshold.is_finite() || !self.no_speech_threshold.is_finite() {
            return out_of_range("asr_settings", "thresholds must be finite numbers");
        }
        if self
            .initial_prompt
            .as_ref()
            .is_some_and(|prompt| prompt.chars().count() > MAX_PROMPT_CHARS)
        {
            return out_of_range("asr_settings.initial_prompt", "longer than 2000 characters");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(task: Task, model: ModelVariant, language: Option<&str>) -> TranscriptionOptions {
        TranscriptionOptions {
            task,
            model,
            language: language.map(str::to_string),
            ..TranscriptionOptions::default()
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(TranscriptionOptions::default().validate().is_ok());
    }

    #[test]
    fn test_english_only_model_requires_english() {
        let auto = options(Task::Transcribe, ModelVariant::BaseEn, None);
        assert!(matches!(
            auto.validate(),
            Err(OptionsError::EnglishOnlyModel { .. })
        ));

        let german = options(Task::Transcribe, ModelVariant::SmallEn, Some("de"));
        assert!(german.validate().is_err());

        let english = options(Task::Transcribe, ModelVariant::TinyEn, Some("en"));
        assert!(english.validate().is_ok());
    }

    #[test]
    fn test_translate_english_rejected() {
        let opts = options(Task::Translate, ModelVariant::Large, Some("en"));
        assert_eq!(opts.validate(), Err(OptionsError::TranslateEnglish));

        let opts = options(Task::Translate, ModelVariant::Large, Some("fr"));
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_language_code_shape() {
        for bad in ["", "e", "ENG", "en-US", "engl"] {
            let opts = options(Task::Transcribe, ModelVariant::Base, Some(bad));
            assert!(opts.validate().is_err(), "{bad} should be rejected");
        }
        let opts = options(Task::Transcribe, ModelVariant::Base, Some("yue"));
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_model_serde_names() {
        let opts: TranscriptionOptions =
            serde_json::from_str(r#"{"task":"translate","model":"medium.en","language":"en"}"#)
                .unwrap();
        assert_eq!(opts.task, Task::Translate);
        assert_eq!(opts.model, ModelVariant::MediumEn);
        assert_eq!(
            serde_json::to_string(&ModelVariant::TinyEn).unwrap(),
            "\"tiny.en\""
        );
    }

    #[test]
    fn test_settings_groups_deserialize() {
        let opts: TranscriptionOptions = serde_json::from_str(
            r#"{
                "language": "de",
                "alignment": {"processing": {"max_line_width": 42, "max_line_count": 2}},
                "diarization": {"min_speakers": 2},
                "vad_settings": {"vad_onset": 0.4},
                "asr_settings": {"beam_size": 3, "initial_prompt": "Glossar", "patience": 1.0}
            }"#,
        )
        .unwrap();

        assert_eq!(opts.subtitle_layout().max_line_width, Some(42));
        assert_eq!(opts.subtitle_layout().max_line_count, Some(2));
        assert_eq!(opts.diarization.as_ref().unwrap().min_speakers, Some(2));
        assert_eq!(opts.vad.as_ref().unwrap().chunk_size, 30);
        assert_eq!(opts.asr.beam_size, 3);
        assert_eq!(opts.asr.temperature_increment_on_fallback, 0.2);
        assert_eq!(opts.asr.initial_prompt.as_deref(), Some("Glossar"));
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_settings_groups_validated() {
        let mut opts = TranscriptionOptions {
            task: Task::Translate,
            alignment: Some(AlignmentSettings::default()),
            ..TranscriptionOptions::default()
        };
        assert_eq!(opts.validate(), Err(OptionsError::AlignmentWithTranslation));

        opts.task = Task::Transcribe;
        opts.alignment = Some(AlignmentSettings {
            processing: SubtitleLayout {
                max_line_count: Some(2),
                ..SubtitleLayout::default()
            },
        });
        assert_eq!(opts.validate(), Err(OptionsError::LineCountWithoutWidth));

        opts.alignment = None;
        opts.diarization = Some(DiarizationSettings {
            min_speakers: Some(3),
            max_speakers: Some(2),
        });
        assert_eq!(
            opts.validate(),
            Err(OptionsError::SpeakerRange { min: 3, max: 2 })
        );

        opts.diarization = None;
        opts.vad = Some(VadSettings {
            chunk_size: 31,
            ..VadSettings::default()
        });
        assert!(matches!(opts.validate(), Err(OptionsError::OutOfRange { .. })));

        opts.vad = None;
        opts.asr.beam_size = 0;
        assert!(matches!(opts.validate(), Err(OptionsError::OutOfRange { .. })));

        opts.asr.beam_size = 5;
        opts.asr.temperature = f32::NAN;
        assert!(matches!(opts.validate(), Err(OptionsError::OutOfRange { .. })));

        opts.asr.temperature = 0.0;
        opts.asr.initial_prompt = Some("x".repeat(2001));
        assert!(matches!(opts.validate(), Err(OptionsError::OutOfRange { .. })));
    }
}
