//! Task tags.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::DecodeError;

/// What a batch item asks the model to do.
///
/// Parsed from the short tags used in datasets (`"tts"`, `"tts-c"`, ...);
/// anything else is rejected with [`DecodeError::UnknownTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Task {
    /// Text to speech
    Tts,
    /// Text to speech continuing the prompt audio
    TtsContinuation,
    /// Noise suppression: prompt is noisy speech, response is clean speech
    NoiseSuppression,
    /// Speech removal: prompt is noisy speech, response is the noise
    SpeechRemoval,
    /// Speech to text (phonemes)
    SpeechToText,
    /// Output-duration prediction
    Length,
    /// Raw text to phonemes
    Phonemize,
    /// Phonemes back to raw text
    Unphonemize,
}

/// Which text field a text-producing task writes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextField {
    Phonemes,
    Text,
}

impl Task {
    pub const ALL: [Task; 8] = [
        Task::Tts,
        Task::TtsContinuation,
        Task::NoiseSuppression,
        Task::SpeechRemoval,
        Task::SpeechToText,
        Task::Length,
        Task::Phonemize,
        Task::Unphonemize,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tts => "tts",
            Self::TtsContinuation => "tts-c",
            Self::NoiseSuppression => "ns",
            Self::SpeechRemoval => "sr",
            Self::SpeechToText => "stt",
            Self::Length => "len",
            Self::Phonemize => "phn",
            Self::Unphonemize => "un-phn",
        }
    }

    /// Tasks whose output is a text sequence rather than audio codes.
    pub fn is_text_output(&self) -> bool {
        self.text_output_field().is_some()
    }

    /// The field a text-producing task decodes into.
    pub fn text_output_field(&self) -> Option<TextField> {
        match self {
            Self::SpeechToText | Self::Phonemize => Some(TextField::Phonemes),
            Self::Unphonemize => Some(TextField::Text),
            _ => None,
        }
    }

    /// Tasks that produce audio codes.
    pub fn is_audio_output(&self) -> bool {
        !self.is_text_output() && *self != Self::Length
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Task {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Task::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DecodeError::UnknownTask(s.to_string()))
    }
}

impl TryFrom<String> for Task {
    type Error = DecodeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Task> for String {
    fn from(task: Task) -> Self {
        task.as_str().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_all_tags() {
        for task in Task::ALL {
            assert_eq!(task.as_str().parse::<Task>().unwrap(), task);
        }
    }

    #[test]
    fn test_unknown_tag_rejected() {
        assert_eq!(
            "karaoke".parse::<Task>(),
            Err(DecodeError::UnknownTask("karaoke".into()))
        );
        // tags are case sensitive
        assert!("TTS".parse::<Task>().is_err());
    }

    #[test]
    fn test_text_tasks() {
        assert_eq!(
            Task::SpeechToText.text_output_field(),
            Some(TextField::Phonemes)
        );
        assert_eq!(Task::Unphonemize.text_output_field(), Some(TextField::Text));
        assert!(!Task::Tts.is_text_output());
        assert!(!Task::Length.is_audio_output());
        assert!(Task::NoiseSuppression.is_audio_output());
    }

    #[test]
    fn test_serde_uses_tags() {
        let json = serde_json::to_string(&Task::TtsContinuation).unwrap();
        assert_eq!(json, "\"tts-c\"");
        let task: Task = serde_json::from_str("\"un-phn\"").unwrap();
        assert_eq!(task, Task::Unphonemize);
        assert!(serde_json::from_str::<Task>("\"nope\"").is_err());
    }
}
