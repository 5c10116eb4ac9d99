//! Ragged batch items.

use super::{Codes, Task};

/// Prompt audio for one item: absent, one clip, or several segments.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Prompt {
    #[default]
    Absent,
    Single(Codes),
    Segments(Vec<Codes>),
}

impl Prompt {
    pub fn is_absent(&self) -> bool {
        match self {
            Self::Absent => true,
            Self::Single(_) => false,
            Self::Segments(segments) => segments.is_empty(),
        }
    }

    /// Smallest level count across all segments, `None` when absent.
    pub fn min_levels(&self) -> Option<usize> {
        match self {
            Self::Absent => None,
            Self::Single(codes) => Some(codes.levels()),
            Self::Segments(segments) => segments.iter().map(Codes::levels).min(),
        }
    }

    /// Total timesteps across segments.
    pub fn len(&self) -> usize {
        match self {
            Self::Absent => 0,
            Self::Single(codes) => codes.len(),
            Self::Segments(segments) => segments.iter().map(Codes::len).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keep levels `[0, levels)` of every segment.
    pub fn truncate_levels(&self, levels: usize) -> Self {
        match self {
            Self::Absent => Self::Absent,
            Self::Single(codes) => Self::Single(codes.truncate_levels(levels)),
            Self::Segments(segments) => Self::Segments(
                segments
                    .iter()
                    .map(|codes| codes.truncate_levels(levels))
                    .collect(),
            ),
        }
    }
}

impl From<Codes> for Prompt {
    fn from(codes: Codes) -> Self {
        Self::Single(codes)
    }
}

/// One example of a batch.
///
/// Fields a task does not use stay `None`. `response` holds the ground truth
/// when training, the AR output when running the NAR, and the source audio
/// for speech-to-text.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchItem {
    pub task: Task,
    /// Phoneme token ids, wrapped in bos/eos
    pub phonemes: Option<Vec<u32>>,
    /// Raw (un-phonemized) text token ids
    pub text: Option<Vec<u32>>,
    pub language: Option<u32>,
    pub tone: Option<u32>,
    pub prompt: Prompt,
    pub response: Option<Codes>,
    /// Output length in timesteps, sizing the masked-decode canvas
    pub target_len: Option<usize>,
}

impl BatchItem {
    pub fn new(task: Task) -> Self {
        Self {
            task,
            phonemes: None,
            text: None,
            language: None,
            tone: None,
            prompt: Prompt::Absent,
            response: None,
            target_len: None,
        }
    }

    /// A text-to-speech item.
    pub fn tts(phonemes: Vec<u32>, prompt: impl Into<Prompt>) -> Self {
        Self {
            phonemes: Some(phonemes),
            prompt: prompt.into(),
            ..Self::new(Task::Tts)
        }
    }

    pub fn with_response(mut self, response: Codes) -> Self {
        self.response = Some(response);
        self
    }

    pub fn with_text(mut self, text: Vec<u32>) -> Self {
        self.text = Some(text);
        self
    }

    pub fn with_language(mut self, language: u32) -> Self {
        self.language = Some(language);
        self
    }

    pub fn with_tone(mut self, tone: u32) -> Self {
        self.tone = Some(tone);
        self
    }

    pub fn with_target_len(mut self, len: usize) -> Self {
        self.target_len = Some(len);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_levels() {
        assert_eq!(Prompt::Absent.min_levels(), None);
        let segments = Prompt::Segments(vec![Codes::filled(3, 4, 0), Codes::filled(2, 2, 0)]);
        assert_eq!(segments.min_levels(), Some(2));
        assert_eq!(segments.len(), 5);
        assert!(Prompt::Segments(vec![]).is_absent());
    }

    #[test]
    fn test_prompt_truncate_levels() {
        let prompt = Prompt::Single(Codes::filled(5, 8, 7)).truncate_levels(3);
        assert_eq!(prompt.min_levels(), Some(3));
        assert_eq!(prompt.len(), 5);
    }

    #[test]
    fn test_builder() {
        let item = BatchItem::tts(vec![1, 5, 2], Codes::filled(75, 8, 0))
            .with_language(0)
            .with_target_len(120);
        assert_eq!(item.task, Task::Tts);
        assert_eq!(item.prompt.len(), 75);
        assert_eq!(item.target_len, Some(120));
        assert!(item.response.is_none());
    }
}
