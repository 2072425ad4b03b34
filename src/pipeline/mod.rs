//! Reply pipeline stages between the LLM and the client: sentence
//! segmentation and strictly ordered speech synthesis.

pub mod segmenter;
pub mod synthesizer;

pub use segmenter::SentenceSegmenter;
pub use synthesizer::{SentenceQueue, SequentialSynthesizer, SynthesisPlan, SynthesisSummary};
