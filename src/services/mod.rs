pub mod admission;
pub mod encryption;
pub mod gemini;
pub mod generation;
pub mod prompt;
pub mod queue;
pub mod storage;
pub mod watermark;
pub mod worker;
