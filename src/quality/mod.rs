//! Output quality guards for generated text.
//!
//! Currently this is the repetition-loop detector consulted by the
//! generation retry engine.

mod repetition;

pub use repetition::{
    Detection, RepetitionCheck, RepetitionDetector, DEFAULT_MIN_LENGTH, DEFAULT_THRESHOLD,
};
