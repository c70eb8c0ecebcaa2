pub mod icons;
pub mod progress;
pub mod prompt;

pub use progress::{ConductorUI, UiSink};
pub use prompt::CheckpointPrompt;
