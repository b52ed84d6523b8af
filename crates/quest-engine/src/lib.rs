pub mod locate;
pub mod normalize;
pub mod plugin;
pub mod provider;
pub mod timer;

pub use locate::{CaptureCommand, Screenshot, ScreenshotLocator, ScreenshotRef, ScreenshotSource};
pub use normalize::{normalize, NormalizedImage};
pub use plugin::QuestHelper;
pub use provider::{OpenAiChatProvider, ProviderFactory, VisionProvider, VisionRequest};
