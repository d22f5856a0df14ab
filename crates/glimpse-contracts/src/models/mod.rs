mod registry;
mod selectors;

pub use registry::{ModelRegistry, ModelSpec, DEFAULT_VISION_MODEL, VISION_CAPABILITY};
pub use selectors::{ModelSelection, ModelSelector};
