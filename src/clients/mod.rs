pub mod traits;
pub mod vision;

pub use traits::{InferenceClient, InferenceError, VisionRequest, VisionResponse};
pub use vision::VisionClient;
