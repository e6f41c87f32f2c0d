//! Batch generation pipeline: strategies, sampling, and the orchestrating loop.

mod backend;
mod cache;
mod orchestrator;
mod preprocess;
mod processed;
mod request;
mod sampling;
mod txt2img;

pub use backend::{
    ConditioningKey, Conditioner, Embedding, FaceRestorer, ImageConditioning, ImageSink, JobState, LatentTensor,
    ModelBackend, NoScripts, NoStyles, NullSink, OutputKind, PromptStyle, PromptStyles, Sampler, SamplerCall, SaveRequest, Scripts,
    StyleApplier,
};
pub use cache::{ConditioningCache, Polarity};
pub use orchestrator::{process_images, process_images_inner, Collaborators, Processing, Stage};
pub use preprocess::{Img2Img, PostprocessInputs, PreparedBatch};
pub use processed::{create_infotext, format_float, quote, InfotextContext, Processed};
pub use request::{BatchSlice, GenerationRequest, Prompt, SeedPlan};
pub use sampling::{recomposite, scale_noise, LatentMasks, SamplingDriver};
pub use txt2img::{txt2img_image_conditioning, Txt2Img};
