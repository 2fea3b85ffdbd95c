pub mod audio;
pub mod batch;
pub mod config;
pub mod error;
pub mod extract;
pub mod pipeline;
pub mod resources;

pub use audio::{ClipPosition, SourceMedia, TimeRange};
pub use batch::{BatchProcessor, BatchReport, BatchStats, BatchUnit, UnitOutcome};
pub use config::{AudioConfig, Config, Preset, RetryPolicy, SamplerConfig};
pub use error::{ExtractionFailure, Result, SamplerError};
pub use extract::{Cascade, ErrorCategory, ExtractionBackend, RetryOrchestrator};
pub use pipeline::{print_summary, ExtractionResult, Sampler};
pub use resources::{Artifact, ResourceManager};
