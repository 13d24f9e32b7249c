//! Kiln runner
//!
//! Environment providers, the target pipeline engine, the build matrix
//! coordinator and the artifact publisher.

pub mod command;
pub mod config;
pub mod coordinator;
pub mod environment;
pub mod pipeline;
pub mod publisher;
pub mod store;
pub mod workspace;

pub use config::Config;
pub use coordinator::{Coordinator, MatrixReport, TargetReport, TargetStatus, select_targets};
pub use environment::{ContainerProvider, EnvironmentProvider, HostProvider, ModeProvider};
pub use pipeline::{PipelineSettings, TargetPipeline};
pub use publisher::Publisher;
pub use store::{ArtifactStore, open_store};
