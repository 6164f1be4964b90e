pub mod cancel;
pub mod classify;
pub mod component;
pub mod config;
pub mod error;
pub mod filter;
pub mod finalize;
mod graph;
pub mod order;
mod parse;
pub mod parser;
pub mod paths;
mod pool;
pub mod pipeline;
pub mod registry;
mod relations;
mod walker;
pub mod worktree;

pub use cancel::CancelToken;
pub use classify::{Classifier, ClassifyCtx, Decision};
pub use component::{
    CandidacyReason, Component, ComponentKind, ComponentRecord, DiscoveryContext, DiscoveryOrigin,
    DiscoveryResult, PhaseTag, Status, STACK_CONFIG_FILE, UNIT_CONFIG_FILE,
};
pub use config::{DiscoveryConfig, FileConfig};
pub use error::DiscoveryError;
pub use filter::{parse_query, FilterExpr};
pub use finalize::CycleBreak;
pub use order::run_levels;
pub use parser::{ConfigParser, ExcludeBlock, ParsedUnit};
pub use pipeline::{Discovery, DiscoveryOutcome};
pub use registry::ComponentRegistry;
pub use walker::IGNORABLE_DIRS;
pub use worktree::{Worktree, WorktreeProvider, DESTROY_ARG};
