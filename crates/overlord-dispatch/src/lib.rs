//! Turns queued tasks into executed, reviewed work: worktree provisioning,
//! mission briefs, the dispatch lifecycle, natural-language plan parsing,
//! the plan executor, and release coordination.

pub mod detectors;
pub mod dispatcher;
pub mod dispatch_engine;
pub mod mirrors;
pub mod mission_brief;
pub mod release;
pub mod scanner;
pub mod task_parser;

pub use detectors::{DetectionEngine, DetectionResult, Severity};
pub use dispatcher::{DispatchOptions, Dispatcher};
pub use dispatch_engine::{build_simple_plan, DispatchEngine, DispatchResult, StepResult};
pub use mirrors::{MirrorError, MirrorManager, MirrorResult};
pub use scanner::{detect_test_command, scan_ecosystem, scan_project, GitState, ProjectStatus, TestHealth};
pub use release::{
    parse_version_string, suggest_next_version, validate_release_spec, ReleaseCoordinator, ReleaseError, ReleaseSpec,
    VersionBump,
};
pub use task_parser::{ParseError, TaskParser};
