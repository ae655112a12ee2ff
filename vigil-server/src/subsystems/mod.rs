pub mod dedupe;
pub mod enrich;
pub mod fallback;
pub mod pipeline;
pub mod query;
pub mod retention;
pub mod run_control;
pub mod scheduler;
pub mod translate;
