pub mod api;
pub mod diff;
pub mod events;
pub mod job;

pub use api::{gate_verdict, ScoreResponse, SyncReviewRequest, SyncReviewResponse};
pub use diff::{chunk_files, split_files, DiffChunk, DiffFilter, FileDiff, FilteredDiff};
pub use events::{ImportEvent, ImportEventKind, ReviewEvent, ReviewEventKind};
pub use job::{
    Author, ChangeStats, JobEventType, JobId, JobStatus, MergeRequestRef, NewJob, ReviewJob,
};

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

/// Short commit hash this build came from, or `"unknown"`.
pub fn version() -> String {
    let hash = option_env!("REVHOOK_GIT_HASH").or(built_info::GIT_COMMIT_HASH);
    match hash {
        Some(hash) => abbreviate(hash, 8).to_string(),
        None => "unknown".to_string(),
    }
}

/// The first `len` characters of `hash`, or all of it if shorter.
///
/// Hashes arrive from webhooks and the environment, so this never assumes ASCII.
pub fn abbreviate(hash: &str, len: usize) -> &str {
    match hash.char_indices().nth(len) {
        Some((end, _)) => &hash[..end],
        None => hash,
    }
}
