//! Encoding modules for recstation

pub mod supervisor;

pub use supervisor::{
    CompletionCallback, EncodeCompletion, EncodeError, EncodeJob, EncodeJobInfo, EncodeOutcome,
    EncodeProgram, EncodeStats, EncodeSupervisor, JobId, JobState,
};
