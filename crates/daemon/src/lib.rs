//! recstation
//!
//! Recording back end: reservation scheduling across tuners, recording
//! capture, encode and HLS stream supervision in a worker process, and the
//! control channel between the two processes.

pub mod concurrency;
pub mod control;
pub mod daemon;
pub mod encode;
pub mod ipc;
pub mod logging;
pub mod metrics;
pub mod metrics_server;
pub mod model;
pub mod process;
pub mod recorder;
pub mod scheduler;
pub mod store;
pub mod stream;
pub mod worker;

pub use recstation_config as config;
pub use recstation_config::Config;
pub use concurrency::{derive_plan, ConcurrencyPlan};
pub use daemon::{run_worker, Daemon, DaemonError};
pub use encode::{EncodeError, EncodeOutcome, EncodeProgram, EncodeSupervisor};
pub use ipc::{IpcClient, IpcError, IpcServer};
pub use logging::init_logging;
pub use metrics::{new_shared_status, SharedStatus, StatusSnapshot};
pub use metrics_server::{create_metrics_router, run_metrics_server, ServerError};
pub use recorder::{RecordError, Recorder};
pub use scheduler::{recompute, ReservationManager, ReserveError, Schedule, ScheduleError};
pub use store::{MemoryStore, Store, StoreError};
pub use stream::{StreamError, StreamManager, StreamSource, StreamState};
pub use worker::Worker;
