pub mod accounts;
pub mod categories;
pub mod classify;
pub mod config;
pub mod db;
pub mod filter;
pub mod gmail;
pub mod jobs;
pub mod ledger;
pub mod lifecycle;
pub mod migrations;
pub mod processor;
pub mod publish;
pub mod queue;
pub mod reconcile;
pub mod telemetry;
pub mod throttle;
pub mod watches;
pub mod worker;

pub use accounts::{Account, AccountConfig, AccountRepository};
pub use categories::{Category, CategoryRepository};
pub use classify::{Classification, Classifier, ClassifyInput, KeywordClassifier};
pub use config::Config;
pub use db::Database;
pub use filter::{ReceiptFilter, receipt_time};
pub use jobs::{AccountTokenStore, JobDispatcher};
pub use ledger::{ClaimOutcome, Ledger, LedgerEntry};
pub use lifecycle::{SetupOutcome, WatchLifecycle};
pub use processor::{MessageProcessor, ProcessSummary};
pub use publish::{
    MailboxNotification, PushEnvelope, SYNC_MAILBOX_JOB, SyncJobPayload, decode_notification,
    publish_sync_job,
};
pub use queue::{Job, JobContext, JobQueue, JobState};
pub use reconcile::{CandidateTier, find_candidates};
pub use telemetry::{TelemetryError, init_logging, init_telemetry};
pub use throttle::{InMemoryThrottle, NotificationThrottle};
pub use watches::{Watch, WatchRepository};
pub use worker::{JobError, JobExecutor, WorkerConfig, run_worker};
