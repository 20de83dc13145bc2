//! rollcall: a task execution and event-routing engine for recurring chat
//! automation. Cron-scheduled tasks run through a retrying, per-account
//! serialized runner; handlers converse with remote bots through per-peer
//! FIFO event queues and record every run in SQLite.

pub mod chat;
pub mod logging;
pub mod model;
pub mod router;
pub mod runner;
pub mod scheduler;
pub mod settings;
pub mod solver;
pub mod store;
pub mod tasks;
