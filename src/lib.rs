pub mod clients;
pub mod config;
pub mod kv;
pub mod migration;
pub mod model;
pub mod poller;
pub mod processor;
pub mod scheduler;
pub mod server;
pub mod sourcer;
pub mod worker;

pub use config::AppConfig;
pub use kv::{ScheduledCall, SentMessage, Status, StoreError, Storer};
pub use model::{Call, Campaign, Destination, Event, Source, Trigger};
pub use poller::Poller;
pub use scheduler::{Scheduler, SchedulerError};
pub use worker::Worker;
