pub mod cli;
pub mod config;
pub mod daemon;
pub mod dag;
pub mod error;
pub mod escalation;
pub mod events;
pub mod feature;
pub mod git;
pub mod history;
pub mod http_api;
pub mod orchestrator;
pub mod pr_client;
pub mod provider;
pub mod redact;
pub mod resource;
pub mod scheduler;
pub mod unit;
pub mod util;
pub mod worker;
pub mod worker_pool;
