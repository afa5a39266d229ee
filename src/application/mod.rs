pub mod accounts;
pub mod bootstrap;
pub mod clock;
pub mod commands;
pub mod ledger;
pub mod reports;
pub mod scheduler;
pub mod sync_engine;
