pub mod auth;
pub mod calendar;
pub mod clock;
pub mod config;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod scheduler;
pub mod sql;
pub mod store;
pub mod tls;
pub mod wal;
pub mod wire;
