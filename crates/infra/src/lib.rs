//! Infrastructure layer: event store, command pipeline, webhook intake,
//! collaborators, configuration and the application services built on them.

pub mod command_dispatcher;
pub mod config;
pub mod event_store;
pub mod external;
pub mod postgres;
pub mod projections;
pub mod retry;
pub mod services;
pub mod streams;
pub mod unit_of_work;
pub mod webhook;

mod integration_tests;
