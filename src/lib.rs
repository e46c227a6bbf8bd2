pub mod config;
pub mod error;
pub mod extractor;
pub mod ledger;
pub mod routes;
pub mod webhooks;
