pub mod cli;
pub mod compare;
pub mod comparison;
pub mod diff;
pub mod error;
pub mod github;
pub mod provider;
pub mod report;
pub mod store;
pub mod traverse;
