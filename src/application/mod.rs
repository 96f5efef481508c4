//! Application layer: error boundary, the demonstration site and route listing.

pub mod error;
pub mod routes;
pub mod site;
