//! Gateway over the MongoDB driver.
//!
//! Everything the rebuild machinery needs from the server goes through the
//! [`MongoGateway`] trait, so tests can substitute an in-memory deployment.

mod driver;
mod gateway;

pub use driver::DriverGateway;
pub use gateway::{CollStats, MongoGateway, ReplSetInfo};
