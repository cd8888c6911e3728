//! Services module for grants-service.

pub mod error;
pub mod memory;
pub mod metrics;
pub mod mongo;
pub mod postgres;
pub mod storer;

pub use error::GrantError;
pub use memory::{MemoryFactory, MemoryStorer};
pub use metrics::{get_metrics, init_metrics};
pub use mongo::{MongoFactory, MongoStorer};
pub use postgres::{PostgresFactory, PostgresStorer};
pub use storer::{Storer, StorerFactory};
