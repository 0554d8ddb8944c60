pub mod enrichment;
mod error;
pub mod pool;
pub mod prober;
pub mod report;
pub mod runner;
pub mod settings;
pub mod transport;

pub use error::{Error, Result};
