pub mod archive;
pub mod binaries;
pub mod bootimage;
pub mod build;
pub mod config;
pub mod devtree;
pub mod error;
pub mod executor;
pub mod fetch;
pub mod materialize;
pub mod model;
pub mod paths;
pub mod pipeline;
pub mod report;
pub mod selection;
pub mod snapshot;
pub mod summary;
pub mod toolchain;

pub use error::{Error, Result};
