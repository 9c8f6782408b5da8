// SPDX-License-Identifier: Apache-2.0

// Query Engine Module
// Embedded DuckDB session, driver registry and the shared types the
// attachment layer produces.

pub mod drivers;
pub mod error;
pub mod handle;
pub mod registry;
pub mod repository;
pub mod session;
pub mod session_manager;
pub mod traits;
pub mod types;
pub mod values;

pub use error::{EngineError, EngineResult};
pub use registry::DriverRegistry;
pub use repository::{DatasourceRepository, InMemoryDatasourceRepository};
pub use session::QueryEngineSession;
pub use session_manager::SessionManager;
pub use traits::DatasourceDriver;
pub use types::*;
