// SPDX-License-Identifier: Apache-2.0

// Datasource drivers module

pub mod engine_driver;

pub use engine_driver::EngineDriver;
