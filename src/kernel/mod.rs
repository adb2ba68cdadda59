//! Kernel - the set of offices hosted by one runtime.
//!
//! The Kernel owns its offices by name. Each office has its own teams, asset
//! managers and monitoring service; the kernel only routes invocations and
//! coordinates start and shutdown.

mod monitoring;
mod recovery;

pub use monitoring::AssetMonitoringService;
pub use recovery::with_recovery;

use std::collections::HashMap;

use crate::function::Parameter;
use crate::office::{Office, ProcessHandle};
use crate::types::{Error, Result};

/// Hosts offices and routes invocations to them.
#[derive(Debug, Default)]
pub struct Kernel {
    offices: HashMap<String, Office>,
}

impl Kernel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_office(&mut self, office: Office) -> Result<()> {
        if self.offices.contains_key(office.name()) {
            return Err(Error::validation(format!("office '{}' already registered", office.name())));
        }
        tracing::info!(office = %office.name(), "office_registered");
        self.offices.insert(office.name().to_string(), office);
        Ok(())
    }

    pub fn office(&self, name: &str) -> Option<&Office> {
        self.offices.get(name)
    }

    pub fn office_names(&self) -> impl Iterator<Item = &str> {
        self.offices.keys().map(String::as_str)
    }

    pub fn invoke_function(&self, office: &str, function: &str, parameter: Option<Parameter>) -> Result<ProcessHandle> {
        self.offices
            .get(office)
            .ok_or_else(|| Error::not_found(format!("office '{}'", office)))?
            .invoke_function(function, parameter)
    }

    /// Start asset monitoring for every office.
    pub fn start(&self) -> Result<()> {
        for office in self.offices.values() {
            office.start()?;
        }
        Ok(())
    }

    /// Shut every office down. Returns whether all of them drained in time.
    pub async fn shutdown(&self) -> bool {
        let mut drained = true;
        for office in self.offices.values() {
            drained &= office.shutdown().await;
        }
        drained
    }
}
