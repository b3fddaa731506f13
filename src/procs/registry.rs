// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::collections::HashMap;
use std::sync::Arc;

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::procs::ManagedProcess;
use crate::Error;

const ID_LEN: usize = 10;

/// All commands of one configuration generation, in the order they were configured.
///
/// A registry is built once per (re)load and then only read, a reload replaces it wholesale.
#[derive(Debug, Default)]
pub struct CommandRegistry {
    order: Vec<Arc<ManagedProcess>>,
    index: HashMap<String, usize>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A random id not used by any command in this registry
    pub fn generate_id(&self) -> String {
        let mut rng = rand::thread_rng();
        loop {
            let id: String = (&mut rng)
                .sample_iter(&Alphanumeric)
                .take(ID_LEN)
                .map(char::from)
                .collect();

            if !self.index.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn insert(&mut self, process: ManagedProcess) -> Result<Arc<ManagedProcess>, Error> {
        if self.index.contains_key(process.id()) {
            return Err(format!("duplicate command id: {}", process.id()).into());
        }

        let process = Arc::new(process);
        self.index.insert(process.id().to_string(), self.order.len());
        self.order.push(Arc::clone(&process));
        Ok(process)
    }

    pub fn get(&self, id: &str) -> Option<&Arc<ManagedProcess>> {
        self.index.get(id).map(|&idx| &self.order[idx])
    }

    /// Finds a command by exact id, else by id prefix or name prefix.
    ///
    /// Prefixes are not disambiguated, the first match in configuration order wins.
    pub fn resolve(&self, reference: &str) -> Option<&Arc<ManagedProcess>> {
        if reference.is_empty() {
            return None;
        }

        self.get(reference).or_else(|| {
            self.order
                .iter()
                .find(|p| p.id().starts_with(reference) || p.name().starts_with(reference))
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ManagedProcess>> {
        self.order.iter()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
