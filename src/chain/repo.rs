use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;

use super::Chain;

#[derive(Debug, Error, PartialEq)]
pub enum RepoError {
    #[error("chain for request {0} already exists")]
    AlreadyExists(String),
}

/// Process-wide map of running chains, keyed by request id.
///
/// `add` rejects duplicates, which is what prevents one Job Runner from
/// accepting the same chain twice.
#[derive(Clone, Default)]
pub struct Repo {
    chains: Arc<Mutex<HashMap<String, Arc<Chain>>>>,
}

impl Repo {
    pub fn new() -> Self {
        Repo::default()
    }

    pub fn add(&self, chain: Arc<Chain>) -> Result<(), RepoError> {
        let mut chains = self.chains.lock().unwrap();
        let request_id = chain.request_id();
        if chains.contains_key(&request_id) {
            return Err(RepoError::AlreadyExists(request_id));
        }
        chains.insert(request_id, chain);
        Ok(())
    }

    pub fn get(&self, request_id: &str) -> Option<Arc<Chain>> {
        self.chains.lock().unwrap().get(request_id).cloned()
    }

    pub fn remove(&self, request_id: &str) {
        self.chains.lock().unwrap().remove(request_id);
    }

    pub fn count(&self) -> usize {
        self.chains.lock().unwrap().len()
    }
}
