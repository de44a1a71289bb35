//! Stateful mock of [`AuthTransport`](super::AuthTransport) keyed by host, so tests can
//! script per-server failures and responses without touching the network.

#![cfg(test)]

use std::collections::HashMap;
use std::sync::Mutex;

use super::{AuthTransport, Error};

#[derive(Debug, Default)]
struct State {
    responses: HashMap<String, String>,
    failures: HashMap<String, String>,
    calls: Vec<String>,
}

#[derive(Default)]
pub struct MockAuthTransport {
    state: Mutex<State>,
}

impl MockAuthTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn respond_with(&self, host: &str, body: &str) {
        self.lock().responses.insert(host.to_string(), body.to_string());
    }

    pub fn fail_host(&self, host: &str) {
        self.lock().failures.insert(host.to_string(), "simulated connect failure".to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    fn host_in(url: &str) -> String {
        url.split("://").nth(1).and_then(|rest| rest.split([':', '/']).next()).unwrap_or(url).to_string()
    }
}

impl AuthTransport for MockAuthTransport {
    fn get(&self, url: &str, _query: &[(&str, String)]) -> Result<String, Error> {
        let host = Self::host_in(url);
        let mut state = self.lock();
        state.calls.push(host.clone());

        if let Some(msg) = state.failures.get(&host) {
            return Err(Error::Connect(msg.clone()));
        }

        Ok(state.responses.get(&host).cloned().unwrap_or_else(|| "Auth: -1".to_string()))
    }
}
