//! Scripted transport for tests and dry runs.
//!
//! Queries are answered from a script: one-shot replies are consumed first,
//! in order, then the standing reply for that command applies. Every line
//! sent through the adapter is logged so tests can assert on the exact
//! command sequence an instrument saw.

use super::ScpiTransport;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Default)]
struct MockState {
    connected: bool,
    refuse_connect: bool,
    standing: HashMap<String, String>,
    queued: HashMap<String, VecDeque<String>>,
    log: Vec<String>,
}

/// Cloneable handle; clones share one script and one command log.
#[derive(Clone, Default)]
pub struct MockAdapter {
    state: Arc<Mutex<MockState>>,
}

impl MockAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Answer `command` with `response` every time.
    pub fn reply(&self, command: &str, response: &str) -> &Self {
        self.state()
            .standing
            .insert(command.to_string(), response.to_string());
        self
    }

    /// Answer the next `command` with `response`; queued replies go first.
    pub fn reply_once(&self, command: &str, response: &str) -> &Self {
        self.state()
            .queued
            .entry(command.to_string())
            .or_default()
            .push_back(response.to_string());
        self
    }

    /// Make the next connect attempt fail.
    pub fn refuse_connect(&self) -> &Self {
        self.state().refuse_connect = true;
        self
    }

    /// Every line sent so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.state().log.clone()
    }

    /// Position of the first logged line equal to `command`.
    pub fn position(&self, command: &str) -> Option<usize> {
        self.state().log.iter().position(|line| line == command)
    }
}

#[async_trait]
impl ScpiTransport for MockAdapter {
    fn adapter_type(&self) -> &str {
        "mock"
    }

    fn info(&self) -> String {
        format!("MockAdapter({} lines sent)", self.state().log.len())
    }

    fn is_connected(&self) -> bool {
        self.state().connected
    }

    async fn connect(&mut self) -> Result<()> {
        let mut state = self.state();
        if std::mem::take(&mut state.refuse_connect) {
            return Err(anyhow!("mock connection refused"));
        }
        state.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.state().connected = false;
        Ok(())
    }

    async fn write(&mut self, command: &str) -> Result<()> {
        let mut state = self.state();
        if !state.connected {
            return Err(anyhow!("mock adapter not connected"));
        }
        state.log.push(command.to_string());
        Ok(())
    }

    async fn query(&mut self, command: &str) -> Result<String> {
        let mut state = self.state();
        if !state.connected {
            return Err(anyhow!("mock adapter not connected"));
        }
        state.log.push(command.to_string());

        if let Some(response) = state
            .queued
            .get_mut(command)
            .and_then(|queue| queue.pop_front())
        {
            return Ok(response);
        }
        state
            .standing
            .get(command)
            .cloned()
            .ok_or_else(|| anyhow!("no scripted reply for '{}'", command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queued_replies_before_standing() {
        let mut mock = MockAdapter::new();
        mock.reply("FETCH?", "1.0").reply_once("FETCH?", "2.0");
        mock.connect().await.unwrap();

        assert_eq!(mock.query("FETCH?").await.unwrap(), "2.0");
        assert_eq!(mock.query("FETCH?").await.unwrap(), "1.0");
        assert_eq!(mock.query("FETCH?").await.unwrap(), "1.0");
    }

    #[tokio::test]
    async fn test_unscripted_query_fails() {
        let mut mock = MockAdapter::new();
        mock.connect().await.unwrap();
        assert!(mock.query("*IDN?").await.is_err());
    }

    #[tokio::test]
    async fn test_clones_share_log() {
        let handle = MockAdapter::new();
        let mut transport = handle.clone();
        transport.connect().await.unwrap();
        transport.write("*RST").await.unwrap();
        transport.write("*CLS").await.unwrap();
        assert_eq!(handle.commands(), vec!["*RST", "*CLS"]);
        assert_eq!(handle.position("*CLS"), Some(1));
    }

    #[tokio::test]
    async fn test_refused_connect() {
        let mut mock = MockAdapter::new();
        mock.refuse_connect();
        assert!(mock.connect().await.is_err());
        assert!(!mock.is_connected());
        mock.connect().await.unwrap();
        assert!(mock.is_connected());
    }

    #[tokio::test]
    async fn test_write_requires_connection() {
        let mut mock = MockAdapter::new();
        assert!(mock.write("OUTP 1").await.is_err());
    }
}
