//! Registry fakes (testing only)

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::authorization::{AuthorizationResult, PlateAuthorizer, StaticRegistry};

/// Records every lookup and answers from an allow-list.
#[derive(Default)]
pub struct RecordingRegistry {
    inner: StaticRegistry,
    lookups: Mutex<Vec<String>>,
}

impl RecordingRegistry {
    pub fn new<I, S>(plates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            inner: StaticRegistry::new(plates),
            lookups: Mutex::new(Vec::new()),
        }
    }

    pub fn lookups(&self) -> Vec<String> {
        self.lookups.lock().unwrap().clone()
    }
}

#[async_trait]
impl PlateAuthorizer for RecordingRegistry {
    async fn lookup(&self, plate: &str, timeout: Duration) -> AuthorizationResult {
        self.lookups.lock().unwrap().push(plate.to_string());
        self.inner.lookup(plate, timeout).await
    }

    fn describe(&self) -> String {
        "recording".to_string()
    }
}

/// Never answers; ignores the timeout it is given.
#[derive(Debug, Default)]
pub struct StallingRegistry;

#[async_trait]
impl PlateAuthorizer for StallingRegistry {
    async fn lookup(&self, _plate: &str, _timeout: Duration) -> AuthorizationResult {
        std::future::pending().await
    }

    fn describe(&self) -> String {
        "stalling".to_string()
    }
}
