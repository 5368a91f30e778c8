use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use super::proxy::ProxyTarget;
use super::RequestHandler;
use crate::jwt::SigningKey;

pub type ProxyTable = HashMap<String, ProxyTarget>;

/// Values a listener attaches to each request it accepts, plus the list of
/// candidate handlers still to try for the matched path and method.
#[derive(Debug, Clone)]
pub struct RequestScope {
    server_name: Arc<str>,
    signing: Option<Arc<SigningKey>>,
    proxies: Arc<ProxyTable>,
    candidates: VecDeque<Arc<RequestHandler>>,
}

impl RequestScope {
    pub fn new(
        server_name: Arc<str>,
        signing: Option<Arc<SigningKey>>,
        proxies: Arc<ProxyTable>,
    ) -> Self {
        Self {
            server_name,
            signing,
            proxies,
            candidates: VecDeque::new(),
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// The listener's signing key, if it carries one under `name`.
    pub fn signing_key(&self, name: &str) -> Option<&SigningKey> {
        self.signing
            .as_deref()
            .filter(|key| key.name() == name)
    }

    pub fn proxy(&self, name: &str) -> Option<&ProxyTarget> {
        self.proxies.get(name)
    }

    pub(crate) fn load_candidates(&mut self, handlers: &[Arc<RequestHandler>]) {
        self.candidates = handlers.iter().cloned().collect();
    }

    /// Pop the next handler; each is handed out at most once per request.
    pub(crate) fn next_candidate(&mut self) -> Option<Arc<RequestHandler>> {
        self.candidates.pop_front()
    }

    pub fn remaining_candidates(&self) -> usize {
        self.candidates.len()
    }
}
