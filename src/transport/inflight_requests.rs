use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct InflightRequest {
    pub to: SocketAddr,
    pub sent_at: Instant,
}

impl InflightRequest {
    pub fn does_match(&self, from: &SocketAddr) -> bool {
        if self.to.port() != from.port() {
            return false;
        }

        if self.to.ip().is_unspecified() {
            return true;
        }

        self.to.ip() == from.ip()
    }
}

#[derive(Debug)]
/// Requests waiting for a reply, by transaction id.
pub struct InflightRequests {
    requests: HashMap<u32, InflightRequest>,
    timeout: Duration,
}

impl InflightRequests {
    pub fn new(timeout: Duration) -> Self {
        Self {
            requests: HashMap::new(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn add(&mut self, transaction_id: u32, to: SocketAddr) {
        self.add_at(transaction_id, to, Instant::now())
    }

    pub fn add_at(&mut self, transaction_id: u32, to: SocketAddr, now: Instant) {
        self.requests
            .insert(transaction_id, InflightRequest { to, sent_at: now });
    }

    /// Check if a transaction_id is still inflight and not expired.
    pub fn contains(&self, transaction_id: u32) -> bool {
        self.requests
            .get(&transaction_id)
            .map(|request| request.sent_at.elapsed() < self.timeout)
            .unwrap_or(false)
    }

    /// Remove the request answered by `from`.
    ///
    /// Returns `None` for unknown transactions, replies from another address,
    /// and replies arriving after the timeout.
    pub fn remove(&mut self, transaction_id: u32, from: &SocketAddr) -> Option<InflightRequest> {
        self.remove_at(transaction_id, from, Instant::now())
    }

    pub fn remove_at(
        &mut self,
        transaction_id: u32,
        from: &SocketAddr,
        now: Instant,
    ) -> Option<InflightRequest> {
        let request = self.requests.get(&transaction_id)?;

        if !request.does_match(from) {
            return None;
        }

        // Late replies are reported as timeouts by `take_expired`.
        if now.saturating_duration_since(request.sent_at) >= self.timeout {
            return None;
        }

        self.requests.remove(&transaction_id)
    }

    /// Remove and return the requests that timed out.
    pub fn take_expired(&mut self, now: Instant) -> Vec<(u32, InflightRequest)> {
        let timeout = self.timeout;

        let expired: Vec<u32> = self
            .requests
            .iter()
            .filter(|(_, request)| now.saturating_duration_since(request.sent_at) >= timeout)
            .map(|(tid, _)| *tid)
            .collect();

        expired
            .into_iter()
            .filter_map(|tid| self.requests.remove(&tid).map(|request| (tid, request)))
            .collect()
    }

    /// Time until the oldest request expires.
    pub fn next_expiry(&self, now: Instant) -> Option<Duration> {
        self.requests
            .values()
            .map(|request| (request.sent_at + self.timeout).saturating_duration_since(now))
            .min()
    }
}
