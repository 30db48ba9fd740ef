//! Sliding-window record of source IPs per client.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;

/// A client was seen from more distinct IPs than it may use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LimitExceeded {
    pub email: String,
    pub distinct_ips: usize,
    pub limit: u32,
}

pub struct IpTracker {
    window: Duration,
    default_limit: u32,
    clients: DashMap<String, HashMap<IpAddr, Instant>>,
}

impl IpTracker {
    pub fn new(window: Duration, default_limit: u32) -> Self {
        Self {
            window,
            default_limit,
            clients: DashMap::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record that `email` was active from `ip` at `at`.
    pub fn observe(&self, email: &str, ip: IpAddr, at: Instant) {
        let mut ips = self.clients.entry(email.to_string()).or_default();
        let seen = ips.entry(ip).or_insert(at);
        if at > *seen {
            *seen = at;
        }
    }

    /// Limit that applies to a client whose own setting is `client_limit`.
    /// Zero means unlimited.
    pub fn effective_limit(&self, client_limit: u32) -> u32 {
        if client_limit > 0 {
            client_limit
        } else {
            self.default_limit
        }
    }

    /// Evict expired samples and report clients over their limit.
    ///
    /// `limits` maps email to the client's own `limitIp`. At most one event
    /// per client per scan.
    pub fn scan(&self, now: Instant, limits: &HashMap<String, u32>) -> Vec<LimitExceeded> {
        let mut exceeded = Vec::new();

        self.clients.retain(|email, ips| {
            ips.retain(|_, seen| now.saturating_duration_since(*seen) <= self.window);
            if ips.is_empty() {
                return false;
            }

            let limit = self.effective_limit(limits.get(email).copied().unwrap_or(0));
            if limit > 0 && ips.len() > limit as usize {
                exceeded.push(LimitExceeded {
                    email: email.clone(),
                    distinct_ips: ips.len(),
                    limit,
                });
            }
            true
        });

        exceeded.sort_by(|a, b| a.email.cmp(&b.email));
        exceeded
    }

    /// Distinct IPs currently inside the window for `email`.
    pub fn client_ips(&self, email: &str) -> Vec<IpAddr> {
        let mut ips: Vec<IpAddr> = self
            .clients
            .get(email)
            .map(|entry| entry.keys().copied().collect())
            .unwrap_or_default();
        ips.sort();
        ips
    }

    pub fn tracked_clients(&self) -> usize {
        self.clients.len()
    }

    /// Forget everything.
    pub fn reset(&self) {
        self.clients.clear();
    }
}
