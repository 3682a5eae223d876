//! Query to answer matching.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use crate::dns::capture::Transport;
use crate::dns::packet::{Answer, DnsMessage};

/// An unanswered query is flushed as a timeout after this long.
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(6);
/// rcode reported for timed out queries.
pub const RCODE_TIMEOUT: i32 = -1;
const MAX_PENDING: usize = 65536;

pub type Endpoint = (IpAddr, u16);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QaKey {
    pub client: Endpoint,
    pub server: Endpoint,
    pub transport: Transport,
    pub id: u16,
}

/// A DNS message together with where it was seen going.
#[derive(Debug, Clone)]
pub struct Captured {
    pub src: Endpoint,
    pub dst: Endpoint,
    pub transport: Transport,
    pub msg: DnsMessage,
    pub at: Instant,
}

/// One finished query, answered or not.
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub client: Endpoint,
    pub server: Endpoint,
    pub transport: Transport,
    pub rcode: i32,
    pub latency: Duration,
    pub timeout: bool,
    pub domain: String,
    pub answers: Vec<Answer>,
}

#[derive(Debug)]
struct Pending {
    at: Instant,
    domain: String,
}

#[derive(Debug, Default)]
pub struct QaTracker {
    pending: HashMap<QaKey, Pending>,
}

impl QaTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one message. Returns the transaction an answer completes.
    pub fn observe(&mut self, c: Captured) -> Option<Transaction> {
        if !c.msg.response {
            if self.pending.len() >= MAX_PENDING {
                return None;
            }
            let key = QaKey {
                client: c.src,
                server: c.dst,
                transport: c.transport,
                id: c.msg.id,
            };
            let domain = c
                .msg
                .questions
                .first()
                .map(|q| q.name.clone())
                .unwrap_or_default();
            // A retransmitted query keeps its first timestamp
            self.pending.entry(key).or_insert(Pending { at: c.at, domain });
            return None;
        }

        let key = QaKey {
            client: c.dst,
            server: c.src,
            transport: c.transport,
            id: c.msg.id,
        };
        let pending = self.pending.remove(&key)?;
        Some(Transaction {
            client: key.client,
            server: key.server,
            transport: key.transport,
            rcode: c.msg.rcode as i32,
            latency: c.at.saturating_duration_since(pending.at),
            timeout: false,
            domain: pending.domain,
            answers: c.msg.answers,
        })
    }

    /// Remove and return every query older than the timeout.
    pub fn expire(&mut self, now: Instant) -> Vec<Transaction> {
        let mut expired = Vec::new();
        self.pending.retain(|key, p| {
            let age = now.saturating_duration_since(p.at);
            if age < QUERY_TIMEOUT {
                return true;
            }
            expired.push(Transaction {
                client: key.client,
                server: key.server,
                transport: key.transport,
                rcode: RCODE_TIMEOUT,
                latency: age,
                timeout: true,
                domain: std::mem::take(&mut p.domain),
                answers: Vec::new(),
            });
            false
        });
        expired
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
