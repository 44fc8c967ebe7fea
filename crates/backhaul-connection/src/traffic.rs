//! Traffic accounting
//!
//! Inbound is the direction from the public end user towards the local
//! service; outbound is the reply direction. Both sides count the same way.

use backhaul_proto::TunnelRequest;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug)]
pub struct TrafficStats {
    inbound: AtomicU64,
    outbound: AtomicU64,
    created_at: DateTime<Utc>,
    updated_at_ms: AtomicI64,
}

impl TrafficStats {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            inbound: AtomicU64::new(0),
            outbound: AtomicU64::new(0),
            created_at: now,
            updated_at_ms: AtomicI64::new(now.timestamp_millis()),
        }
    }

    pub fn record_inbound(&self, bytes: u64) {
        self.inbound.fetch_add(bytes, Ordering::Relaxed);
        self.touch();
    }

    pub fn record_outbound(&self, bytes: u64) {
        self.outbound.fetch_add(bytes, Ordering::Relaxed);
        self.touch();
    }

    fn touch(&self) {
        self.updated_at_ms
            .fetch_max(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn inbound_bytes(&self) -> u64 {
        self.inbound.load(Ordering::Relaxed)
    }

    pub fn outbound_bytes(&self) -> u64 {
        self.outbound.load(Ordering::Relaxed)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.updated_at_ms.load(Ordering::Relaxed))
            .unwrap_or(self.created_at)
    }

    pub fn snapshot(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            inbound_bytes: self.inbound_bytes(),
            outbound_bytes: self.outbound_bytes(),
            created_at: self.created_at,
            updated_at: self.updated_at(),
        }
    }
}

impl Default for TrafficStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficSnapshot {
    pub inbound_bytes: u64,
    pub outbound_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub type TrafficCallback = Arc<dyn Fn(&TunnelRequest, u64) + Send + Sync>;

/// Optional traffic observers
#[derive(Clone, Default)]
pub struct TrafficListener {
    pub inbound: Option<TrafficCallback>,
    pub outbound: Option<TrafficCallback>,
}

impl TrafficListener {
    pub fn on_inbound(mut self, f: impl Fn(&TunnelRequest, u64) + Send + Sync + 'static) -> Self {
        self.inbound = Some(Arc::new(f));
        self
    }

    pub fn on_outbound(mut self, f: impl Fn(&TunnelRequest, u64) + Send + Sync + 'static) -> Self {
        self.outbound = Some(Arc::new(f));
        self
    }
}

/// Accounting hook called for every forwarded chunk of one tunnel
#[derive(Clone)]
pub struct TrafficMeter {
    stats: Arc<TrafficStats>,
    listener: TrafficListener,
    request: Arc<TunnelRequest>,
}

impl TrafficMeter {
    pub fn new(request: Arc<TunnelRequest>, listener: TrafficListener) -> Self {
        Self {
            stats: Arc::new(TrafficStats::new()),
            listener,
            request,
        }
    }

    pub fn inbound(&self, bytes: usize) {
        self.stats.record_inbound(bytes as u64);
        if let Some(callback) = &self.listener.inbound {
            callback(&self.request, bytes as u64);
        }
    }

    pub fn outbound(&self, bytes: usize) {
        self.stats.record_outbound(bytes as u64);
        if let Some(callback) = &self.listener.outbound {
            callback(&self.request, bytes as u64);
        }
    }

    pub fn stats(&self) -> &Arc<TrafficStats> {
        &self.stats
    }
}
