//! Admission - リクエストの受付判定
//!
//! # 判定順序
//! 1. drain 中 → `Draining`
//! 2. content-type 不一致 → `UnsupportedMediaType`
//! 3. body サイズ超過 → `PayloadTooLarge`
//! 4. 同時実行数の上限 → `Busy`（CAS で check-and-increment）
//!
//! 静的なチェックを先に済ませるので、拒否されたリクエストはカウンタに触れない。

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

use super::builder::BuildError;
use super::counter::{InFlightCounter, InFlightPermit};
use crate::domain::{AdmissionRejection, RoutePolicy};

/// Write-once process drain flag.
#[derive(Debug, Default)]
pub struct DrainFlag(AtomicBool);

impl DrainFlag {
    /// Returns `true` only for the call that flipped the flag.
    pub fn set(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
struct RouteEntry {
    policy: Arc<RoutePolicy>,
    counter: Arc<InFlightCounter>,
}

/// An admitted request: its route's policy plus the in-flight slot it holds.
#[derive(Debug)]
pub struct Admission {
    pub policy: Arc<RoutePolicy>,
    pub permit: InFlightPermit,
}

/// Registry of route policies, their in-flight counters and the drain flag.
///
/// Design:
/// - Built during initialization (mutable `register`).
/// - Shared by `Arc` at runtime; only the counters and the flag change.
#[derive(Debug, Default)]
pub struct AdmissionRegistry {
    routes: HashMap<String, RouteEntry>,
    drain: DrainFlag,
    released: Arc<Notify>,
}

impl AdmissionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, policy: RoutePolicy) -> Result<Arc<RoutePolicy>, BuildError> {
        if policy.max_concurrent_requests == 0 {
            return Err(BuildError::InvalidPolicy {
                path: policy.path,
                reason: "max_concurrent_requests must be at least 1".to_string(),
            });
        }
        if policy.methods.is_empty() {
            return Err(BuildError::InvalidPolicy {
                path: policy.path,
                reason: "at least one method is required".to_string(),
            });
        }
        if self.routes.contains_key(&policy.path) {
            return Err(BuildError::DuplicateRoute(policy.path));
        }

        let policy = Arc::new(policy);
        let counter = Arc::new(InFlightCounter::new(Arc::clone(&self.released)));
        self.routes.insert(
            policy.path.clone(),
            RouteEntry {
                policy: Arc::clone(&policy),
                counter,
            },
        );
        Ok(policy)
    }

    pub fn policy(&self, path: &str) -> Option<&Arc<RoutePolicy>> {
        self.routes.get(path).map(|e| &e.policy)
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    /// Decide whether a request may run.
    ///
    /// On success the route's counter has already been incremented; the
    /// returned permit gives it back when dropped.
    pub fn admit(
        &self,
        path: &str,
        content_type: Option<&str>,
        content_length: Option<u64>,
    ) -> Result<Admission, AdmissionRejection> {
        let entry = self
            .routes
            .get(path)
            .ok_or_else(|| AdmissionRejection::UnknownRoute(path.to_string()))?;
        let policy = &entry.policy;

        if self.drain.is_set() {
            return Err(AdmissionRejection::Draining);
        }

        if !policy.accepts_content_type(content_type) {
            return Err(AdmissionRejection::UnsupportedMediaType {
                declared: content_type.map(str::to_string),
                accepted: policy.accepted_content_types.clone(),
            });
        }

        if let (Some(allowed), Some(observed)) = (policy.max_content_length, content_length)
            && observed > allowed
        {
            return Err(AdmissionRejection::PayloadTooLarge { observed, allowed });
        }

        let permit = entry
            .counter
            .try_acquire(policy.max_concurrent_requests)
            .ok_or_else(|| AdmissionRejection::Busy {
                path: path.to_string(),
                limit: policy.max_concurrent_requests,
            })?;

        Ok(Admission {
            policy: Arc::clone(policy),
            permit,
        })
    }

    /// In-flight count for `path`, or `None` for an unknown route.
    pub fn current(&self, path: &str) -> Option<usize> {
        self.routes.get(path).map(|e| e.counter.current())
    }

    pub fn total_in_flight(&self) -> usize {
        self.routes.values().map(|e| e.counter.current()).sum()
    }

    /// Stop admitting new work. Returns `true` the first time only.
    pub fn start_draining(&self) -> bool {
        self.drain.set()
    }

    pub fn is_draining(&self) -> bool {
        self.drain.is_set()
    }

    /// Resolve once no route has in-flight work.
    pub async fn wait_idle(&self) {
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if self.total_in_flight() == 0 {
                return;
            }
            released.await;
        }
    }
}
