//! Waiting captures.
//!
//! Two FIFO queues: `fresh` holds requests never checked against the current state,
//! `stale` holds requests that already failed admission and are only worth another
//! look once the state changes (a worker ended or the effective configuration moved).

use crate::capture::{CaptureId, CaptureRequest};
use crate::feedline_config::FeedlineConfig;
use std::collections::VecDeque;

/// A queued capture together with its resolved configuration.
#[derive(Debug)]
pub struct Pending {
    /// The capture.
    pub request: CaptureRequest,
    /// Full configuration it requires.
    pub config: FeedlineConfig,
}

impl Pending {
    /// Pairs a request with its resolved configuration.
    pub fn new(request: CaptureRequest, config: FeedlineConfig) -> Self {
        Self { request, config }
    }

    /// Capture id.
    pub fn id(&self) -> &CaptureId {
        self.request.id()
    }
}

/// Fresh and stale queues.
#[derive(Debug, Default)]
pub struct AdmissionQueue {
    fresh: VecDeque<Pending>,
    stale: VecDeque<Pending>,
}

impl AdmissionQueue {
    /// Empty queues.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends to the fresh queue.
    pub fn push_fresh(&mut self, pending: Pending) {
        self.fresh.push_back(pending);
    }

    /// Appends to the stale queue.
    pub fn push_stale(&mut self, pending: Pending) {
        self.stale.push_back(pending);
    }

    /// Next request to check, oldest first.
    pub fn pop_fresh(&mut self) -> Option<Pending> {
        self.fresh.pop_front()
    }

    /// Moves every stale request behind the fresh ones, keeping their order.
    ///
    /// Returns how many moved.
    pub fn requeue_stale(&mut self) -> usize {
        let moved = self.stale.len();
        self.fresh.append(&mut self.stale);
        moved
    }

    /// True if nothing is waiting to be checked.
    pub fn fresh_is_empty(&self) -> bool {
        self.fresh.is_empty()
    }

    /// True if nothing is waiting at all.
    pub fn is_empty(&self) -> bool {
        self.fresh.is_empty() && self.stale.is_empty()
    }

    /// Waiting requests in both queues.
    pub fn len(&self) -> usize {
        self.fresh.len() + self.stale.len()
    }

    /// Removes a waiting request from whichever queue holds it.
    pub fn remove(&mut self, id: &CaptureId) -> Option<Pending> {
        for queue in [&mut self.fresh, &mut self.stale] {
            if let Some(pos) = queue.iter().position(|p| p.id() == id) {
                return queue.remove(pos);
            }
        }
        None
    }

    /// Mutable access to a waiting request.
    pub fn get_mut(&mut self, id: &CaptureId) -> Option<&mut Pending> {
        self.fresh
            .iter_mut()
            .chain(self.stale.iter_mut())
            .find(|p| p.id() == id)
    }

    /// Waiting ids, fresh queue first.
    pub fn ids(&self) -> Vec<CaptureId> {
        self.fresh
            .iter()
            .chain(self.stale.iter())
            .map(|p| p.id().clone())
            .collect()
    }

    /// Empties both queues, fresh first.
    pub fn drain(&mut self) -> Vec<Pending> {
        let mut all: Vec<Pending> = self.fresh.drain(..).collect();
        all.extend(self.stale.drain(..));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::ChannelTransport;
    use crate::tap::TapSource;
    use std::sync::Arc;

    fn pending(samples: u64) -> Pending {
        let transport = Arc::new(ChannelTransport::new());
        let config = FeedlineConfig::default();
        let request = CaptureRequest::new(TapSource::Adc, samples, config.clone(), transport).unwrap();
        Pending::new(request, config)
    }

    #[test]
    fn stale_requests_go_behind_fresh_ones() {
        let mut queue = AdmissionQueue::new();
        let (a, b, c) = (pending(1), pending(2), pending(3));
        let (ida, idb, idc) = (a.id().clone(), b.id().clone(), c.id().clone());

        queue.push_stale(a);
        queue.push_stale(b);
        queue.push_fresh(c);
        assert_eq!(queue.requeue_stale(), 2);

        assert_eq!(queue.ids(), vec![idc, ida, idb]);
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn remove_searches_both_queues() {
        let mut queue = AdmissionQueue::new();
        let (a, b) = (pending(1), pending(2));
        let (ida, idb) = (a.id().clone(), b.id().clone());
        queue.push_fresh(a);
        queue.push_stale(b);

        assert!(queue.remove(&idb).is_some());
        assert!(queue.remove(&idb).is_none());
        assert!(queue.get_mut(&ida).is_some());
        assert_eq!(queue.drain().len(), 1);
        assert!(queue.is_empty());
    }
}
