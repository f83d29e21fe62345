//! Per-service priority queue
//!
//! TigerStyle: Bounded request lanes, explicit counters, no silent drops.
//!
//! Three FIFO lanes are consulted in a fixed order: responses, urgent
//! requests, normal requests. Only the two request lanes count against the
//! depth limit; a response is always accepted so that every outstanding
//! request can be resolved.

use softbus_core::message::{Message, MessageKind};
use std::collections::VecDeque;

/// Error when the request lanes are full
#[derive(Debug, Clone)]
pub struct QueueFullError {
    pub queue_depth: usize,
    pub limit: usize,
}

impl std::fmt::Display for QueueFullError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "queue full: {} requests (limit: {})",
            self.queue_depth, self.limit
        )
    }
}

impl std::error::Error for QueueFullError {}

/// Lane index, in delivery order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lane {
    Response = 0,
    Urgent = 1,
    Normal = 2,
}

impl Lane {
    pub(crate) fn of(msg: &Message) -> Self {
        let header = msg.header();
        match header.kind {
            MessageKind::Response => Lane::Response,
            MessageKind::Request if header.is_urgent() => Lane::Urgent,
            MessageKind::Request => Lane::Normal,
        }
    }

    /// Lanes holding messages of `kind`, in delivery order
    pub(crate) fn for_kind(kind: MessageKind) -> &'static [Lane] {
        match kind {
            MessageKind::Response => &[Lane::Response],
            MessageKind::Request => &[Lane::Urgent, Lane::Normal],
        }
    }
}

const LANES_ALL: [Lane; 3] = [Lane::Response, Lane::Urgent, Lane::Normal];

/// Three-lane message queue owned by one service
#[derive(Debug)]
pub struct ServiceQueue {
    lanes: [VecDeque<Message>; 3],
    /// Bound on urgent plus normal requests; zero means unlimited
    depth_max: usize,
    /// Total messages enqueued (for stats)
    enqueued_count: u64,
    /// Total messages removed for delivery (for stats)
    processed_count: u64,
}

impl ServiceQueue {
    pub fn new(depth_max: usize) -> Self {
        Self {
            lanes: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
            depth_max,
            enqueued_count: 0,
            processed_count: 0,
        }
    }

    /// Enqueue a message in the lane its header selects.
    ///
    /// Returns error if it is a request and the request lanes are full.
    pub fn push(&mut self, msg: Message) -> Result<(), QueueFullError> {
        let lane = Lane::of(&msg);
        if lane != Lane::Response && self.depth_max != 0 && self.request_len() >= self.depth_max {
            return Err(QueueFullError {
                queue_depth: self.request_len(),
                limit: self.depth_max,
            });
        }

        self.lanes[lane as usize].push_back(msg);
        self.enqueued_count = self.enqueued_count.wrapping_add(1);

        debug_assert!(self.depth_max == 0 || self.request_len() <= self.depth_max);
        Ok(())
    }

    /// Pop the next message across all lanes, highest priority first
    pub fn pop_next(&mut self) -> Option<Message> {
        self.pop_from(&LANES_ALL)
    }

    /// Pop the next message of `kind`
    pub fn pop_kind(&mut self, kind: MessageKind) -> Option<Message> {
        self.pop_from(Lane::for_kind(kind))
    }

    fn pop_from(&mut self, lanes: &[Lane]) -> Option<Message> {
        let msg = lanes
            .iter()
            .find_map(|lane| self.lanes[*lane as usize].pop_front());
        if msg.is_some() {
            self.processed_count = self.processed_count.wrapping_add(1);
        }
        msg
    }

    /// Extra references to every queued message of `kind`, in delivery order
    pub fn snapshot(&self, kind: MessageKind) -> Vec<Message> {
        Lane::for_kind(kind)
            .iter()
            .flat_map(|lane| self.lanes[*lane as usize].iter())
            .map(Message::add_ref)
            .collect()
    }

    /// Remove the queued message `target` refers to
    pub fn remove(&mut self, target: &Message) -> Option<Message> {
        let lane = &mut self.lanes[Lane::of(target) as usize];
        let position = lane.iter().position(|msg| msg.ptr_eq(target))?;
        self.processed_count = self.processed_count.wrapping_add(1);
        lane.remove(position)
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.iter().all(VecDeque::is_empty)
    }

    /// Number of queued messages across all lanes
    pub fn len(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }

    /// Number of queued messages of `kind`
    pub fn len_kind(&self, kind: MessageKind) -> usize {
        Lane::for_kind(kind)
            .iter()
            .map(|lane| self.lanes[*lane as usize].len())
            .sum()
    }

    pub(crate) fn lane_len(&self, lane: Lane) -> usize {
        self.lanes[lane as usize].len()
    }

    /// Number of queued requests (urgent plus normal)
    pub fn request_len(&self) -> usize {
        self.len_kind(MessageKind::Request)
    }

    pub fn depth_max(&self) -> usize {
        self.depth_max
    }

    pub fn enqueued_count(&self) -> u64 {
        self.enqueued_count
    }

    pub fn processed_count(&self) -> u64 {
        self.processed_count
    }

    /// Drain every queued message, highest priority first
    ///
    /// Used at teardown to release the queue's references.
    pub fn drain(&mut self) -> Vec<Message> {
        let mut drained = Vec::with_capacity(self.len());
        for lane in &mut self.lanes {
            drained.extend(lane.drain(..));
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use softbus_core::error::ErrorCode;
    use softbus_core::message::{MessageAttrs, MessageHeader};

    fn create_message(kind: MessageKind, attrs: MessageAttrs, uuid: u32) -> Message {
        Message::new(
            MessageHeader {
                errc: ErrorCode::None,
                fsid: 1,
                tsid: 2,
                kind,
                msgid: 7,
                seqid: uuid,
                attrs,
                uuid,
            },
            None,
            None,
        )
    }

    fn normal(uuid: u32) -> Message {
        create_message(MessageKind::Request, MessageAttrs::empty(), uuid)
    }

    fn urgent(uuid: u32) -> Message {
        create_message(MessageKind::Request, MessageAttrs::URGENCY_REQUEST, uuid)
    }

    fn response(uuid: u32) -> Message {
        create_message(MessageKind::Response, MessageAttrs::empty(), uuid)
    }

    #[test]
    fn test_queue_priority_order() {
        let mut queue = ServiceQueue::new(0);

        queue.push(normal(1)).unwrap();
        queue.push(urgent(2)).unwrap();
        queue.push(normal(3)).unwrap();
        queue.push(response(4)).unwrap();
        queue.push(urgent(5)).unwrap();

        let order: Vec<u32> = std::iter::from_fn(|| queue.pop_next())
            .map(|msg| msg.uuid())
            .collect();
        assert_eq!(order, vec![4, 2, 5, 1, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_queue_pop_kind() {
        let mut queue = ServiceQueue::new(0);
        queue.push(normal(1)).unwrap();
        queue.push(response(2)).unwrap();
        queue.push(urgent(3)).unwrap();

        assert_eq!(queue.pop_kind(MessageKind::Request).map(|m| m.uuid()), Some(3));
        assert_eq!(queue.pop_kind(MessageKind::Request).map(|m| m.uuid()), Some(1));
        assert!(queue.pop_kind(MessageKind::Request).is_none());
        assert_eq!(queue.len_kind(MessageKind::Response), 1);
    }

    #[test]
    fn test_queue_limit_applies_to_requests_only() {
        let mut queue = ServiceQueue::new(2);

        queue.push(normal(1)).unwrap();
        queue.push(urgent(2)).unwrap();

        let err = queue.push(normal(3)).unwrap_err();
        assert_eq!(err.queue_depth, 2);
        assert_eq!(err.limit, 2);

        // Responses always fit
        queue.push(response(4)).unwrap();
        queue.push(response(5)).unwrap();
        assert_eq!(queue.len(), 4);
        assert_eq!(queue.request_len(), 2);
    }

    #[test]
    fn test_queue_snapshot_and_remove() {
        let mut queue = ServiceQueue::new(0);
        queue.push(normal(1)).unwrap();
        queue.push(normal(2)).unwrap();
        queue.push(urgent(3)).unwrap();

        let snapshot = queue.snapshot(MessageKind::Request);
        let uuids: Vec<u32> = snapshot.iter().map(Message::uuid).collect();
        assert_eq!(uuids, vec![3, 1, 2]);
        assert_eq!(snapshot[1].ref_count(), 2);

        let removed = queue.remove(&snapshot[1]).unwrap();
        assert_eq!(removed.uuid(), 1);
        assert_eq!(queue.len(), 2);
        assert!(queue.remove(&snapshot[1]).is_none());
    }

    #[test]
    fn test_queue_counters() {
        let mut queue = ServiceQueue::new(10);

        assert_eq!(queue.enqueued_count(), 0);
        queue.push(normal(1)).unwrap();
        queue.push(response(2)).unwrap();
        assert_eq!(queue.enqueued_count(), 2);
        assert_eq!(queue.processed_count(), 0);

        queue.pop_next();
        assert_eq!(queue.processed_count(), 1);
        assert_eq!(queue.lane_len(Lane::Normal), 1);
        queue.pop_next();
        assert_eq!(queue.processed_count(), 2);
    }

    #[test]
    fn test_queue_drain() {
        let mut queue = ServiceQueue::new(10);
        queue.push(normal(1)).unwrap();
        queue.push(response(2)).unwrap();
        queue.push(urgent(3)).unwrap();

        let drained = queue.drain();
        assert_eq!(drained.len(), 3);
        assert_eq!(drained[0].uuid(), 2);
        assert!(queue.is_empty());
    }
}
