//! Interactive and background request queues.

use std::collections::VecDeque;

use rag_embeddings::EmbeddingError;
use rag_types::{Priority, TaskType};
use tokio::sync::oneshot;
use tokio::time::Instant;

pub type Reply = oneshot::Sender<Result<Vec<Vec<f32>>, EmbeddingError>>;

/// A submitted request waiting for dispatch.
#[derive(Debug)]
pub struct PendingRequest {
    pub texts: Vec<String>,
    pub priority: Priority,
    pub task: TaskType,
    pub deadline: Option<Instant>,
    pub reply: Reply,
}

impl PendingRequest {
    /// Past its deadline, or the caller stopped waiting.
    pub fn is_dead(&self, now: Instant) -> bool {
        self.reply.is_closed() || self.deadline.is_some_and(|d| d <= now)
    }

    pub fn fail(self, err: EmbeddingError) {
        let _ = self.reply.send(Err(err));
    }
}

/// Requests sent to the provider together. All share one task type.
#[derive(Debug)]
pub struct Batch {
    pub class: Priority,
    pub task: TaskType,
    pub requests: Vec<PendingRequest>,
    /// Background went first because interactive work had starved it
    pub starvation_grant: bool,
}

impl Batch {
    pub fn text_count(&self) -> usize {
        self.requests.iter().map(|r| r.texts.len()).sum()
    }
}

#[derive(Debug)]
pub struct DualQueue {
    interactive: VecDeque<PendingRequest>,
    background: VecDeque<PendingRequest>,
    interactive_depth: usize,
    starvation_ticks: u32,
    starved: u32,
    max_batch_size: usize,
}

impl DualQueue {
    pub fn new(interactive_depth: usize, starvation_ticks: u32, max_batch_size: usize) -> Self {
        Self {
            interactive: VecDeque::new(),
            background: VecDeque::new(),
            interactive_depth: interactive_depth.max(1),
            starvation_ticks,
            starved: 0,
            max_batch_size: max_batch_size.max(1),
        }
    }

    /// Enqueue a request. Returns the interactive request shed to make room.
    ///
    /// A full interactive queue first gives up its dead requests, wherever
    /// they sit, onto `dead`. Only a queue still full of live work sheds.
    pub fn push(
        &mut self,
        request: PendingRequest,
        now: Instant,
        dead: &mut Vec<PendingRequest>,
    ) -> Option<PendingRequest> {
        match request.priority {
            Priority::Interactive => {
                if self.interactive.len() >= self.interactive_depth {
                    self.purge_interactive(now, dead);
                }
                let shed = if self.interactive.len() >= self.interactive_depth {
                    self.interactive.pop_front()
                } else {
                    None
                };
                self.interactive.push_back(request);
                shed
            }
            Priority::Background => {
                self.background.push_back(request);
                None
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.interactive.is_empty() && self.background.is_empty()
    }

    pub fn len(&self) -> (usize, usize) {
        (self.interactive.len(), self.background.len())
    }

    fn purge_interactive(&mut self, now: Instant, dead: &mut Vec<PendingRequest>) {
        let (gone, live): (VecDeque<_>, VecDeque<_>) =
            self.interactive.drain(..).partition(|r| r.is_dead(now));
        self.interactive = live;
        dead.extend(gone);
    }

    /// Remove dead requests from the head of each queue.
    pub fn purge_heads(&mut self, now: Instant) -> Vec<PendingRequest> {
        let mut dead = Vec::new();
        for queue in [&mut self.interactive, &mut self.background] {
            while queue.front().is_some_and(|r| r.is_dead(now)) {
                if let Some(request) = queue.pop_front() {
                    dead.push(request);
                }
            }
        }
        dead
    }

    /// Take every queued request.
    pub fn drain(&mut self) -> Vec<PendingRequest> {
        self.starved = 0;
        self.interactive
            .drain(..)
            .chain(self.background.drain(..))
            .collect()
    }

    /// Pick the next batch to dispatch. Dead requests met on the way are
    /// pushed onto `dead`.
    pub fn next_batch(&mut self, now: Instant, dead: &mut Vec<PendingRequest>) -> Option<Batch> {
        dead.extend(self.purge_heads(now));

        let has_interactive = !self.interactive.is_empty();
        let has_background = !self.background.is_empty();

        if has_background && (!has_interactive || self.starved > self.starvation_ticks) {
            let starvation_grant = has_interactive;
            self.starved = 0;
            let requests = self.coalesce_background(now, dead);
            let task = requests.first()?.task;
            return Some(Batch {
                class: Priority::Background,
                task,
                requests,
                starvation_grant,
            });
        }

        let request = self.interactive.pop_front()?;
        if has_background {
            self.starved += 1;
        }
        Some(Batch {
            class: Priority::Interactive,
            task: request.task,
            requests: vec![request],
            starvation_grant: false,
        })
    }

    fn coalesce_background(
        &mut self,
        now: Instant,
        dead: &mut Vec<PendingRequest>,
    ) -> Vec<PendingRequest> {
        let mut requests: Vec<PendingRequest> = Vec::new();
        let mut texts = 0;
        while let Some(next) = self.background.front() {
            if next.is_dead(now) {
                if let Some(request) = self.background.pop_front() {
                    dead.push(request);
                }
                continue;
            }
            let full = texts + next.texts.len() > self.max_batch_size;
            if requests
                .first()
                .is_some_and(|head| full || head.task != next.task)
            {
                break;
            }
            texts += next.texts.len();
            if let Some(request) = self.background.pop_front() {
                requests.push(request);
            }
        }
        requests
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn request(
        priority: Priority,
        n: usize,
    ) -> (
        PendingRequest,
        oneshot::Receiver<Result<Vec<Vec<f32>>, EmbeddingError>>,
    ) {
        let (tx, rx) = oneshot::channel();
        let req = PendingRequest {
            texts: (0..n).map(|i| format!("text {i}")).collect(),
            priority,
            task: priority.default_task(),
            deadline: None,
            reply: tx,
        };
        (req, rx)
    }

    fn push(queue: &mut DualQueue, request: PendingRequest) -> Option<PendingRequest> {
        queue.push(request, Instant::now(), &mut Vec::new())
    }

    #[tokio::test]
    async fn test_interactive_before_background() {
        let mut queue = DualQueue::new(8, 8, 100);
        let (bg, _bg_rx) = request(Priority::Background, 1);
        let (it, _it_rx) = request(Priority::Interactive, 1);
        push(&mut queue, bg);
        push(&mut queue, it);

        let mut dead = Vec::new();
        let batch = queue.next_batch(Instant::now(), &mut dead).unwrap();
        assert_eq!(batch.class, Priority::Interactive);
        let batch = queue.next_batch(Instant::now(), &mut dead).unwrap();
        assert_eq!(batch.class, Priority::Background);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_interactive_overflow_sheds_oldest() {
        let mut queue = DualQueue::new(2, 8, 100);
        let (a, _a_rx) = request(Priority::Interactive, 1);
        let (b, _b_rx) = request(Priority::Interactive, 2);
        let (c, _c_rx) = request(Priority::Interactive, 3);
        assert!(push(&mut queue, a).is_none());
        assert!(push(&mut queue, b).is_none());

        let shed = push(&mut queue, c).unwrap();
        assert_eq!(shed.texts.len(), 1);
        assert_eq!(queue.len(), (2, 0));
    }

    #[tokio::test]
    async fn test_background_coalescing_respects_batch_size() {
        let mut queue = DualQueue::new(8, 8, 5);
        let mut receivers = Vec::new();
        for n in [2, 2, 2] {
            let (req, rx) = request(Priority::Background, n);
            receivers.push(rx);
            push(&mut queue, req);
        }

        let mut dead = Vec::new();
        let batch = queue.next_batch(Instant::now(), &mut dead).unwrap();
        assert_eq!(batch.requests.len(), 2);
        assert_eq!(batch.text_count(), 4);
        let batch = queue.next_batch(Instant::now(), &mut dead).unwrap();
        assert_eq!(batch.text_count(), 2);
    }

    #[tokio::test]
    async fn test_starvation_grant() {
        let mut queue = DualQueue::new(100, 2, 100);
        let (bg, _bg_rx) = request(Priority::Background, 1);
        push(&mut queue, bg);
        let mut receivers = Vec::new();
        for _ in 0..10 {
            let (it, rx) = request(Priority::Interactive, 1);
            receivers.push(rx);
            push(&mut queue, it);
        }

        let mut dead = Vec::new();
        let mut classes = Vec::new();
        for _ in 0..4 {
            let batch = queue.next_batch(Instant::now(), &mut dead).unwrap();
            classes.push((batch.class, batch.starvation_grant));
        }
        assert_eq!(
            classes,
            vec![
                (Priority::Interactive, false),
                (Priority::Interactive, false),
                (Priority::Interactive, false),
                (Priority::Background, true),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_requests_removed() {
        let mut queue = DualQueue::new(8, 8, 100);
        let now = Instant::now();

        let (mut expired, _expired_rx) = request(Priority::Interactive, 1);
        expired.deadline = Some(now);
        let (abandoned, abandoned_rx) = request(Priority::Background, 1);
        drop(abandoned_rx);
        let (live, _live_rx) = request(Priority::Background, 1);

        push(&mut queue, expired);
        push(&mut queue, abandoned);
        push(&mut queue, live);

        let mut dead = Vec::new();
        let batch = queue
            .next_batch(now + Duration::from_millis(1), &mut dead)
            .unwrap();
        assert_eq!(dead.len(), 2);
        assert_eq!(batch.class, Priority::Background);
        assert_eq!(batch.requests.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_drops_dead_before_shedding() {
        let mut queue = DualQueue::new(3, 8, 100);
        let now = Instant::now();

        let (first, _first_rx) = request(Priority::Interactive, 1);
        let (mut expired, _expired_rx) = request(Priority::Interactive, 2);
        expired.deadline = Some(now);
        let (abandoned, abandoned_rx) = request(Priority::Interactive, 3);
        drop(abandoned_rx);
        push(&mut queue, first);
        push(&mut queue, expired);
        push(&mut queue, abandoned);

        let (incoming, _incoming_rx) = request(Priority::Interactive, 4);
        let mut dead = Vec::new();
        let shed = queue.push(incoming, now + Duration::from_millis(1), &mut dead);

        // The live head survives; only the dead ones leave
        assert!(shed.is_none());
        assert_eq!(dead.len(), 2);
        assert_eq!(queue.len(), (2, 0));
        let batch = queue.next_batch(now, &mut dead).unwrap();
        assert_eq!(batch.text_count(), 1);
    }

    #[tokio::test]
    async fn test_background_tasks_not_mixed() {
        let mut queue = DualQueue::new(8, 8, 100);
        let (doc, _doc_rx) = request(Priority::Background, 1);
        let (mut query, _query_rx) = request(Priority::Background, 1);
        query.task = TaskType::RetrievalQuery;
        let (doc2, _doc2_rx) = request(Priority::Background, 1);
        push(&mut queue, doc);
        push(&mut queue, query);
        push(&mut queue, doc2);

        let mut dead = Vec::new();
        let mut tasks = Vec::new();
        while let Some(batch) = queue.next_batch(Instant::now(), &mut dead) {
            tasks.push((batch.task, batch.requests.len()));
        }
        assert_eq!(
            tasks,
            vec![
                (TaskType::RetrievalDocument, 1),
                (TaskType::RetrievalQuery, 1),
                (TaskType::RetrievalDocument, 1),
            ]
        );
    }
}
