//! Single-threaded worker draining a bounded FIFO of requests.
//!
//! Requests may be sent from any thread, including host stack completion
//! contexts. The worker hands them one at a time to its [RequestHandler],
//! so the handler never sees two requests concurrently.

use std::{
    fmt, io,
    sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use log::{error, trace};

/// Smallest queue the worker accepts.
pub const MIN_QUEUE_CAPACITY: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueError {
    /// The bounded queue is saturated. The request was not enqueued.
    Full,
    /// The worker and its inbox are gone.
    Closed,
}

impl std::error::Error for QueueError {}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::Full => write!(f, "queue full"),
            QueueError::Closed => write!(f, "queue closed"),
        }
    }
}

/// Called with the handler's response once a request has been handled.
pub type ResponseCallback<P> = Box<dyn FnOnce(P) + Send + 'static>;

struct Envelope<R, P> {
    request: R,
    callback: Option<ResponseCallback<P>>,
}

/// Sending half of the queue. Cheap to clone.
pub struct RequestSender<R, P> {
    tx: SyncSender<Envelope<R, P>>,
}

impl<R, P> Clone for RequestSender<R, P> {
    fn clone(&self) -> Self {
        RequestSender {
            tx: self.tx.clone(),
        }
    }
}

impl<R, P> RequestSender<R, P> {
    /// Append a request. Never blocks.
    pub fn send(&self, request: R) -> Result<(), QueueError> {
        self.push(Envelope {
            request,
            callback: None,
        })
    }

    /// Append a request whose response is passed to `callback` after the
    /// worker handled it.
    pub fn send_with(
        &self,
        request: R,
        callback: impl FnOnce(P) + Send + 'static,
    ) -> Result<(), QueueError> {
        self.push(Envelope {
            request,
            callback: Some(Box::new(callback)),
        })
    }

    fn push(&self, envelope: Envelope<R, P>) -> Result<(), QueueError> {
        self.tx.try_send(envelope).map_err(|err| match err {
            TrySendError::Full(_) => QueueError::Full,
            TrySendError::Disconnected(_) => QueueError::Closed,
        })
    }
}

/// Receiving half of the queue, owned by the [Worker].
pub struct RequestInbox<R, P> {
    rx: Receiver<Envelope<R, P>>,
}

/// Create a bounded queue holding at least [MIN_QUEUE_CAPACITY] requests.
pub fn bounded<R, P>(
    capacity: usize,
) -> (RequestSender<R, P>, RequestInbox<R, P>) {
    let (tx, rx) = mpsc::sync_channel(capacity.max(MIN_QUEUE_CAPACITY));
    (RequestSender { tx }, RequestInbox { rx })
}

pub trait RequestHandler {
    type Request;
    type Response;

    fn handle(&mut self, request: Self::Request) -> Self::Response;
}

#[derive(Debug, PartialEq, Eq)]
pub enum WorkerError {
    Timeout,
    Closed,
}

impl std::error::Error for WorkerError {}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerError::Timeout => write!(f, "Timeout"),
            WorkerError::Closed => write!(f, "Request queue closed"),
        }
    }
}

pub struct Worker<H: RequestHandler> {
    handler: H,
    inbox: RequestInbox<H::Request, H::Response>,
}

impl<H: RequestHandler> Worker<H> {
    pub fn new(
        handler: H,
        inbox: RequestInbox<H::Request, H::Response>,
    ) -> Self {
        Worker { handler, inbox }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn into_handler(self) -> H {
        self.handler
    }

    fn dispatch(&mut self, envelope: Envelope<H::Request, H::Response>) {
        let response = self.handler.handle(envelope.request);
        if let Some(callback) = envelope.callback {
            callback(response);
        }
    }

    /// Handle queued requests, including those enqueued while handling,
    /// until the queue is empty. Returns the number handled.
    pub fn run_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(envelope) = self.inbox.rx.try_recv() {
            self.dispatch(envelope);
            handled += 1;
        }
        trace!("handled {} requests", handled);
        handled
    }

    /// Pump requests on the calling thread until `done` holds for the
    /// handler or `timeout` elapses.
    pub fn run_until(
        &mut self,
        timeout: Duration,
        done: impl Fn(&H) -> bool,
    ) -> Result<(), WorkerError> {
        let start = Instant::now();
        while !done(&self.handler) {
            let remaining = timeout
                .checked_sub(start.elapsed())
                .ok_or(WorkerError::Timeout)?;
            match self.inbox.rx.recv_timeout(remaining) {
                Ok(envelope) => self.dispatch(envelope),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(WorkerError::Timeout);
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(WorkerError::Closed);
                }
            }
        }
        Ok(())
    }

    /// Handle requests until every sender is dropped.
    pub fn run(mut self) -> H {
        while let Ok(envelope) = self.inbox.rx.recv() {
            self.dispatch(envelope);
        }
        self.handler
    }
}

impl<H> Worker<H>
where
    H: RequestHandler + Send + 'static,
    H::Request: Send,
    H::Response: Send,
{
    /// Run the worker on a dedicated thread.
    pub fn spawn(self, name: &str) -> io::Result<JoinHandle<H>> {
        let name = name.to_string();
        thread::Builder::new().name(name.clone()).spawn(move || {
            let handler = self.run();
            error!("worker {} stopped: all senders dropped", name);
            handler
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Recorder {
        seen: Vec<u32>,
        requeue: Option<RequestSender<u32, usize>>,
    }

    impl RequestHandler for Recorder {
        type Request = u32;
        type Response = usize;

        fn handle(&mut self, request: u32) -> usize {
            self.seen.push(request);
            if request > 0 {
                if let Some(tx) = &self.requeue {
                    tx.send(request - 1).unwrap();
                }
            }
            self.seen.len()
        }
    }

    #[test]
    fn test_fifo_order() {
        let (tx, inbox) = bounded(8);
        let mut worker = Worker::new(
            Recorder {
                seen: vec![],
                requeue: None,
            },
            inbox,
        );
        for i in [5, 3, 9] {
            tx.send(i).unwrap();
        }
        assert_eq!(worker.run_pending(), 3);
        assert_eq!(worker.handler().seen, vec![5, 3, 9]);
        assert_eq!(worker.run_pending(), 0);
    }

    #[test]
    fn test_full_queue_is_reported() {
        let (tx, _inbox) = bounded::<u32, usize>(2);
        for i in 0..MIN_QUEUE_CAPACITY as u32 {
            assert_eq!(tx.send(i), Ok(()));
        }
        assert_eq!(tx.send(99), Err(QueueError::Full));
    }

    #[test]
    fn test_closed_queue() {
        let (tx, inbox) = bounded::<u32, usize>(8);
        drop(inbox);
        assert_eq!(tx.send(1), Err(QueueError::Closed));
    }

    #[test]
    fn test_response_callback_and_requeue() {
        let (tx, inbox) = bounded(8);
        let mut worker = Worker::new(
            Recorder {
                seen: vec![],
                requeue: Some(tx.clone()),
            },
            inbox,
        );
        let responses = Arc::new(Mutex::new(Vec::new()));
        let r = responses.clone();
        tx.send_with(2, move |resp| r.lock().unwrap().push(resp))
            .unwrap();
        assert_eq!(worker.run_pending(), 3);
        assert_eq!(worker.handler().seen, vec![2, 1, 0]);
        assert_eq!(*responses.lock().unwrap(), vec![1]);
    }

    #[test]
    fn test_run_until_from_other_thread() {
        let (tx, inbox) = bounded(8);
        let mut worker = Worker::new(
            Recorder {
                seen: vec![],
                requeue: None,
            },
            inbox,
        );
        let producer = thread::spawn(move || {
            for i in 0..4 {
                tx.send(i).unwrap();
            }
        });
        worker
            .run_until(Duration::from_secs(5), |h| h.seen.len() == 4)
            .unwrap();
        producer.join().unwrap();
        assert_eq!(worker.handler().seen, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_run_until_timeout() {
        let (_tx, inbox) = bounded::<u32, usize>(8);
        let mut worker = Worker::new(
            Recorder {
                seen: vec![],
                requeue: None,
            },
            inbox,
        );
        assert_eq!(
            worker.run_until(Duration::from_millis(10), |h| !h.seen.is_empty()),
            Err(WorkerError::Timeout)
        );
    }
}
