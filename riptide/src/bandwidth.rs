use std::collections::VecDeque;
use tokio::{sync::mpsc, task, time};

// Outbound bandwidth governor: a per-cycle token bucket. Each cycle the
// reserve resets to `byte_slice`; requests that don't fit are queued and
// served at the next cycle boundary in priority order. Fixed per-cycle
// grants give deterministic upload pacing independent of TCP jitter.

// Cycles of consumed-bytes history kept for observers.
const HISTORY_LEN: usize = 1000;

#[derive(Debug, thiserror::Error)]
pub enum BandwidthError {

    #[error("bytes_min {bytes_min} exceeds byte_slice {byte_slice}; request can never be granted")]
    Unsatisfiable { bytes_min: usize, byte_slice: usize },

    #[error("channel error: {0}")]
    Channel(String),

}

impl<T> From<mpsc::error::SendError<T>> for BandwidthError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        BandwidthError::Channel(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BandwidthError>;
pub type RateTx = mpsc::UnboundedSender<RateCommand>;
pub type RateRx = mpsc::UnboundedReceiver<RateCommand>;
pub type GrantTx = mpsc::UnboundedSender<Grant>;

// Delivered on the requester's channel, possibly repeatedly for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grant {

    pub granted: usize,

    // False when the request was only partially served and carries over.
    pub request_done: bool,

}

pub enum RateCommand {

    Request {
        bytes: usize,
        bytes_min: usize,
        priority: u8,
        reply: GrantTx,
    },

    // Bookkeeping for bytes already written without a prior request.
    Take(usize),

    Shutdown,

}

#[derive(Debug)]
struct PendingRequest {
    bytes: usize,
    bytes_min: usize,
    priority: u8,
    seq: u64,
    reply: GrantTx,
}

#[derive(Debug)]
pub enum RequestOutcome {
    // Bytes granted immediately.
    Granted(usize),
    // Queued for the next cycle(s); grants arrive on the reply channel.
    Pending,
}

#[derive(Debug)]
pub struct RateLimiter {

    // Tokens handed out per cycle.
    byte_slice: usize,

    // Remaining tokens this cycle. take() may push this negative; the drift
    // is clamped at -byte_slice so a burst costs at most one silent cycle.
    reserve: i64,

    pending: Vec<PendingRequest>,

    // Consumed bytes of the last HISTORY_LEN cycles, oldest first.
    history: VecDeque<usize>,

    seq: u64,

}

impl RateLimiter {

    pub fn new(byte_slice: usize) -> Self {
        Self {
            byte_slice,
            reserve: byte_slice as i64,
            pending: Vec::new(),
            history: VecDeque::with_capacity(HISTORY_LEN),
            seq: 0,
        }
    }

    // Request `bytes` of traffic, delivered in chunks of at least
    // `bytes_min` except for the last one. Grants that don't fit the current
    // reserve are deferred to cycle boundaries.
    pub fn request(
        &mut self,
        bytes: usize,
        bytes_min: usize,
        priority: u8,
        reply: GrantTx,
    ) -> Result<RequestOutcome> {
        assert!(bytes >= bytes_min && bytes_min > 0);

        if bytes_min > self.byte_slice {
            return Err(BandwidthError::Unsatisfiable {
                bytes_min,
                byte_slice: self.byte_slice,
            });
        }

        if (bytes_min as i64) <= self.reserve {
            let grant = (self.reserve as usize).min(bytes);
            self.reserve -= grant as i64;
            return Ok(RequestOutcome::Granted(grant));
        }

        self.seq += 1;
        self.pending.push(PendingRequest {
            bytes,
            bytes_min,
            priority,
            seq: self.seq,
            reply,
        });
        Ok(RequestOutcome::Pending)
    }

    pub fn take(&mut self, bytes: usize) {
        self.reserve -= bytes as i64;
        if self.reserve < -(self.byte_slice as i64) {
            self.reserve = -(self.byte_slice as i64);
        }
    }

    // Begin a new cycle: log the previous cycle's consumption, reset the
    // reserve and deal it out to queued requests, highest priority first and
    // oldest first within a priority.
    pub fn cycle_begin(&mut self) {

        let consumed = self.byte_slice as i64 - self.reserve;
        if self.history.len() == HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(consumed.max(0) as usize);

        // A negative reserve (bytes taken beyond the slice) eats into the
        // fresh slice.
        self.reserve += self.byte_slice as i64;
        if self.reserve > self.byte_slice as i64 {
            self.reserve = self.byte_slice as i64;
        }

        self.pending.sort_by(|a, b| {
            b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq))
        });

        let mut carried = Vec::new();
        for mut request in self.pending.drain(..) {
            if self.reserve <= 0 || (request.bytes_min as i64) > self.reserve {
                carried.push(request);
                continue;
            }

            if (request.bytes as i64) > self.reserve {
                let grant = self.reserve as usize;
                self.reserve = 0;
                request.bytes -= grant;
                if request.bytes < request.bytes_min {
                    request.bytes_min = request.bytes;
                }
                // A dropped receiver cancels the rest of the request.
                if request.reply.send(Grant { granted: grant, request_done: false }).is_ok() {
                    carried.push(request);
                }
            } else {
                let grant = request.bytes;
                self.reserve -= grant as i64;
                request.reply.send(Grant { granted: grant, request_done: true }).ok();
            }
        }
        self.pending = carried;
    }

    pub fn history(&self) -> impl Iterator<Item = usize> + '_ {
        self.history.iter().copied()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

// Runs a limiter on its own task, resetting the bucket on a fixed interval.
pub fn spawn(
    byte_slice: usize,
    cycle_length: std::time::Duration,
) -> (task::JoinHandle<()>, RateTx) {

    let (rate_tx, mut rate_rx): (RateTx, RateRx) = mpsc::unbounded_channel();
    let mut limiter = RateLimiter::new(byte_slice);

    let handle = tokio::spawn(async move {
        let mut cycle = time::interval(cycle_length);
        cycle.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        // The first tick fires immediately.
        cycle.tick().await;

        loop { tokio::select! {

            _ = cycle.tick() => limiter.cycle_begin(),

            cmd = rate_rx.recv() => {
                match cmd {

                    Some(RateCommand::Request { bytes, bytes_min, priority, reply }) => {
                        match limiter.request(bytes, bytes_min, priority, reply.clone()) {
                            Ok(RequestOutcome::Granted(granted)) => {
                                reply.send(Grant { granted, request_done: granted == bytes }).ok();
                                if granted < bytes {
                                    // Remainder queues for the next cycle.
                                    let rest = bytes - granted;
                                    limiter
                                        .request(rest, bytes_min.min(rest), priority, reply)
                                        .ok();
                                }
                            }
                            Ok(RequestOutcome::Pending) => {}
                            Err(e) => {
                                tracing::warn!("bandwidth request rejected: {}", e);
                                // Receiver drop tells the requester it will
                                // never be served.
                                drop(reply);
                            }
                        }
                    }

                    Some(RateCommand::Take(bytes)) => limiter.take(bytes),

                    Some(RateCommand::Shutdown) | None => break,

                }
            }
        }}
    });

    (handle, rate_tx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> (GrantTx, mpsc::UnboundedReceiver<Grant>) {
        mpsc::unbounded_channel()
    }

    #[test]
    fn test_immediate_grant() {
        let mut limiter = RateLimiter::new(1000);
        let (tx, _rx) = channel();
        match limiter.request(600, 100, 0, tx).unwrap() {
            RequestOutcome::Granted(n) => assert_eq!(n, 600),
            _ => panic!("expected immediate grant"),
        }
        // Only 400 left; a request for more is capped at the reserve.
        let (tx, _rx) = channel();
        match limiter.request(600, 100, 0, tx).unwrap() {
            RequestOutcome::Granted(n) => assert_eq!(n, 400),
            _ => panic!("expected immediate grant"),
        }
    }

    #[test]
    fn test_unsatisfiable() {
        let mut limiter = RateLimiter::new(100);
        let (tx, _rx) = channel();
        assert!(matches!(
            limiter.request(500, 200, 0, tx),
            Err(BandwidthError::Unsatisfiable { .. })
        ));
    }

    #[test]
    fn test_pending_served_in_priority_then_fifo_order() {
        let mut limiter = RateLimiter::new(100);
        limiter.take(100); // drain the cycle

        let (tx_low, mut rx_low) = channel();
        let (tx_hi, mut rx_hi) = channel();
        let (tx_low2, mut rx_low2) = channel();

        assert!(matches!(limiter.request(40, 40, 0, tx_low).unwrap(), RequestOutcome::Pending));
        assert!(matches!(limiter.request(50, 50, 5, tx_hi).unwrap(), RequestOutcome::Pending));
        assert!(matches!(limiter.request(30, 30, 0, tx_low2).unwrap(), RequestOutcome::Pending));

        limiter.cycle_begin();

        assert_eq!(rx_hi.try_recv().unwrap(), Grant { granted: 50, request_done: true });
        assert_eq!(rx_low.try_recv().unwrap(), Grant { granted: 40, request_done: true });
        // 10 bytes left, bytes_min 30 does not fit; carried over.
        assert!(rx_low2.try_recv().is_err());
        assert_eq!(limiter.pending_len(), 1);

        limiter.cycle_begin();
        assert_eq!(rx_low2.try_recv().unwrap(), Grant { granted: 30, request_done: true });
        assert_eq!(limiter.pending_len(), 0);
    }

    #[test]
    fn test_partial_grant_requeues_with_reduced_bytes() {
        let mut limiter = RateLimiter::new(100);
        limiter.take(100);

        let (tx, mut rx) = channel();
        assert!(matches!(limiter.request(250, 50, 0, tx).unwrap(), RequestOutcome::Pending));

        limiter.cycle_begin();
        assert_eq!(rx.try_recv().unwrap(), Grant { granted: 100, request_done: false });

        limiter.cycle_begin();
        assert_eq!(rx.try_recv().unwrap(), Grant { granted: 100, request_done: false });

        limiter.cycle_begin();
        assert_eq!(rx.try_recv().unwrap(), Grant { granted: 50, request_done: true });
        assert_eq!(limiter.pending_len(), 0);
    }

    #[test]
    fn test_cycle_grants_never_exceed_slice() {
        let mut limiter = RateLimiter::new(128);
        limiter.take(128);

        let mut receivers = Vec::new();
        for i in 0..10 {
            let (tx, rx) = channel();
            limiter.request(50, 10, (i % 3) as u8, tx).unwrap();
            receivers.push(rx);
        }

        for _ in 0..20 {
            limiter.cycle_begin();
            let granted: usize = receivers
                .iter_mut()
                .map(|rx| {
                    let mut sum = 0;
                    while let Ok(grant) = rx.try_recv() {
                        sum += grant.granted;
                    }
                    sum
                })
                .sum();
            assert!(granted <= 128, "granted {} in one cycle", granted);
        }

        // Everything was eventually served.
        assert_eq!(limiter.pending_len(), 0);
    }

    #[test]
    fn test_take_clamps_negative_drift() {
        let mut limiter = RateLimiter::new(100);
        limiter.take(10_000);

        // Debt is bounded to one slice: after two cycles the reserve is
        // positive again.
        limiter.cycle_begin();
        let (tx, _rx) = channel();
        assert!(matches!(limiter.request(10, 10, 0, tx).unwrap(), RequestOutcome::Pending));

        limiter.cycle_begin();
        let (tx, mut rx) = channel();
        match limiter.request(10, 10, 0, tx.clone()).unwrap() {
            RequestOutcome::Granted(n) => assert_eq!(n, 10),
            _ => {
                // Served from the queue drain instead.
                assert!(rx.try_recv().is_ok());
            }
        }
    }

    #[test]
    fn test_history_records_consumption() {
        let mut limiter = RateLimiter::new(100);
        let (tx, _rx) = channel();
        limiter.request(60, 10, 0, tx).unwrap();
        limiter.cycle_begin();
        assert_eq!(limiter.history().last(), Some(60));
    }

    #[tokio::test]
    async fn test_spawned_limiter_round_trip() {
        let (_handle, rate_tx) = spawn(1 << 16, std::time::Duration::from_millis(10));
        let (tx, mut rx) = mpsc::unbounded_channel();

        rate_tx
            .send(RateCommand::Request { bytes: 1024, bytes_min: 64, priority: 0, reply: tx })
            .unwrap();

        let mut total = 0;
        while total < 1024 {
            let grant = rx.recv().await.expect("grant channel closed");
            total += grant.granted;
            if grant.request_done {
                break;
            }
        }
        assert_eq!(total, 1024);
        rate_tx.send(RateCommand::Shutdown).unwrap();
    }
}
