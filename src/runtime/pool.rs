//! Client pool: a fixed number of job slots driven by one mio poller.
//!
//! Every call to [`ClientPool::iterate`] runs one cycle:
//!
//! 1. Fill empty slots with new jobs, each starting a non-blocking connect.
//! 2. Poll, bounded by the nearest job deadline and a fixed ceiling. The wait
//!    is zero when some job still holds unconsumed readiness.
//! 3. Fold events into the jobs' retained readiness.
//! 4. Tear down expired jobs, advance every other open job once.
//! 5. Capture the status line, then free the slots of closed jobs.
//!
//! Job failures are counted and never escape `iterate`; only a failing
//! poll call does.

use super::error::JobError;
use super::job::{Job, JobParams, Outcome};
use super::timeout::{Expiry, Timeout};
use crate::config::Config;
use crate::histogram::Histogram;
use crate::protocols::rpc::Procedure;
use mio::{Events, Poll, Registry};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// First transaction id handed out by a pool.
pub const XID_BASE: u32 = 0x1234_abcd;

/// Longest a single poll may block.
const POLL_CEILING: Duration = Duration::from_secs(10);

/// Range of the send latency histogram.
pub const SEND_RANGE: Duration = Duration::from_millis(500);

/// Range of the receive latency histogram.
pub const RECV_RANGE: Duration = Duration::from_secs(10);

/// Pool parameters, resolved from the run configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of concurrent job slots.
    pub jobs: usize,
    /// Upper bound (exclusive) of each job's call budget.
    pub max_calls: u32,
    /// Upper bound (exclusive) of each job's payload size.
    pub max_ints: usize,
    pub job_timeout: Duration,
    /// Total jobs to create over the run; `None` refills forever.
    pub connections: Option<u64>,
    pub target: Procedure,
    /// Seed for payloads, budgets and send slices; `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl From<&Config> for PoolConfig {
    fn from(config: &Config) -> Self {
        Self {
            jobs: config.jobs,
            max_calls: config.max_calls,
            max_ints: config.max_ints,
            job_timeout: config.job_timeout(),
            connections: config.connections,
            target: config.target(),
            seed: config.seed,
        }
    }
}

/// Running totals for one pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Calls whose reply was validated.
    pub calls: u64,
    /// Failed jobs, timeouts included.
    pub errors: u64,
    pub timeouts: u64,
    pub jobs_started: u64,
}

pub struct ClientPool {
    addr: SocketAddr,
    config: PoolConfig,
    poll: Poll,
    events: Events,
    jobs: Vec<Option<Job>>,
    rng: StdRng,
    next_xid: u32,
    stats: PoolStats,
    send_histogram: Histogram,
    recv_histogram: Histogram,
    status: String,
    /// Polls never wait past this point.
    end_time: Option<Instant>,
}

impl ClientPool {
    /// Create a pool of empty slots targeting `addr`.
    pub fn new(addr: SocketAddr, config: PoolConfig) -> io::Result<Self> {
        let poll = Poll::new()?;
        let events = Events::with_capacity(config.jobs.max(64));
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        debug!(
            addr = %addr,
            jobs = config.jobs,
            max_calls = config.max_calls,
            job_timeout_ms = config.job_timeout.as_millis() as u64,
            "Client pool created"
        );

        Ok(Self {
            addr,
            jobs: (0..config.jobs).map(|_| None).collect(),
            status: String::with_capacity(config.jobs),
            config,
            poll,
            events,
            rng,
            next_xid: XID_BASE,
            stats: PoolStats::default(),
            send_histogram: Histogram::new(SEND_RANGE),
            recv_histogram: Histogram::new(RECV_RANGE),
            end_time: None,
        })
    }

    /// Run one multiplex-and-advance cycle over all slots.
    pub fn iterate(&mut self) -> io::Result<()> {
        self.spawn_jobs();

        let timeout = self.poll_timeout();
        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            if e.kind() != io::ErrorKind::Interrupted {
                return Err(e);
            }
            self.events.clear();
        }

        for event in self.events.iter() {
            if let Some(Some(job)) = self.jobs.get_mut(event.token().0) {
                job.absorb(event);
            }
        }

        self.advance_jobs();
        self.capture_status();
        self.reap();
        Ok(())
    }

    /// Keep polls from blocking past `end`, so a timed run stops on time.
    pub fn set_end_time(&mut self, end: Option<Instant>) {
        self.end_time = end;
    }

    pub fn stats(&self) -> PoolStats {
        self.stats
    }

    pub fn send_histogram(&self) -> &Histogram {
        &self.send_histogram
    }

    pub fn recv_histogram(&self) -> &Histogram {
        &self.recv_histogram
    }

    /// One liveness character per slot from the last iteration.
    pub fn status_line(&self) -> &str {
        &self.status
    }

    /// Whether the connection budget is spent and every slot is empty.
    pub fn is_drained(&self) -> bool {
        self.budget_spent() && self.jobs.iter().all(Option::is_none)
    }

    /// Number of occupied slots.
    #[cfg(test)]
    pub fn active_jobs(&self) -> usize {
        self.jobs.iter().flatten().count()
    }

    #[cfg(test)]
    pub fn job(&self, slot: usize) -> Option<&Job> {
        self.jobs.get(slot).and_then(Option::as_ref)
    }

    fn budget_spent(&self) -> bool {
        self.config
            .connections
            .is_some_and(|budget| self.stats.jobs_started >= budget)
    }

    fn spawn_jobs(&mut self) {
        for slot in 0..self.jobs.len() {
            if self.jobs[slot].is_some() {
                continue;
            }
            if self.budget_spent() {
                break;
            }
            let job = self.start_job(slot);
            self.jobs[slot] = Some(job);
        }
    }

    fn start_job(&mut self, slot: usize) -> Job {
        let max_calls = self.rng.gen_range(0..self.config.max_calls.max(1));
        let num_ints = self.rng.gen_range(0..self.config.max_ints.max(1));
        let params = JobParams {
            xid: self.next_xid,
            max_calls,
            num_ints,
            timeout: self.config.job_timeout,
            target: self.config.target,
        };
        self.next_xid = self.next_xid.wrapping_add(max_calls.max(1));
        self.stats.jobs_started += 1;

        let mut job = Job::new(slot, params);
        trace!(
            job = %job.name(),
            xid = job.xid(),
            max_calls = job.max_calls(),
            num_ints,
            "Starting job"
        );

        let registry = self.poll.registry();
        if let Err(e) = job.connect(self.addr, registry) {
            fail_job(&mut job, e, &mut self.stats, registry);
        }
        job
    }

    /// Zero if any job can make progress without waiting, otherwise the
    /// nearest deadline (or run end) capped at the ceiling.
    fn poll_timeout(&self) -> Option<Duration> {
        let mut timeout = Timeout::new(Instant::now()).with_ceiling(POLL_CEILING);
        if let Some(end) = self.end_time {
            timeout.update(end);
        }
        for job in self.jobs.iter().flatten() {
            if job.is_ready() {
                return Some(Duration::ZERO);
            }
            if job.is_open() {
                timeout.update(job.deadline());
            }
        }
        timeout.bound().as_poll_timeout()
    }

    fn advance_jobs(&mut self) {
        let mut expiry = Timeout::new(Instant::now());
        let registry = self.poll.registry();

        for job in self.jobs.iter_mut().flatten() {
            if !job.is_open() {
                continue;
            }
            if expiry.update(job.deadline()) == Expiry::Expired {
                fail_job(job, JobError::Timeout, &mut self.stats, registry);
                continue;
            }

            match job.advance(registry, &mut self.rng) {
                Ok(Outcome::Idle | Outcome::Progress) => {}
                Ok(Outcome::Sent(latency)) => self.send_histogram.record(latency),
                Ok(Outcome::Completed(latency) | Outcome::Finished(latency)) => {
                    self.recv_histogram.record(latency);
                    self.stats.calls += 1;
                }
                Err(e) => {
                    fail_job(job, e, &mut self.stats, registry);
                    continue;
                }
            }
            job.mark_waiting();
        }
    }

    fn capture_status(&mut self) {
        self.status.clear();
        for slot in self.jobs.iter_mut() {
            let activity = match slot {
                Some(job) => job.take_activity(),
                None => '.',
            };
            self.status.push(activity);
        }
    }

    /// Free the slots of jobs that closed this iteration.
    fn reap(&mut self) {
        for slot in self.jobs.iter_mut() {
            if slot.as_ref().is_some_and(|job| !job.is_open()) {
                *slot = None;
            }
        }
    }
}

/// Count a job failure, log it, and close the socket.
fn fail_job(job: &mut Job, error: JobError, stats: &mut PoolStats, registry: &Registry) {
    stats.errors += 1;
    if error.is_timeout() {
        stats.timeouts += 1;
        warn!(job = %job.name(), fd = job.fd(), "Timed out waiting for reply");
        job.dump();
        job.mark('t');
    } else {
        warn!(
            job = %job.name(),
            fd = job.fd(),
            calls = job.calls(),
            error = %error,
            "Job failed"
        );
        if error.is_protocol() {
            job.dump();
        }
        job.mark('*');
    }
    job.close(registry);
}
