//! Top-level run loop and final report.

use crate::config::Config;
use crate::histogram::Histogram;
use crate::runtime::{ClientPool, PoolConfig, PoolStats};
use std::io::{self, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::{Duration, Instant};
use tracing::{error, info};

/// Height of each rendered histogram.
const HISTOGRAM_LINES: usize = 16;

const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("cannot resolve server address '{0}': {1}")]
    Resolve(String, #[source] io::Error),
    #[error("server address '{0}' did not resolve to any address")]
    NoAddress(String),
    #[error("cannot create poller: {0}")]
    Setup(#[source] io::Error),
    #[error("readiness poll failed: {0}")]
    Multiplex(#[source] io::Error),
    #[error("cannot write output: {0}")]
    Output(#[from] io::Error),
}

/// Resolve `server` (`host:port`) to the first address it yields.
pub fn resolve(server: &str) -> Result<SocketAddr, DriverError> {
    server
        .to_socket_addrs()
        .map_err(|e| DriverError::Resolve(server.to_string(), e))?
        .next()
        .ok_or_else(|| DriverError::NoAddress(server.to_string()))
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub stats: PoolStats,
    /// Stopped because the error budget ran out.
    pub aborted: bool,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn failed(&self) -> bool {
        self.stats.errors > 0
    }
}

pub struct Driver {
    pool: ClientPool,
    runtime: Option<Duration>,
    max_errors: u64,
    trace: bool,
}

impl Driver {
    pub fn new(config: &Config) -> Result<Self, DriverError> {
        let addr = resolve(&config.server)?;
        let pool = ClientPool::new(addr, PoolConfig::from(config)).map_err(DriverError::Setup)?;

        info!(
            server = %config.server,
            addr = %addr,
            jobs = config.jobs,
            job_timeout_ms = config.job_timeout().as_millis() as u64,
            runtime_secs = config.runtime.map(|d| d.as_secs()),
            "Starting stress run"
        );

        Ok(Self {
            pool,
            runtime: config.runtime,
            max_errors: config.max_errors,
            trace: config.trace,
        })
    }

    /// Iterate the pool until the run time ends, the error budget is spent,
    /// or the connection budget drains. Progress goes to `out`.
    pub fn run<W: Write>(&mut self, out: &mut W) -> Result<RunSummary, DriverError> {
        let started = Instant::now();
        let end = self.runtime.map(|d| started + d);
        self.pool.set_end_time(end);
        let mut next_progress = started;
        let mut aborted = false;

        loop {
            if let Err(e) = self.pool.iterate() {
                error!(error = %e, "Readiness poll failed");
                return Err(DriverError::Multiplex(e));
            }

            let stats = self.pool.stats();
            if self.trace {
                writeln!(out, "{}:", self.pool.status_line())?;
                out.flush()?;
            } else if Instant::now() >= next_progress {
                write!(out, "{}... ", stats.calls)?;
                out.flush()?;
                next_progress = Instant::now() + PROGRESS_INTERVAL;
            }

            if end.is_some_and(|end| Instant::now() >= end) {
                break;
            }
            if stats.errors >= self.max_errors {
                error!(errors = stats.errors, "Too many errors, aborting this run");
                aborted = true;
                break;
            }
            if self.pool.is_drained() {
                break;
            }
        }

        if !self.trace {
            writeln!(out)?;
        }

        let summary = RunSummary {
            stats: self.pool.stats(),
            aborted,
            elapsed: started.elapsed(),
        };
        info!(
            calls = summary.stats.calls,
            errors = summary.stats.errors,
            timeouts = summary.stats.timeouts,
            connections = summary.stats.jobs_started,
            send_samples = self.pool.send_histogram().count(),
            recv_samples = self.pool.recv_histogram().count(),
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "Run finished"
        );
        Ok(summary)
    }

    /// Write the error count and both latency histograms.
    pub fn report<W: Write>(&self, out: &mut W) -> io::Result<()> {
        write_report(
            out,
            &self.pool.stats(),
            self.pool.send_histogram(),
            self.pool.recv_histogram(),
        )
    }
}

pub fn write_report<W: Write>(
    out: &mut W,
    stats: &PoolStats,
    send: &Histogram,
    recv: &Histogram,
) -> io::Result<()> {
    if stats.errors > 0 {
        writeln!(out, "Encountered {} errors", stats.errors)?;
    }

    write!(out, "\n\nSend histogram (time needed to send a full packet)\n")?;
    out.write_all(send.render(HISTOGRAM_LINES).as_bytes())?;

    write!(out, "\n\nReceive histogram (time taken to receive a full reply)\n")?;
    out.write_all(recv.render(HISTOGRAM_LINES).as_bytes())?;
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Behavior, MockServer};

    fn config(server: &str) -> Config {
        Config {
            server: server.to_string(),
            runtime: None,
            jobs: 3,
            job_timeout: Some(Duration::from_secs(5)),
            max_calls: 2,
            max_errors: 256,
            max_ints: 32,
            connections: Some(6),
            seed: Some(11),
            program: 0x3123_0000,
            version: 2,
            procedure: 9,
            trace: false,
            log_level: "info".to_string(),
        }
    }

    #[test]
    fn test_resolve_literal_address() {
        let addr = resolve("127.0.0.1:5050").unwrap();
        assert_eq!(addr, "127.0.0.1:5050".parse().unwrap());
    }

    #[test]
    fn test_resolve_rejects_missing_port() {
        assert!(matches!(
            resolve("127.0.0.1"),
            Err(DriverError::Resolve(..))
        ));
    }

    #[test]
    fn test_report_without_errors() {
        let mut send = Histogram::new(Duration::from_millis(500));
        send.record(Duration::from_millis(20));
        let recv = Histogram::new(Duration::from_secs(10));

        let mut out = Vec::new();
        write_report(&mut out, &PoolStats::default(), &send, &recv).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(!text.contains("Encountered"));
        assert!(text.contains("Send histogram (time needed to send a full packet)"));
        assert!(text.contains("Receive histogram (time taken to receive a full reply)"));
        assert!(text.contains("500 msec"));
        assert!(text.ends_with("(no samples)\n"));
    }

    #[test]
    fn test_report_counts_errors() {
        let stats = PoolStats {
            errors: 3,
            ..PoolStats::default()
        };
        let send = Histogram::new(Duration::from_millis(500));
        let recv = Histogram::new(Duration::from_secs(10));

        let mut out = Vec::new();
        write_report(&mut out, &stats, &send, &recv).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("Encountered 3 errors\n"));
    }

    #[test]
    fn test_run_drains_connection_budget() {
        let server = MockServer::start(Behavior::Sum);
        let mut driver = Driver::new(&config(&server.addr().to_string())).unwrap();

        let mut out = Vec::new();
        let summary = driver.run(&mut out).unwrap();
        assert!(!summary.aborted);
        assert!(!summary.failed());
        assert_eq!(summary.stats.jobs_started, 6);
        assert!(summary.stats.calls >= 6);

        let progress = String::from_utf8(out).unwrap();
        assert!(progress.starts_with("0... "));
        assert!(progress.ends_with('\n'));
    }

    #[test]
    fn test_run_aborts_on_error_budget() {
        let server = MockServer::start(Behavior::CorruptSum);
        let mut config = config(&server.addr().to_string());
        config.max_errors = 2;
        config.connections = None;
        config.trace = true;
        let mut driver = Driver::new(&config).unwrap();

        let mut out = Vec::new();
        let summary = driver.run(&mut out).unwrap();
        assert!(summary.aborted);
        assert!(summary.failed());
        assert!(summary.stats.errors >= 2);

        let trace = String::from_utf8(out).unwrap();
        assert!(trace.lines().all(|line| line.len() == 4 && line.ends_with(':')));
    }

    #[test]
    fn test_run_stops_at_end_time() {
        let server = MockServer::start(Behavior::Silent);
        let mut config = config(&server.addr().to_string());
        config.runtime = Some(Duration::from_millis(300));
        config.connections = None;
        let mut driver = Driver::new(&config).unwrap();

        let started = Instant::now();
        let summary = driver.run(&mut Vec::new()).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!summary.failed());
    }
}
