// src/ftp_pool.rs
//! Pooled, circuit-breaker-protected FTP sessions (C1).
//!
//! Mirrors the shape of the RPC connection pool this crate inherited from its
//! upstream infrastructure: a small number of warm, authenticated sessions
//! checked out through a semaphore, a per-host circuit breaker tracking
//! consecutive failures, and a background health checker that recycles stale
//! or unhealthy sessions.

use crate::errors::IngestError;
use crate::metrics;
use crate::notifications::Notifier;
use crate::settings::Settings;
use anyhow::Result;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use log::{info, warn};
use std::collections::VecDeque;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};
use suppaftp::AsyncFtpStream;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;

type HostRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitBreakerStateName {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
struct CircuitBreakerState {
    state: CircuitBreakerStateName,
    failures: u32,
    last_failure: Option<Instant>,
}

impl Default for CircuitBreakerState {
    fn default() -> Self {
        Self {
            state: CircuitBreakerStateName::Closed,
            failures: 0,
            last_failure: None,
        }
    }
}

/// An entry in the FTP directory listing.
#[derive(Debug, Clone)]
pub struct FtpEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

struct Session {
    stream: AsyncFtpStream,
    created_at: Instant,
}

/// Maintains N warm authenticated FTP sessions against a single host.
pub struct FtpPool {
    host: String,
    user: String,
    password: String,
    idle: Arc<Mutex<VecDeque<Session>>>,
    semaphore: Arc<Semaphore>,
    max_lifetime: Duration,
    op_timeout: Duration,
    circuit_breaker: Arc<Mutex<CircuitBreakerState>>,
    failure_threshold: u32,
    window: Duration,
    cooloff: Duration,
    limiter: Arc<HostRateLimiter>,
    notifier: Mutex<Option<Notifier>>,
}

/// RAII guard returned by [`FtpPool::acquire`]. Returns the session to the
/// idle queue on drop unless it was explicitly discarded after an I/O error.
pub struct FtpSessionGuard {
    pool: Arc<FtpPool>,
    session: Option<Session>,
    _permit: OwnedSemaphorePermit,
}

impl FtpPool {
    pub fn new(settings: &Settings) -> Result<Arc<Self>> {
        let quota = Quota::per_second(
            NonZeroU32::new(settings.ftp.ops_per_sec.max(1))
                .ok_or_else(|| anyhow::anyhow!("ops_per_sec must be non-zero"))?,
        );
        let pool = Self {
            host: settings.ftp.host.clone(),
            user: settings.ftp.user.clone(),
            password: settings.ftp.password.clone(),
            idle: Arc::new(Mutex::new(VecDeque::new())),
            semaphore: Arc::new(Semaphore::new(settings.ftp.pool_size.max(1))),
            max_lifetime: Duration::from_secs(settings.ftp.max_lifetime_secs),
            op_timeout: Duration::from_millis(settings.ftp.op_timeout_ms),
            circuit_breaker: Arc::new(Mutex::new(CircuitBreakerState::default())),
            failure_threshold: settings.ftp.circuit_breaker.failure_threshold,
            window: Duration::from_secs(settings.ftp.circuit_breaker.window_secs),
            cooloff: Duration::from_millis(settings.ftp.circuit_breaker.cooloff_ms),
            limiter: Arc::new(RateLimiter::direct(quota)),
            notifier: Mutex::new(None),
        };
        let pool = Arc::new(pool);
        pool.clone().spawn_health_checker();
        Ok(pool)
    }

    /// Wires a [`Notifier`] so circuit-breaker transitions are posted to
    /// Slack (spec §6: "circuit-breaker state changes"). Optional; the pool
    /// functions identically without one.
    pub async fn set_notifier(&self, notifier: Notifier) {
        *self.notifier.lock().await = Some(notifier);
    }

    async fn notify_state_change(&self, state: &str) {
        let guard = self.notifier.lock().await;
        if let Some(notifier) = guard.as_ref() {
            notifier.circuit_breaker_state_changed(&self.host, state).await;
        }
    }

    /// Checks the circuit breaker out of a background loop every 30s,
    /// transitioning Open -> HalfOpen once the cooloff elapses.
    fn spawn_health_checker(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            loop {
                ticker.tick().await;
                let mut cb = self.circuit_breaker.lock().await;
                if cb.state == CircuitBreakerStateName::Open {
                    if let Some(last) = cb.last_failure {
                        if last.elapsed() >= self.cooloff {
                            cb.state = CircuitBreakerStateName::HalfOpen;
                            cb.failures = 0;
                            info!("FTP circuit breaker for {} transitioning to HalfOpen", self.host);
                            metrics::set_circuit_breaker_state(&self.host, 2.0);
                            drop(cb);
                            self.notify_state_change("half-open").await;
                            continue;
                        }
                    }
                }
            }
        });
    }

    fn is_open(&self, cb: &CircuitBreakerState) -> bool {
        cb.state == CircuitBreakerStateName::Open
    }

    /// Checks out a session, lazily authenticating a fresh one if the idle
    /// queue is empty. Fails fast with `FtpUnavailable` if the breaker is open.
    pub async fn acquire(self: &Arc<Self>) -> Result<FtpSessionGuard, IngestError> {
        {
            let cb = self.circuit_breaker.lock().await;
            if self.is_open(&cb) {
                return Err(IngestError::FtpUnavailable {
                    host: self.host.clone(),
                });
            }
        }

        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| IngestError::TransientFtp("semaphore closed".to_string()))?;

        let mut idle = self.idle.lock().await;
        while let Some(session) = idle.pop_front() {
            if session.created_at.elapsed() < self.max_lifetime {
                return Ok(FtpSessionGuard {
                    pool: self.clone(),
                    session: Some(session),
                    _permit: permit,
                });
            }
            // session past max_lifetime: let it drop and try the next one.
        }
        drop(idle);

        let session = self.connect_and_login().await?;
        Ok(FtpSessionGuard {
            pool: self.clone(),
            session: Some(session),
            _permit: permit,
        })
    }

    async fn connect_and_login(&self) -> Result<Session, IngestError> {
        let addr = self.host.clone();
        let connect = async {
            let mut stream = AsyncFtpStream::connect(&addr)
                .await
                .map_err(|e| IngestError::TransientFtp(format!("connect {}: {}", addr, e)))?;
            stream
                .login(&self.user, &self.password)
                .await
                .map_err(|e| IngestError::TransientFtp(format!("login: {}", e)))?;
            stream
                .transfer_type(suppaftp::types::FileType::Binary)
                .await
                .map_err(|e| IngestError::TransientFtp(format!("set binary mode: {}", e)))?;
            Ok::<_, IngestError>(stream)
        };

        match timeout(self.op_timeout, connect).await {
            Ok(Ok(stream)) => {
                self.report_success().await;
                Ok(Session {
                    stream,
                    created_at: Instant::now(),
                })
            }
            Ok(Err(e)) => {
                self.report_failure().await;
                Err(e)
            }
            Err(_) => {
                self.report_failure().await;
                Err(IngestError::TransientFtp(format!(
                    "connect to {} timed out",
                    self.host
                )))
            }
        }
    }

    async fn report_success(&self) {
        let mut cb = self.circuit_breaker.lock().await;
        let became_closed = cb.state == CircuitBreakerStateName::HalfOpen;
        if became_closed {
            cb.state = CircuitBreakerStateName::Closed;
            cb.failures = 0;
            info!("FTP circuit breaker for {} is now Closed", self.host);
            metrics::set_circuit_breaker_state(&self.host, 0.0);
        } else if cb.state == CircuitBreakerStateName::Closed {
            cb.failures = 0;
        }
        drop(cb);
        if became_closed {
            self.notify_state_change("closed").await;
        }
    }

    async fn report_failure(&self) {
        let mut cb = self.circuit_breaker.lock().await;
        let mut opened = false;
        match cb.state {
            CircuitBreakerStateName::HalfOpen => {
                cb.state = CircuitBreakerStateName::Open;
                cb.last_failure = Some(Instant::now());
                warn!(
                    "FTP provider {} failed in HalfOpen state; circuit breaker Open again",
                    self.host
                );
                metrics::set_circuit_breaker_state(&self.host, 1.0);
                metrics::increment_circuit_breaker_opened(&self.host);
                opened = true;
            }
            CircuitBreakerStateName::Closed => {
                if let Some(last) = cb.last_failure {
                    if last.elapsed() > self.window {
                        cb.failures = 0;
                    }
                }
                cb.failures += 1;
                cb.last_failure = Some(Instant::now());
                if cb.failures >= self.failure_threshold {
                    cb.state = CircuitBreakerStateName::Open;
                    warn!(
                        "FTP provider {} circuit breaker Open after {} consecutive failures",
                        self.host, cb.failures
                    );
                    metrics::set_circuit_breaker_state(&self.host, 1.0);
                    metrics::increment_circuit_breaker_opened(&self.host);
                    opened = true;
                }
            }
            CircuitBreakerStateName::Open => {}
        }
        drop(cb);
        if opened {
            self.notify_state_change("open").await;
        }
    }

    /// Lists entries under `path`. Returns an empty vector (never an error)
    /// when the subdirectory cannot be accessed, per spec §4.2's
    /// skip-without-failing-the-enumeration contract.
    pub async fn list(self: &Arc<Self>, path: &str) -> Result<Vec<FtpEntry>, IngestError> {
        self.limiter.until_ready().await;
        let mut guard = self.acquire().await?;
        let result = timeout(self.op_timeout, guard.session_mut().stream.list(Some(path))).await;
        match result {
            Ok(Ok(lines)) => {
                self.report_success().await;
                metrics::increment_ftp_operation("list", "success");
                Ok(lines.iter().filter_map(|l| parse_list_line(l)).collect())
            }
            Ok(Err(e)) => {
                guard.discard();
                self.report_failure().await;
                metrics::increment_ftp_operation("list", "failure");
                warn!("FTP list({}) failed: {}", path, e);
                Ok(Vec::new())
            }
            Err(_) => {
                guard.discard();
                self.report_failure().await;
                metrics::increment_ftp_operation("list", "failure");
                warn!("FTP list({}) timed out", path);
                Ok(Vec::new())
            }
        }
    }

    /// Downloads the contents of `path`.
    pub async fn download(self: &Arc<Self>, path: &str) -> Result<Vec<u8>, IngestError> {
        self.limiter.until_ready().await;
        let mut guard = self.acquire().await?;
        let result = timeout(
            self.op_timeout,
            guard.session_mut().stream.retr_as_buffer(path),
        )
        .await;
        match result {
            Ok(Ok(cursor)) => {
                self.report_success().await;
                metrics::increment_ftp_operation("download", "success");
                Ok(cursor.into_inner())
            }
            Ok(Err(e)) => {
                guard.discard();
                self.report_failure().await;
                metrics::increment_ftp_operation("download", "failure");
                Err(IngestError::TransientFtp(format!("download {}: {}", path, e)))
            }
            Err(_) => {
                guard.discard();
                self.report_failure().await;
                metrics::increment_ftp_operation("download", "failure");
                Err(IngestError::TransientFtp(format!("download {} timed out", path)))
            }
        }
    }
}

impl FtpSessionGuard {
    fn session_mut(&mut self) -> &mut Session {
        self.session.as_mut().expect("session guard used after discard")
    }

    /// Marks the session as broken so it is not returned to the idle queue.
    pub fn discard(&mut self) {
        self.session = None;
    }
}

impl Drop for FtpSessionGuard {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            let idle = self.pool.idle.clone();
            tokio::spawn(async move {
                idle.lock().await.push_back(session);
            });
        }
    }
}

/// Parses one line of a Unix-style FTP `LIST` response. Best-effort: lines
/// that don't match the expected shape are skipped rather than failing the
/// whole listing.
fn parse_list_line(line: &str) -> Option<FtpEntry> {
    let mut parts = line.split_whitespace();
    let perms = parts.next()?;
    let is_dir = perms.starts_with('d');
    // skip link-count, owner, group
    let size: u64 = parts.nth(3).and_then(|s| s.parse().ok()).unwrap_or(0);
    // skip month, day, year/time
    let _ = (parts.next()?, parts.next()?, parts.next()?);
    let name = parts.collect::<Vec<_>>().join(" ");
    if name.is_empty() {
        return None;
    }
    Some(FtpEntry { name, is_dir, size })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_directory_entry() {
        let line = "drwxr-xr-x   2 ftp      ftp          4096 Oct 06 10:22 180";
        let entry = parse_list_line(line).unwrap();
        assert!(entry.is_dir);
        assert_eq!(entry.name, "180");
    }

    #[test]
    fn parses_file_entry_with_size() {
        let line = "-rw-r--r--   1 ftp      ftp         10240 Oct 06 10:22 2144014.json";
        let entry = parse_list_line(line).unwrap();
        assert!(!entry.is_dir);
        assert_eq!(entry.name, "2144014.json");
        assert_eq!(entry.size, 10240);
    }

    #[test]
    fn skips_malformed_line() {
        assert!(parse_list_line("not a listing line").is_none());
    }
}
