//! Bounded retry loop used to reach a remote agent or a freshly spawned backend process.
use crate::debugger::cancel::CancellationToken;
use crate::debugger::error::Error;
use log::{debug, info};
use std::thread;
use std::time::{Duration, Instant};

/// Progress report of a connection attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionProgress {
    pub target: String,
    /// Attempt number, starting at 1.
    pub attempt: u32,
    pub max_attempts: u32,
    /// Failure of the previous attempt.
    pub last_error: Option<String>,
}

#[derive(Clone, Debug)]
pub struct ConnectionStarter {
    max_attempts: u32,
    interval: Duration,
}

impl ConnectionStarter {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            interval,
        }
    }

    /// Call `attempt` until it succeeds, at most `max_attempts` times, waiting `interval` between
    /// two consecutive attempts (not after the last one).
    ///
    /// Exhaustion returns [`Error::ConnectionTimeout`] carrying the last failure text.
    pub fn connect<T>(
        &self,
        target: &str,
        cancel: &CancellationToken,
        mut progress: impl FnMut(&ConnectionProgress),
        mut attempt: impl FnMut(u32) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let mut last_error = None;

        for n in 1..=self.max_attempts {
            cancel.check()?;
            progress(&ConnectionProgress {
                target: target.to_string(),
                attempt: n,
                max_attempts: self.max_attempts,
                last_error: last_error.clone(),
            });

            match attempt(n) {
                Ok(conn) => {
                    info!(target: "transport", "connected to {target} (attempt {n})");
                    return Ok(conn);
                }
                Err(e) => {
                    debug!(target: "transport", "attempt {n} to {target} failed: {e:#}");
                    last_error = Some(e.to_string());
                }
            }

            if n < self.max_attempts {
                self.pause(cancel)?;
            }
        }

        Err(Error::ConnectionTimeout {
            target: target.to_string(),
            attempts: self.max_attempts,
            last_error: last_error.unwrap_or_default(),
        })
    }

    /// Sleep for one interval, waking up periodically to observe cancellation.
    fn pause(&self, cancel: &CancellationToken) -> Result<(), Error> {
        const SLICE: Duration = Duration::from_millis(20);

        let deadline = Instant::now() + self.interval;
        loop {
            cancel.check()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::sleep(SLICE.min(deadline - now));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io;

    fn refused() -> Error {
        Error::IO(io::Error::from(io::ErrorKind::ConnectionRefused))
    }

    #[test]
    fn test_exhaustion_after_n_attempts() {
        let starter = ConnectionStarter::new(4, Duration::from_millis(25));
        let mut calls = 0;
        let mut reports = vec![];

        let begin = Instant::now();
        let result: Result<(), _> = starter.connect(
            "tcp 127.0.0.1:1",
            &CancellationToken::new(),
            |p| reports.push(p.clone()),
            |_| {
                calls += 1;
                Err(refused())
            },
        );
        let elapsed = begin.elapsed();

        assert_eq!(calls, 4);
        assert!(elapsed >= Duration::from_millis(75), "elapsed: {elapsed:?}");
        assert_eq!(reports.len(), 4);
        assert_eq!(reports[0].last_error, None);
        assert!(reports[3].last_error.is_some());
        match result {
            Err(Error::ConnectionTimeout {
                attempts, target, ..
            }) => {
                assert_eq!(attempts, 4);
                assert_eq!(target, "tcp 127.0.0.1:1");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_success_stops_retrying() {
        let starter = ConnectionStarter::new(5, Duration::from_millis(1));
        let mut calls = 0;
        let conn = starter
            .connect("agent", &CancellationToken::new(), |_| {}, |n| {
                calls += 1;
                if n == 2 {
                    Ok("connected")
                } else {
                    Err(refused())
                }
            })
            .unwrap();
        assert_eq!(conn, "connected");
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_cancelled_between_attempts() {
        let starter = ConnectionStarter::new(10, Duration::from_millis(1));
        let token = CancellationToken::new();
        let result: Result<(), _> = starter.connect("agent", &token, |_| {}, |n| {
            if n == 3 {
                token.cancel();
            }
            Err(refused())
        });
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
