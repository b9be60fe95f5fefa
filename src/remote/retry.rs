//! Bounded exponential-backoff retry for single network calls.

use serde::Deserialize;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::error::{Result, StoreError};

/// Default number of retries after the first attempt
pub const DEFAULT_RETRY_COUNT: u32 = 3;
/// Default base backoff (ms)
pub const DEFAULT_BACKOFF_MS: u64 = 500;

/// Retry settings, overridable on every remote-facing call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryOptions {
  /// Retries after the initial attempt
  pub retry_count: u32,
  /// Base delay; the delay after attempt `n` is `backoff_ms * 2^n`
  pub backoff_ms: u64,
  /// Log every attempt at info level
  pub debug: bool,
}

impl Default for RetryOptions {
  fn default() -> Self {
    Self {
      retry_count: DEFAULT_RETRY_COUNT,
      backoff_ms: DEFAULT_BACKOFF_MS,
      debug: false,
    }
  }
}

impl RetryOptions {
  /// Delay to wait after the (0-indexed) attempt `attempt` failed.
  pub fn backoff_for(&self, attempt: u32) -> Duration {
    let factor = 2u64.saturating_pow(attempt);
    Duration::from_millis(self.backoff_ms.saturating_mul(factor))
  }
}

/// Anything that carries an HTTP-style status code.
pub trait StatusCode {
  fn status_code(&self) -> u16;
}

impl StatusCode for reqwest::Response {
  fn status_code(&self) -> u16 {
    self.status().as_u16()
  }
}

/// Wraps network calls with retry on transport errors and 5xx responses.
#[derive(Debug, Clone, Default)]
pub struct RetryingFetcher {
  defaults: RetryOptions,
}

impl RetryingFetcher {
  pub fn new(defaults: RetryOptions) -> Self {
    Self { defaults }
  }

  pub fn defaults(&self) -> &RetryOptions {
    &self.defaults
  }

  /// Run `request` until it yields a non-5xx response or retries run out.
  ///
  /// 4xx responses are returned immediately. When retries are exhausted the
  /// last 5xx response is returned as-is; if no attempt got a response at
  /// all a `StoreError::Network` is raised instead.
  pub async fn fetch_with_retry<F, Fut, R, E>(
    &self,
    mut request: F,
    overrides: Option<&RetryOptions>,
  ) -> Result<R>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<R, E>>,
    R: StatusCode,
    E: Display,
  {
    let options = overrides.unwrap_or(&self.defaults);
    let max_attempts = options.retry_count.saturating_add(1);
    let mut last_response: Option<R> = None;
    let mut last_error = String::new();

    for attempt in 0..max_attempts {
      match request().await {
        Ok(response) => {
          let status = response.status_code();
          if status < 500 {
            return Ok(response);
          }
          log_attempt(options, attempt, max_attempts, &format!("HTTP {}", status));
          last_response = Some(response);
        }
        Err(e) => {
          last_error = e.to_string();
          log_attempt(options, attempt, max_attempts, &last_error);
        }
      }

      if attempt + 1 < max_attempts {
        sleep(options.backoff_for(attempt)).await;
      }
    }

    match last_response {
      Some(response) => Ok(response),
      None => Err(StoreError::Network {
        attempts: max_attempts,
        message: last_error,
      }),
    }
  }

  /// Send a reqwest request built fresh for every attempt.
  pub async fn send<F>(
    &self,
    mut build: F,
    overrides: Option<&RetryOptions>,
  ) -> Result<reqwest::Response>
  where
    F: FnMut() -> reqwest::RequestBuilder,
  {
    self
      .fetch_with_retry(|| build().send(), overrides)
      .await
  }
}

fn log_attempt(options: &RetryOptions, attempt: u32, max_attempts: u32, reason: &str) {
  if options.debug {
    info!(
      "Request failed (attempt {}/{}): {}",
      attempt + 1,
      max_attempts,
      reason
    );
  } else {
    debug!(
      "Request failed (attempt {}/{}): {}",
      attempt + 1,
      max_attempts,
      reason
    );
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicU32, Ordering};

  struct FakeResponse(u16);

  impl StatusCode for FakeResponse {
    fn status_code(&self) -> u16 {
      self.0
    }
  }

  fn fast(retry_count: u32) -> RetryOptions {
    RetryOptions {
      retry_count,
      backoff_ms: 1,
      debug: false,
    }
  }

  #[test]
  fn test_backoff_doubles() {
    let options = RetryOptions {
      backoff_ms: 100,
      ..Default::default()
    };
    assert_eq!(options.backoff_for(0), Duration::from_millis(100));
    assert_eq!(options.backoff_for(1), Duration::from_millis(200));
    assert_eq!(options.backoff_for(3), Duration::from_millis(800));
  }

  #[tokio::test]
  async fn test_always_500_makes_retry_count_plus_one_attempts() {
    let attempts = AtomicU32::new(0);
    let fetcher = RetryingFetcher::default();

    let response = fetcher
      .fetch_with_retry(
        || {
          attempts.fetch_add(1, Ordering::SeqCst);
          async { Ok::<_, String>(FakeResponse(500)) }
        },
        Some(&fast(2)),
      )
      .await
      .unwrap();

    assert_eq!(response.status_code(), 500);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn test_404_is_not_retried() {
    let attempts = AtomicU32::new(0);
    let fetcher = RetryingFetcher::new(fast(5));

    let response = fetcher
      .fetch_with_retry(
        || {
          attempts.fetch_add(1, Ordering::SeqCst);
          async { Ok::<_, String>(FakeResponse(404)) }
        },
        None,
      )
      .await
      .unwrap();

    assert_eq!(response.status_code(), 404);
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_persistent_transport_errors_raise_network_error() {
    let fetcher = RetryingFetcher::default();

    let result = fetcher
      .fetch_with_retry(
        || async { Err::<FakeResponse, _>("connection reset") },
        Some(&fast(1)),
      )
      .await;

    match result {
      Err(StoreError::Network { attempts, message }) => {
        assert_eq!(attempts, 2);
        assert_eq!(message, "connection reset");
      }
      _ => panic!("expected network error"),
    }
  }

  #[tokio::test]
  async fn test_recovers_after_transient_failure() {
    let attempts = AtomicU32::new(0);
    let fetcher = RetryingFetcher::default();

    let response = fetcher
      .fetch_with_retry(
        || {
          let n = attempts.fetch_add(1, Ordering::SeqCst);
          async move {
            match n {
              0 => Err("timeout".to_string()),
              1 => Ok(FakeResponse(502)),
              _ => Ok(FakeResponse(200)),
            }
          }
        },
        Some(&fast(3)),
      )
      .await
      .unwrap();

    assert_eq!(response.status_code(), 200);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
  }
}
