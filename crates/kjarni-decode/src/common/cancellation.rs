//! Cooperative cancellation of a generation call.
//!
//! The controller polls the token before every step; a step that has started
//! always runs to completion.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::error::{GenerationError, Result};

#[derive(Debug, Default)]
struct Flag(AtomicBool);

impl Flag {
    fn raised(value: bool) -> Arc<Self> {
        Arc::new(Flag(AtomicBool::new(value)))
    }

    fn get(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Checked by the generation loop between steps. The default token is never cancelled.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<Flag>,
}

impl CancellationToken {
    /// Creates a linked token/handle pair.
    ///
    /// ```ignore
    /// let (token, handle) = CancellationToken::new();
    /// let options = GenerateOptions::default().with_cancellation(token);
    /// // from another thread or task:
    /// handle.cancel();
    /// ```
    pub fn new() -> (Self, CancellationHandle) {
        let token = Self::default();
        let handle = token.handle();
        (token, handle)
    }

    pub fn never() -> Self {
        Self::default()
    }

    pub fn already_cancelled() -> Self {
        CancellationToken {
            flag: Flag::raised(true),
        }
    }

    /// Another handle that cancels this token.
    pub fn handle(&self) -> CancellationHandle {
        CancellationHandle {
            flag: Arc::clone(&self.flag),
        }
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.flag.get()
    }

    /// `CancellationRequested` carrying the number of completed steps.
    #[inline]
    pub fn check(&self, steps: usize) -> Result<()> {
        if self.is_cancelled() {
            Err(GenerationError::CancellationRequested { steps })
        } else {
            Ok(())
        }
    }
}

/// Triggers cancellation of every linked token.
#[derive(Debug, Clone)]
pub struct CancellationHandle {
    flag: Arc<Flag>,
}

impl CancellationHandle {
    pub fn cancel(&self) {
        self.flag.raise();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.get()
    }

    /// Cancels once `timeout` has elapsed. Must be called inside a tokio runtime.
    pub fn cancel_after(self, timeout: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            self.cancel();
        })
    }
}
