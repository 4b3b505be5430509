//! Progress reporting and cooperative cancellation.
//!
//! Engines call [`Progress::report`] between inference calls, never during
//! one. A run stops with [`WordtimeError::Cancelled`] when the callback
//! returns [`ControlFlow::Break`] or when the shared [`CancelFlag`] is raised.

use std::ops::ControlFlow;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::error::{Result, WordtimeError};

/// Callback of shape `(resolved_amount, total_amount)`.
pub type ProgressFn<'a> = dyn FnMut(f64, f64) -> ControlFlow<()> + 'a;

/// Shared flag another thread can raise to stop a running engine.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Progress sink handed to the engines.
#[derive(Default)]
pub struct Progress<'a> {
    callback: Option<&'a mut ProgressFn<'a>>,
    cancel: Option<CancelFlag>,
}

impl<'a> Progress<'a> {
    /// No callback, no cancellation.
    pub fn silent() -> Self {
        Self::default()
    }

    pub fn with_callback(callback: &'a mut ProgressFn<'a>) -> Self {
        Self {
            callback: Some(callback),
            cancel: None,
        }
    }

    pub fn cancel_on(mut self, flag: CancelFlag) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Report progress; errors with `Cancelled` if the caller asked to stop.
    pub fn report(&mut self, resolved: f64, total: f64) -> Result<()> {
        if let Some(callback) = self.callback.as_mut() {
            if callback(resolved.min(total), total).is_break() {
                return Err(WordtimeError::Cancelled);
            }
        }
        self.check_cancelled()
    }

    pub fn check_cancelled(&self) -> Result<()> {
        match &self.cancel {
            Some(flag) if flag.is_cancelled() => Err(WordtimeError::Cancelled),
            _ => Ok(()),
        }
    }
}

impl std::fmt::Debug for Progress<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Progress")
            .field("has_callback", &self.callback.is_some())
            .field("cancel", &self.cancel)
            .finish()
    }
}
