//! The error type returned by reconciliation actions.
//!
//! Every action either succeeds, asks the pipeline to stop without a retry, or
//! fails with an error the controller should retry with backoff. The two failure
//! kinds are modelled as variants of [`ActionError`] so that callers dispatch on
//! them with an exhaustive `match`.

use std::{error::Error, fmt::Write};

use snafu::Snafu;

pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

#[derive(Debug, Snafu)]
pub enum ActionError {
    /// Ends the pipeline for this run without requeueing the request.
    ///
    /// Used for structural problems such as a missing dependency operator or an
    /// invalid configuration, which only a later watch event can resolve.
    #[snafu(display("reconciliation stopped"))]
    Stop { source: BoxError },

    /// Ends the pipeline for this run and requeues the request with backoff.
    #[snafu(display("reconciliation action failed"))]
    Retryable { source: BoxError },
}

impl ActionError {
    pub fn stop(cause: impl Into<BoxError>) -> Self {
        Self::Stop {
            source: cause.into(),
        }
    }

    pub fn retryable(cause: impl Into<BoxError>) -> Self {
        Self::Retryable {
            source: cause.into(),
        }
    }

    pub fn is_stop(&self) -> bool {
        matches!(self, Self::Stop { .. })
    }

    /// The error which caused the action to fail.
    pub fn cause(&self) -> &(dyn Error + Send + Sync + 'static) {
        match self {
            Self::Stop { source } | Self::Retryable { source } => source.as_ref(),
        }
    }

    /// The full message of [`Self::cause`], including its sources.
    pub fn cause_message(&self) -> String {
        full_message(self.cause())
    }
}

/// Converts fallible results into [`ActionError`]s.
pub trait ActionResultExt<T> {
    /// Turns the error into a [`ActionError::Stop`].
    fn or_stop(self) -> Result<T, ActionError>;

    /// Turns the error into a [`ActionError::Retryable`].
    fn or_retry(self) -> Result<T, ActionError>;
}

impl<T, E> ActionResultExt<T> for Result<T, E>
where
    E: Into<BoxError>,
{
    fn or_stop(self) -> Result<T, ActionError> {
        self.map_err(ActionError::stop)
    }

    fn or_retry(self) -> Result<T, ActionError> {
        self.map_err(ActionError::retryable)
    }
}

/// Joins the error and all of its sources with `": "`.
pub fn full_message(err: &(dyn Error + 'static)) -> String {
    let mut buf = err.to_string();
    let mut current = err.source();
    while let Some(source) = current {
        // Writing into a String can't fail
        let _ = write!(buf, ": {source}");
        current = source.source();
    }
    buf
}

/// Several independent errors collected into one, reported in the order they occurred.
#[derive(Debug)]
pub struct MultiError {
    errors: Vec<BoxError>,
}

impl MultiError {
    /// Returns `Ok(())` if `errors` is empty, otherwise all of them combined.
    pub fn from_errors(errors: Vec<BoxError>) -> Result<(), Self> {
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Self { errors })
        }
    }

    pub fn errors(&self) -> &[BoxError] {
        &self.errors
    }
}

impl std::fmt::Display for MultiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let [only] = self.errors.as_slice() {
            return f.write_str(&full_message(only.as_ref()));
        }

        write!(f, "{} errors occurred:", self.errors.len())?;
        for err in &self.errors {
            write!(f, "\n\t* {}", full_message(err.as_ref()))?;
        }
        Ok(())
    }
}

impl Error for MultiError {}
