// Copyright 2026 larder Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    backtrace::Backtrace,
    fmt::{Debug, Display},
    sync::Arc,
};

/// ErrorKind is all kinds of Error of larder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A configuration value is out of its legal range.
    InvalidArgument,
    /// A configuration option was set twice or conflicts with another option.
    IllegalState,
    /// The loader returned an error.
    Load,
    /// The loader finished without producing a value.
    NullValue,
    /// The loader tried to load the key it is currently loading.
    RecursiveLoad,
    /// The loading task went away before producing a result.
    TaskCancelled,
    /// Join error.
    Join,
}

impl ErrorKind {
    /// Convert self into static str.
    pub fn into_static(self) -> &'static str {
        self.into()
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.into_static())
    }
}

impl From<ErrorKind> for &'static str {
    fn from(v: ErrorKind) -> &'static str {
        match v {
            ErrorKind::InvalidArgument => "Invalid argument",
            ErrorKind::IllegalState => "Illegal state",
            ErrorKind::Load => "Load error",
            ErrorKind::NullValue => "Null value",
            ErrorKind::RecursiveLoad => "Recursive load",
            ErrorKind::TaskCancelled => "Task cancelled",
            ErrorKind::Join => "Join error",
        }
    }
}

/// Error is the error struct returned by all larder functions.
///
/// ## Display
///
/// - Via `Display`, the error is printed in a single line:
///
/// ```shell
/// Load error, context: { hash: 42 } => loader failed, source: connection refused
/// ```
///
/// - Via `Debug`, the error is printed in multiple lines with the context, the source and the backtrace (if
///   captured).
///
/// - Via `{:#?}`, the conventional struct-style representation is used.
///
/// Errors are cheap to clone, so a single load failure can be handed to every caller waiting on the same key.
pub struct Error {
    kind: ErrorKind,
    message: String,

    context: Vec<(&'static str, String)>,

    source: Option<Arc<anyhow::Error>>,
    backtrace: Option<Arc<Backtrace>>,
}

impl Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if f.alternate() {
            let mut de = f.debug_struct("Error");
            de.field("kind", &self.kind);
            de.field("message", &self.message);
            de.field("context", &self.context);
            de.field("source", &self.source);
            de.field("backtrace", &self.backtrace);
            return de.finish();
        }

        write!(f, "{}", self.kind)?;
        if !self.message.is_empty() {
            write!(f, " => {}", self.message)?;
        }
        writeln!(f)?;

        if !self.context.is_empty() {
            writeln!(f)?;
            writeln!(f, "Context:")?;
            for (k, v) in self.context.iter() {
                writeln!(f, "  {}: {}", k, v)?;
            }
        }

        if let Some(source) = &self.source {
            writeln!(f)?;
            writeln!(f, "Source:")?;
            writeln!(f, "  {source:#}")?;
        }

        if let Some(backtrace) = &self.backtrace {
            writeln!(f)?;
            writeln!(f, "Backtrace:")?;
            writeln!(f, "{backtrace}")?;
        }

        Ok(())
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind)?;

        if !self.context.is_empty() {
            write!(f, ", context: {{ ")?;
            let mut iter = self.context.iter().peekable();
            while let Some((k, v)) = iter.next() {
                write!(f, "{}: {}", k, v)?;
                if iter.peek().is_some() {
                    write!(f, ", ")?;
                }
            }
            write!(f, " }}")?;
        }

        if !self.message.is_empty() {
            write!(f, " => {}", self.message)?;
        }

        if let Some(source) = &self.source {
            write!(f, ", source: {source}")?;
        }

        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|v| v.as_ref().as_ref())
    }
}

impl Clone for Error {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            message: self.message.clone(),
            context: self.context.clone(),
            source: self.source.clone(),
            backtrace: self.backtrace.clone(),
        }
    }
}

impl Error {
    /// Create a new error.
    ///
    /// If the error needs to carry a source error, please use `with_source` method.
    ///
    /// ```rust
    /// # use larder_common::error::{Error, ErrorKind};
    /// let cause = std::io::Error::other("backend unavailable");
    /// Error::new(ErrorKind::Load, "loader failed").with_source(cause);
    /// ```
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: Vec::new(),
            source: None,
            backtrace: Some(Arc::new(Backtrace::capture())),
        }
    }

    /// Add more context in error.
    pub fn with_context(mut self, key: &'static str, value: impl ToString) -> Self {
        self.context.push((key, value.to_string()));
        self
    }

    /// Set source for error.
    ///
    /// # Notes
    ///
    /// If the source has been set, we will raise a panic here.
    pub fn with_source(mut self, source: impl Into<anyhow::Error>) -> Self {
        debug_assert!(self.source.is_none(), "the source error has been set");
        self.source = Some(Arc::new(source.into()));
        self
    }

    /// Get the error kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Get the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Get the error context.
    pub fn context(&self) -> &Vec<(&'static str, String)> {
        &self.context
    }

    /// Get the error backtrace.
    pub fn backtrace(&self) -> Option<&Backtrace> {
        self.backtrace.as_deref()
    }

    /// Get the error source.
    pub fn source(&self) -> Option<&anyhow::Error> {
        self.source.as_deref()
    }

    /// Downcast the reference of the source error to a specific error type reference.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source.as_deref().and_then(|e| e.downcast_ref::<E>())
    }

    /// Returns `true` if the error was produced while loading a value rather than while configuring a cache.
    pub fn is_load_failure(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Load | ErrorKind::NullValue | ErrorKind::RecursiveLoad | ErrorKind::TaskCancelled
        )
    }
}

/// Result type for larder.
pub type Result<T> = std::result::Result<T, Error>;

/// Helper methods for Error.
impl Error {
    /// Helper for creating an [`ErrorKind::InvalidArgument`] error for a configuration option.
    pub fn invalid_argument(option: &'static str, message: impl Into<String>) -> Self {
        Error::new(ErrorKind::InvalidArgument, message).with_context("option", option)
    }

    /// Helper for creating an [`ErrorKind::IllegalState`] error for a configuration option.
    pub fn illegal_state(option: &'static str, message: impl Into<String>) -> Self {
        Error::new(ErrorKind::IllegalState, message).with_context("option", option)
    }

    /// Helper for creating an [`ErrorKind::IllegalState`] error for an option that has been set before.
    pub fn already_set(option: &'static str) -> Self {
        Self::illegal_state(option, "option was already set")
    }

    /// Helper for wrapping an error returned by a loader.
    pub fn load(source: impl Into<anyhow::Error>) -> Self {
        Error::new(ErrorKind::Load, "loader failed").with_source(source)
    }

    /// Helper for creating an [`ErrorKind::NullValue`] error.
    pub fn null_value() -> Self {
        Error::new(ErrorKind::NullValue, "loader returned no value")
    }

    /// Helper for creating an [`ErrorKind::RecursiveLoad`] error.
    pub fn recursive_load(hash: u64) -> Self {
        Error::new(ErrorKind::RecursiveLoad, "recursive load of the same key").with_context("hash", hash)
    }

    /// Helper for creating an [`ErrorKind::TaskCancelled`] error.
    pub fn load_cancelled(hash: u64) -> Self {
        Error::new(ErrorKind::TaskCancelled, "loading task ended without a result").with_context("hash", hash)
    }
}
