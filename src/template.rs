use std::fmt;
use std::sync::Arc;

/// A deferred value could not be produced from the trigger arguments.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ResolutionError {
    message: String,
}

impl ResolutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Prefix the message with the name of the field being resolved.
    pub fn in_field(self, field: &str) -> Self {
        Self {
            message: format!("{field}: {}", self.message),
        }
    }
}

type Resolver<A> = Arc<dyn Fn(&A) -> Result<String, ResolutionError> + Send + Sync>;

/// A string that is either fixed at configuration time or computed from the
/// trigger arguments `A` when the action is dispatched.
pub enum Templatable<A> {
    Static(String),
    Lambda(Resolver<A>),
}

impl<A> Templatable<A> {
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&A) -> Result<String, ResolutionError> + Send + Sync + 'static,
    {
        Templatable::Lambda(Arc::new(f))
    }

    pub fn resolve(&self, args: &A) -> Result<String, ResolutionError> {
        match self {
            Templatable::Static(value) => Ok(value.clone()),
            Templatable::Lambda(f) => f(args),
        }
    }

    pub fn is_static(&self) -> bool {
        matches!(self, Templatable::Static(_))
    }
}

impl<A> Clone for Templatable<A> {
    fn clone(&self) -> Self {
        match self {
            Templatable::Static(value) => Templatable::Static(value.clone()),
            Templatable::Lambda(f) => Templatable::Lambda(Arc::clone(f)),
        }
    }
}

impl<A> fmt::Debug for Templatable<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Templatable::Static(value) => f.debug_tuple("Static").field(value).finish(),
            Templatable::Lambda(_) => f.write_str("Lambda(..)"),
        }
    }
}

impl<A> From<&str> for Templatable<A> {
    fn from(value: &str) -> Self {
        Templatable::Static(value.to_string())
    }
}

impl<A> From<String> for Templatable<A> {
    fn from(value: String) -> Self {
        Templatable::Static(value)
    }
}
