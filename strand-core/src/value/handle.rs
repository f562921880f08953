use std::fmt;
use std::sync::Arc;
use strand_types::ValueId;

struct HandleInner {
    id: ValueId,
    name: String,
}

/// Opaque host resource (file, socket, database connection).
///
/// Handles are mutable values that can neither be shared across threads,
/// cloned, nor serialized.
#[derive(Clone)]
pub struct HostHandle {
    inner: Arc<HandleInner>,
}

impl HostHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id: ValueId::next(),
                name: name.into(),
            }),
        }
    }

    pub fn id(&self) -> ValueId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }
}

impl fmt::Display for HostHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "host handle '{}'", self.inner.name)
    }
}

impl fmt::Debug for HostHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostHandle({}, {:?})", self.inner.id, self.inner.name)
    }
}
