use std::fmt;

use crate::DEFAULT_PORT_RANGE;

/// An integer endpoint identifier, conceptually a local TCP port.
pub type EndpointId = u16;

/// The transport a named port of a node is bound to.
///
/// Every ingress and egress name on a node starts out bound to
/// exactly one of these. The planner rewrites `Stdin`/`Stdout`
/// bindings (and aliased `Port` bindings) to freshly allocated
/// `Port` entries before wiring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointKind {
    /// The node's standard input.
    Stdin,
    /// The node's standard output.
    Stdout,
    /// A numeric endpoint on the local host.
    Port(EndpointId),
}

impl EndpointKind {
    /// The endpoint id, if this is a `Port` binding.
    pub fn port(&self) -> Option<EndpointId> {
        match self {
            Self::Port(p) => Some(*p),
            _ => None,
        }
    }
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdin => write!(f, "stdin"),
            Self::Stdout => write!(f, "stdout"),
            Self::Port(p) => write!(f, "{}", p),
        }
    }
}

/// The pool of endpoints available to the planner.
///
/// Acquire-only: each call to [`PortPool::acquire`] returns an id
/// that has never been returned before, and ids are never released.
/// The pool's lifetime is the pipeline's lifetime.
pub struct PortPool {
    next: EndpointId,
    end: EndpointId,
}

impl Default for PortPool {
    fn default() -> Self {
        Self::new(DEFAULT_PORT_RANGE.0, DEFAULT_PORT_RANGE.1)
    }
}

impl PortPool {
    /// Create a pool over the half-open range `[start, end)`.
    pub fn new(start: EndpointId, end: EndpointId) -> Self {
        Self { next: start, end }
    }

    /// Acquire a fresh endpoint.
    pub fn acquire(&mut self) -> Result<EndpointId, PoolExhausted> {
        if self.next >= self.end {
            return Err(PoolExhausted { end: self.end });
        }
        let id = self.next;
        self.next += 1;
        Ok(id)
    }

    /// How many endpoints remain.
    pub fn remaining(&self) -> usize {
        (self.end - self.next) as usize
    }
}

/// The endpoint pool was drained.
#[derive(Debug, Clone, thiserror::Error)]
#[error("endpoint pool exhausted (upper bound {end})")]
pub struct PoolExhausted {
    pub end: EndpointId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ahash::AHashSet;

    #[test]
    fn acquire_is_unique_until_exhausted() {
        let mut pool = PortPool::new(9100, 9110);
        let mut seen = AHashSet::new();

        for _ in 0..10 {
            assert!(seen.insert(pool.acquire().unwrap()));
        }
        assert!(pool.acquire().is_err());
        assert_eq!(pool.remaining(), 0);
    }

    #[test]
    fn default_range_matches_config() {
        let mut pool = PortPool::default();
        assert_eq!(pool.acquire().unwrap(), DEFAULT_PORT_RANGE.0);
        assert_eq!(pool.remaining() as u16, DEFAULT_PORT_RANGE.1 - DEFAULT_PORT_RANGE.0 - 1);
    }
}
