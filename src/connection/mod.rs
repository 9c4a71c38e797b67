pub mod config;
pub mod dsn;

use crate::core::Result;
use crate::driver::Pool;
use std::fmt;
use std::sync::Arc;

/// Role of a physical connection within its cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Replica,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Replica => write!(f, "replica"),
        }
    }
}

/// Physical connection handle
///
/// One opened pool against one endpoint. Index 0 of a cluster is the
/// primary; every other index is a replica.
#[derive(Clone)]
pub struct PhysicalConnection {
    index: usize,
    pool: Arc<dyn Pool>,
}

impl PhysicalConnection {
    pub(crate) fn new(index: usize, pool: Arc<dyn Pool>) -> Self {
        Self { index, pool }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_primary(&self) -> bool {
        self.index == 0
    }

    pub fn role(&self) -> Role {
        if self.is_primary() {
            Role::Primary
        } else {
            Role::Replica
        }
    }

    pub fn endpoint(&self) -> &str {
        self.pool.endpoint()
    }

    pub fn pool(&self) -> &Arc<dyn Pool> {
        &self.pool
    }

    pub async fn ping(&self) -> Result<()> {
        self.pool.ping().await
    }

    pub async fn close(&self) -> Result<()> {
        self.pool.close().await
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}

impl fmt::Debug for PhysicalConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalConnection")
            .field("index", &self.index)
            .field("role", &self.role())
            .field("endpoint", &self.endpoint())
            .field("closed", &self.is_closed())
            .finish()
    }
}
