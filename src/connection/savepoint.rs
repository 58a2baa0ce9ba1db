use crate::error::{Error, Result};

/// A named position in the transaction buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Savepoint {
    pub name: String,
    /// Length of the transaction buffer when the savepoint was created.
    pub position: usize,
}

/// Tracks the live savepoints of a transaction, in creation order.
#[derive(Debug, Default)]
pub struct SavepointManager {
    savepoints: Vec<Savepoint>,
}

impl SavepointManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a savepoint at the given buffer position. Names must be unique among live
    /// savepoints.
    pub fn set(&mut self, name: &str, position: usize) -> Result<()> {
        if name.is_empty() {
            return Err(Error::Value("Savepoint name can't be empty".into()));
        }
        if self.savepoints.iter().any(|s| s.name == name) {
            return Err(Error::DuplicateSavepoint(name.to_owned()));
        }
        self.savepoints.push(Savepoint { name: name.to_owned(), position });
        Ok(())
    }

    /// Invalidates all savepoints created after the named one, which stays live, and returns
    /// its buffer position.
    pub fn rollback_to(&mut self, name: &str) -> Result<usize> {
        let index = self.index(name)?;
        self.savepoints.truncate(index + 1);
        Ok(self.savepoints[index].position)
    }

    /// Removes the named savepoint, leaving the others alone.
    pub fn release(&mut self, name: &str) -> Result<()> {
        let index = self.index(name)?;
        self.savepoints.remove(index);
        Ok(())
    }

    pub fn names(&self) -> Vec<String> {
        self.savepoints.iter().map(|s| s.name.clone()).collect()
    }

    fn index(&self, name: &str) -> Result<usize> {
        self.savepoints
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| Error::Value(format!("Savepoint {} does not exist", name)))
    }
}
