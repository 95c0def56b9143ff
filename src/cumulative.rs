//! Cumulative block digest.
//!
//! A 16-byte digest folded one block at a time: the first block's MD5
//! becomes the state, and every later block's MD5 is added into it with
//! byte-wise wrapping addition. The fold is commutative, so the result does
//! not depend on the order blocks arrive in, and the state is exactly the
//! 16 bytes returned by [`Cumulative::marshal`], which can be stored
//! between writes and restored across process restarts.

use thiserror::Error;

/// Digest size in bytes.
pub const SIZE: usize = 16;

/// Error returned by [`Cumulative::unmarshal`] when the serialized state
/// has the wrong length.
#[derive(Debug, Error)]
#[error("invalid hash state size: {0}")]
pub struct InvalidStateError(pub usize);

/// Running cumulative digest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cumulative {
    state: Option<[u8; SIZE]>,
}

impl Cumulative {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop any accumulated state.
    pub fn reset(&mut self) {
        self.state = None;
    }

    /// Fold one block into the digest.
    pub fn write(&mut self, data: &[u8]) {
        let digest = md5::compute(data);
        match self.state.as_mut() {
            None => self.state = Some(digest.0),
            Some(state) => {
                for (s, d) in state.iter_mut().zip(digest.0.iter()) {
                    *s = s.wrapping_add(*d);
                }
            }
        }
    }

    /// Append the current state to `prefix` and return the result. Before
    /// the first write the state is empty and `prefix` comes back as is.
    pub fn sum(&self, prefix: &[u8]) -> Vec<u8> {
        let mut out = prefix.to_vec();
        if let Some(state) = &self.state {
            out.extend_from_slice(state);
        }
        out
    }

    /// Serialized continuation state: the raw 16 bytes, or empty before
    /// the first write.
    pub fn marshal(&self) -> Vec<u8> {
        self.state.map(|s| s.to_vec()).unwrap_or_default()
    }

    /// Restore a state produced by [`Cumulative::marshal`]. An empty slice
    /// resets the digest.
    pub fn unmarshal(&mut self, state: &[u8]) -> Result<(), InvalidStateError> {
        if state.is_empty() {
            self.state = None;
            return Ok(());
        }

        let state: [u8; SIZE] = state
            .try_into()
            .map_err(|_| InvalidStateError(state.len()))?;
        self.state = Some(state);
        Ok(())
    }
}
