// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Embera contributors

//! The resource-loader collaborator boundary.
//!
//! This crate does not implement URL schemes, archive formats, or any
//! concrete resource backend — that is explicitly out of scope. What it
//! does own is the seam: a trait an embedder implements to hand compiled
//! or source bytes back to the VM on demand (e.g. for a `require`-style
//! standard function built on top of this crate).

use crate::error::RuntimeError;

/// A resource identified by an embedder-defined name (a module path, a
/// URL, a file name — the VM itself assigns no meaning to the string).
pub trait ResourceLoader {
    /// Fetch the raw bytes behind `name`, or a `LookupMiss` if it isn't
    /// known to this loader.
    fn load(&self, name: &str) -> Result<Vec<u8>, RuntimeError>;

    /// Whether `name` resolves without actually fetching its bytes.
    /// Default implementation just calls [`Self::load`] and discards the
    /// result; override it when checking existence is cheaper than
    /// loading.
    fn exists(&self, name: &str) -> bool {
        self.load(name).is_ok()
    }
}

/// A loader with nothing registered; every lookup misses. Useful as the
/// default when an embedding has no `require`-like facility.
pub struct NullResourceLoader;

impl ResourceLoader for NullResourceLoader {
    fn load(&self, _name: &str) -> Result<Vec<u8>, RuntimeError> {
        Err(RuntimeError::LookupMiss)
    }

    fn exists(&self, _name: &str) -> bool {
        false
    }
}

#[cfg(test)]
mod resource_test {
    use super::*;

    #[test]
    fn null_loader_misses_everything() {
        let loader = NullResourceLoader;
        assert!(loader.load("anything").is_err());
        assert!(!loader.exists("anything"));
    }
}
