//! Type registry: maps message types to wire slugs.
//!
//! Every message type a bus endpoint sends or receives is registered once,
//! before the bus starts, either under an explicit slug or under a slug
//! derived from its fully-qualified Rust type name. Peers built from the
//! same code derive identical slugs; mixed builds should pass explicit ones.
//!
//! # Example
//!
//! ```
//! use wirebus::TypeRegistry;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Ping(u32);
//! #[derive(Serialize, Deserialize)]
//! struct Pong(u32);
//!
//! let mut registry = TypeRegistry::new();
//! registry.register::<Ping>().unwrap();
//! registry.register_as::<Pong>("demo.pong").unwrap();
//!
//! assert_eq!(registry.slug_of::<Pong>().unwrap(), "demo.pong");
//! assert!(registry.contains_slug(registry.slug_of::<Ping>().unwrap()));
//! ```

use std::any::{type_name, TypeId};
use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{BusError, Result};

/// Slugs with this prefix are reserved for bus-internal envelopes.
pub const RESERVED_SLUG_PREFIX: char = '$';

/// A type that can travel on the bus.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Message for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

#[derive(Debug, Clone)]
struct TypeEntry {
    type_id: TypeId,
    type_name: &'static str,
}

/// Explicit, per-bus registry of message types.
#[derive(Debug, Default, Clone)]
pub struct TypeRegistry {
    by_type: HashMap<TypeId, String>,
    by_slug: HashMap<String, TypeEntry>,
}

impl TypeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Slug derived from a type's fully-qualified name.
    pub fn derive_slug<T: ?Sized + 'static>() -> String {
        type_name::<T>().to_string()
    }

    /// Register `T` under its derived slug.
    pub fn register<T: Message>(&mut self) -> Result<&mut Self> {
        self.register_as::<T>(&Self::derive_slug::<T>())
    }

    /// Register `T` under an explicit slug.
    ///
    /// Registering the same type under the same slug again is a no-op.
    /// A slug claimed by another type, or a second slug for the same type,
    /// is a [`BusError::SlugCollision`].
    pub fn register_as<T: Message>(&mut self, slug: &str) -> Result<&mut Self> {
        if slug.is_empty() || slug.starts_with(RESERVED_SLUG_PREFIX) {
            return Err(BusError::Config(format!(
                "invalid slug {:?} for {}",
                slug,
                type_name::<T>()
            )));
        }

        let type_id = TypeId::of::<T>();

        if let Some(existing) = self.by_slug.get(slug) {
            if existing.type_id == type_id {
                return Ok(self);
            }
            return Err(BusError::SlugCollision {
                slug: slug.to_string(),
                existing: existing.type_name.to_string(),
            });
        }
        if let Some(previous) = self.by_type.get(&type_id) {
            return Err(BusError::SlugCollision {
                slug: previous.clone(),
                existing: type_name::<T>().to_string(),
            });
        }

        self.by_type.insert(type_id, slug.to_string());
        self.by_slug.insert(
            slug.to_string(),
            TypeEntry {
                type_id,
                type_name: type_name::<T>(),
            },
        );
        Ok(self)
    }

    /// Slug registered for `T`.
    pub fn slug_of<T: 'static>(&self) -> Result<&str> {
        self.by_type
            .get(&TypeId::of::<T>())
            .map(String::as_str)
            .ok_or_else(|| BusError::UnknownType(type_name::<T>().to_string()))
    }

    /// Whether some type is registered under `slug`.
    pub fn contains_slug(&self, slug: &str) -> bool {
        self.by_slug.contains_key(slug)
    }

    /// Rust type name registered under `slug`.
    pub fn type_name_of(&self, slug: &str) -> Result<&'static str> {
        self.by_slug
            .get(slug)
            .map(|e| e.type_name)
            .ok_or_else(|| BusError::UnknownType(slug.to_string()))
    }

    /// Whether `slug` is the slug of `T`.
    pub fn is_slug_of<T: 'static>(&self, slug: &str) -> bool {
        self.by_slug
            .get(slug)
            .is_some_and(|e| e.type_id == TypeId::of::<T>())
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.by_slug.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.by_slug.is_empty()
    }

    /// Iterate over registered slugs.
    pub fn slugs(&self) -> impl Iterator<Item = &str> {
        self.by_slug.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize)]
    struct Ping;
    #[derive(Serialize, Deserialize)]
    struct Pong;

    #[test]
    fn test_derived_slug_is_qualified_type_name() {
        let mut registry = TypeRegistry::new();
        registry.register::<Ping>().unwrap();

        let slug = registry.slug_of::<Ping>().unwrap();
        assert!(slug.ends_with("registry::tests::Ping"));
        assert_eq!(registry.type_name_of(slug).unwrap(), type_name::<Ping>());
    }

    #[test]
    fn test_reregistering_same_pair_is_noop() {
        let mut registry = TypeRegistry::new();
        registry.register_as::<Ping>("ping").unwrap();
        registry.register_as::<Ping>("ping").unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_slug_collision_between_types() {
        let mut registry = TypeRegistry::new();
        registry.register_as::<Ping>("shared").unwrap();

        let err = registry.register_as::<Pong>("shared").unwrap_err();
        assert!(matches!(err, BusError::SlugCollision { .. }));
    }

    #[test]
    fn test_second_slug_for_same_type_rejected() {
        let mut registry = TypeRegistry::new();
        registry.register_as::<Ping>("a").unwrap();
        assert!(registry.register_as::<Ping>("b").is_err());
    }

    #[test]
    fn test_reserved_and_empty_slugs_rejected() {
        let mut registry = TypeRegistry::new();
        assert!(matches!(
            registry.register_as::<Ping>("$error"),
            Err(BusError::Config(_))
        ));
        assert!(registry.register_as::<Ping>("").is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unknown_type_lookup() {
        let registry = TypeRegistry::new();
        assert!(matches!(
            registry.slug_of::<Ping>(),
            Err(BusError::UnknownType(_))
        ));
        assert!(registry.type_name_of("nope").is_err());
    }

    #[test]
    fn test_is_slug_of() {
        let mut registry = TypeRegistry::new();
        registry.register_as::<Ping>("ping").unwrap();
        registry.register_as::<Pong>("pong").unwrap();

        assert!(registry.is_slug_of::<Ping>("ping"));
        assert!(!registry.is_slug_of::<Ping>("pong"));
        assert_eq!(registry.slugs().count(), 2);
    }
}
