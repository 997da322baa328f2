//! Block schema registry.
//!
//! Every block carries a `flavour` string identifying its type. The
//! [`Schema`] maps each registered flavour to a [`BlockSchema`] describing
//! its structural rules: the role it plays in the tree, which parents may
//! contain it, and hooks used by snapshot sanitization. Flavours are
//! resolved once at registration; mutation paths never dispatch on raw
//! strings beyond the single registry lookup.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::error::{FolioError, Result};
use crate::store::PropValue;

/// Structural role of a block within a page tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRole {
    /// The single top-level block of a page. Never has a parent.
    Root,
    /// Any block below the root. Always has a parent.
    Content,
}

/// Validation rules and serialization hooks for one flavour.
#[derive(Debug, Clone)]
pub struct BlockSchema {
    /// Flavour tag, e.g. `"folio:paragraph"`.
    pub flavour: String,

    /// Role the flavour plays in the tree.
    pub role: BlockRole,

    /// Flavours allowed as parent. `None` means any flavour whose role
    /// permits children.
    pub parent_flavours: Option<Vec<String>>,

    /// Whether blocks of this flavour carry a rich-text `text` property.
    /// When set, `add_block` creates the Y.Text even if the caller passed
    /// no text.
    pub has_text: bool,

    /// Property holding a blob key or remote URL for embedded media.
    /// Snapshot import uses this to re-store remote sources through the
    /// blob manager.
    pub embed_source_prop: Option<String>,

    /// Default property values merged under caller-provided props.
    pub defaults: IndexMap<String, PropValue>,
}

impl BlockSchema {
    /// Create a schema with no constraints beyond the role.
    pub fn new(flavour: impl Into<String>, role: BlockRole) -> Self {
        Self {
            flavour: flavour.into(),
            role,
            parent_flavours: None,
            has_text: false,
            embed_source_prop: None,
            defaults: IndexMap::new(),
        }
    }

    /// Restrict which flavours may contain this one.
    pub fn with_parents(mut self, parents: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.parent_flavours = Some(parents.into_iter().map(Into::into).collect());
        self
    }

    /// Mark the flavour as carrying rich text.
    pub fn with_text(mut self) -> Self {
        self.has_text = true;
        self
    }

    /// Name the property holding an embedded media source.
    pub fn with_embed_source(mut self, prop: impl Into<String>) -> Self {
        self.embed_source_prop = Some(prop.into());
        self
    }

    /// Add a default property value.
    pub fn with_default(mut self, key: impl Into<String>, value: PropValue) -> Self {
        self.defaults.insert(key.into(), value);
        self
    }
}

/// Registry of block flavours for a workspace.
///
/// Pure lookup table; registration happens at startup and the registry is
/// shared read-only between pages.
#[derive(Debug, Default)]
pub struct Schema {
    flavours: HashMap<String, Arc<BlockSchema>>,
}

impl Schema {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a flavour. Re-registering a flavour replaces the previous
    /// entry.
    pub fn register(&mut self, schema: BlockSchema) -> &mut Self {
        self.flavours.insert(schema.flavour.clone(), Arc::new(schema));
        self
    }

    /// Look up a flavour.
    pub fn get(&self, flavour: &str) -> Option<Arc<BlockSchema>> {
        self.flavours.get(flavour).cloned()
    }

    /// All registered flavours.
    pub fn flavours(&self) -> Vec<String> {
        self.flavours.keys().cloned().collect()
    }

    /// The registered flavour whose role is [`BlockRole::Root`], if any.
    pub fn root_flavour(&self) -> Option<Arc<BlockSchema>> {
        self.flavours
            .values()
            .find(|s| s.role == BlockRole::Root)
            .cloned()
    }

    /// Validate placing a block of `flavour` under a parent of
    /// `parent_flavour` (`None` means top level).
    pub fn validate_placement(
        &self,
        flavour: &str,
        parent_flavour: Option<&str>,
    ) -> Result<Arc<BlockSchema>> {
        let schema = self.get(flavour).ok_or_else(|| {
            FolioError::SchemaViolation(format!("unknown flavour '{flavour}'"))
        })?;

        match (schema.role, parent_flavour) {
            (BlockRole::Root, Some(parent)) => {
                return Err(FolioError::SchemaViolation(format!(
                    "root flavour '{flavour}' cannot be placed under '{parent}'"
                )));
            }
            (BlockRole::Content, None) => {
                return Err(FolioError::SchemaViolation(format!(
                    "content flavour '{flavour}' requires a parent block"
                )));
            }
            _ => {}
        }

        if let (Some(allowed), Some(parent)) = (&schema.parent_flavours, parent_flavour)
            && !allowed.iter().any(|p| p == parent)
        {
            return Err(FolioError::SchemaViolation(format!(
                "flavour '{flavour}' cannot be placed under '{parent}'"
            )));
        }

        Ok(schema)
    }
}

/// A ready-made registry covering the generic document flavours used in
/// examples and tests: a `folio:page` root, `folio:note` containers,
/// `folio:paragraph` text blocks and `folio:image` embeds.
pub fn default_schema() -> Schema {
    let mut schema = Schema::new();
    schema
        .register(BlockSchema::new("folio:page", BlockRole::Root).with_text())
        .register(
            BlockSchema::new("folio:note", BlockRole::Content).with_parents(["folio:page"]),
        )
        .register(
            BlockSchema::new("folio:paragraph", BlockRole::Content)
                .with_text()
                .with_parents(["folio:note", "folio:page", "folio:paragraph"]),
        )
        .register(
            BlockSchema::new("folio:image", BlockRole::Content)
                .with_embed_source("sourceId")
                .with_parents(["folio:note", "folio:page"]),
        );
    schema
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_get() {
        let mut schema = Schema::new();
        schema.register(BlockSchema::new("folio:page", BlockRole::Root));

        assert!(schema.get("folio:page").is_some());
        assert!(schema.get("folio:unknown").is_none());
    }

    #[test]
    fn test_root_flavour_lookup() {
        let schema = default_schema();
        assert_eq!(schema.root_flavour().unwrap().flavour, "folio:page");
    }

    #[test]
    fn test_unknown_flavour_rejected() {
        let schema = default_schema();
        let err = schema.validate_placement("folio:unknown", None).unwrap_err();
        assert!(matches!(err, FolioError::SchemaViolation(_)));
    }

    #[test]
    fn test_root_cannot_have_parent() {
        let schema = default_schema();
        assert!(schema.validate_placement("folio:page", None).is_ok());
        assert!(
            schema
                .validate_placement("folio:page", Some("folio:note"))
                .is_err()
        );
    }

    #[test]
    fn test_content_requires_parent() {
        let schema = default_schema();
        assert!(schema.validate_placement("folio:paragraph", None).is_err());
        assert!(
            schema
                .validate_placement("folio:paragraph", Some("folio:note"))
                .is_ok()
        );
    }

    #[test]
    fn test_parent_allowlist_enforced() {
        let schema = default_schema();
        // images may not nest under paragraphs
        assert!(
            schema
                .validate_placement("folio:image", Some("folio:paragraph"))
                .is_err()
        );
        assert!(
            schema
                .validate_placement("folio:image", Some("folio:note"))
                .is_ok()
        );
    }
}
