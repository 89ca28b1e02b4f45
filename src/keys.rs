//! Entity Key Registry
//!
//! Pure functions mapping logical storefront resources to stable,
//! hierarchical cache keys. A key is an ordered list of segments; any prefix
//! of a key addresses every key that extends it, which is what bulk
//! invalidation and list patching rely on.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// == Key Segment ==
/// A single component of a cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeySegment {
    Str(String),
    Int(i64),
    Bool(bool),
}

impl fmt::Display for KeySegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySegment::Str(s) => f.write_str(s),
            KeySegment::Int(i) => write!(f, "{}", i),
            KeySegment::Bool(b) => write!(f, "{}", b),
        }
    }
}

impl From<&str> for KeySegment {
    fn from(value: &str) -> Self {
        KeySegment::Str(value.to_string())
    }
}

impl From<String> for KeySegment {
    fn from(value: String) -> Self {
        KeySegment::Str(value)
    }
}

impl From<i64> for KeySegment {
    fn from(value: i64) -> Self {
        KeySegment::Int(value)
    }
}

impl From<bool> for KeySegment {
    fn from(value: bool) -> Self {
        KeySegment::Bool(value)
    }
}

// == Cache Key ==
/// Ordered, hashable tuple of segments identifying a cached entity or list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(Vec<KeySegment>);

impl CacheKey {
    /// Builds a key from any sequence of segment-like values.
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<KeySegment>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// Parses the `seg:seg:seg` display form. Every segment parses as a string.
    pub fn parse(raw: &str) -> Self {
        if raw.is_empty() {
            return Self::default();
        }
        Self::new(raw.split(':'))
    }

    pub fn segments(&self) -> &[KeySegment] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns a new key with `segment` appended.
    pub fn child(&self, segment: impl Into<KeySegment>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self(segments)
    }

    /// True when `prefix` is a (non-strict) prefix of this key.
    /// The empty key is a prefix of every key.
    pub fn starts_with(&self, prefix: &CacheKey) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// Maps the key to the backend REST path that serves it.
    ///
    /// - `products` → `/products`
    /// - `products:list` → `/products`
    /// - `products:list:page=2` → `/products?page=2`
    /// - `products:detail:42` → `/products/42`
    /// - anything else joins its segments (`stock:summary` → `/stock/summary`)
    pub fn resource_path(&self) -> String {
        let segs: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        match segs.as_slice() {
            [resource] => format!("/{}", resource),
            [resource, list] if list == LIST => format!("/{}", resource),
            [resource, list, filter] if list == LIST => {
                if filter.is_empty() {
                    format!("/{}", resource)
                } else {
                    format!("/{}?{}", resource, filter)
                }
            }
            [resource, detail, id] if detail == DETAIL => format!("/{}/{}", resource, id),
            _ => format!("/{}", segs.join("/")),
        }
    }

    /// True for keys under a `list` scope.
    pub fn is_list(&self) -> bool {
        matches!(self.0.get(1), Some(KeySegment::Str(s)) if s == LIST)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for segment in &self.0 {
            if !first {
                f.write_str(":")?;
            }
            write!(f, "{}", segment)?;
            first = false;
        }
        Ok(())
    }
}

const LIST: &str = "list";
const DETAIL: &str = "detail";

// == Entity Kind ==
/// Server-owned entity families held in the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Product,
    Order,
    Coupon,
    Stock,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Product,
        EntityKind::Order,
        EntityKind::Coupon,
        EntityKind::Stock,
    ];

    /// Root key segment for the entity family.
    pub fn resource(self) -> &'static str {
        match self {
            EntityKind::Product => "products",
            EntityKind::Order => "orders",
            EntityKind::Coupon => "coupons",
            EntityKind::Stock => "stock",
        }
    }

    /// Realtime topic carrying changes for the entity family.
    pub fn topic(self) -> &'static str {
        match self {
            EntityKind::Product => "product_update",
            EntityKind::Order => "order_update",
            EntityKind::Coupon => "coupon_update",
            EntityKind::Stock => "stock_update",
        }
    }

    pub fn from_topic(topic: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.topic() == topic)
    }

    /// Field holding the entity identity inside a payload.
    pub fn id_field(self) -> &'static str {
        match self {
            EntityKind::Stock => "product_id",
            _ => "id",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.resource())
    }
}

// == List Filter ==
/// Filter descriptor for list keys.
///
/// Renders as a stable query string: fields appear in lexical order and
/// unset fields are omitted, so equal filters always yield equal keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListFilter {
    pub page: Option<u32>,
    pub per_page: Option<u32>,
    pub search: Option<String>,
    pub status: Option<String>,
    pub sort: Option<String>,
}

impl ListFilter {
    pub fn page(page: u32) -> Self {
        Self {
            page: Some(page),
            ..Self::default()
        }
    }

    pub fn descriptor(&self) -> String {
        let mut parts = BTreeMap::new();
        if let Some(page) = self.page {
            parts.insert("page", page.to_string());
        }
        if let Some(per_page) = self.per_page {
            parts.insert("per_page", per_page.to_string());
        }
        if let Some(search) = &self.search {
            parts.insert("search", search.clone());
        }
        if let Some(status) = &self.status {
            parts.insert("status", status.clone());
        }
        if let Some(sort) = &self.sort {
            parts.insert("sort", sort.clone());
        }
        parts
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&")
    }
}

// == Key Constructors ==
/// Every key of an entity family.
pub fn all(kind: EntityKind) -> CacheKey {
    CacheKey::new([kind.resource()])
}

/// Prefix covering every list of an entity family.
pub fn lists(kind: EntityKind) -> CacheKey {
    all(kind).child(LIST)
}

/// A filtered list of an entity family.
pub fn list(kind: EntityKind, filter: &ListFilter) -> CacheKey {
    lists(kind).child(filter.descriptor())
}

/// Prefix covering every detail entry of an entity family.
pub fn details(kind: EntityKind) -> CacheKey {
    all(kind).child(DETAIL)
}

/// A single entity.
pub fn detail(kind: EntityKind, id: impl Into<String>) -> CacheKey {
    details(kind).child(id.into())
}

/// Aggregate stock levels across the catalog.
pub fn stock_summary() -> CacheKey {
    CacheKey::new(["stock", "summary"])
}

/// Admin console dashboard figures (revenue, order counts).
pub fn dashboard_stats() -> CacheKey {
    CacheKey::new(["dashboard", "stats"])
}

/// Derived keys that are refetched, never patched in place.
pub fn aggregates() -> Vec<CacheKey> {
    vec![stock_summary(), dashboard_stats()]
}
