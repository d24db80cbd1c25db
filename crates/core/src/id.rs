//! Hierarchical resource identifiers.
//!
//! Two root shapes are accepted:
//! - `/subscriptions/{sub}[/resourceGroups/{rg}]...`
//! - `/planes/{planeType}/{planeName}[/{scopeType}/{scopeName}]...`
//!
//! Scopes may be followed by `providers/{namespace}` and type/name pairs. The
//! display form keeps the caller's casing; `key()` is the lower-cased form used
//! for routing and storage, and equality/hashing follow the key.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use smallvec::SmallVec;

use crate::error::{Error, Result};

type Pairs = SmallVec<[(String, String); 4]>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Shape {
    /// A scope or a fully named resource.
    Id,
    Scope,
    Collection,
    Any,
}

#[derive(Clone)]
pub struct ResourceId {
    plane: Option<(String, String)>,
    scopes: Pairs,
    provider: Option<String>,
    /// Type/name pairs; the trailing name is empty for collections.
    types: Pairs,
    collection: bool,
    display: String,
    key: String,
}

impl ResourceId {
    /// Parse a scope or a resource id. Collections are rejected.
    pub fn parse(path: &str) -> Result<Self> { Self::parse_as(path, Shape::Id) }

    /// Parse an id that must not carry a provider segment.
    pub fn parse_scope(path: &str) -> Result<Self> { Self::parse_as(path, Shape::Scope) }

    /// Parse a list path ending in a resource type without a name.
    pub fn parse_collection(path: &str) -> Result<Self> { Self::parse_as(path, Shape::Collection) }

    /// Build `{scope}/providers/{resource_type}/{name}`; `resource_type` is `Namespace/type`.
    pub fn in_scope(scope: &ResourceId, resource_type: &str, name: &str) -> Result<Self> {
        Self::parse(&format!("{}/providers/{}/{}", scope.root_scope(), resource_type, name))
    }

    fn parse_as(path: &str, shape: Shape) -> Result<Self> {
        let err = |reason: &str| Error::invalid_id(path, reason);
        let body = path.trim().strip_prefix('/').ok_or_else(|| err("must start with '/'"))?;
        let body = body.strip_suffix('/').unwrap_or(body);
        if body.is_empty() { return Err(err("empty path")); }
        let parts: Vec<&str> = body.split('/').collect();
        if parts.iter().any(|p| p.trim().is_empty()) { return Err(err("empty segment")); }

        let split = parts.iter().position(|p| p.eq_ignore_ascii_case("providers")).unwrap_or(parts.len());
        let (scope_parts, rest) = parts.split_at(split);

        let mut plane = None;
        let pair_parts: &[&str] = match scope_parts.first() {
            Some(root) if root.eq_ignore_ascii_case("subscriptions") => scope_parts,
            Some(root) if root.eq_ignore_ascii_case("planes") => {
                if scope_parts.len() < 3 { return Err(err("plane scope needs a type and a name")); }
                plane = Some((scope_parts[1].to_string(), scope_parts[2].to_string()));
                &scope_parts[3..]
            }
            _ => return Err(err("unknown root scope, expected /subscriptions or /planes")),
        };
        if pair_parts.len() % 2 != 0 { return Err(err("scope segments must come in type/name pairs")); }
        let scopes: Pairs = pair_parts.chunks(2).map(|c| (c[0].to_string(), c[1].to_string())).collect();

        let mut provider = None;
        let mut types = Pairs::new();
        let mut collection = false;
        if !rest.is_empty() {
            let ns = rest.get(1).ok_or_else(|| err("'providers' must be followed by a namespace"))?;
            provider = Some(ns.to_string());
            let segs = &rest[2..];
            if segs.is_empty() { return Err(err("missing resource type after provider namespace")); }
            collection = segs.len() % 2 == 1;
            types = segs
                .chunks(2)
                .map(|c| (c[0].to_string(), c.get(1).map(|s| s.to_string()).unwrap_or_default()))
                .collect();
        }

        match shape {
            Shape::Id if collection => return Err(err("odd number of type/name segments")),
            Shape::Scope if provider.is_some() => return Err(err("expected a scope without a provider segment")),
            Shape::Collection if !collection => return Err(err("expected a path ending in a resource type")),
            _ => {}
        }
        Ok(Self::build(plane, scopes, provider, types, collection))
    }

    fn build(plane: Option<(String, String)>, scopes: Pairs, provider: Option<String>, types: Pairs, collection: bool) -> Self {
        let mut display = String::new();
        if let Some((t, n)) = &plane {
            display.push_str("/planes/");
            display.push_str(t);
            display.push('/');
            display.push_str(n);
        }
        for (k, v) in &scopes {
            display.push('/');
            display.push_str(k);
            display.push('/');
            display.push_str(v);
        }
        if let Some(ns) = &provider {
            display.push_str("/providers/");
            display.push_str(ns);
            for (t, n) in &types {
                display.push('/');
                display.push_str(t);
                if !n.is_empty() {
                    display.push('/');
                    display.push_str(n);
                }
            }
        }
        let key = display.to_lowercase();
        Self { plane, scopes, provider, types, collection, display, key }
    }

    pub fn as_str(&self) -> &str { &self.display }

    /// Lower-cased canonical form used for routing and storage.
    pub fn key(&self) -> &str { &self.key }

    pub fn is_scope(&self) -> bool { self.provider.is_none() }
    pub fn is_collection(&self) -> bool { self.collection }

    /// `(planeType, planeName)` for `/planes/...` ids.
    pub fn plane(&self) -> Option<(&str, &str)> { self.plane.as_ref().map(|(t, n)| (t.as_str(), n.as_str())) }

    pub fn provider_namespace(&self) -> Option<&str> { self.provider.as_deref() }

    /// Value of a scope segment, e.g. `scope_value("resourceGroups")`.
    pub fn scope_value(&self, kind: &str) -> Option<&str> {
        self.scopes.iter().find(|(k, _)| k.eq_ignore_ascii_case(kind)).map(|(_, v)| v.as_str())
    }

    pub fn resource_group(&self) -> Option<&str> { self.scope_value("resourceGroups") }

    /// `Namespace/type[/subtype...]`, empty for scopes.
    pub fn resource_type(&self) -> String {
        match &self.provider {
            Some(ns) => {
                let mut s = ns.clone();
                for (t, _) in &self.types {
                    s.push('/');
                    s.push_str(t);
                }
                s
            }
            None => String::new(),
        }
    }

    /// Name of the last segment; empty for collections.
    pub fn name(&self) -> &str {
        if let Some((_, n)) = self.types.last() { return n; }
        if let Some((_, n)) = self.scopes.last() { return n; }
        self.plane.as_ref().map(|(_, n)| n.as_str()).unwrap_or("")
    }

    pub fn type_segments(&self) -> impl Iterator<Item = (&str, &str)> {
        self.types.iter().map(|(t, n)| (t.as_str(), n.as_str()))
    }

    pub fn root_scope(&self) -> ResourceId {
        Self::build(self.plane.clone(), self.scopes.clone(), None, Pairs::new(), false)
    }

    /// Keep the first `depth` type segments; `0` yields the root scope.
    pub fn truncate(&self, depth: usize) -> ResourceId {
        if self.provider.is_none() || depth >= self.types.len() { return self.clone(); }
        if depth == 0 { return self.root_scope(); }
        let types: Pairs = self.types.iter().take(depth).cloned().collect();
        Self::build(self.plane.clone(), self.scopes.clone(), self.provider.clone(), types, false)
    }

    pub fn parent(&self) -> Option<ResourceId> {
        if self.provider.is_some() {
            return Some(self.truncate(self.types.len() - 1));
        }
        let min = if self.plane.is_some() { 0 } else { 1 };
        if self.scopes.len() <= min { return None; }
        let mut scopes = self.scopes.clone();
        scopes.pop();
        Some(Self::build(self.plane.clone(), scopes, None, Pairs::new(), false))
    }

    /// Child resource `{self}/{type_name}/{name}`.
    pub fn append(&self, type_name: &str, name: &str) -> Result<ResourceId> {
        if self.provider.is_none() || self.collection {
            return Err(Error::invalid_id(&self.display, "child resources need a named parent resource"));
        }
        Self::parse(&format!("{}/{}/{}", self.display, type_name, name))
    }

    /// True when `self` lives strictly below `scope`.
    pub fn is_under(&self, scope: &ResourceId) -> bool {
        self.key.len() > scope.key.len() && self.key.starts_with(&scope.key) && self.key.as_bytes()[scope.key.len()] == b'/'
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.display) }
}

impl fmt::Debug for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "ResourceId({})", self.display) }
}

impl FromStr for ResourceId {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> { Self::parse(s) }
}

impl PartialEq for ResourceId {
    fn eq(&self, other: &Self) -> bool { self.key == other.key }
}
impl Eq for ResourceId {}

impl Hash for ResourceId {
    fn hash<H: Hasher>(&self, state: &mut H) { self.key.hash(state) }
}

impl PartialOrd for ResourceId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> { Some(self.cmp(other)) }
}
impl Ord for ResourceId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering { self.key.cmp(&other.key) }
}

impl Serialize for ResourceId {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> { s.serialize_str(&self.display) }
}

impl<'de> Deserialize<'de> for ResourceId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        ResourceId::parse_as(&s, Shape::Any).map_err(serde::de::Error::custom)
    }
}
