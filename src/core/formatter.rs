//! Per-backend response shaping.
//!
//! Steps run in a fixed order: target extraction, property filtering
//! (allow list wins over deny list), field renames, grouping.
use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    config::models::BackendConfig,
    core::{
        context::Context,
        error::ConfigError,
        proxy::{BoxProxy, Data, Middleware, Proxy, ProxyResult, Request, Response, expect_single, join, split},
    },
};

#[derive(Debug, Clone, PartialEq)]
enum AllowRule {
    /// Keep the whole value
    Keep,
    /// Keep only the listed descendants
    Nested(BTreeMap<String, AllowRule>),
}

#[derive(Debug, Clone, PartialEq)]
enum DenyRule {
    Whole,
    Fields(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
enum PropertyFilter {
    None,
    Allow(BTreeMap<String, AllowRule>),
    Deny(BTreeMap<String, DenyRule>),
}

impl PropertyFilter {
    fn allow(paths: &[String]) -> Self {
        let mut root = BTreeMap::new();
        for path in paths {
            let tokens: Vec<&str> = path.split('.').collect();
            let Some((last, parents)) = tokens.split_last() else {
                continue;
            };
            insert_allow_path(&mut root, parents, last);
        }
        PropertyFilter::Allow(root)
    }

    fn deny(paths: &[String]) -> Self {
        let mut rules: BTreeMap<String, DenyRule> = BTreeMap::new();
        for path in paths {
            match path.split_once('.') {
                None => {
                    rules.insert(path.clone(), DenyRule::Whole);
                }
                Some((parent, child)) => {
                    let rule = rules
                        .entry(parent.to_string())
                        .or_insert_with(|| DenyRule::Fields(Vec::new()));
                    if let DenyRule::Fields(fields) = rule {
                        fields.push(child.to_string());
                    }
                }
            }
        }
        PropertyFilter::Deny(rules)
    }

    fn apply(&self, data: &mut Data) {
        match self {
            PropertyFilter::None => {}
            PropertyFilter::Allow(rules) => {
                prune(rules, data);
            }
            PropertyFilter::Deny(rules) => {
                for (key, rule) in rules {
                    match rule {
                        DenyRule::Whole => {
                            data.remove(key);
                        }
                        DenyRule::Fields(fields) => {
                            if let Some(Value::Object(nested)) = data.get_mut(key) {
                                for field in fields {
                                    nested.remove(field);
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}

/// A leaf entry covers everything below it, so a later, deeper entry under
/// the same branch does not narrow it.
fn insert_allow_path(root: &mut BTreeMap<String, AllowRule>, parents: &[&str], last: &str) {
    let mut node = root;
    for token in parents {
        let entry = node
            .entry(token.to_string())
            .or_insert_with(|| AllowRule::Nested(BTreeMap::new()));
        match entry {
            AllowRule::Keep => return,
            AllowRule::Nested(children) => node = children,
        }
    }
    node.insert(last.to_string(), AllowRule::Keep);
}

/// Drops everything not covered by `rules`. Returns true when nothing is left.
fn prune(rules: &BTreeMap<String, AllowRule>, data: &mut Data) -> bool {
    data.retain(|key, value| match rules.get(key) {
        None => false,
        Some(AllowRule::Keep) => true,
        Some(AllowRule::Nested(children)) => match value {
            Value::Object(nested) => !prune(children, nested),
            _ => false,
        },
    });
    data.is_empty()
}

/// Reshapes one backend's decoded response.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityFormatter {
    target: Vec<String>,
    filter: PropertyFilter,
    mapping: Vec<(String, String)>,
    group: Option<String>,
}

impl EntityFormatter {
    pub fn new(backend: &BackendConfig) -> Self {
        let filter = if !backend.allow_list.is_empty() {
            PropertyFilter::allow(&backend.allow_list)
        } else if !backend.deny_list.is_empty() {
            PropertyFilter::deny(&backend.deny_list)
        } else {
            PropertyFilter::None
        };

        Self {
            target: backend
                .target
                .as_deref()
                .filter(|t| !t.is_empty())
                .map(|t| t.split('.').map(str::to_string).collect())
                .unwrap_or_default(),
            filter,
            mapping: backend
                .mapping
                .iter()
                .map(|(from, to)| (from.clone(), to.clone()))
                .collect(),
            group: backend.group.clone().filter(|g| !g.is_empty()),
        }
    }

    /// True when formatting would leave every response untouched.
    pub fn is_noop(&self) -> bool {
        self.target.is_empty()
            && self.filter == PropertyFilter::None
            && self.mapping.is_empty()
            && self.group.is_none()
    }

    pub fn format(&self, mut entity: Response) -> Response {
        if !self.target.is_empty() {
            entity.data = self.extract_target(std::mem::take(&mut entity.data));
        }

        if !entity.data.is_empty() {
            self.filter.apply(&mut entity.data);
        }

        for (from, to) in &self.mapping {
            if let Some(value) = entity.data.remove(from) {
                entity.data.insert(to.clone(), value);
            }
        }

        if let Some(group) = &self.group {
            let inner = std::mem::take(&mut entity.data);
            entity.data.insert(group.clone(), Value::Object(inner));
        }

        entity
    }

    fn extract_target(&self, mut data: Data) -> Data {
        for part in &self.target {
            match data.remove(part) {
                Some(Value::Object(nested)) => data = nested,
                _ => return Data::new(),
            }
        }
        data
    }
}

/// Applies an [`EntityFormatter`] to whatever response the next proxy returns.
pub struct FormatterMiddleware {
    formatter: Arc<EntityFormatter>,
}

impl FormatterMiddleware {
    pub fn new(formatter: EntityFormatter) -> Self {
        Self {
            formatter: Arc::new(formatter),
        }
    }
}

impl Middleware for FormatterMiddleware {
    fn wrap(&self, next: Vec<BoxProxy>) -> Result<BoxProxy, ConfigError> {
        let next = expect_single("formatter", next)?;
        if self.formatter.is_noop() {
            return Ok(next);
        }
        Ok(Arc::new(FormatterProxy {
            formatter: self.formatter.clone(),
            next,
        }))
    }
}

struct FormatterProxy {
    formatter: Arc<EntityFormatter>,
    next: BoxProxy,
}

#[async_trait]
impl Proxy for FormatterProxy {
    async fn call(&self, ctx: Context, req: Request) -> ProxyResult {
        let (response, err) = split(self.next.call(ctx, req).await);
        join(response.map(|r| self.formatter.format(r)), err)
    }
}
