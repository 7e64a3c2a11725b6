//! Routers filter and order the invoker list per invocation

use mizzen_core::constants::{
    ENABLED_KEY, FORCE_KEY, FORCE_USE_TAG_KEY, PRIORITY_KEY, ROUTE_PROTOCOL, RULE_KEY, TAG_KEY,
    TAG_ROUTE_PROTOCOL,
};
use mizzen_core::{Error, Result, Url};
use mizzen_rpc::{Invoker, RpcInvocation};
use std::sync::Arc;
use tracing::warn;

/// Filters the candidate invokers for one invocation
pub trait Router: Send + Sync {
    fn url(&self) -> &Url;

    fn priority(&self) -> i32 {
        0
    }

    fn route(
        &self,
        invokers: Vec<Arc<dyn Invoker>>,
        consumer: &Url,
        invocation: &RpcInvocation,
    ) -> Result<Vec<Arc<dyn Invoker>>>;
}

/// Build router instances from registry `routers` category URLs, sorted by
/// priority; disabled and unrecognized rules are skipped
pub fn routers_from_urls(urls: &[Url]) -> Vec<Arc<dyn Router>> {
    let mut routers: Vec<Arc<dyn Router>> = Vec::new();
    for url in urls {
        if !url.param_bool(ENABLED_KEY, true) {
            continue;
        }
        match url.protocol() {
            ROUTE_PROTOCOL => match ConditionRouter::new(url.clone()) {
                Ok(router) => routers.push(Arc::new(router)),
                Err(e) => warn!("ignoring malformed condition route {}: {}", url, e),
            },
            TAG_ROUTE_PROTOCOL => routers.push(Arc::new(TagRouter::new(url.clone()))),
            other => warn!("ignoring route with unknown protocol '{}'", other),
        }
    }
    routers.sort_by_key(|r| r.priority());
    routers
}

#[derive(Debug, Clone, PartialEq)]
enum Op {
    Eq,
    Ne,
}

#[derive(Debug, Clone)]
struct Condition {
    key: String,
    op: Op,
    values: Vec<String>,
}

impl Condition {
    fn matches(&self, actual: Option<&str>) -> bool {
        let hit = match actual {
            Some(actual) => self.values.iter().any(|pattern| glob_match(pattern, actual)),
            None => false,
        };
        match self.op {
            Op::Eq => hit,
            Op::Ne => !hit,
        }
    }
}

fn glob_match(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match (pattern.strip_prefix('*'), pattern.strip_suffix('*')) {
        (Some(suffix), _) => value.ends_with(suffix),
        (_, Some(prefix)) => value.starts_with(prefix),
        _ => pattern == value,
    }
}

fn parse_conditions(clause: &str) -> Result<Vec<Condition>> {
    let mut out = Vec::new();
    for part in clause.split('&').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, op, rest) = if let Some((k, v)) = part.split_once("!=") {
            (k, Op::Ne, v)
        } else if let Some((k, v)) = part.split_once('=') {
            (k, Op::Eq, v)
        } else {
            return Err(Error::InvalidArgument(format!("bad route condition '{}'", part)));
        };
        let values: Vec<String> = rest
            .split(',')
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect();
        if key.trim().is_empty() || values.is_empty() {
            return Err(Error::InvalidArgument(format!("bad route condition '{}'", part)));
        }
        out.push(Condition { key: key.trim().to_string(), op, values });
    }
    Ok(out)
}

/// Boolean-expression router: `when-conditions => then-conditions` over
/// consumer and provider URLs.
///
/// A request matching the when side may only reach providers matching the
/// then side. An empty then side blacklists matching requests entirely.
/// When filtering leaves nothing, the rule steps aside unless `force=true`.
pub struct ConditionRouter {
    url: Url,
    when: Vec<Condition>,
    then: Option<Vec<Condition>>,
    force: bool,
    priority: i32,
}

impl ConditionRouter {
    pub fn new(url: Url) -> Result<Self> {
        let rule = url
            .param(RULE_KEY)
            .ok_or_else(|| Error::InvalidArgument("condition route without rule".into()))?;
        let (when_clause, then_clause) = rule
            .split_once("=>")
            .ok_or_else(|| Error::InvalidArgument(format!("rule '{}' lacks '=>'", rule)))?;
        let when = parse_conditions(when_clause)?;
        // an empty then side means: matching consumers get nothing
        let then = if then_clause.trim().is_empty() {
            None
        } else {
            Some(parse_conditions(then_clause)?)
        };
        Ok(Self {
            force: url.param_bool(FORCE_KEY, false),
            priority: url.param(PRIORITY_KEY).and_then(|p| p.parse().ok()).unwrap_or(0),
            url,
            when,
            then,
        })
    }

    fn when_matches(&self, consumer: &Url, invocation: &RpcInvocation) -> bool {
        self.when.iter().all(|c| {
            let actual = match c.key.as_str() {
                "host" => Some(consumer.host()),
                "method" => Some(invocation.method()),
                key => consumer.param(key).or_else(|| invocation.attachment(key)),
            };
            c.matches(actual)
        })
    }

    fn then_matches(&self, provider: &Url) -> bool {
        match &self.then {
            None => false,
            Some(conditions) => conditions.iter().all(|c| {
                let actual = match c.key.as_str() {
                    "host" => Some(provider.host()),
                    key => provider.param(key),
                };
                c.matches(actual)
            }),
        }
    }
}

impl Router for ConditionRouter {
    fn url(&self) -> &Url {
        &self.url
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn route(
        &self,
        invokers: Vec<Arc<dyn Invoker>>,
        consumer: &Url,
        invocation: &RpcInvocation,
    ) -> Result<Vec<Arc<dyn Invoker>>> {
        if !self.when_matches(consumer, invocation) {
            return Ok(invokers);
        }
        if self.then.is_none() {
            return Ok(Vec::new());
        }
        let filtered: Vec<Arc<dyn Invoker>> = invokers
            .iter()
            .filter(|i| self.then_matches(i.url()))
            .cloned()
            .collect();
        if filtered.is_empty() && !self.force {
            warn!(
                "condition route {} matched nothing, ignoring it",
                self.url.param_or(RULE_KEY, "?")
            );
            return Ok(invokers);
        }
        Ok(filtered)
    }
}

/// Static tag routing: tagged requests reach same-tag providers, untagged
/// requests reach untagged providers. Without `tag.force`, a tag with no
/// live provider falls back to the untagged pool.
pub struct TagRouter {
    url: Url,
}

impl TagRouter {
    pub fn new(url: Url) -> Self {
        Self { url }
    }
}

impl Router for TagRouter {
    fn url(&self) -> &Url {
        &self.url
    }

    fn route(
        &self,
        invokers: Vec<Arc<dyn Invoker>>,
        consumer: &Url,
        invocation: &RpcInvocation,
    ) -> Result<Vec<Arc<dyn Invoker>>> {
        let tag = invocation
            .attachment(TAG_KEY)
            .or_else(|| consumer.param(TAG_KEY))
            .map(str::to_string);
        match tag {
            Some(tag) => {
                let tagged: Vec<Arc<dyn Invoker>> = invokers
                    .iter()
                    .filter(|i| i.url().param(TAG_KEY) == Some(tag.as_str()))
                    .cloned()
                    .collect();
                if !tagged.is_empty() {
                    return Ok(tagged);
                }
                if consumer.param_bool(FORCE_USE_TAG_KEY, false) {
                    return Ok(Vec::new());
                }
                Ok(invokers
                    .into_iter()
                    .filter(|i| i.url().param(TAG_KEY).is_none())
                    .collect())
            }
            None => Ok(invokers
                .into_iter()
                .filter(|i| i.url().param(TAG_KEY).is_none())
                .collect()),
        }
    }
}
