//! Routing Rule Engine
//!
//! Holds the six category lists and answers "what happens to traffic for
//! this domain/IP?".
//!
//! # Consistency
//!
//! The lists live in an immutable [`RuleTable`] behind an `Arc`. A setter
//! compiles its replacement list first, then swaps in a new table under a
//! short write lock. Readers clone the `Arc` and work on that snapshot, so
//! a classification sees each list either fully old or fully new.
//!
//! # Precedence
//!
//! 1. block lists
//! 2. direct lists
//! 3. proxy lists
//! 4. default: proxy in global mode, direct otherwise

use crate::policy::StatsPolicy;
use crate::rule::{Category, MatchType, Matcher, RouteAction, RoutingRule, normalize_domain};
use ipnet::IpNet;
use serde_json::{Value, json};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// One category list: raw patterns plus their compiled matchers
#[derive(Debug, Default)]
struct CompiledList {
    patterns: Vec<String>,
    matchers: Vec<Matcher>,
}

impl CompiledList {
    fn compile(match_type: MatchType, patterns: Vec<String>) -> Self {
        let matchers = patterns
            .iter()
            .filter_map(|p| Matcher::compile(match_type, p))
            .collect();
        Self { patterns, matchers }
    }
}

/// Immutable snapshot of all six lists, indexed by [`Category::index`]
#[derive(Debug, Default, Clone)]
pub struct RuleTable {
    lists: [Arc<CompiledList>; 6],
}

impl RuleTable {
    /// Patterns of one category, in insertion order
    pub fn patterns(&self, category: Category) -> &[String] {
        &self.lists[category.index()].patterns
    }

    /// All rules in compiled order
    pub fn rules(&self) -> Vec<RoutingRule> {
        Category::ORDER
            .iter()
            .flat_map(|category| {
                self.patterns(*category)
                    .iter()
                    .map(move |p| RoutingRule::new(category.action, category.match_type, p.clone()))
            })
            .collect()
    }

    pub fn rule_count(&self) -> usize {
        self.lists.iter().map(|l| l.patterns.len()).sum()
    }

    /// First matching action by precedence, if any rule matches
    pub fn lookup(&self, target: &str, is_domain: bool) -> Option<RouteAction> {
        if is_domain {
            let domain = normalize_domain(target).to_ascii_lowercase();
            if domain.is_empty() {
                return None;
            }
            Category::ORDER
                .iter()
                .filter(|c| c.match_type == MatchType::Domain)
                .find(|c| {
                    self.lists[c.index()]
                        .matchers
                        .iter()
                        .any(|m| m.matches_domain(&domain))
                })
                .map(|c| c.action)
        } else {
            let trimmed = target.trim().trim_start_matches('[').trim_end_matches(']');
            let addr: IpAddr = match trimmed.parse() {
                Ok(addr) => addr,
                Err(_) => {
                    debug!("Not an IP address: {}", target);
                    return None;
                }
            };
            Category::ORDER
                .iter()
                .filter(|c| c.match_type == MatchType::Ip)
                .find(|c| self.lists[c.index()].matchers.iter().any(|m| m.matches_ip(&addr)))
                .map(|c| c.action)
        }
    }
}

/// Routing rule engine
pub struct RoutingEngine {
    table: RwLock<Arc<RuleTable>>,
    global_mode: AtomicBool,
    stats_policy: RwLock<StatsPolicy>,
}

impl RoutingEngine {
    /// Create an engine with empty lists and global mode off
    pub fn new() -> Self {
        Self {
            table: RwLock::new(Arc::new(RuleTable::default())),
            global_mode: AtomicBool::new(false),
            stats_policy: RwLock::new(StatsPolicy::default()),
        }
    }

    /// Current rule snapshot
    pub fn snapshot(&self) -> Arc<RuleTable> {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace one category list wholesale
    pub fn set_list(&self, category: Category, patterns: Vec<String>) {
        let compiled = Arc::new(CompiledList::compile(category.match_type, patterns));
        let count = compiled.patterns.len();
        let unmatched = count - compiled.matchers.len();

        {
            let mut guard = self.table.write().unwrap_or_else(PoisonError::into_inner);
            let mut next = RuleTable::clone(&guard);
            next.lists[category.index()] = compiled;
            *guard = Arc::new(next);
        }

        info!("Routing list '{}' replaced ({} patterns)", category, count);
        if unmatched > 0 {
            warn!("{} pattern(s) in '{}' are not evaluated locally", unmatched, category);
        }
    }

    pub fn set_direct_domains(&self, list: Vec<String>) {
        self.set_list(Category::DIRECT_DOMAIN, list);
    }

    pub fn set_proxy_domains(&self, list: Vec<String>) {
        self.set_list(Category::PROXY_DOMAIN, list);
    }

    pub fn set_block_domains(&self, list: Vec<String>) {
        self.set_list(Category::BLOCK_DOMAIN, list);
    }

    pub fn set_direct_ips(&self, list: Vec<String>) {
        self.set_list(Category::DIRECT_IP, list);
    }

    pub fn set_proxy_ips(&self, list: Vec<String>) {
        self.set_list(Category::PROXY_IP, list);
    }

    pub fn set_block_ips(&self, list: Vec<String>) {
        self.set_list(Category::BLOCK_IP, list);
    }

    /// Replace all six lists from exchange records
    ///
    /// Categories with no records become empty. All six lists change in
    /// one swap.
    pub fn set_router_configuration(&self, records: &[RoutingRule]) {
        let mut grouped: [Vec<String>; 6] = Default::default();
        for record in records {
            grouped[record.category().index()].push(record.pattern.clone());
        }

        let mut next = RuleTable::default();
        for category in Category::ORDER {
            let patterns = std::mem::take(&mut grouped[category.index()]);
            next.lists[category.index()] =
                Arc::new(CompiledList::compile(category.match_type, patterns));
        }

        let total = next.rule_count();
        *self.table.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
        info!("Router configuration replaced ({} rules)", total);
    }

    /// Current lists as exchange records, in compiled order
    pub fn router_configuration(&self) -> Vec<RoutingRule> {
        self.compile_rules()
    }

    /// All rules in compiled order
    pub fn compile_rules(&self) -> Vec<RoutingRule> {
        self.snapshot().rules()
    }

    pub fn set_global_mode(&self, enabled: bool) {
        if self.global_mode.swap(enabled, Ordering::SeqCst) != enabled {
            info!("Global mode {}", if enabled { "enabled" } else { "disabled" });
        }
    }

    pub fn is_global_mode(&self) -> bool {
        self.global_mode.load(Ordering::SeqCst)
    }

    /// Action for traffic when no rule matches
    pub fn default_action(&self) -> RouteAction {
        if self.is_global_mode() {
            RouteAction::Proxy
        } else {
            RouteAction::Direct
        }
    }

    /// Resolve the action for a concrete domain or IP
    pub fn classify(&self, target: &str, is_domain: bool) -> RouteAction {
        let action = self
            .snapshot()
            .lookup(target, is_domain)
            .unwrap_or_else(|| self.default_action());
        debug!("Classified {} as {}", target, action);
        action
    }

    pub fn stats_policy(&self) -> StatsPolicy {
        *self.stats_policy.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_stats_policy(&self, policy: StatsPolicy) {
        *self.stats_policy.write().unwrap_or_else(PoisonError::into_inner) = policy;
    }

    /// Engine `routing` block for the current lists and mode
    ///
    /// IP entries the engine would reject are left out of the block but
    /// stay in [`router_configuration`](Self::router_configuration).
    pub fn xray_routing(&self) -> Value {
        let table = self.snapshot();
        let mut rules = Vec::new();

        for category in Category::ORDER {
            let patterns = table.patterns(category);
            if patterns.is_empty() {
                continue;
            }
            let rule = match category.match_type {
                MatchType::Domain => json!({
                    "type": "field",
                    "domain": patterns.iter().map(|p| xray_domain(p)).collect::<Vec<_>>(),
                    "outboundTag": category.action.as_str(),
                }),
                MatchType::Ip => {
                    let ips: Vec<&str> = patterns.iter().filter_map(|p| xray_ip(p)).collect();
                    if ips.is_empty() {
                        continue;
                    }
                    json!({
                        "type": "field",
                        "ip": ips,
                        "outboundTag": category.action.as_str(),
                    })
                }
            };
            rules.push(rule);
        }

        rules.push(json!({
            "type": "field",
            "network": "tcp,udp",
            "outboundTag": self.default_action().as_str(),
        }));

        json!({
            "domainStrategy": "AsIs",
            "rules": rules,
        })
    }
}

impl Default for RoutingEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// IP entries the engine accepts: addresses, CIDR blocks and `geoip:` sets
fn xray_ip(pattern: &str) -> Option<&str> {
    let p = pattern.trim();
    let accepted = p.to_ascii_lowercase().starts_with("geoip:")
        || p.parse::<IpNet>().is_ok()
        || p.parse::<IpAddr>().is_ok();
    if !accepted {
        warn!("Leaving IP pattern '{}' out of the engine routing", p);
        return None;
    }
    Some(p)
}

/// Plain domains become explicit suffix rules for the engine
fn xray_domain(pattern: &str) -> String {
    let p = pattern.trim();
    let has_prefix = ["domain:", "full:", "keyword:", "regexp:", "geosite:"]
        .iter()
        .any(|prefix| p.to_ascii_lowercase().starts_with(prefix));
    if has_prefix {
        p.to_string()
    } else {
        format!("domain:{}", p)
    }
}
