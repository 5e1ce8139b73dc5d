//! Rule engine: hot-reloaded rule sets evaluated against enriched signals.

pub mod expr;
pub mod hotreload;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;

use expr::{Expr, Value};
use hotreload::HotConfigRegistry;

use crate::envcfg;

/// Identifiers rule conditions may reference.
pub const ALLOWED_FIELDS: [&str; 8] = [
    "goplus_risk",
    "buy_tax",
    "sell_tax",
    "lp_lock_days",
    "dex_liquidity",
    "dex_volume_1h",
    "heat_slope",
    "last_sentiment_score",
];

const MAX_RULES_COUNT: usize = 200;

// ── Parsed rule set ─────────────────────────────────────────────────

#[derive(Debug)]
pub struct Rule {
    pub id: String,
    pub condition: Expr,
    pub score: f64,
    pub reason: String,
}

#[derive(Debug)]
pub struct RuleGroup {
    pub name: String,
    pub priority: i64,
    pub rules: Vec<Rule>,
}

#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    pub opportunity: f64,
    pub caution: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Thresholds {
            opportunity: 15.0,
            caution: -5.0,
        }
    }
}

#[derive(Debug)]
pub struct MissingSource {
    pub key: String,
    pub condition: Option<Expr>,
    pub reason: String,
}

#[derive(Debug)]
pub struct RuleSet {
    pub version: String,
    pub groups: Vec<RuleGroup>,
    pub thresholds: Thresholds,
    pub missing_map: Vec<MissingSource>,
}

fn yaml_str(v: &serde_yaml::Value, key: &str) -> Option<String> {
    v.get(key).and_then(|x| x.as_str()).map(|s| s.to_string())
}

fn yaml_f64(v: &serde_yaml::Value, key: &str) -> Option<f64> {
    v.get(key).and_then(|x| x.as_f64().or_else(|| x.as_i64().map(|i| i as f64)))
}

fn yaml_i64(v: &serde_yaml::Value, key: &str) -> Option<i64> {
    v.get(key).and_then(|x| x.as_i64())
}

/// Default detection conditions for string-valued missing_map entries.
/// Sources beyond these are treated as never missing until configured with
/// an explicit condition.
fn default_missing_condition(source: &str) -> Option<&'static str> {
    match source {
        "dex" => Some("dex_liquidity is null and dex_volume_1h is null"),
        "hf" => Some("last_sentiment_score is null"),
        "goplus" => Some("goplus_risk is null"),
        _ => None,
    }
}

impl RuleSet {
    /// Parse and validate the `rules` namespace. Returns an error message
    /// (the caller keeps its last-good set) on any structural or expression
    /// violation.
    pub fn from_yaml(value: &serde_yaml::Value, fallback_version: &str) -> Result<RuleSet, String> {
        if !value.is_mapping() {
            return Err("rules must be a mapping".to_string());
        }
        for key in ["groups", "scoring", "missing_map"] {
            if value.get(key).is_none() {
                return Err(format!("missing required key: {key}"));
            }
        }

        // Groups come as a list or a name-keyed mapping.
        let groups_val = value.get("groups").unwrap();
        let mut raw_groups: Vec<(String, serde_yaml::Value)> = Vec::new();
        match groups_val {
            serde_yaml::Value::Sequence(seq) => {
                for g in seq {
                    let name = yaml_str(g, "name").unwrap_or_else(|| "unknown".to_string());
                    raw_groups.push((name, g.clone()));
                }
            }
            serde_yaml::Value::Mapping(groups) => {
                for (k, g) in groups {
                    let name = k.as_str().unwrap_or("unknown").to_string();
                    if !g.is_mapping() {
                        return Err(format!("group {name} must be a mapping"));
                    }
                    raw_groups.push((name, g.clone()));
                }
            }
            _ => return Err("groups must be a list or mapping".to_string()),
        }
        if raw_groups.is_empty() {
            return Err("groups cannot be empty".to_string());
        }

        let mut groups = Vec::new();
        let mut total_rules = 0usize;
        for (name, g) in raw_groups {
            let priority = yaml_i64(&g, "priority").unwrap_or(0);
            let rules_val = g.get("rules").cloned().unwrap_or(serde_yaml::Value::Sequence(Vec::new()));
            let serde_yaml::Value::Sequence(rule_seq) = rules_val else {
                return Err(format!("group {name} rules must be a list"));
            };

            let mut rules = Vec::new();
            for r in &rule_seq {
                total_rules += 1;
                let raw_cond = yaml_str(r, "condition")
                    .or_else(|| yaml_str(r, "when"))
                    .unwrap_or_default();
                if raw_cond.is_empty() {
                    continue;
                }
                let condition = Expr::parse(&raw_cond)
                    .map_err(|e| format!("unsafe expression `{raw_cond}`: {e}"))?;
                rules.push(Rule {
                    id: yaml_str(r, "id").unwrap_or_default(),
                    condition,
                    score: yaml_f64(r, "score").unwrap_or(0.0),
                    reason: yaml_str(r, "reason").unwrap_or_default(),
                });
            }
            groups.push(RuleGroup {
                name,
                priority,
                rules,
            });
        }
        if total_rules > MAX_RULES_COUNT {
            return Err(format!("too many rules: {total_rules} > {MAX_RULES_COUNT}"));
        }

        let scoring = value.get("scoring").unwrap();
        let thresholds_val = scoring
            .get("thresholds")
            .ok_or("scoring thresholds must be a mapping")?;
        if !thresholds_val.is_mapping() {
            return Err("scoring thresholds must be a mapping".to_string());
        }
        let opportunity = yaml_f64(thresholds_val, "opportunity");
        let caution = yaml_f64(thresholds_val, "caution");
        if opportunity.is_none() && caution.is_none() {
            return Err("must define at least opportunity or caution threshold".to_string());
        }
        let defaults = Thresholds::default();
        let thresholds = Thresholds {
            opportunity: opportunity.unwrap_or(defaults.opportunity),
            caution: caution.unwrap_or(defaults.caution),
        };

        let missing_val = value.get("missing_map").unwrap();
        let serde_yaml::Value::Mapping(missing_map_raw) = missing_val else {
            return Err("missing_map must be a mapping".to_string());
        };
        let mut missing_map = Vec::new();
        for (k, v) in missing_map_raw {
            let key = k.as_str().unwrap_or_default().to_string();
            match v {
                serde_yaml::Value::String(reason) => {
                    let condition = default_missing_condition(&key)
                        .map(|c| Expr::parse(c).expect("default conditions parse"));
                    missing_map.push(MissingSource {
                        key,
                        condition,
                        reason: reason.clone(),
                    });
                }
                serde_yaml::Value::Mapping(_) => {
                    let cond_raw = yaml_str(v, "condition").unwrap_or_default();
                    let condition = if cond_raw.is_empty() {
                        None
                    } else {
                        Some(
                            Expr::parse(&cond_raw)
                                .map_err(|e| format!("unsafe expression `{cond_raw}`: {e}"))?,
                        )
                    };
                    let reason =
                        yaml_str(v, "reason").unwrap_or_else(|| format!("{key} 数据缺失"));
                    missing_map.push(MissingSource {
                        key,
                        condition,
                        reason,
                    });
                }
                _ => continue,
            }
        }
        if !missing_map
            .iter()
            .any(|m| matches!(m.key.as_str(), "dex" | "hf" | "goplus"))
        {
            return Err("missing_map should define at least one of dex/hf/goplus".to_string());
        }

        let version = yaml_str(value, "version").unwrap_or_else(|| fallback_version.to_string());

        Ok(RuleSet {
            version,
            groups,
            thresholds,
            missing_map,
        })
    }
}

// ── Loader ──────────────────────────────────────────────────────────

/// Caches the parsed rule set keyed by the registry's per-namespace SHA,
/// keeping the last-good set when a new revision fails validation.
pub struct RuleLoader {
    registry: Arc<HotConfigRegistry>,
    cache: Mutex<Option<(String, Arc<RuleSet>)>>,
}

impl RuleLoader {
    pub fn new(registry: Arc<HotConfigRegistry>) -> RuleLoader {
        RuleLoader {
            registry,
            cache: Mutex::new(None),
        }
    }

    /// Returns `(rules, version, hot_reloaded)`.
    pub fn get(&self) -> (Option<Arc<RuleSet>>, String, bool) {
        self.registry.reload_if_stale(false);
        let sha = self.registry.ns_sha("rules").unwrap_or_default();

        let mut cache = self.cache.lock().unwrap();
        if let Some((cached_sha, set)) = cache.as_ref() {
            if *cached_sha == sha {
                return (Some(Arc::clone(set)), set.version.clone(), false);
            }
        }

        let fallback = if sha.is_empty() {
            "unknown".to_string()
        } else {
            format!("sha:{}", &sha[..sha.len().min(8)])
        };
        match RuleSet::from_yaml(&self.registry.get_ns("rules"), &fallback) {
            Ok(set) => {
                let set = Arc::new(set);
                tracing::info!(
                    stage = "rules.reloaded",
                    new_version = %set.version,
                    hot_reload = cache.is_some(),
                );
                *cache = Some((sha, Arc::clone(&set)));
                let version = set.version.clone();
                (Some(set), version, true)
            }
            Err(e) => {
                tracing::warn!(stage = "rules.reload_error", reason = "validation_failed", error = %e);
                match cache.as_ref() {
                    Some((_, set)) => (Some(Arc::clone(set)), set.version.clone(), false),
                    None => (None, "error".to_string(), false),
                }
            }
        }
    }
}

// ── Evaluation ──────────────────────────────────────────────────────

/// Rule level produced by scoring thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Opportunity,
    Observe,
    Caution,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Opportunity => "opportunity",
            Level::Observe => "observe",
            Level::Caution => "caution",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Evaluation {
    pub score: f64,
    pub level: Level,
    pub reasons: Vec<String>,
    pub all_reasons: Vec<String>,
    pub missing: Vec<String>,
    pub rules_version: String,
    pub hot_reloaded: bool,
    pub refine_used: bool,
}

/// Optional external reason refiner. Any failure or non-conforming output
/// keeps the original reasons.
pub trait ReasonRefiner: Send + Sync {
    fn refine(&self, reasons: &[String], budget: Duration) -> Option<Vec<String>>;
}

pub struct RuleEngine {
    loader: RuleLoader,
    refiner: Option<Box<dyn ReasonRefiner>>,
    refine_timeout: Duration,
}

impl RuleEngine {
    pub fn new(registry: Arc<HotConfigRegistry>) -> RuleEngine {
        RuleEngine {
            loader: RuleLoader::new(registry),
            refiner: None,
            refine_timeout: Duration::from_millis(envcfg::env_u64("REFINE_TIMEOUT_MS", 800)),
        }
    }

    pub fn with_refiner(mut self, refiner: Box<dyn ReasonRefiner>) -> RuleEngine {
        self.refiner = Some(refiner);
        self
    }

    /// Side-effect-free evaluation of a combined signals∪events row.
    pub fn evaluate(&self, ctx: &serde_json::Map<String, serde_json::Value>) -> Evaluation {
        let (rules, version, hot_reloaded) = self.loader.get();

        let Some(rules) = rules else {
            let msg = "规则加载失败".to_string();
            return Evaluation {
                score: 0.0,
                level: Level::Observe,
                reasons: vec![msg.clone()],
                all_reasons: vec![msg],
                missing: Vec::new(),
                rules_version: version,
                hot_reloaded,
                refine_used: false,
            };
        };

        let lookup = |name: &str| -> Value {
            if !ALLOWED_FIELDS.contains(&name) {
                return Value::Null;
            }
            ctx.get(name).map(expr::value_from_json).unwrap_or(Value::Null)
        };

        let mut total_score = 0.0;
        // (priority, |score|, reason) for reason ranking.
        let mut fired: Vec<(i64, f64, String)> = Vec::new();

        // Reasons rank by the owning group's priority, then |score|.
        for group in &rules.groups {
            for rule in &group.rules {
                if rule.condition.eval(&lookup) {
                    total_score += rule.score;
                    if !rule.reason.is_empty() {
                        fired.push((group.priority, rule.score.abs(), rule.reason.clone()));
                    }
                }
            }
        }

        // Missing sources surface at priority 100 so they reach the top 3.
        let mut missing = Vec::new();
        for source in &rules.missing_map {
            let Some(cond) = &source.condition else {
                continue;
            };
            if cond.eval(&lookup) {
                missing.push(source.key.clone());
                fired.push((100, 0.0, source.reason.clone()));
            }
        }

        fired.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then(b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal))
        });

        let mut all_reasons: Vec<String> = Vec::new();
        for (_, _, reason) in &fired {
            if !all_reasons.contains(reason) {
                all_reasons.push(reason.clone());
            }
        }
        let mut reasons: Vec<String> = all_reasons.iter().take(3).cloned().collect();

        let mut refine_used = false;
        if let Some(refiner) = &self.refiner {
            if let Some(refined) = refiner.refine(&reasons, self.refine_timeout) {
                let replaced = reasons.len();
                reasons = refined;
                all_reasons = reasons
                    .iter()
                    .cloned()
                    .chain(all_reasons.into_iter().skip(replaced))
                    .collect();
                refine_used = true;
            }
        }

        let level = if total_score >= rules.thresholds.opportunity {
            Level::Opportunity
        } else if total_score <= rules.thresholds.caution {
            Level::Caution
        } else {
            Level::Observe
        };

        Evaluation {
            score: total_score,
            level,
            reasons,
            all_reasons,
            missing,
            rules_version: rules.version.clone(),
            hot_reloaded,
            refine_used,
        }
    }
}
