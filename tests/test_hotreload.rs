use std::path::PathBuf;
use std::time::Duration;

use signal_flow::rules::hotreload::HotConfigRegistry;
use signal_flow::rules::{Level, RuleEngine};

// ── Helpers ─────────────────────────────────────────────────────────

fn write_rules(dir: &std::path::Path, opportunity: i64) {
    let body = format!(
        r#"version: test-{opportunity}
groups:
  - name: liquidity
    priority: 80
    rules:
      - id: deep_liquidity
        when: "dex_liquidity >= 100000"
        score: 12
        reason: "流动性充足"
scoring:
  thresholds:
    opportunity: {opportunity}
    caution: -5
missing_map:
  dex: "DEX 数据缺失"
"#
    );
    std::fs::write(dir.join("rules.yml"), body).unwrap();
}

fn registry_for(dir: &std::path::Path) -> std::sync::Arc<HotConfigRegistry> {
    HotConfigRegistry::new(vec!["rules.yml".to_string()], PathBuf::from(dir)).unwrap()
}

fn ctx(liquidity: f64) -> serde_json::Map<String, serde_json::Value> {
    let mut ctx = serde_json::Map::new();
    ctx.insert("dex_liquidity".to_string(), serde_json::json!(liquidity));
    ctx
}

// ── Hot reload behavior ─────────────────────────────────────────────

#[tokio::test]
async fn threshold_change_flips_level_after_reload() {
    let tmp = tempfile::tempdir().unwrap();
    write_rules(tmp.path(), 15);

    let registry = registry_for(tmp.path());
    let engine = RuleEngine::new(registry.clone());

    // Score 12 is below the opportunity threshold of 15.
    let before = engine.evaluate(&ctx(200_000.0));
    assert_eq!(before.score, 12.0);
    assert_eq!(before.level, Level::Observe);
    let old_version = before.rules_version.clone();

    // Rewrite with a lower threshold; wait out the reload cooldown and the
    // mtime granularity.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    write_rules(tmp.path(), 10);

    let after = engine.evaluate(&ctx(200_000.0));
    assert_eq!(after.level, Level::Opportunity);
    assert!(after.hot_reloaded);
    assert_ne!(after.rules_version, old_version);
}

#[tokio::test]
async fn parse_error_keeps_last_good_snapshot() {
    let tmp = tempfile::tempdir().unwrap();
    write_rules(tmp.path(), 15);

    let registry = registry_for(tmp.path());
    let good = registry.get_ns("rules");
    let good_version = registry.snapshot_version();

    tokio::time::sleep(Duration::from_millis(1100)).await;
    std::fs::write(tmp.path().join("rules.yml"), "groups: [ {{{ not yaml").unwrap();
    registry.reload_if_stale(true);

    assert_eq!(registry.get_ns("rules"), good);
    assert_eq!(registry.snapshot_version(), good_version);

    // Valid content again replaces the snapshot.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    write_rules(tmp.path(), 20);
    registry.reload_if_stale(true);
    assert_ne!(registry.snapshot_version(), good_version);
}

#[tokio::test]
async fn validation_failure_keeps_last_good_rule_set() {
    let tmp = tempfile::tempdir().unwrap();
    write_rules(tmp.path(), 15);

    let registry = registry_for(tmp.path());
    let engine = RuleEngine::new(registry.clone());
    let before = engine.evaluate(&ctx(200_000.0));
    assert_eq!(before.score, 12.0);

    // Parsable YAML whose rules fail validation (unsafe expression) must
    // not replace the live rule set.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let evil = r#"version: evil
groups:
  - name: g
    rules:
      - when: "open('/etc/passwd')"
        score: 1
        reason: "x"
scoring:
  thresholds:
    caution: -5
missing_map:
  dex: "missing"
"#;
    std::fs::write(tmp.path().join("rules.yml"), evil).unwrap();
    registry.reload_if_stale(true);

    let after = engine.evaluate(&ctx(200_000.0));
    assert_eq!(after.score, 12.0);
    assert_eq!(after.rules_version, before.rules_version);
}

#[tokio::test]
async fn rule_file_size_cap_is_exact() {
    let tmp = tempfile::tempdir().unwrap();
    write_rules(tmp.path(), 15);
    let registry = registry_for(tmp.path());

    // Exactly 256 KiB of valid YAML is accepted.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let mut exact = std::fs::read_to_string(tmp.path().join("rules.yml")).unwrap();
    exact.push_str("\n# ");
    exact.push_str(&"x".repeat(262_144 - exact.len() - 1));
    exact.push('\n');
    assert_eq!(exact.len(), 262_144);
    std::fs::write(tmp.path().join("rules.yml"), &exact).unwrap();
    assert!(registry.reload_if_stale(true));
    let accepted_version = registry.snapshot_version();

    // One byte past the cap keeps the previous snapshot.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    exact.insert(exact.len() - 1, 'x');
    assert_eq!(exact.len(), 262_145);
    std::fs::write(tmp.path().join("rules.yml"), &exact).unwrap();
    registry.reload_if_stale(true);
    assert_eq!(registry.snapshot_version(), accepted_version);
}

#[tokio::test]
async fn initial_load_with_broken_file_fails() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(tmp.path().join("rules.yml"), "{{{ not yaml").unwrap();
    assert!(HotConfigRegistry::new(vec!["rules.yml".to_string()], tmp.path().to_path_buf()).is_err());
}

#[tokio::test]
async fn missing_files_are_tolerated_at_startup() {
    let tmp = tempfile::tempdir().unwrap();
    write_rules(tmp.path(), 15);
    let registry = HotConfigRegistry::new(
        vec!["rules.yml".to_string(), "risk_rules.yml".to_string()],
        tmp.path().to_path_buf(),
    )
    .unwrap();
    assert!(registry.get_ns("risk_rules").as_mapping().unwrap().is_empty());
}

#[tokio::test]
async fn get_path_navigates_namespaces() {
    let tmp = tempfile::tempdir().unwrap();
    write_rules(tmp.path(), 15);
    let registry = registry_for(tmp.path());

    let v = registry.get_path("rules.scoring.thresholds.opportunity", serde_yaml::Value::Null);
    assert_eq!(v.as_i64(), Some(15));

    let missing = registry.get_path("rules.scoring.nope", serde_yaml::Value::String("d".into()));
    assert_eq!(missing.as_str(), Some("d"));
}
