//! Hot-reload registry for the rules directory.
//!
//! YAML files are scanned on demand (throttled to one check per second),
//! change-detected by mtime then SHA1, and published as immutable snapshots.
//! A file that stops parsing keeps its last-good namespace; the initial load
//! is strict. Readers take an `Arc` snapshot and never block writers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Instant, SystemTime};

use anyhow::{Result, bail};
use regex::Regex;
use sha1::{Digest, Sha1};

use crate::envcfg;
use crate::metrics;

pub const MAX_FILE_BYTES: u64 = 262_144;

const MIN_COOLDOWN_SECS: f64 = 1.0;

/// Env names honored inside `${NAME:default}` tokens; anything else is left
/// literal.
const ALLOWED_ENVS: [&str; 3] = ["THETA_LIQ", "THETA_VOL", "THETA_SENT"];

/// Default file set, matching the original deployment.
pub const DEFAULT_FILES: [&str; 4] = [
    "rules.yml",
    "risk_rules.yml",
    "onchain.yml",
    "topic_merge.yml",
];

/// One published configuration snapshot. Never mutated after publish.
pub struct Snapshot {
    namespaces: HashMap<String, serde_yaml::Value>,
    shas: HashMap<String, String>,
    version: String,
}

#[derive(Clone)]
struct FileState {
    mtime: SystemTime,
    sha1: String,
}

struct ReloadState {
    file_states: HashMap<String, FileState>,
    last_check: Option<Instant>,
}

pub struct HotConfigRegistry {
    files: Vec<String>,
    rules_dir: PathBuf,
    enabled: bool,
    snapshot: RwLock<Arc<Snapshot>>,
    state: Mutex<ReloadState>,
}

impl HotConfigRegistry {
    /// Build from `RULES_DIR` and the default file set.
    pub fn from_env() -> Result<Arc<HotConfigRegistry>> {
        let dir = envcfg::env_str("RULES_DIR", "rules");
        let files = DEFAULT_FILES.iter().map(|s| s.to_string()).collect();
        Self::new(files, PathBuf::from(dir))
    }

    /// Strict initial load: a configured file that exists but fails to parse
    /// aborts startup. Missing files are tolerated.
    pub fn new(files: Vec<String>, rules_dir: PathBuf) -> Result<Arc<HotConfigRegistry>> {
        let enabled = envcfg::env_bool("CONFIG_HOTRELOAD_ENABLED", true);

        let mut namespaces = HashMap::new();
        let mut shas = HashMap::new();
        let mut file_states = HashMap::new();

        for filename in &files {
            let Some(ns) = filename_to_namespace(filename) else {
                tracing::warn!(stage = "config.reload.error", ns = %filename, reason = "invalid_filename");
                continue;
            };
            let path = rules_dir.join(filename);
            if !path.exists() {
                tracing::warn!(stage = "config.reload.error", ns = %ns, reason = "file_not_found");
                continue;
            }

            let meta = std::fs::metadata(&path)?;
            if meta.len() > MAX_FILE_BYTES {
                bail!("config file {} exceeds {} bytes", path.display(), MAX_FILE_BYTES);
            }
            let content = std::fs::read_to_string(&path)?;
            let substituted = substitute_env(&content);
            let parsed: serde_yaml::Value = match serde_yaml::from_str(&substituted) {
                Ok(serde_yaml::Value::Null) => serde_yaml::Value::Mapping(Default::default()),
                Ok(v) => v,
                Err(e) => bail!("failed to parse {}: {e}", path.display()),
            };

            let sha = sha1_hex(&content);
            tracing::info!(stage = "config.applied", ns = %ns, sha = %&sha[..8]);
            namespaces.insert(ns.clone(), parsed);
            shas.insert(ns, sha.clone());
            file_states.insert(
                filename.clone(),
                FileState {
                    mtime: meta.modified()?,
                    sha1: sha,
                },
            );
        }

        let version = combined_version(&namespaces, &shas);
        publish_metrics(&version);

        Ok(Arc::new(HotConfigRegistry {
            files,
            rules_dir,
            enabled,
            snapshot: RwLock::new(Arc::new(Snapshot {
                namespaces,
                shas,
                version,
            })),
            state: Mutex::new(ReloadState {
                file_states,
                last_check: None,
            }),
        }))
    }

    /// Check for file changes and atomically publish a new snapshot when
    /// anything reparsed. Throttled to one check per second unless forced.
    /// Returns true if a new snapshot was published.
    pub fn reload_if_stale(&self, force: bool) -> bool {
        if !self.enabled && !force {
            return false;
        }

        {
            let mut state = self.state.lock().unwrap();
            if !force {
                if let Some(last) = state.last_check {
                    if last.elapsed().as_secs_f64() < MIN_COOLDOWN_SECS {
                        return false;
                    }
                }
            }
            state.last_check = Some(Instant::now());
        }

        let started = Instant::now();
        let changed = self.check_and_reload();
        if changed {
            let version = self.snapshot_version();
            tracing::info!(
                stage = "config.reload",
                new_sha = %&version[..version.len().min(8)],
                elapsed_ms = started.elapsed().as_millis() as u64,
            );
        }
        changed
    }

    fn check_and_reload(&self) -> bool {
        let old = self.snapshot.read().unwrap().clone();
        let mut state = self.state.lock().unwrap();

        let mut namespaces = HashMap::new();
        let mut shas = HashMap::new();
        let mut file_states = HashMap::new();
        let mut any_changed = false;

        for filename in &self.files {
            let Some(ns) = filename_to_namespace(filename) else {
                continue;
            };
            let path = self.rules_dir.join(filename);

            let keep_old = |namespaces: &mut HashMap<String, serde_yaml::Value>,
                            shas: &mut HashMap<String, String>,
                            file_states: &mut HashMap<String, FileState>,
                            state: &ReloadState| {
                if let Some(v) = old.namespaces.get(&ns) {
                    namespaces.insert(ns.clone(), v.clone());
                    if let Some(sha) = old.shas.get(&ns) {
                        shas.insert(ns.clone(), sha.clone());
                    }
                    if let Some(fs) = state.file_states.get(filename) {
                        file_states.insert(filename.clone(), fs.clone());
                    }
                }
            };

            if !path.exists() {
                // Deleted file keeps its last-good namespace.
                keep_old(&mut namespaces, &mut shas, &mut file_states, &state);
                continue;
            }

            let meta = match std::fs::metadata(&path) {
                Ok(m) => m,
                Err(e) => {
                    metrics::CONFIG_RELOAD_ERRORS_TOTAL.inc();
                    tracing::warn!(stage = "config.reload.error", ns = %ns, reason = "stat_error", error = %e);
                    keep_old(&mut namespaces, &mut shas, &mut file_states, &state);
                    continue;
                }
            };

            if meta.len() > MAX_FILE_BYTES {
                metrics::CONFIG_RELOAD_ERRORS_TOTAL.inc();
                tracing::warn!(stage = "config.reload.error", ns = %ns, reason = "file_size_exceeded", size = meta.len());
                keep_old(&mut namespaces, &mut shas, &mut file_states, &state);
                continue;
            }

            let mtime = meta.modified().ok();
            let old_state = state.file_states.get(filename);
            if let (Some(mtime), Some(prev)) = (mtime, old_state) {
                if prev.mtime == mtime {
                    keep_old(&mut namespaces, &mut shas, &mut file_states, &state);
                    continue;
                }
            }

            let content = match std::fs::read_to_string(&path) {
                Ok(c) => c,
                Err(e) => {
                    metrics::CONFIG_RELOAD_ERRORS_TOTAL.inc();
                    tracing::warn!(stage = "config.reload.error", ns = %ns, reason = "io_error", error = %e);
                    keep_old(&mut namespaces, &mut shas, &mut file_states, &state);
                    continue;
                }
            };

            let sha = sha1_hex(&content);
            if let Some(prev) = old_state {
                if prev.sha1 == sha {
                    // Touched but identical content: remember the new mtime.
                    if let (Some(v), Some(mtime)) = (old.namespaces.get(&ns), mtime) {
                        namespaces.insert(ns.clone(), v.clone());
                        shas.insert(ns.clone(), sha.clone());
                        file_states.insert(filename.clone(), FileState { mtime, sha1: sha });
                    }
                    continue;
                }
            }

            let substituted = substitute_env(&content);
            match serde_yaml::from_str::<serde_yaml::Value>(&substituted) {
                Ok(parsed) => {
                    let parsed = match parsed {
                        serde_yaml::Value::Null => serde_yaml::Value::Mapping(Default::default()),
                        v => v,
                    };
                    let old_sha = old.shas.get(&ns).map(|s| s[..8].to_string());
                    tracing::info!(
                        stage = "config.applied",
                        ns = %ns,
                        old_sha = old_sha.as_deref().unwrap_or(""),
                        new_sha = %&sha[..8],
                    );
                    namespaces.insert(ns.clone(), parsed);
                    shas.insert(ns.clone(), sha.clone());
                    if let Some(mtime) = mtime {
                        file_states.insert(filename.clone(), FileState { mtime, sha1: sha });
                    }
                    any_changed = true;
                }
                Err(e) => {
                    metrics::CONFIG_RELOAD_ERRORS_TOTAL.inc();
                    tracing::warn!(
                        stage = "config.reload.error",
                        ns = %ns,
                        reason = "yaml_parse_error",
                        error = %e.to_string().chars().take(200).collect::<String>(),
                    );
                    keep_old(&mut namespaces, &mut shas, &mut file_states, &state);
                }
            }
        }

        if !any_changed {
            return false;
        }

        let version = combined_version(&namespaces, &shas);
        publish_metrics(&version);
        metrics::CONFIG_RELOAD_TOTAL.inc();

        state.file_states = file_states;
        let mut guard = self.snapshot.write().unwrap();
        *guard = Arc::new(Snapshot {
            namespaces,
            shas,
            version,
        });
        true
    }

    /// RCU read: clone the namespace value out of the current snapshot.
    pub fn get_ns(&self, ns: &str) -> serde_yaml::Value {
        let snap = self.snapshot.read().unwrap().clone();
        snap.namespaces
            .get(ns)
            .cloned()
            .unwrap_or(serde_yaml::Value::Mapping(Default::default()))
    }

    /// Navigate `ns.key.key…`; returns `default` on any miss.
    pub fn get_path(&self, dotted: &str, default: serde_yaml::Value) -> serde_yaml::Value {
        let mut parts = dotted.split('.');
        let Some(ns) = parts.next() else {
            return default;
        };
        let mut current = self.get_ns(ns);
        for part in parts {
            match current.get(part) {
                Some(v) => current = v.clone(),
                None => return default,
            }
        }
        current
    }

    /// Current combined version: first 12 hex of SHA1 over per-file SHA1s in
    /// sorted-namespace order, or `empty`.
    pub fn snapshot_version(&self) -> String {
        self.snapshot.read().unwrap().version.clone()
    }

    /// SHA1 of one namespace's backing file, if loaded.
    pub fn ns_sha(&self, ns: &str) -> Option<String> {
        self.snapshot.read().unwrap().shas.get(ns).cloned()
    }

    /// Install a SIGHUP handler that forces one reload per signal.
    #[cfg(unix)]
    pub fn install_signal_handler(self: &Arc<Self>) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let Ok(mut hup) =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            else {
                tracing::warn!(stage = "config.reload", reason = "sighup_unavailable");
                return;
            };
            tracing::info!(stage = "config.reload", message = "SIGHUP handler installed");
            while hup.recv().await.is_some() {
                tracing::info!(stage = "config.reload", reason = "sighup");
                registry.reload_if_stale(true);
            }
        });
    }
}

fn publish_metrics(version: &str) {
    metrics::CONFIG_VERSION.reset();
    metrics::CONFIG_VERSION.with_label_values(&[version]).set(1.0);
    metrics::CONFIG_LAST_SUCCESS_UNIXTIME.set(chrono::Utc::now().timestamp() as f64);
}

/// `thresholds.yml` → `thresholds`; names outside `[-_a-z0-9]+` are invalid.
pub fn filename_to_namespace(filename: &str) -> Option<String> {
    let stem = filename.strip_suffix(".yml")?;
    let ok = !stem.is_empty()
        && stem
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
    ok.then(|| stem.to_string())
}

fn sha1_hex(content: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn combined_version(
    namespaces: &HashMap<String, serde_yaml::Value>,
    shas: &HashMap<String, String>,
) -> String {
    let mut keys: Vec<&String> = namespaces.keys().collect();
    keys.sort();
    let combined: String = keys
        .iter()
        .filter_map(|ns| shas.get(*ns).cloned())
        .collect();
    if combined.is_empty() {
        return "empty".to_string();
    }
    sha1_hex(&combined)[..12].to_string()
}

/// Replace `${NAME:default}` tokens for whitelisted env names; numeric-looking
/// values are passed through as numbers.
pub fn substitute_env(content: &str) -> String {
    let re = Regex::new(r"\$\{([A-Z_]+):([^}]*)\}").unwrap();
    re.replace_all(content, |caps: &regex::Captures| {
        let name = &caps[1];
        let default = &caps[2];
        if !ALLOWED_ENVS.contains(&name) {
            return caps[0].to_string();
        }
        let value = std::env::var(name).unwrap_or_else(|_| default.to_string());
        if let Ok(i) = value.trim().parse::<i64>() {
            return i.to_string();
        }
        if let Ok(f) = value.trim().parse::<f64>() {
            return f.to_string();
        }
        value
    })
    .to_string()
}
