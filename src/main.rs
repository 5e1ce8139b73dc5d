mod cli;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use signal_flow::api::{self, ApiState};
use signal_flow::cards::{CardBuilder, schema};
use signal_flow::kv::Kv;
use signal_flow::providers::dex::DexProvider;
use signal_flow::rules::hotreload::{DEFAULT_FILES, HotConfigRegistry};
use signal_flow::rules::RuleSet;
use signal_flow::sched::{Job, Worker};
use signal_flow::{envcfg, logs, store};

fn main() {
    logs::init();
    let cli = cli::Cli::parse();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to create runtime: {e}");
            std::process::exit(2);
        }
    };

    let code = rt.block_on(run(cli.command));
    std::process::exit(code);
}

async fn run(command: cli::Command) -> i32 {
    match command {
        cli::Command::Worker => {
            let worker = match Worker::from_env().await {
                Ok(w) => w,
                Err(e) => {
                    eprintln!("worker startup failed: {e:#}");
                    return 2;
                }
            };
            match worker.run().await {
                Ok(()) => 0,
                Err(e) => {
                    eprintln!("worker crashed: {e:#}");
                    1
                }
            }
        }

        cli::Command::Serve { host, port } => {
            let state = match build_api_state().await {
                Ok(s) => s,
                Err(e) => {
                    eprintln!("serve startup failed: {e:#}");
                    return 2;
                }
            };
            match api::serve(&host, port, state).await {
                Ok(()) => 0,
                Err(e) => {
                    eprintln!("serve failed: {e:#}");
                    1
                }
            }
        }

        cli::Command::Ingest => run_single_job(Job::Ingest).await,
        cli::Command::Scan => {
            let code = run_single_job(Job::SecurityScan).await;
            if code != 0 {
                return code;
            }
            run_single_job(Job::DexScan).await
        }
        cli::Command::Verify { limit } => match Worker::from_env().await {
            Ok(worker) => {
                worker.run_verify(limit).await;
                0
            }
            Err(e) => {
                eprintln!("startup failed: {e:#}");
                2
            }
        },
        cli::Command::Dispatch => run_single_job(Job::Dispatch).await,

        cli::Command::Card { event_key, render } => {
            let state = match build_api_state().await {
                Ok(s) => s,
                Err(e) => {
                    eprintln!("startup failed: {e:#}");
                    return 2;
                }
            };
            match state.builder.build_card(&event_key, render).await {
                Ok(card) => {
                    println!("{}", serde_json::to_string_pretty(&card).unwrap_or_default());
                    0
                }
                Err(e) => {
                    eprintln!("card build failed: {e}");
                    1
                }
            }
        }

        cli::Command::Schema => {
            println!(
                "{}",
                serde_json::to_string_pretty(&schema::card_json_schema()).unwrap_or_default()
            );
            0
        }

        cli::Command::ValidateRules { dir } => validate_rules(dir),
    }
}

async fn run_single_job(job: Job) -> i32 {
    match Worker::from_env().await {
        Ok(worker) => {
            worker.run_job(job).await;
            0
        }
        Err(e) => {
            eprintln!("startup failed: {e:#}");
            2
        }
    }
}

async fn build_api_state() -> anyhow::Result<Arc<ApiState>> {
    let kv = Kv::connect().await;
    let db = store::open_from_env()?;
    let registry = HotConfigRegistry::from_env()?;
    let dex = Arc::new(DexProvider::from_env(kv.clone()));
    let builder = CardBuilder::new(db, dex, registry);
    Ok(Arc::new(ApiState { kv, builder }))
}

fn validate_rules(dir: Option<PathBuf>) -> i32 {
    let dir = dir.unwrap_or_else(|| PathBuf::from(envcfg::env_str("RULES_DIR", "rules")));
    if !dir.is_dir() {
        eprintln!("rules directory not found: {}", dir.display());
        return 2;
    }

    let files = DEFAULT_FILES.iter().map(|s| s.to_string()).collect();
    let registry = match HotConfigRegistry::new(files, dir.clone()) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("rules load failed: {e:#}");
            return 1;
        }
    };

    match RuleSet::from_yaml(&registry.get_ns("rules"), "validate") {
        Ok(set) => {
            let total: usize = set.groups.iter().map(|g| g.rules.len()).sum();
            println!(
                "rules OK: version={} groups={} rules={} combined_sha={}",
                set.version,
                set.groups.len(),
                total,
                registry.snapshot_version()
            );
            0
        }
        Err(e) => {
            eprintln!("rules validation failed: {e}");
            1
        }
    }
}
