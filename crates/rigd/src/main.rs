use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rig_core::config::{load_config, ConfigError, ControllerConfig};
use rig_core::lifecycle::Phase;
use rig_core::plan::{load_manifest, ManifestError};
use rig_core::types::ObjectKind;
use rig_core::validation::{Validate, ValidationLevel};
use rigd::alerts::AlertRegistry;
use rigd::clock::{Clock, SystemClock};
use rigd::exec::LocalExec;
use rigd::group::GroupController;
use rigd::management::{ManagementClient, ManagementError};
use rigd::persistence::SqliteStore;
use rigd::reconciler::{MemoryEvents, Outcome, ScenarioReconciler};
use rigd::registry::ClientRegistry;
use rigd::store::{ObjectStore, StoreError};
use rigd::template::{TemplateCatalog, TemplateDef};

const DEFAULT_CONFIG: &str = "config/rig.toml";
const DEFAULT_TEMPLATE_DIR: &str = "templates";
const IDLE_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
struct CliArgs {
    config_path: PathBuf,
    template_dir: PathBuf,
    sqlite_path: Option<PathBuf>,
    scenario: Option<PathBuf>,
    once: bool,
}

#[derive(Debug, thiserror::Error)]
enum MainError {
    #[error("{0}")]
    Args(String),
    #[error("failed to load config at {path}: {source}")]
    LoadConfig {
        path: PathBuf,
        #[source]
        source: ConfigError,
    },
    #[error("{0}")]
    InvalidConfig(String),
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read templates under {path}: {source}")]
    Templates {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Management(#[from] ManagementError),
    #[error("reconcile error: {0}")]
    Reconcile(String),
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    if let Err(err) = run() {
        eprintln!("rigd failed: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), MainError> {
    let mut argv = env::args();
    let program = argv.next().unwrap_or_else(|| "rigd".to_string());
    let args = parse_cli_args(argv.collect::<Vec<_>>(), &program)?;

    let config = if args.config_path.exists() {
        load_config(&args.config_path).map_err(|source| MainError::LoadConfig {
            path: args.config_path.clone(),
            source,
        })?
    } else {
        ControllerConfig::default()
    };
    reject_config_errors(&config)?;

    let sqlite_path = args
        .sqlite_path
        .clone()
        .unwrap_or_else(|| config.store.sqlite_path.clone());
    if let Some(parent) = sqlite_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| MainError::CreateDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let store = SqliteStore::open(&sqlite_path)?;
    let templates = load_templates(&args.template_dir)?;
    let alerts = AlertRegistry::new();
    let clock = SystemClock;
    let events = MemoryEvents::new();
    let clients = ClientRegistry::new();
    let exec = LocalExec::new(config.timeouts.management_call);

    if let Some(manifest_path) = &args.scenario {
        let manifest = load_manifest(manifest_path)?;
        let name = manifest_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("scenario")
            .to_string();
        let client = ManagementClient::new(&store, config.timeouts.management_call);
        match client.submit_test(&name, &manifest, clock.now()) {
            Ok(_) => info!(test = %name, "scenario submitted"),
            Err(ManagementError::AlreadyExists { .. }) => {
                info!(test = %name, "scenario already submitted")
            }
            Err(err) => return Err(err.into()),
        }
    }

    let reconciler = ScenarioReconciler {
        store: &store,
        templates: &templates,
        exec: &exec,
        alerts: &alerts,
        clock: &clock,
        events: &events,
        clients: &clients,
        config: &config,
    };
    let groups = GroupController {
        store: &store,
        exec: &exec,
        alerts: &alerts,
        clock: &clock,
    };

    info!(sqlite = %sqlite_path.display(), "rigd running");

    loop {
        let mut wake: Option<Duration> = None;
        let mut all_terminal = true;

        let scenarios = store.list_scenarios()?;
        for scenario in &scenarios {
            let outcome = reconciler
                .reconcile(&scenario.meta.name)
                .map_err(|err| MainError::Reconcile(err.to_string()))?;
            track_outcome(&mut wake, outcome);

            if !scenario.status.lifecycle.phase.is_terminal() {
                all_terminal = false;
            }

            // Drive the group children of this scenario.
            for kind in [ObjectKind::Cluster, ObjectKind::Cascade, ObjectKind::Call] {
                let groups_of_kind = store
                    .list_jobs(&scenario.meta.name, &Default::default())?
                    .into_iter()
                    .filter(|job| job.kind == kind)
                    .collect::<Vec<_>>();
                for group in groups_of_kind {
                    let outcome = groups
                        .reconcile(&group.meta.namespace, kind, &group.meta.name)
                        .map_err(|err| MainError::Reconcile(err.to_string()))?;
                    track_outcome(&mut wake, outcome);
                }
            }
        }

        if args.once || (all_terminal && !scenarios.is_empty()) {
            report(&store)?;
            return Ok(());
        }
        if scenarios.is_empty() {
            warn!("no scenarios in the store; waiting");
        }

        thread::sleep(wake.unwrap_or(IDLE_TICK).min(Duration::from_secs(60)));
    }
}

fn track_outcome(wake: &mut Option<Duration>, outcome: Outcome) {
    let candidate = match outcome {
        Outcome::Stop => return,
        Outcome::Requeue => Duration::ZERO,
        Outcome::RequeueAfter(after) => after,
    };
    *wake = Some(match wake {
        Some(current) => (*current).min(candidate),
        None => candidate,
    });
}

fn report(store: &dyn ObjectStore) -> Result<(), MainError> {
    for scenario in store.list_scenarios()? {
        let lifecycle = &scenario.status.lifecycle;
        info!(
            test = %scenario.meta.name,
            phase = ?lifecycle.phase,
            reason = %lifecycle.reason,
            "final state"
        );
        if lifecycle.phase == Phase::Failed {
            warn!(test = %scenario.meta.name, message = %lifecycle.message, "failure detail");
        }
    }
    Ok(())
}

fn reject_config_errors(config: &ControllerConfig) -> Result<(), MainError> {
    let errors: Vec<String> = config
        .validate()
        .into_iter()
        .filter(|issue| issue.level == ValidationLevel::Error)
        .map(|issue| format!("{}: {}", issue.code, issue.message))
        .collect();

    if errors.is_empty() {
        return Ok(());
    }
    Err(MainError::InvalidConfig(format!(
        "config validation failed ({})",
        errors.join("; ")
    )))
}

/// Load every `<dir>/<group>/<name>.json` file as template `<group>/<name>`.
fn load_templates(dir: &Path) -> Result<TemplateCatalog, MainError> {
    let mut catalog = TemplateCatalog::new();
    if !dir.exists() {
        return Ok(catalog);
    }

    let mut stack = vec![dir.to_path_buf()];
    let mut bodies: HashMap<String, String> = HashMap::new();
    while let Some(current) = stack.pop() {
        let entries = fs::read_dir(&current).map_err(|source| MainError::Templates {
            path: current.clone(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| MainError::Templates {
                path: current.clone(),
                source,
            })?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().is_some_and(|ext| ext == "json") {
                let body = fs::read_to_string(&path).map_err(|source| MainError::Templates {
                    path: path.clone(),
                    source,
                })?;
                let name = path
                    .strip_prefix(dir)
                    .unwrap_or(&path)
                    .with_extension("")
                    .to_string_lossy()
                    .replace('\\', "/");
                bodies.insert(name, body);
            }
        }
    }

    for (name, body) in bodies {
        catalog.insert(name, TemplateDef::new(body));
    }
    Ok(catalog)
}

fn parse_cli_args(args: Vec<String>, program: &str) -> Result<CliArgs, MainError> {
    let mut parsed = CliArgs {
        config_path: PathBuf::from(DEFAULT_CONFIG),
        template_dir: PathBuf::from(DEFAULT_TEMPLATE_DIR),
        sqlite_path: None,
        scenario: None,
        once: false,
    };

    let mut idx = 0usize;
    while idx < args.len() {
        match args[idx].as_str() {
            "--help" | "-h" => return Err(MainError::Args(usage(program))),
            "--config" => {
                idx += 1;
                let value = args
                    .get(idx)
                    .ok_or_else(|| MainError::Args("missing value for --config".to_string()))?;
                parsed.config_path = PathBuf::from(value);
            }
            "--templates" => {
                idx += 1;
                let value = args
                    .get(idx)
                    .ok_or_else(|| MainError::Args("missing value for --templates".to_string()))?;
                parsed.template_dir = PathBuf::from(value);
            }
            "--sqlite-path" => {
                idx += 1;
                let value = args.get(idx).ok_or_else(|| {
                    MainError::Args("missing value for --sqlite-path".to_string())
                })?;
                parsed.sqlite_path = Some(PathBuf::from(value));
            }
            "--scenario" => {
                idx += 1;
                let value = args
                    .get(idx)
                    .ok_or_else(|| MainError::Args("missing value for --scenario".to_string()))?;
                parsed.scenario = Some(PathBuf::from(value));
            }
            "--once" => parsed.once = true,
            other => {
                return Err(MainError::Args(format!(
                    "unknown argument: {other}\n\n{}",
                    usage(program)
                )))
            }
        }
        idx += 1;
    }

    Ok(parsed)
}

fn usage(program: &str) -> String {
    format!(
        "Usage: {program} [--config <path>] [--templates <dir>] [--sqlite-path <path>] \
         [--scenario <manifest>] [--once]\n\
Defaults:\n\
  --config    {DEFAULT_CONFIG}\n\
  --templates {DEFAULT_TEMPLATE_DIR}"
    )
}
