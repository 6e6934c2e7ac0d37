use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tracing_subscriber::EnvFilter;

use rig_core::config::{load_config, ControllerConfig};
use rig_core::plan::{load_manifest, ManifestError};
use rig_core::types::{Component, Scenario};
use rigd::management::{ManagementClient, ManagementError};
use rigd::persistence::SqliteStore;
use rigd::store::{ObjectStore, StoreError};
use rigd::template::{
    RenderedTemplate, Scheme, TemplateCatalog, TemplateDef, TemplateError, TemplateResolver,
};
use rigd::validate::{validate_plan, PlanError};

const DEFAULT_CONFIG: &str = "config/rig.toml";

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("{0}")]
    Args(String),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Management(#[from] ManagementError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error("test {0:?} not found")]
    TestNotFound(String),
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode output: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Submit { test: String, manifest: PathBuf },
    Inspect { test: String },
    Save { test: String, output: PathBuf },
    Report { test: String },
    Delete { test: String },
    Validate { manifest: PathBuf, templates: Option<PathBuf> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CliArgs {
    config_path: PathBuf,
    sqlite_path: Option<PathBuf>,
    command: Command,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let mut argv = env::args();
    let program = argv.next().unwrap_or_else(|| "rig".to_string());

    match parse_cli_args(argv.collect(), &program).and_then(run) {
        Ok(()) => {}
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    }
}

fn run(args: CliArgs) -> Result<(), CliError> {
    // Validation is offline: no store needed.
    if let Command::Validate { manifest, templates } = &args.command {
        return validate_manifest(manifest, templates.as_deref());
    }

    let config = if args.config_path.exists() {
        load_config(&args.config_path).unwrap_or_default()
    } else {
        ControllerConfig::default()
    };
    let sqlite_path = args
        .sqlite_path
        .clone()
        .unwrap_or_else(|| config.store.sqlite_path.clone());
    let store = SqliteStore::open(&sqlite_path)?;
    let client = ManagementClient::new(&store, config.timeouts.management_call);

    match args.command {
        Command::Submit { test, manifest } => {
            let parsed = load_manifest(&manifest)?;
            client.submit_test(&test, &parsed, Utc::now())?;
            println!("test {test} submitted");
            Ok(())
        }
        Command::Inspect { test } => {
            let scenario = require_test(&client, &test)?;
            println!("{}", serde_json::to_string_pretty(&scenario.status)?);
            Ok(())
        }
        Command::Report { test } => {
            let scenario = require_test(&client, &test)?;
            report(&store, &scenario)
        }
        Command::Save { test, output } => {
            let scenario = require_test(&client, &test)?;
            save(&store, &scenario, &output)
        }
        Command::Delete { test } => {
            client.delete_test(&test)?;
            println!("test {test} deleted");
            Ok(())
        }
        Command::Validate { .. } => unreachable!("handled above"),
    }
}

fn require_test(client: &ManagementClient<'_>, test: &str) -> Result<Scenario, CliError> {
    client
        .get_test(test)?
        .ok_or_else(|| CliError::TestNotFound(test.to_string()))
}

fn report(store: &dyn ObjectStore, scenario: &Scenario) -> Result<(), CliError> {
    let lifecycle = &scenario.status.lifecycle;
    println!("test:   {}", scenario.meta.name);
    println!("phase:  {:?}", lifecycle.phase);
    if !lifecycle.reason.is_empty() {
        println!("reason: {}", lifecycle.reason);
    }
    if !lifecycle.message.is_empty() {
        println!("detail: {}", lifecycle.message);
    }

    let children = store.list_jobs(&scenario.meta.name, &Default::default())?;
    if !children.is_empty() {
        println!("jobs:");
        for job in children {
            println!(
                "  {:<14} {:<20} {:?} {}",
                job.kind.as_str(),
                job.meta.name,
                job.status.lifecycle.phase,
                job.status.lifecycle.reason
            );
        }
    }
    Ok(())
}

fn save(store: &dyn ObjectStore, scenario: &Scenario, output: &Path) -> Result<(), CliError> {
    fs::create_dir_all(output).map_err(|source| CliError::Write {
        path: output.to_path_buf(),
        source,
    })?;

    let scenario_path = output.join("scenario.json");
    fs::write(
        &scenario_path,
        serde_json::to_string_pretty(scenario)?,
    )
    .map_err(|source| CliError::Write {
        path: scenario_path,
        source,
    })?;

    for job in store.list_jobs(&scenario.meta.name, &Default::default())? {
        let path = output.join(format!("{}-{}.json", job.kind.as_str(), job.meta.name));
        fs::write(&path, serde_json::to_string_pretty(&job)?).map_err(|source| {
            CliError::Write { path, source }
        })?;
    }

    println!("saved test {} under {}", scenario.meta.name, output.display());
    Ok(())
}

fn validate_manifest(manifest: &Path, templates: Option<&Path>) -> Result<(), CliError> {
    let parsed = load_manifest(manifest)?;

    match templates {
        Some(dir) => {
            let catalog = load_templates(dir)?;
            validate_plan("validate", &parsed.scenario.actions, &catalog)?;
        }
        None => {
            // Without a template directory the structural checks still run;
            // template bodies are assumed resolvable.
            validate_plan("validate", &parsed.scenario.actions, &AnyTemplate)?;
        }
    }

    println!("{}: plan is valid", manifest.display());
    Ok(())
}

/// Resolver that accepts every template reference, for offline validation.
struct AnyTemplate;

impl TemplateResolver for AnyTemplate {
    fn resolve(
        &self,
        _namespace: &str,
        _name: &str,
        _scheme: &Scheme,
    ) -> Result<RenderedTemplate, TemplateError> {
        Ok(RenderedTemplate {
            spec: serde_json::Value::Object(Default::default()),
            telemetry: Vec::new(),
            component: Component::Sut,
        })
    }
}

fn load_templates(dir: &Path) -> Result<TemplateCatalog, CliError> {
    let mut catalog = TemplateCatalog::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let entries = fs::read_dir(&current).map_err(|source| CliError::Read {
            path: current.clone(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| CliError::Read {
                path: current.clone(),
                source,
            })?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().is_some_and(|ext| ext == "json") {
                let body = fs::read_to_string(&path).map_err(|source| CliError::Read {
                    path: path.clone(),
                    source,
                })?;
                let name = path
                    .strip_prefix(dir)
                    .unwrap_or(&path)
                    .with_extension("")
                    .to_string_lossy()
                    .replace('\\', "/");
                catalog.insert(name, TemplateDef::new(body));
            }
        }
    }
    Ok(catalog)
}

fn parse_cli_args(args: Vec<String>, program: &str) -> Result<CliArgs, CliError> {
    let mut config_path = PathBuf::from(DEFAULT_CONFIG);
    let mut sqlite_path = None;
    let mut templates = None;
    let mut positional = Vec::new();

    let mut idx = 0usize;
    while idx < args.len() {
        match args[idx].as_str() {
            "--help" | "-h" => return Err(CliError::Args(usage(program))),
            "--config" => {
                idx += 1;
                let value = args
                    .get(idx)
                    .ok_or_else(|| CliError::Args("missing value for --config".to_string()))?;
                config_path = PathBuf::from(value);
            }
            "--sqlite-path" => {
                idx += 1;
                let value = args.get(idx).ok_or_else(|| {
                    CliError::Args("missing value for --sqlite-path".to_string())
                })?;
                sqlite_path = Some(PathBuf::from(value));
            }
            "--templates" => {
                idx += 1;
                let value = args
                    .get(idx)
                    .ok_or_else(|| CliError::Args("missing value for --templates".to_string()))?;
                templates = Some(PathBuf::from(value));
            }
            other if other.starts_with("--") => {
                return Err(CliError::Args(format!(
                    "unknown argument: {other}\n\n{}",
                    usage(program)
                )))
            }
            other => positional.push(other.to_string()),
        }
        idx += 1;
    }

    let mut positional = positional.into_iter();
    let command = match positional.next().as_deref() {
        Some("submit") => {
            let test = expect_arg(&mut positional, "test name", program)?;
            let manifest = expect_arg(&mut positional, "manifest path", program)?;
            Command::Submit {
                test,
                manifest: PathBuf::from(manifest),
            }
        }
        Some("inspect") => Command::Inspect {
            test: expect_arg(&mut positional, "test name", program)?,
        },
        Some("save") => {
            let test = expect_arg(&mut positional, "test name", program)?;
            let output = expect_arg(&mut positional, "output directory", program)?;
            Command::Save {
                test,
                output: PathBuf::from(output),
            }
        }
        Some("report") => Command::Report {
            test: expect_arg(&mut positional, "test name", program)?,
        },
        Some("delete") => Command::Delete {
            test: expect_arg(&mut positional, "test name", program)?,
        },
        Some("validate") => Command::Validate {
            manifest: PathBuf::from(expect_arg(&mut positional, "manifest path", program)?),
            templates,
        },
        Some(other) => {
            return Err(CliError::Args(format!(
                "unknown command: {other}\n\n{}",
                usage(program)
            )))
        }
        None => return Err(CliError::Args(usage(program))),
    };

    if let Some(extra) = positional.next() {
        return Err(CliError::Args(format!(
            "unexpected argument: {extra}\n\n{}",
            usage(program)
        )));
    }

    Ok(CliArgs {
        config_path,
        sqlite_path,
        command,
    })
}

fn expect_arg(
    positional: &mut impl Iterator<Item = String>,
    what: &str,
    program: &str,
) -> Result<String, CliError> {
    positional
        .next()
        .ok_or_else(|| CliError::Args(format!("missing {what}\n\n{}", usage(program))))
}

fn usage(program: &str) -> String {
    format!(
        "Usage: {program} [--config <path>] [--sqlite-path <path>] <command>\n\
Commands:\n\
  submit   <test> <manifest>   submit a scenario manifest as a new test\n\
  inspect  <test>              print the test status block\n\
  report   <test>              print the test and its jobs\n\
  save     <test> <dir>        dump the test and its jobs as JSON files\n\
  delete   <test>              delete the test and everything it owns\n\
  validate <manifest>          validate a manifest offline\n\
           [--templates <dir>]   resolve template references against <dir>"
    )
}
