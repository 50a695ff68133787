//! CLI boundary. Verbs are parsed by hand and each one returns its
//! printable output, so the binary stays a thin shell around `run_cli`.

use std::io::Read;
use std::sync::atomic::AtomicBool;

use crate::context::{DirSource, Document, EventSource, FileSource, Pipeline, RESERVED_KEYS};
use crate::github::{self, GitHubClient};
use crate::home::Home;
use crate::manifest;
use crate::run::{Orchestrator, RunOverrides, RunTuning};
use crate::shared::logging::DebugLog;
use crate::template::Engine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliVerb {
    Manifest,
    Run,
    Template,
    Unknown,
}

pub fn parse_cli_verb(input: &str) -> CliVerb {
    match input {
        "manifest" => CliVerb::Manifest,
        "run" => CliVerb::Run,
        "template" => CliVerb::Template,
        _ => CliVerb::Unknown,
    }
}

pub fn cli_help_lines() -> Vec<String> {
    vec![
        "Commands:".to_string(),
        "  manifest             Read a run manifest from stdin and lay out the run".to_string(),
        "  run <run-id>         Dispatch the run's workflow and collect its outputs".to_string(),
        "  template             Render stdin against the assembled context".to_string(),
        "  --debug              Log progress details to stderr (also REFLOW_DEBUG=1)".to_string(),
    ]
}

fn help_text() -> String {
    cli_help_lines().join("\n")
}

pub fn run_cli(args: Vec<String>) -> Result<String, String> {
    let mut debug = false;
    let args: Vec<String> = args
        .into_iter()
        .filter(|arg| {
            if arg == "--debug" {
                debug = true;
                false
            } else {
                true
            }
        })
        .collect();

    let log = if debug {
        DebugLog::new(true)
    } else {
        DebugLog::from_env()
    };

    if args.is_empty() {
        return Ok(help_text());
    }

    match parse_cli_verb(args[0].as_str()) {
        CliVerb::Manifest => cmd_manifest(&log),
        CliVerb::Run => cmd_run(&args[1..], &log),
        CliVerb::Template => cmd_template(&log),
        CliVerb::Unknown => Err(format!("unknown command `{}`", args[0])),
    }
}

fn cmd_manifest(log: &DebugLog) -> Result<String, String> {
    let home = Home::resolve().map_err(|err| err.to_string())?;
    let builder = manifest::Builder { home: &home };
    let id = builder
        .build(std::io::stdin().lock())
        .map_err(|err| err.to_string())?;
    log.debug(&format!("run laid out under {}", home.run_dir(&id).display()));
    Ok(format!("::set-output name=run-id::{id}"))
}

fn cmd_run(args: &[String], log: &DebugLog) -> Result<String, String> {
    let [run_id] = args else {
        return Err("usage: run <run-id>".to_string());
    };

    let home = Home::resolve().map_err(|err| err.to_string())?;
    let github = GitHubClient::new(github::token_from_env());
    let engine = Engine::new();
    let orchestrator = Orchestrator {
        github: &github,
        engine: &engine,
        home: &home,
        log,
        tuning: RunTuning::default(),
        overrides: overrides_from_env(),
    };

    let cancel = AtomicBool::new(false);
    let outputs = orchestrator
        .run(&cancel, run_id)
        .map_err(|err| err.to_string())?;

    serde_json::to_string(&outputs).map_err(|err| format!("encoding outputs: {err}"))
}

fn cmd_template(log: &DebugLog) -> Result<String, String> {
    let home = Home::resolve().map_err(|err| err.to_string())?;
    let github = GitHubClient::new(github::token_from_env());
    let engine = Engine::new();

    let overrides = overrides_from_env();
    let mut pipeline = Pipeline::new(log);
    if let Some(path) = overrides.github_context.clone() {
        pipeline.push(FileSource::new("github", path));
    }
    if let Some(path) = overrides.values_context.clone() {
        pipeline.push(FileSource::new("values", path).templated(&engine));
    }
    pipeline.push(DirSource::new("home context", home.context_dir(), log));
    pipeline.push(EventSource::new(&github));
    pipeline.push(
        DirSource::new("home templates", home.templates_dir(), log)
            .exclude(RESERVED_KEYS)
            .templated(&engine),
    );

    let cancel = AtomicBool::new(false);
    let mut doc = Document::new();
    pipeline
        .build(&cancel, &mut doc)
        .map_err(|err| err.to_string())?;

    let mut text = String::new();
    std::io::stdin()
        .lock()
        .read_to_string(&mut text)
        .map_err(|err| format!("reading stdin: {err}"))?;

    engine.render(&text, &doc).map_err(|err| err.to_string())
}

/// Environment stand-ins for context and input files, used on runners
/// where the corresponding files are inconvenient to lay out.
fn overrides_from_env() -> RunOverrides {
    RunOverrides {
        github_context: env_nonempty("REFLOW_CONTEXT_GITHUB").map(Into::into),
        values_context: env_nonempty("REFLOW_CONTEXT_VALUES").map(Into::into),
        inputs: env_nonempty("REFLOW_INPUTS"),
    }
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}
