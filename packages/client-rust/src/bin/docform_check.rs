//! `docform-check`: registers a schema, evaluates it over a document and
//! prints field states, validation errors, the widget tree and the submit
//! payload as JSON.
//!
//! The document comes from `--values` (a JSON file), from a live site
//! (`--doc` plus `--base-url` and token credentials), or is a new document.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use docform_client::{logging, ClientConfig, FormSession, RestBackend, SessionConfig};
use docform_core::{FormCore, Schema, SchemaDef, Values};
use serde_json::json;

#[derive(Debug, Parser)]
#[command(version, about = "Evaluate a form schema against a document")]
struct Args {
    /// Schema definition (JSON)
    #[arg(long)]
    schema: PathBuf,
    /// Document values (JSON object)
    #[arg(long, conflicts_with = "doc")]
    values: Option<PathBuf>,
    /// Load this document from the site instead
    #[arg(long)]
    doc: Option<String>,
    #[arg(long, env = "DOCFORM_BASE_URL", default_value = "http://localhost:8000")]
    base_url: String,
    #[arg(long, env = "DOCFORM_API_KEY")]
    api_key: Option<String>,
    #[arg(long, env = "DOCFORM_API_SECRET", hide_env_values = true)]
    api_secret: Option<String>,
    /// Log as JSON lines on stderr
    #[arg(long)]
    json_logs: bool,
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

async fn load_form(args: &Args, schema: Arc<Schema>) -> anyhow::Result<FormCore> {
    if let Some(path) = &args.values {
        let values: Values = read_json(path)?;
        return Ok(FormCore::load(schema, values));
    }
    let Some(name) = &args.doc else {
        return Ok(FormCore::new_document(schema));
    };
    let backend = RestBackend::new(&ClientConfig {
        base_url: args.base_url.clone(),
        api_key: args.api_key.clone(),
        api_secret: args.api_secret.clone(),
        ..ClientConfig::default()
    })?;
    let session = FormSession::open(Arc::new(backend), Arc::clone(&schema), SessionConfig::default(), name).await?;
    let form = FormCore::load(schema, session.snapshot());
    session.close();
    Ok(form)
}

async fn run(args: &Args) -> anyhow::Result<bool> {
    let def: SchemaDef = read_json(&args.schema)?;
    let schema = Arc::new(Schema::new(def).context("schema rejected")?);
    let form = load_form(args, schema).await?;

    let errors = form.validate();
    let report = json!({
        "doctype": form.schema().doctype(),
        "name": form.document_name(),
        "field_states": form.field_states(),
        "errors": errors
            .iter()
            .map(|e| json!({ "error": e, "message": e.to_string() }))
            .collect::<Vec<_>>(),
        "tabs": form.render(),
        "payload": form.submit_payload(&[]),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    tracing::info!(errors = errors.len(), "check complete");
    Ok(errors.is_empty())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    if let Err(error) = logging::init(args.json_logs) {
        eprintln!("logging: {error:#}");
    }
    match run(&args).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::from(2)
        }
    }
}
