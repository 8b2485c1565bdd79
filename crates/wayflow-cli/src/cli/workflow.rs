//! Workflow commands: validate, run, import, exec, list, delete, undelete
//! and functions.

use std::path::Path;

use anyhow::{bail, Context, Result};
use comfy_table::{presets, Cell, Color, ContentArrangement, Table};
use console::style;

use wayflow_core::repository::{SessionRepository, WorkflowRepository};
use wayflow_core::service::access::AllowAll;
use wayflow_core::service::workflow::WorkflowService;
use wayflow_core::service::ServiceError;
use wayflow_core::workflow::definition::load_workflow_file;
use wayflow_types::config::EngineConfig;
use wayflow_types::identity::Identity;
use wayflow_types::scope::Scope;
use wayflow_types::session::SessionStartParams;
use wayflow_types::workflow::{DeletedFilter, WorkflowDefinition, WorkflowFilter};

use crate::cli::session::print_record;
use crate::state::{scratch, AppState};

// ---------------------------------------------------------------------------
// Validate
// ---------------------------------------------------------------------------

pub async fn validate(file: &Path, config: &EngineConfig, json: bool) -> Result<()> {
    let def = load_file(file)?;

    // Compiling needs the function registry and the expression parser.
    let service = scratch(config.clone());
    let stored = service.create(&Identity::system(), def).await?;
    let orphans = service
        .graph(stored.id)
        .map(|g| g.orphans())
        .unwrap_or_default();

    if json {
        let out = serde_json::json!({
            "handle": stored.handle,
            "name": stored.meta.name,
            "steps": stored.steps.len(),
            "paths": stored.paths.len(),
            "start_steps": orphans,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!();
        println!(
            "  {} Workflow '{}' is valid",
            style("*").green().bold(),
            style(&stored.handle).cyan()
        );
        println!("  Steps: {}", stored.steps.len());
        println!("  Paths: {}", stored.paths.len());
        println!("  Start steps: {orphans:?}");
        println!();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Run (in memory)
// ---------------------------------------------------------------------------

pub async fn run(
    file: &Path,
    input: Option<&str>,
    step: Option<u64>,
    trace: bool,
    config: &EngineConfig,
    json: bool,
) -> Result<()> {
    let def = load_file(file)?;
    let input = parse_input(input)?;

    let service = scratch(config.clone());
    let who = Identity::system();
    let stored = service.create(&who, def).await?;

    let params = SessionStartParams {
        workflow_id: stored.id,
        step_id: step.unwrap_or(0),
        input,
        event_type: "cli".to_string(),
        resource_type: "file".to_string(),
        invoker: who.clone(),
        trace,
        wait: true,
    };
    let session = service.exec(params).await?;
    service.sessions().flush().await;

    let record = service.sessions().find_by_id(&who, session.id()).await?;
    print_record(&record, json)?;

    if !json && !record.states.is_empty() {
        println!(
            "  {} The session is suspended and lives only in memory. Use {} then {} to resume it later.",
            style("!").yellow().bold(),
            style("wayflow import").dim(),
            style("wayflow exec").dim()
        );
        println!();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Import
// ---------------------------------------------------------------------------

pub async fn import(state: &AppState, file: &Path, disabled: bool, json: bool) -> Result<()> {
    let mut def = load_file(file)?;
    def.enabled = !disabled;
    let who = Identity::system();

    let existing = match state.service.lookup_by_handle(&who, &def.handle).await {
        Ok(existing) => Some(existing),
        Err(ServiceError::WorkflowNotFound(_)) => None,
        Err(e) => return Err(e.into()),
    };

    let (stored, verb) = match existing {
        Some(existing) => {
            def.id = existing.id;
            def.updated_at = existing.updated_at;
            let before = existing.updated_at;
            let stored = state.service.update(&who, def).await?;
            let verb = if stored.updated_at == before {
                "Unchanged"
            } else {
                "Updated"
            };
            (stored, verb)
        }
        None => (state.service.create(&who, def).await?, "Imported"),
    };

    if json {
        let out = serde_json::json!({
            "id": stored.id,
            "handle": stored.handle,
            "enabled": stored.enabled,
            "steps": stored.steps.len(),
            "result": verb.to_lowercase(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!();
        println!(
            "  {} {verb} workflow '{}'",
            style("*").green().bold(),
            style(&stored.handle).cyan()
        );
        println!("  ID: {}", stored.id);
        println!("  Steps: {}", stored.steps.len());
        if !stored.enabled {
            println!("  Status: {}", style("disabled").yellow());
        }
        println!();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Exec (stored)
// ---------------------------------------------------------------------------

pub async fn exec(
    state: &AppState,
    target: &str,
    input: Option<&str>,
    step: Option<u64>,
    json: bool,
) -> Result<()> {
    let who = Identity::system();
    let def = resolve_workflow(&state.service, &who, target).await?;

    let params = SessionStartParams {
        workflow_id: def.id,
        step_id: step.unwrap_or(0),
        input: parse_input(input)?,
        event_type: "cli".to_string(),
        resource_type: "workflow".to_string(),
        invoker: who.clone(),
        trace: false,
        wait: true,
    };
    let session = state.service.exec(params).await?;

    state.service.sessions().flush().await;
    let record = state.service.sessions().find_by_id(&who, session.id()).await?;
    print_record(&record, json)
}

// ---------------------------------------------------------------------------
// List / delete / undelete
// ---------------------------------------------------------------------------

pub async fn list(state: &AppState, query: Option<String>, deleted: bool, json: bool) -> Result<()> {
    let filter = WorkflowFilter {
        query,
        deleted: if deleted {
            DeletedFilter::Include
        } else {
            DeletedFilter::Exclude
        },
        ..Default::default()
    };
    let defs = state.service.search(&Identity::system(), &filter).await?;

    if json {
        let out: Vec<_> = defs
            .iter()
            .map(|d| {
                serde_json::json!({
                    "id": d.id,
                    "handle": d.handle,
                    "name": d.meta.name,
                    "enabled": d.enabled,
                    "steps": d.steps.len(),
                    "loaded": state.service.graph(d.id).is_some(),
                    "deleted_at": d.deleted_at.map(|t| t.to_rfc3339()),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if defs.is_empty() {
        println!();
        println!("  No workflows stored.");
        println!(
            "  Import one with: {}",
            style("wayflow import <file.yaml>").dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Handle").fg(Color::Cyan),
            Cell::new("ID"),
            Cell::new("Name"),
            Cell::new("Steps"),
            Cell::new("Status"),
        ]);

    for d in &defs {
        let status = if d.is_deleted() {
            Cell::new("deleted").fg(Color::Red)
        } else if !d.enabled {
            Cell::new("disabled").fg(Color::Yellow)
        } else if state.service.graph(d.id).is_none() {
            Cell::new("not loaded").fg(Color::Red)
        } else {
            Cell::new("enabled").fg(Color::Green)
        };

        table.add_row(vec![
            Cell::new(&d.handle),
            Cell::new(d.id),
            Cell::new(&d.meta.name),
            Cell::new(d.steps.len()),
            status,
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

pub async fn delete(state: &AppState, target: &str, json: bool) -> Result<()> {
    let who = Identity::system();
    let def = resolve_workflow(&state.service, &who, target).await?;
    state.service.delete(&who, def.id).await?;

    if json {
        println!("{}", serde_json::json!({ "deleted": def.id }));
    } else {
        println!(
            "  {} Deleted workflow '{}' ({})",
            style("*").green().bold(),
            style(&def.handle).cyan(),
            def.id
        );
    }
    Ok(())
}

pub async fn undelete(state: &AppState, id: u64, json: bool) -> Result<()> {
    state.service.undelete(&Identity::system(), id).await?;

    if json {
        println!("{}", serde_json::json!({ "undeleted": id }));
    } else {
        println!("  {} Restored workflow {id}", style("*").green().bold());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Functions
// ---------------------------------------------------------------------------

pub fn functions(state: &AppState, json: bool) -> Result<()> {
    let functions = state.service.functions();

    if json {
        println!("{}", serde_json::to_string_pretty(&functions)?);
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Reference").fg(Color::Cyan),
            Cell::new("Parameters"),
            Cell::new("Results"),
            Cell::new("Description"),
        ]);

    for f in &functions {
        let names = |params: &[wayflow_types::function::Param]| {
            params
                .iter()
                .map(|p| {
                    if p.required {
                        format!("{}*", p.name)
                    } else {
                        p.name.clone()
                    }
                })
                .collect::<Vec<_>>()
                .join(", ")
        };
        table.add_row(vec![
            Cell::new(&f.reference),
            Cell::new(names(&f.parameters)),
            Cell::new(names(&f.results)),
            Cell::new(&f.description),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn load_file(file: &Path) -> Result<WorkflowDefinition> {
    load_workflow_file(file).with_context(|| format!("Failed to load {}", file.display()))
}

/// Parse a JSON object into a scope; no input is an empty scope.
pub fn parse_input(input: Option<&str>) -> Result<Scope> {
    let Some(raw) = input else {
        return Ok(Scope::new());
    };
    let value: serde_json::Value = serde_json::from_str(raw).context("Invalid JSON input")?;
    if !value.is_object() {
        bail!("Input must be a JSON object");
    }
    Ok(Scope::from_json(&value)?)
}

/// Look a workflow up by numeric ID, falling back to its handle.
pub async fn resolve_workflow<W, S>(
    service: &WorkflowService<W, S, AllowAll>,
    who: &Identity,
    target: &str,
) -> Result<WorkflowDefinition>
where
    W: WorkflowRepository,
    S: SessionRepository + 'static,
{
    if let Ok(id) = target.parse::<u64>() {
        if let Ok(def) = service.lookup(who, id).await {
            return Ok(def);
        }
    }
    match service.lookup_by_handle(who, target).await {
        Ok(def) => Ok(def),
        Err(ServiceError::WorkflowNotFound(_)) => bail!("Workflow '{target}' not found"),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_input_accepts_objects_only() {
        assert!(parse_input(None).unwrap().is_empty());

        let scope = parse_input(Some(r#"{"name": "ann", "age": 7}"#)).unwrap();
        assert_eq!(scope.string_or("name", ""), "ann");
        assert_eq!(scope.i64_or("age", 0), 7);

        assert!(parse_input(Some("[1, 2]")).is_err());
        assert!(parse_input(Some("{oops")).is_err());
    }

    #[tokio::test]
    async fn resolve_workflow_by_id_and_handle() {
        let service = scratch(EngineConfig::default());
        let who = Identity::system();
        let stored = service
            .create(&who, WorkflowDefinition::new("greet"))
            .await
            .unwrap();

        let by_id = resolve_workflow(&service, &who, &stored.id.to_string())
            .await
            .unwrap();
        assert_eq!(by_id.handle, "greet");

        let by_handle = resolve_workflow(&service, &who, "greet").await.unwrap();
        assert_eq!(by_handle.id, stored.id);

        assert!(resolve_workflow(&service, &who, "missing").await.is_err());
    }
}
