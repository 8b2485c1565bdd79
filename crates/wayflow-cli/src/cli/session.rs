//! Session commands: list, show, resume and cancel.

use anyhow::{Context, Result};
use comfy_table::{presets, Cell, Color, ContentArrangement, Table};
use console::style;

use wayflow_types::identity::Identity;
use wayflow_types::session::{SessionFilter, SessionRecord, SessionStatus};

use crate::cli::workflow::{parse_input, resolve_workflow};
use crate::state::AppState;

pub async fn list(
    state: &AppState,
    workflow: Option<&str>,
    status: &[String],
    limit: usize,
    json: bool,
) -> Result<()> {
    let who = Identity::system();

    let workflow_id = match workflow {
        Some(target) => Some(resolve_workflow(&state.service, &who, target).await?.id),
        None => None,
    };
    let status = status
        .iter()
        .map(|s| s.parse::<SessionStatus>().map_err(anyhow::Error::msg))
        .collect::<Result<Vec<_>>>()?;

    let filter = SessionFilter {
        workflow_id,
        status,
        created_by: None,
        limit: Some(limit),
    };
    let records = state.service.sessions().find(&who, &filter).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!();
        println!("  No sessions found.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("ID").fg(Color::Cyan),
            Cell::new("Workflow"),
            Cell::new("Status"),
            Cell::new("Started"),
            Cell::new("Completed"),
            Cell::new("Waiting"),
        ]);

    for r in &records {
        table.add_row(vec![
            Cell::new(r.id),
            Cell::new(r.workflow_id),
            status_cell(r.status),
            Cell::new(r.created_at.format("%Y-%m-%d %H:%M:%S")),
            Cell::new(
                r.completed_at
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "-".to_string()),
            ),
            Cell::new(r.states.len()),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

pub async fn show(state: &AppState, id: u64, json: bool) -> Result<()> {
    let record = state
        .service
        .sessions()
        .find_by_id(&Identity::system(), id)
        .await
        .with_context(|| format!("Session {id} not found"))?;
    print_record(&record, json)
}

pub async fn resume(
    state: &AppState,
    session_id: u64,
    state_id: u64,
    input: Option<&str>,
    json: bool,
) -> Result<()> {
    let who = Identity::system();
    let session = state
        .service
        .resume(&who, session_id, state_id, parse_input(input)?)
        .await?;
    session.wait().await;
    state.service.sessions().flush().await;

    let record = state.service.sessions().find_by_id(&who, session_id).await?;
    print_record(&record, json)
}

pub async fn cancel(state: &AppState, session_id: u64, json: bool) -> Result<()> {
    state
        .service
        .sessions()
        .cancel(&Identity::system(), session_id)
        .await?;
    state.service.sessions().flush().await;

    if json {
        println!("{}", serde_json::json!({ "cancelled": session_id }));
    } else {
        println!(
            "  {} Cancelled session {session_id}",
            style("*").green().bold()
        );
    }
    Ok(())
}

/// Print a session's status, result, error, pending inputs and trace.
pub fn print_record(record: &SessionRecord, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(record)?);
        return Ok(());
    }

    println!();
    println!(
        "  Session {} of workflow {}: {}",
        style(record.id).cyan(),
        record.workflow_id,
        styled_status(record.status)
    );

    if let Some(error) = &record.error {
        println!("  Error: {}", style(error).red());
    }

    if record.status == SessionStatus::Completed {
        println!("  Result:");
        let pretty = serde_json::to_string_pretty(&record.result.to_json())?;
        for line in pretty.lines() {
            println!("    {line}");
        }
    }

    let waiting: Vec<_> = record.states.iter().filter(|s| s.waits_for_input()).collect();
    if !waiting.is_empty() {
        println!("  Waiting for input:");
        for s in waiting {
            println!(
                "    state {} (step {})  {}",
                s.state_id,
                s.step_id,
                style(format!("wayflow resume {} {} --input '{{...}}'", record.id, s.state_id)).dim()
            );
        }
    }

    let delayed = record.states.iter().filter(|s| s.resume_at.is_some()).count();
    if delayed > 0 {
        println!("  Delayed states: {delayed}");
    }

    if !record.trace.is_empty() {
        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("State").fg(Color::Cyan),
                Cell::new("Step"),
                Cell::new("From"),
                Cell::new("Outcome"),
                Cell::new("Took"),
                Cell::new("Error"),
            ]);
        for t in &record.trace {
            let took = t.finished_at - t.started_at;
            table.add_row(vec![
                Cell::new(t.state_id),
                Cell::new(t.step_id),
                Cell::new(t.parent_id),
                Cell::new(format!("{:?}", t.outcome)),
                Cell::new(format!("{}ms", took.num_milliseconds())),
                Cell::new(t.error.as_deref().unwrap_or("")),
            ]);
        }
        println!();
        println!("{table}");
    }

    println!();
    Ok(())
}

fn styled_status(status: SessionStatus) -> console::StyledObject<&'static str> {
    let s = style(status.as_str());
    match status {
        SessionStatus::Completed => s.green(),
        SessionStatus::Failed => s.red(),
        SessionStatus::Suspended => s.yellow(),
        SessionStatus::New | SessionStatus::Running => s.blue(),
    }
}

fn status_cell(status: SessionStatus) -> Cell {
    let cell = Cell::new(status.as_str());
    match status {
        SessionStatus::Completed => cell.fg(Color::Green),
        SessionStatus::Failed => cell.fg(Color::Red),
        SessionStatus::Suspended => cell.fg(Color::Yellow),
        SessionStatus::New | SessionStatus::Running => cell.fg(Color::Blue),
    }
}
