use std::io::{self, Write};

use serde::Serialize;

use crate::app::{
    CatalogResult, CheckResult, InitResult, MapResult, OrganismResult, ProgressEvent,
    ProgressSink, ShowResult, TasksResult,
};
use crate::resolver::QueryConfig;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

/// Machine-readable output: one pretty JSON document per command on stdout.
pub struct JsonOutput;

impl JsonOutput {
    pub fn print_init(result: &InitResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_catalog(result: &CatalogResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_organism(result: &OrganismResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_config(config: &QueryConfig) -> io::Result<()> {
        Self::print_json(config)
    }

    pub fn print_check(result: &CheckResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_map(result: &MapResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_tasks(result: &TasksResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_show(result: &ShowResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Human-oriented progress lines on stderr.
pub struct ConsoleProgress;

impl ProgressSink for ConsoleProgress {
    fn event(&self, event: ProgressEvent) {
        let cyan = "\x1b[36m";
        let reset = "\x1b[0m";
        match event.elapsed {
            Some(elapsed) => eprintln!("{cyan}{}{reset} ({} ms)", event.message, elapsed.as_millis()),
            None => eprintln!("{cyan}{}{reset}", event.message),
        }
    }
}

pub fn print_map_summary(result: &MapResult) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let cyan = "\x1b[36m";
    let red = "\x1b[31m";
    let reset = "\x1b[0m";

    println!("{cyan}patpat task {}{reset}", result.task);
    println!(
        "{cyan}{} | {} | {} | {} peptides{reset}",
        result.identifier, result.organism, result.proteome, result.peptides
    );
    for status in &result.statuses {
        let color = if status.succeeded() {
            green
        } else if status.status == "excluded" {
            yellow
        } else {
            red
        };
        println!(
            "{color}  {:<10} {:<20} {} records{reset}",
            status.source, status.status, status.records
        );
    }
    for record in &result.records {
        println!(
            "  {} [{}] {}",
            record.dataset_id,
            record.source,
            record.title.as_deref().unwrap_or("-")
        );
    }
    println!("{green}{} datasets, results in {}{reset}", result.records.len(), result.result_dir);
}

pub fn print_tasks_summary(result: &TasksResult) {
    if result.tasks.is_empty() {
        println!("no tasks");
        return;
    }
    for task in &result.tasks {
        println!(
            "{}  {:<10} {:<12} {}",
            task.task, task.identifier, task.state, task.started_at
        );
    }
}
