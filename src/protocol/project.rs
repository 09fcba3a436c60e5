use std::path::Path;

use serde_json::{json, Value};

use super::{field, parse_field, required, Failure};
use crate::config::EngineConfig;
use crate::model::project::ProjectInfo;
use crate::services::project as service;

use super::command::Command;

pub fn handle(base: &Path, cmd: Command, payload: &Value) -> Option<Result<Value, Failure>> {
    let result = match cmd {
        Command::ProjectList => service::list_projects(base)
            .map(|projects| json!({ "projects": projects }))
            .map_err(Failure::from),

        Command::ProjectCreate => create(base, payload),

        Command::ProjectOpen => required(payload, "project_path").and_then(|path| {
            service::open_project(Path::new(path))
                .map(|project| json!({ "project": project }))
                .map_err(Failure::from)
        }),

        Command::ProjectSave => parse_field::<ProjectInfo>(payload, "project").and_then(|project| {
            service::save_project(base, project)
                .map(|saved| json!({ "project": saved }))
                .map_err(Failure::from)
        }),

        _ => return None,
    };
    Some(result)
}

fn create(base: &Path, payload: &Value) -> Result<Value, Failure> {
    let name = required(payload, "name")?;
    let source_language = field(payload, "source_language").unwrap_or("en");
    let target_language = required(payload, "target_language")?;
    let engine: EngineConfig = match payload.get("engine") {
        Some(v) if !v.is_null() => parse_field(payload, "engine")?,
        _ => EngineConfig::default(),
    };
    engine.validate().map_err(Failure::from)?;

    let project = service::create_project(base, name, source_language, target_language, engine)?;
    Ok(json!({ "project_path": project.project_path, "project": project }))
}
