use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::config::EngineConfig;
use crate::error::ProjectError;
use crate::model::project::ProjectInfo;
use crate::services::terminology::TerminologyTable;

pub const PROJECT_FILE: &str = "project.json";
pub const TERMINOLOGY_FILE: &str = "terminology.json";

/// `STARDEW_TL_HOME`, else `%LOCALAPPDATA%/StardewTranslator/Projects`,
/// else `./Projects`.
pub fn projects_base_dir() -> PathBuf {
    if let Ok(home) = std::env::var("STARDEW_TL_HOME") {
        if !home.trim().is_empty() {
            return PathBuf::from(home);
        }
    }
    if let Ok(local) = std::env::var("LOCALAPPDATA") {
        return PathBuf::from(local).join("StardewTranslator").join("Projects");
    }
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("Projects")
}

fn ensure_dir(dir: &Path) -> Result<(), ProjectError> {
    if !dir.exists() {
        fs::create_dir_all(dir).map_err(|e| ProjectError::io(dir, e))?;
    }
    Ok(())
}

/// Turns a display name (or a pasted path) into a safe directory name.
///
/// Paths keep only their last component; anything outside
/// `[A-Za-z0-9 _-.]` becomes `_`.
pub fn safe_project_dir_name(name: &str) -> String {
    let mut n = name.trim().to_string();

    if n.contains('\\') || n.contains('/') {
        if let Some(bn) = Path::new(&n.replace('\\', "/")).file_name().and_then(|s| s.to_str()) {
            n = bn.to_string();
        }
    }

    // an already flattened path, e.g. C__Users_me_Projects_Farm
    if let Some(pos) = n.rfind("_Projects_") {
        n = n[(pos + "_Projects_".len())..].to_string();
    } else if let Some(pos) = n.rfind("_projects_") {
        n = n[(pos + "_projects_".len())..].to_string();
    }

    let mut out = String::with_capacity(n.len());
    for ch in n.chars() {
        let ok = ch.is_ascii_alphanumeric() || ch == ' ' || ch == '_' || ch == '-' || ch == '.';
        out.push(if ok { ch } else { '_' });
    }

    let out = out.trim().trim_matches('.').to_string();
    if out.is_empty() {
        "Project".to_string()
    } else {
        out
    }
}

pub fn list_projects(base: &Path) -> Result<Vec<ProjectInfo>, ProjectError> {
    ensure_dir(base)?;
    let mut projects = Vec::new();

    let entries = fs::read_dir(base).map_err(|e| ProjectError::io(base, e))?;
    for entry in entries.flatten() {
        let dir = entry.path();
        if !dir.join(PROJECT_FILE).exists() {
            continue;
        }
        match open_project(&dir) {
            Ok(p) => projects.push(p),
            Err(e) => tracing::warn!(dir = %dir.display(), error = %e, "skipping unreadable project"),
        }
    }

    projects.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(projects)
}

pub fn create_project(
    base: &Path,
    name: &str,
    source_language: &str,
    target_language: &str,
    engine: EngineConfig,
) -> Result<ProjectInfo, ProjectError> {
    ensure_dir(base)?;

    let project_dir = base.join(safe_project_dir_name(name));
    if project_dir.exists() {
        return Err(ProjectError::AlreadyExists(project_dir));
    }
    fs::create_dir_all(&project_dir).map_err(|e| ProjectError::io(&project_dir, e))?;

    let project = ProjectInfo {
        name: name.trim().to_string(),
        project_path: project_dir.to_string_lossy().to_string(),
        source_language: source_language.to_string(),
        target_language: target_language.to_string(),
        engine,
        created_at: Some(Utc::now()),
    };
    write_project_file(&project_dir, &project)?;

    tracing::info!(name = %project.name, path = %project.project_path, "project created");
    Ok(project)
}

pub fn open_project(project_dir: &Path) -> Result<ProjectInfo, ProjectError> {
    let path = project_dir.join(PROJECT_FILE);
    if !path.exists() {
        return Err(ProjectError::NotFound(project_dir.to_path_buf()));
    }

    let data = fs::read_to_string(&path).map_err(|e| ProjectError::io(&path, e))?;
    let mut project: ProjectInfo =
        serde_json::from_str(&data).map_err(|e| ProjectError::Invalid {
            path: path.clone(),
            message: e.to_string(),
        })?;

    if project.project_path.trim().is_empty() {
        project.project_path = project_dir.to_string_lossy().to_string();
    }
    Ok(project)
}

pub fn save_project(base: &Path, mut project: ProjectInfo) -> Result<ProjectInfo, ProjectError> {
    let project_dir: PathBuf = {
        let pp = project.project_path.trim();
        if pp.is_empty() {
            base.join(safe_project_dir_name(&project.name))
        } else {
            PathBuf::from(pp)
        }
    };
    ensure_dir(&project_dir)?;

    project.project_path = project_dir.to_string_lossy().to_string();
    if project.created_at.is_none() {
        project.created_at = Some(Utc::now());
    }
    write_project_file(&project_dir, &project)?;

    Ok(project)
}

fn write_project_file(dir: &Path, project: &ProjectInfo) -> Result<(), ProjectError> {
    let path = dir.join(PROJECT_FILE);
    let json = serde_json::to_string_pretty(project).map_err(|e| ProjectError::Invalid {
        path: path.clone(),
        message: e.to_string(),
    })?;
    fs::write(&path, json).map_err(|e| ProjectError::io(&path, e))
}

/// The project's terminology table; empty when none was saved yet.
pub fn load_terminology(project: &ProjectInfo) -> Result<TerminologyTable, ProjectError> {
    let path = Path::new(&project.project_path).join(TERMINOLOGY_FILE);
    if !path.exists() {
        return Ok(TerminologyTable::new());
    }
    let data = fs::read_to_string(&path).map_err(|e| ProjectError::io(&path, e))?;
    Ok(TerminologyTable::from_json_str(&data)?)
}

pub fn save_terminology(project: &ProjectInfo, table: &TerminologyTable) -> Result<(), ProjectError> {
    let dir = Path::new(&project.project_path);
    ensure_dir(dir)?;
    let path = dir.join(TERMINOLOGY_FILE);
    fs::write(&path, table.to_json_string()?).map_err(|e| ProjectError::io(&path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::terminology::TerminologyRule;

    #[test]
    fn dir_names_are_sanitised() {
        assert_eq!(safe_project_dir_name("My Farm: Part 2"), "My Farm_ Part 2");
        assert_eq!(safe_project_dir_name(r"C:\Mods\Ridgeside"), "Ridgeside");
        assert_eq!(safe_project_dir_name("C__Users_me_Projects_Ridgeside"), "Ridgeside");
        assert_eq!(safe_project_dir_name("..."), "Project");
    }

    #[test]
    fn create_open_save_list() {
        let base = tempfile::tempdir().unwrap();
        let created =
            create_project(base.path(), "East Scarp", "en", "zh", EngineConfig::default()).unwrap();
        assert!(created.created_at.is_some());
        assert!(matches!(
            create_project(base.path(), "East Scarp", "en", "zh", EngineConfig::default()),
            Err(ProjectError::AlreadyExists(_))
        ));

        let mut opened = open_project(Path::new(&created.project_path)).unwrap();
        assert_eq!(opened, created);

        opened.engine.batch_size = 7;
        save_project(base.path(), opened).unwrap();

        let listed = list_projects(base.path()).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].engine.batch_size, 7);
    }

    #[test]
    fn broken_projects_are_skipped_when_listing() {
        let base = tempfile::tempdir().unwrap();
        create_project(base.path(), "Good", "en", "zh", EngineConfig::default()).unwrap();
        let bad = base.path().join("Bad");
        fs::create_dir_all(&bad).unwrap();
        fs::write(bad.join(PROJECT_FILE), "{").unwrap();

        let listed = list_projects(base.path()).unwrap();
        assert_eq!(listed.len(), 1);
        assert!(matches!(open_project(&bad), Err(ProjectError::Invalid { .. })));
        assert!(matches!(
            open_project(&base.path().join("Missing")),
            Err(ProjectError::NotFound(_))
        ));
    }

    #[test]
    fn terminology_lives_next_to_the_project() {
        let base = tempfile::tempdir().unwrap();
        let p = create_project(base.path(), "Terms", "en", "zh", EngineConfig::default()).unwrap();
        assert!(load_terminology(&p).unwrap().is_empty());

        let table = TerminologyTable::from_rules([TerminologyRule::literal("Lewis", "刘易斯")]);
        save_terminology(&p, &table).unwrap();
        assert_eq!(load_terminology(&p).unwrap().rules(), table.rules());
    }
}
