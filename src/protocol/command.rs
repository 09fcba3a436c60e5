#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Ping,
    Mask,
    Unmask,
    TerminologyMatch,
    Translate,
    RunQa,
    QaFix,
    CacheStats,
    CacheClear,
    CacheImport,
    CacheExport,
    ProjectList,
    ProjectCreate,
    ProjectOpen,
    ProjectSave,
    Unknown,
}

impl From<&str> for Command {
    fn from(s: &str) -> Self {
        match s {
            "ping" => Command::Ping,
            "mask" => Command::Mask,
            "unmask" => Command::Unmask,
            "terminology.match" => Command::TerminologyMatch,
            "translate" => Command::Translate,
            "run_qa" => Command::RunQa,
            "qa.fix" => Command::QaFix,
            "cache.stats" => Command::CacheStats,
            "cache.clear" => Command::CacheClear,
            "cache.import" => Command::CacheImport,
            "cache.export" => Command::CacheExport,
            "project.list" => Command::ProjectList,
            "project.create" => Command::ProjectCreate,
            "project.open" => Command::ProjectOpen,
            "project.save" => Command::ProjectSave,
            _ => Command::Unknown,
        }
    }
}
