use std::path::PathBuf;

/// Process-wide configuration, read once at startup from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub db_path: PathBuf,
    /// Default timezone applied to tasks created without one.
    pub default_timezone: String,
    /// How late a cron fire may be and still execute (process stalls,
    /// long-held account locks). Beyond this the occurrence is dropped.
    pub misfire_grace_seconds: u64,
    pub solver_base_url: String,
    pub solver_api_key: Option<String>,
    pub solver_model: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/rollcall.db"),
            default_timezone: "UTC".to_string(),
            misfire_grace_seconds: 300,
            solver_base_url: "https://api.openai.com/v1".to_string(),
            solver_api_key: None,
            solver_model: "gpt-4o-mini".to_string(),
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let defaults = Settings::default();
        Self {
            db_path: std::env::var("ROLLCALL_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            default_timezone: non_empty(
                std::env::var("ROLLCALL_TZ").ok(),
                defaults.default_timezone,
            ),
            misfire_grace_seconds: parse_u64(
                std::env::var("ROLLCALL_MISFIRE_GRACE_SECONDS").ok(),
                defaults.misfire_grace_seconds,
            ),
            solver_base_url: non_empty(
                std::env::var("ROLLCALL_SOLVER_BASE_URL").ok(),
                defaults.solver_base_url,
            ),
            solver_api_key: std::env::var("ROLLCALL_SOLVER_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            solver_model: non_empty(
                std::env::var("ROLLCALL_SOLVER_MODEL").ok(),
                defaults.solver_model,
            ),
        }
    }
}

fn non_empty(value: Option<String>, default: String) -> String {
    match value {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => default,
    }
}

fn parse_u64(value: Option<String>, default: u64) -> u64 {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}
