use chrono::Utc;

/// Run-scoped logger. Status lines always reach stderr; debug lines only
/// when the `--debug` flag or `REFLOW_DEBUG` enabled them.
#[derive(Debug, Clone, Default)]
pub struct DebugLog {
    enabled: bool,
}

impl DebugLog {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn from_env() -> Self {
        let enabled = std::env::var("REFLOW_DEBUG")
            .map(|v| {
                let v = v.trim().to_ascii_lowercase();
                !v.is_empty() && v != "0" && v != "false"
            })
            .unwrap_or(false);
        Self { enabled }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn debug(&self, line: &str) {
        if self.enabled {
            eprintln!("[debug {}] {line}", Utc::now().format("%H:%M:%S%.6f"));
        }
    }

    pub fn status(&self, line: &str) {
        eprintln!("{line}");
    }
}
