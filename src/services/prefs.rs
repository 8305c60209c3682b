use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::warn;

/// Keys the agent persists across sessions.
pub mod keys {
    pub const INITIALIZED: &str = "sabrina-initialized";
    pub const LOCATION_HOME: &str = "context-$context.location.home";
    pub const LOCATION_WORK: &str = "context-$context.location.work";
    pub const TIME_MORNING: &str = "context-$context.time.morning";
    pub const TIME_EVENING: &str = "context-$context.time.evening";
    pub const PREFERRED_TEMPERATURE: &str = "preferred-temperature";
}

/// The only process-wide state: user context and preferred units. Injected
/// so tests can substitute an in-memory map.
pub trait PreferenceStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&self, key: &str, value: Value);
}

#[derive(Default)]
pub struct MemoryPreferences {
    values: Mutex<HashMap<String, Value>>,
}

impl MemoryPreferences {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PreferenceStore for MemoryPreferences {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.lock().expect("prefs poisoned").get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) {
        self.values.lock().expect("prefs poisoned").insert(key.to_string(), value);
    }
}

/// JSON-file-backed store. Loads once at construction, writes through on
/// every set. Losing a write on disk failure is logged, not fatal.
pub struct FilePreferences {
    path: PathBuf,
    values: Mutex<HashMap<String, Value>>,
}

impl FilePreferences {
    pub fn new(path: PathBuf) -> Self {
        let values = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                warn!("discarding corrupt preference file {:?}: {}", path, e);
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        };
        Self { path, values: Mutex::new(values) }
    }

    fn flush(&self, values: &HashMap<String, Value>) {
        match serde_json::to_string_pretty(values) {
            Ok(text) => {
                if let Err(e) = std::fs::write(&self.path, text) {
                    warn!("failed to persist preferences to {:?}: {}", self.path, e);
                }
            }
            Err(e) => warn!("failed to serialize preferences: {}", e),
        }
    }
}

impl PreferenceStore for FilePreferences {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.lock().expect("prefs poisoned").get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) {
        let mut values = self.values.lock().expect("prefs poisoned");
        values.insert(key.to_string(), value);
        self.flush(&values);
    }
}
