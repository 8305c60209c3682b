use crate::format::FormatRule;
use crate::handlers::skill::SkillPlugin;
use crate::program::ast::{Location, ParamType};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Declared signature of one skill function, as served by the skill
/// repository.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionSchema {
    pub kind: String,
    pub channel: String,
    pub ftype: FunctionType,
    pub args: Vec<ArgSchema>,
    /// Confirmation template, e.g. `post ${status} on Twitter`.
    pub confirmation: String,
    pub canonical: String,
    pub monitorable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionType {
    Query,
    Action,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArgSchema {
    pub name: String,
    pub ptype: ParamType,
    pub is_input: bool,
    pub required: bool,
    /// Slot-filling question, e.g. "What do you want to tweet?".
    pub question: String,
}

impl FunctionSchema {
    /// Input slots in declared order; slot filling walks exactly this.
    pub fn required_inputs(&self) -> impl Iterator<Item = &ArgSchema> {
        self.args.iter().filter(|a| a.is_input && a.required)
    }

    pub fn out_params(&self) -> impl Iterator<Item = &ArgSchema> {
        self.args.iter().filter(|a| !a.is_input)
    }
}

/// One configured device instance.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub id: String,
    pub kind: String,
    pub name: String,
}

/// Device-view notifications. Dynamic dialogue handlers attach when a device
/// of kind `org.thingpedia.dialogue-handler` appears and detach on removal.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    Added(DeviceInfo),
    Removed(String),
}

pub const DIALOGUE_HANDLER_KIND: &str = "org.thingpedia.dialogue-handler";

/// How a not-yet-configured skill gets set up.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceFactory {
    /// Nothing to configure; the device materializes on first use.
    None,
    /// OAuth dance in the browser; the loop hands out the link.
    OAuth { url: String },
    /// Interactive form; each field is asked as a sub-dialogue.
    Form { fields: Vec<FormField> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct FormField {
    pub name: String,
    pub label: String,
    pub ptype: ParamType,
}

/// One rule-builder category. The set is served by the repository and walked
/// category -> device -> example.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryInfo {
    pub id: String,
    pub name: String,
}

/// One example command attached to a skill, used by the rule builder and the
/// help flow.
#[derive(Debug, Clone, PartialEq)]
pub struct ExampleCommand {
    pub label: String,
    pub code: Vec<String>,
}

/// The skill repository and device database, behind one port. Network-backed
/// in production; in-memory in tests and the console driver.
#[async_trait]
pub trait SkillCatalog: Send + Sync {
    async fn function_schema(&self, kind: &str, channel: &str) -> Option<FunctionSchema>;

    /// Configured devices of the given kind, in configuration order.
    fn devices_of_kind(&self, kind: &str) -> Vec<DeviceInfo>;

    async fn device_factory(&self, kind: &str) -> Option<DeviceFactory>;

    async fn create_device(
        &self,
        kind: &str,
        params: HashMap<String, String>,
    ) -> Result<DeviceInfo>;

    fn categories(&self) -> Vec<CategoryInfo>;

    /// Skill kinds available under a category (not configured instances).
    async fn kinds_in_category(&self, category: &str) -> Vec<DeviceInfo>;

    async fn examples_for(&self, kind: &str) -> Vec<ExampleCommand>;

    async fn format_spec(&self, output_type: &str) -> Option<Vec<FormatRule>>;

    /// Geocoder. Best match first.
    async fn lookup_location(&self, query: &str) -> Result<Vec<Location>>;

    /// The dialogue plugin exported by a configured device of the
    /// dialogue-handler kind.
    fn dialogue_plugin(&self, device_id: &str) -> Option<Arc<dyn SkillPlugin>>;

    /// Subscribe to device additions/removals. The loop drains this between
    /// turns.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<DeviceEvent>;
}

/// In-memory catalog used by tests and the console driver.
#[derive(Default)]
pub struct MemoryCatalog {
    inner: Mutex<MemoryCatalogInner>,
}

#[derive(Default)]
struct MemoryCatalogInner {
    schemas: HashMap<(String, String), FunctionSchema>,
    devices: Vec<DeviceInfo>,
    factories: HashMap<String, DeviceFactory>,
    categories: Vec<CategoryInfo>,
    category_kinds: HashMap<String, Vec<DeviceInfo>>,
    examples: HashMap<String, Vec<ExampleCommand>>,
    format_specs: HashMap<String, Vec<FormatRule>>,
    locations: HashMap<String, Vec<Location>>,
    plugins: HashMap<String, Arc<dyn SkillPlugin>>,
    subscribers: Vec<mpsc::UnboundedSender<DeviceEvent>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_schema(&self, schema: FunctionSchema) {
        let mut inner = self.inner.lock().expect("catalog poisoned");
        inner.schemas.insert((schema.kind.clone(), schema.channel.clone()), schema);
    }

    pub fn add_device(&self, device: DeviceInfo) {
        let mut inner = self.inner.lock().expect("catalog poisoned");
        inner.devices.push(device.clone());
        inner.subscribers.retain(|tx| tx.send(DeviceEvent::Added(device.clone())).is_ok());
    }

    pub fn remove_device(&self, id: &str) {
        let mut inner = self.inner.lock().expect("catalog poisoned");
        inner.devices.retain(|d| d.id != id);
        inner.plugins.remove(id);
        let id = id.to_string();
        inner.subscribers.retain(|tx| tx.send(DeviceEvent::Removed(id.clone())).is_ok());
    }

    pub fn add_factory(&self, kind: impl Into<String>, factory: DeviceFactory) {
        self.inner.lock().expect("catalog poisoned").factories.insert(kind.into(), factory);
    }

    pub fn add_category(&self, info: CategoryInfo, kinds: Vec<DeviceInfo>) {
        let mut inner = self.inner.lock().expect("catalog poisoned");
        inner.category_kinds.insert(info.id.clone(), kinds);
        inner.categories.push(info);
    }

    pub fn add_examples(&self, kind: impl Into<String>, examples: Vec<ExampleCommand>) {
        self.inner.lock().expect("catalog poisoned").examples.insert(kind.into(), examples);
    }

    pub fn add_format_spec(&self, output_type: impl Into<String>, spec: Vec<FormatRule>) {
        self.inner.lock().expect("catalog poisoned").format_specs.insert(output_type.into(), spec);
    }

    pub fn add_location(&self, query: impl Into<String>, results: Vec<Location>) {
        self.inner.lock().expect("catalog poisoned").locations.insert(query.into(), results);
    }

    pub fn add_plugin(&self, device: DeviceInfo, plugin: Arc<dyn SkillPlugin>) {
        {
            let mut inner = self.inner.lock().expect("catalog poisoned");
            inner.plugins.insert(device.id.clone(), plugin);
        }
        self.add_device(device);
    }
}

#[async_trait]
impl SkillCatalog for MemoryCatalog {
    async fn function_schema(&self, kind: &str, channel: &str) -> Option<FunctionSchema> {
        self.inner
            .lock()
            .expect("catalog poisoned")
            .schemas
            .get(&(kind.to_string(), channel.to_string()))
            .cloned()
    }

    fn devices_of_kind(&self, kind: &str) -> Vec<DeviceInfo> {
        self.inner
            .lock()
            .expect("catalog poisoned")
            .devices
            .iter()
            .filter(|d| d.kind == kind)
            .cloned()
            .collect()
    }

    async fn device_factory(&self, kind: &str) -> Option<DeviceFactory> {
        self.inner.lock().expect("catalog poisoned").factories.get(kind).cloned()
    }

    async fn create_device(
        &self,
        kind: &str,
        params: HashMap<String, String>,
    ) -> Result<DeviceInfo> {
        let name = params
            .get("name")
            .cloned()
            .unwrap_or_else(|| kind.rsplit('.').next().unwrap_or(kind).to_string());
        let device = DeviceInfo {
            id: format!("{}-{}", kind, uuid::Uuid::new_v4()),
            kind: kind.to_string(),
            name,
        };
        self.add_device(device.clone());
        Ok(device)
    }

    fn categories(&self) -> Vec<CategoryInfo> {
        self.inner.lock().expect("catalog poisoned").categories.clone()
    }

    async fn kinds_in_category(&self, category: &str) -> Vec<DeviceInfo> {
        self.inner
            .lock()
            .expect("catalog poisoned")
            .category_kinds
            .get(category)
            .cloned()
            .unwrap_or_default()
    }

    async fn examples_for(&self, kind: &str) -> Vec<ExampleCommand> {
        self.inner.lock().expect("catalog poisoned").examples.get(kind).cloned().unwrap_or_default()
    }

    async fn format_spec(&self, output_type: &str) -> Option<Vec<FormatRule>> {
        self.inner.lock().expect("catalog poisoned").format_specs.get(output_type).cloned()
    }

    async fn lookup_location(&self, query: &str) -> Result<Vec<Location>> {
        self.inner
            .lock()
            .expect("catalog poisoned")
            .locations
            .get(query)
            .cloned()
            .ok_or_else(|| anyhow!("no geocoder data for {}", query))
    }

    fn dialogue_plugin(&self, device_id: &str) -> Option<Arc<dyn SkillPlugin>> {
        self.inner.lock().expect("catalog poisoned").plugins.get(device_id).cloned()
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<DeviceEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().expect("catalog poisoned");
        // Replay existing devices so a late subscriber sees the full view.
        for device in &inner.devices {
            let _ = tx.send(DeviceEvent::Added(device.clone()));
        }
        inner.subscribers.push(tx);
        rx
    }
}
