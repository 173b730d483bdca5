//! The configuration cascade.
//!
//! A [`ConfigStore`] holds three layers for one slot:
//!
//! | Layer | Contents | Consumed by |
//! |-------|----------|-------------|
//! | plugin config | the fixed keys in [`PLUGIN_KEYS`] | session setup (backend choice, paths, source) |
//! | driver config | keys a backend declares as its own | the backend adapter |
//! | native config | everything else under a backend's section | the native engine, unexamined |
//!
//! An option bag is partitioned like this:
//!
//! ```text
//! {
//!   include_paths: [t/tmpl],          -> plugin config
//!   type: MiniJinja,                  -> plugin config
//!   MiniJinja: {
//!     template_extension: .j2,        -> driver config ["MiniJinja"]
//!     trim_blocks: true,              -> native config ["MiniJinja"]
//!   },
//! }
//! ```
//!
//! Any top-level key that is not a plugin key must name a registered backend,
//! otherwise partitioning fails. For each backend the driver and native
//! layers are disjoint and together hold exactly that backend's section.
//!
//! # Cascade
//!
//! [`ConfigStore::from_options`] builds a slot's base store.
//! [`ConfigStore::merged`] layers per-call overrides over it and returns a new
//! store; the base is never mutated. With no overrides the base `Arc` itself is
//! returned, so stores obtained that way must be treated as shared.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::error::TemplateError;
use crate::options::{
    kind_of, option_bool, option_list, option_string, resolve_include_paths, OptionBag,
};
use crate::registry::BackendRegistry;

/// Keys recognized at the plugin level.
pub const PLUGIN_KEYS: &[&str] = &[
    "default_type",
    "type",
    "include_paths",
    "add_include_paths",
    "file",
    "string",
    "component_handler_class",
    "auto_add_template_extension",
    "callers_package",
];

/// Backend used when neither `type` nor `default_type` is configured.
pub const DEFAULT_BACKEND: &str = "Simple";

/// Plugin-level options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PluginConfig {
    /// Backend for the slot when a call does not pick one.
    pub default_type: Option<String>,
    /// Backend picked for this particular configuration or call.
    pub backend_type: Option<String>,
    /// Base search path.
    pub include_paths: Vec<String>,
    /// Higher-priority paths searched before `include_paths`.
    pub add_include_paths: Vec<String>,
    /// Explicit template file name.
    pub file: Option<String>,
    /// Literal template source; wins over any file.
    pub string: Option<String>,
    /// Name of the component set embedded components dispatch through.
    pub component_handler_class: Option<String>,
    /// Whether the backend's extension is appended to file names. Names that
    /// already carry an extension are used as given.
    pub auto_add_template_extension: Option<bool>,
    /// Namespace of the code that owns the slot.
    pub callers_package: Option<String>,
}

impl PluginConfig {
    /// Returns true when `key` is a plugin-level key.
    pub fn recognizes(key: &str) -> bool {
        PLUGIN_KEYS.contains(&key)
    }

    fn apply(&mut self, key: &str, value: &Value) -> Result<(), TemplateError> {
        match key {
            "default_type" => self.default_type = optional_string(key, value)?,
            "type" => self.backend_type = optional_string(key, value)?,
            "include_paths" => self.include_paths = option_list(key, value)?,
            "add_include_paths" => self.add_include_paths = option_list(key, value)?,
            "file" => self.file = optional_string(key, value)?,
            "string" => self.string = optional_string(key, value)?,
            "component_handler_class" => {
                self.component_handler_class = optional_string(key, value)?
            }
            "auto_add_template_extension" => {
                self.auto_add_template_extension = match value {
                    Value::Null => None,
                    other => Some(option_bool(key, other)?),
                }
            }
            "callers_package" => self.callers_package = optional_string(key, value)?,
            _ => return Err(TemplateError::invalid_option(key, "not a plugin option")),
        }
        Ok(())
    }

    /// The backend this configuration selects.
    pub fn backend_name(&self) -> &str {
        self.backend_type
            .as_deref()
            .or(self.default_type.as_deref())
            .unwrap_or(DEFAULT_BACKEND)
    }

    /// Include paths in search order.
    pub fn resolved_include_paths(&self) -> Vec<String> {
        resolve_include_paths(&self.include_paths, &self.add_include_paths)
    }

    /// Whether to append the backend extension; on unless disabled.
    pub fn auto_extension(&self) -> bool {
        self.auto_add_template_extension.unwrap_or(true)
    }
}

fn optional_string(key: &str, value: &Value) -> Result<Option<String>, TemplateError> {
    match value {
        Value::Null => Ok(None),
        other => option_string(key, other).map(Some),
    }
}

/// The three configuration layers of one slot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigStore {
    plugin: PluginConfig,
    driver: BTreeMap<String, OptionBag>,
    native: BTreeMap<String, OptionBag>,
}

impl ConfigStore {
    /// An empty store: every option at its default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a store by partitioning an option bag.
    ///
    /// # Errors
    ///
    /// - [`TemplateError::InvalidBackendName`] / [`TemplateError::UnknownBackend`]
    ///   for a top-level key that is neither a plugin key nor a backend
    /// - [`TemplateError::InvalidOption`] for values of the wrong shape
    pub fn from_options(
        options: &OptionBag,
        registry: &BackendRegistry,
    ) -> Result<Self, TemplateError> {
        let mut store = Self::new();
        store.absorb(options, registry)?;
        Ok(store)
    }

    /// Layers call-time overrides over `base`.
    ///
    /// With an empty `overrides` bag this returns `base` itself (same `Arc`).
    /// Otherwise `base` is cloned and the clone is partitioned over, key by
    /// key, leaving `base` untouched.
    pub fn merged(
        base: &Arc<ConfigStore>,
        overrides: &OptionBag,
        registry: &BackendRegistry,
    ) -> Result<Arc<ConfigStore>, TemplateError> {
        if overrides.is_empty() {
            return Ok(Arc::clone(base));
        }
        let mut store = ConfigStore::clone(base);
        store.absorb(overrides, registry)?;
        Ok(Arc::new(store))
    }

    fn absorb(&mut self, options: &OptionBag, registry: &BackendRegistry) -> Result<(), TemplateError> {
        for (key, value) in options {
            if PluginConfig::recognizes(key) {
                self.plugin.apply(key, value)?;
                continue;
            }

            let backend = registry.resolve(key)?;
            let Value::Object(section) = value else {
                return Err(TemplateError::invalid_option(
                    key,
                    format!("backend section must be a mapping, found {}", kind_of(value)),
                ));
            };

            let declared = backend.declared_config_keys();
            let name = backend.name().to_string();
            for (option, setting) in section {
                let layer = if declared.contains(&option.as_str()) {
                    &mut self.driver
                } else {
                    &mut self.native
                };
                layer
                    .entry(name.clone())
                    .or_default()
                    .insert(option.clone(), setting.clone());
            }
        }
        Ok(())
    }

    /// Plugin-level options.
    pub fn plugin(&self) -> &PluginConfig {
        &self.plugin
    }

    /// Driver options stored for `backend`, without defaults applied.
    pub fn driver_config(&self, backend: &str) -> Option<&OptionBag> {
        self.driver.get(backend)
    }

    /// Native options stored for `backend`.
    pub fn native_config(&self, backend: &str) -> Option<&OptionBag> {
        self.native.get(backend)
    }

    /// The backend this store selects.
    pub fn backend_name(&self) -> &str {
        self.plugin.backend_name()
    }

    /// Include paths in search order.
    pub fn include_paths(&self) -> Vec<String> {
        self.plugin.resolved_include_paths()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bag(value: Value) -> OptionBag {
        value.as_object().cloned().unwrap()
    }

    fn registry() -> BackendRegistry {
        BackendRegistry::with_builtins()
    }

    #[test]
    fn test_plugin_keys_partitioned() {
        let store = ConfigStore::from_options(
            &bag(json!({
                "default_type": "Tera",
                "include_paths": "t/tmpl",
                "auto_add_template_extension": 0,
                "callers_package": "My::App",
            })),
            &registry(),
        )
        .unwrap();

        let plugin = store.plugin();
        assert_eq!(plugin.default_type.as_deref(), Some("Tera"));
        assert_eq!(plugin.include_paths, vec!["t/tmpl"]);
        assert!(!plugin.auto_extension());
        assert_eq!(plugin.callers_package.as_deref(), Some("My::App"));
        assert_eq!(store.backend_name(), "Tera");
    }

    #[test]
    fn test_backend_section_split_into_driver_and_native() {
        let store = ConfigStore::from_options(
            &bag(json!({
                "MiniJinja": {
                    "template_extension": ".j2",
                    "embed_tag_name": "embed",
                    "trim_blocks": true,
                    "undefined": "strict",
                }
            })),
            &registry(),
        )
        .unwrap();

        assert_eq!(
            store.driver_config("MiniJinja").unwrap(),
            &bag(json!({"template_extension": ".j2", "embed_tag_name": "embed"}))
        );
        assert_eq!(
            store.native_config("MiniJinja").unwrap(),
            &bag(json!({"trim_blocks": true, "undefined": "strict"}))
        );
        assert!(store.driver_config("Simple").is_none());
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let err = ConfigStore::from_options(&bag(json!({"Mason": {}})), &registry()).unwrap_err();
        assert!(matches!(err, TemplateError::UnknownBackend(ref n) if n == "Mason"));
    }

    #[test]
    fn test_invalid_backend_name_rejected() {
        let err =
            ConfigStore::from_options(&bag(json!({"../evil": {}})), &registry()).unwrap_err();
        assert!(matches!(err, TemplateError::InvalidBackendName(_)));
    }

    #[test]
    fn test_backend_section_must_be_mapping() {
        let err = ConfigStore::from_options(&bag(json!({"Tera": "x"})), &registry()).unwrap_err();
        assert!(matches!(err, TemplateError::InvalidOption { ref key, .. } if key == "Tera"));
    }

    #[test]
    fn test_merge_without_overrides_reuses_base() {
        let base = Arc::new(ConfigStore::new());
        let merged = ConfigStore::merged(&base, &OptionBag::new(), &registry()).unwrap();
        assert!(Arc::ptr_eq(&base, &merged));
    }

    #[test]
    fn test_merge_overrides_without_touching_base() {
        let registry = registry();
        let base = Arc::new(
            ConfigStore::from_options(
                &bag(json!({
                    "include_paths": ["a", "b"],
                    "Simple": {"template_extension": ".html", "missing": "keep"},
                })),
                &registry,
            )
            .unwrap(),
        );
        let snapshot = ConfigStore::clone(&base);

        let overrides = bag(json!({
            "add_include_paths": ["c", "a"],
            "Simple": {"template_extension": ".txt"},
        }));
        let merged = ConfigStore::merged(&base, &overrides, &registry).unwrap();
        let again = ConfigStore::merged(&base, &overrides, &registry).unwrap();

        assert_eq!(*base, snapshot);
        assert_eq!(merged, again);
        assert_eq!(merged.include_paths(), vec!["c", "a", "b"]);
        assert_eq!(
            merged.driver_config("Simple").unwrap()["template_extension"],
            ".txt"
        );
        assert_eq!(merged.native_config("Simple").unwrap()["missing"], "keep");
    }

    #[test]
    fn test_type_wins_over_default_type() {
        let store = ConfigStore::from_options(
            &bag(json!({"default_type": "Tera", "type": "Tal"})),
            &registry(),
        )
        .unwrap();
        assert_eq!(store.backend_name(), "Tal");
        assert_eq!(ConfigStore::new().backend_name(), DEFAULT_BACKEND);
    }
}
