//! Named configuration slots.
//!
//! An application can keep several independent configurations side by side,
//! for example one for page templates and one for e-mail templates. Each is a
//! [`Slot`]: either the unnamed default or a name. The [`SlotTable`] maps slots
//! to their base [`ConfigStore`].
//!
//! Configuring a slot replaces its store wholesale. A slot that is loaded
//! before it was ever configured gets an empty store, created on first use.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::config::ConfigStore;

/// A configuration slot name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum Slot {
    /// The unnamed slot.
    #[default]
    Default,
    /// A named slot.
    Named(String),
}

impl Slot {
    /// Creates a named slot.
    pub fn named(name: impl Into<String>) -> Self {
        Slot::Named(name.into())
    }

    /// The slot name, or `None` for the default slot.
    pub fn name(&self) -> Option<&str> {
        match self {
            Slot::Default => None,
            Slot::Named(name) => Some(name),
        }
    }

    /// Returns true for the default slot.
    pub fn is_default(&self) -> bool {
        matches!(self, Slot::Default)
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Default => write!(f, "<default>"),
            Slot::Named(name) => write!(f, "{}", name),
        }
    }
}

impl From<&str> for Slot {
    fn from(name: &str) -> Self {
        Slot::Named(name.to_string())
    }
}

impl From<String> for Slot {
    fn from(name: String) -> Self {
        Slot::Named(name)
    }
}

impl From<Option<&str>> for Slot {
    fn from(name: Option<&str>) -> Self {
        name.map(Slot::from).unwrap_or_default()
    }
}

impl From<&Slot> for Slot {
    fn from(slot: &Slot) -> Self {
        slot.clone()
    }
}

/// Slot name to base configuration store.
#[derive(Debug, Default)]
pub struct SlotTable {
    stores: HashMap<Slot, Arc<ConfigStore>>,
}

impl SlotTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the store of `slot`, returning the previous one.
    pub fn configure(&mut self, slot: Slot, store: ConfigStore) -> Option<Arc<ConfigStore>> {
        self.stores.insert(slot, Arc::new(store))
    }

    /// The store of `slot`, if it has one.
    pub fn get(&self, slot: &Slot) -> Option<Arc<ConfigStore>> {
        self.stores.get(slot).cloned()
    }

    /// The store of `slot`, creating an empty one on first use.
    pub fn get_or_default(&mut self, slot: &Slot) -> Arc<ConfigStore> {
        Arc::clone(
            self.stores
                .entry(slot.clone())
                .or_insert_with(|| Arc::new(ConfigStore::new())),
        )
    }

    /// Returns true if `slot` has a store.
    pub fn contains(&self, slot: &Slot) -> bool {
        self.stores.contains_key(slot)
    }

    /// All slots with a store, in no particular order.
    pub fn slots(&self) -> impl Iterator<Item = &Slot> {
        self.stores.keys()
    }

    /// Number of slots with a store.
    pub fn len(&self) -> usize {
        self.stores.len()
    }

    /// Returns true if no slot has a store.
    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_conversions() {
        assert_eq!(Slot::from("mail"), Slot::named("mail"));
        assert_eq!(Slot::from(None::<&str>), Slot::Default);
        assert_eq!(Slot::from(Some("x")).name(), Some("x"));
        assert!(Slot::default().is_default());
        assert_eq!(Slot::Default.to_string(), "<default>");
    }

    #[test]
    fn test_get_or_default_creates_once() {
        let mut table = SlotTable::new();
        assert!(table.get(&Slot::Default).is_none());

        let first = table.get_or_default(&Slot::Default);
        let second = table.get_or_default(&Slot::Default);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_configure_replaces_wholesale() {
        let mut table = SlotTable::new();
        let slot = Slot::named("pages");
        let first = table.get_or_default(&slot);

        let previous = table.configure(slot.clone(), ConfigStore::new());
        assert!(Arc::ptr_eq(&previous.unwrap(), &first));
        assert!(!Arc::ptr_eq(&table.get(&slot).unwrap(), &first));
    }

    #[test]
    fn test_slots_are_independent() {
        let mut table = SlotTable::new();
        let a = table.get_or_default(&Slot::named("a"));
        let b = table.get_or_default(&Slot::named("b"));
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(table.contains(&Slot::named("a")));
        assert!(!table.contains(&Slot::Default));
    }
}
