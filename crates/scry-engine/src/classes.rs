use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use scry_jdwp::wire::{
    LineTable, Location, MethodId, ReferenceTypeId, ERROR_ABSENT_INFORMATION, TYPE_TAG_CLASS,
};
use scry_jdwp::TargetVm;

use crate::error::Result;
use crate::source::SourceClass;

#[derive(Debug, Clone)]
struct LoadedMethod {
    method_id: MethodId,
    lines: LineTable,
}

/// A watched class the target has prepared, with its line tables.
#[derive(Debug)]
pub struct LoadedClass {
    source: Arc<SourceClass>,
    type_id: ReferenceTypeId,
    methods: Vec<LoadedMethod>,
}

impl LoadedClass {
    /// Fetches every method's line table. Methods without line information
    /// (native, abstract, compiled without `-g:lines`) get an empty table.
    pub async fn load<V: TargetVm>(
        vm: &V,
        source: Arc<SourceClass>,
        type_id: ReferenceTypeId,
    ) -> Result<Self> {
        let mut methods = Vec::new();
        for method in vm.methods(type_id).await? {
            let lines = match vm.line_table(type_id, method.method_id).await {
                Ok(table) => table,
                Err(err) if err.vm_error_code().is_some() => {
                    if err.vm_error_code() != Some(ERROR_ABSENT_INFORMATION) {
                        tracing::debug!(
                            target: "scry.engine",
                            class = source.name(),
                            method = %method.name,
                            error = %err,
                            "no line table for method"
                        );
                    }
                    LineTable::default()
                }
                Err(err) => return Err(err.into()),
            };
            methods.push(LoadedMethod {
                method_id: method.method_id,
                lines,
            });
        }
        Ok(Self {
            source,
            type_id,
            methods,
        })
    }

    pub fn name(&self) -> &str {
        self.source.name()
    }

    pub fn type_id(&self) -> ReferenceTypeId {
        self.type_id
    }

    /// First executable location of `line`, if any method has code there.
    pub fn location_of_line(&self, line: u32) -> Option<Location> {
        let line = i32::try_from(line).ok()?;
        self.methods.iter().find_map(|method| {
            method.lines.first_index_of_line(line).map(|index| Location {
                type_tag: TYPE_TAG_CLASS,
                class_id: self.type_id,
                method_id: method.method_id,
                index,
            })
        })
    }

    pub fn line_of(&self, location: &Location) -> Option<u32> {
        if location.class_id != self.type_id {
            return None;
        }
        let method = self
            .methods
            .iter()
            .find(|m| m.method_id == location.method_id)?;
        method
            .lines
            .line_for_index(location.index)
            .and_then(|line| u32::try_from(line).ok())
    }
}

#[derive(Debug, Default)]
struct Registry {
    sources: BTreeMap<String, Arc<SourceClass>>,
    loaded: HashMap<String, Arc<LoadedClass>>,
    by_type: HashMap<ReferenceTypeId, Arc<LoadedClass>>,
}

/// Watched classes and, once prepared, their loaded handles.
#[derive(Debug, Default)]
pub struct ClassRegistry {
    inner: RwLock<Registry>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Watches `class`, replacing a previous descriptor of the same name.
    pub fn register(&self, class: SourceClass) -> Arc<SourceClass> {
        let class = Arc::new(class);
        self.inner
            .write()
            .sources
            .insert(class.name().to_string(), Arc::clone(&class));
        class
    }

    pub fn source(&self, name: &str) -> Option<Arc<SourceClass>> {
        self.inner.read().sources.get(name).cloned()
    }

    pub fn is_watched(&self, name: &str) -> bool {
        self.inner.read().sources.contains_key(name)
    }

    pub fn watched_classes(&self) -> Vec<String> {
        self.inner.read().sources.keys().cloned().collect()
    }

    pub fn sources(&self) -> Vec<Arc<SourceClass>> {
        self.inner.read().sources.values().cloned().collect()
    }

    pub fn loaded(&self, name: &str) -> Option<Arc<LoadedClass>> {
        self.inner.read().loaded.get(name).cloned()
    }

    pub fn loaded_by_type(&self, type_id: ReferenceTypeId) -> Option<Arc<LoadedClass>> {
        self.inner.read().by_type.get(&type_id).cloned()
    }

    /// Records a prepared class. Returns `None` if the class was already
    /// loaded; the first handle wins.
    pub fn insert_loaded(&self, class: LoadedClass) -> Option<Arc<LoadedClass>> {
        let mut inner = self.inner.write();
        if inner.loaded.contains_key(class.name()) {
            return None;
        }
        let class = Arc::new(class);
        inner
            .loaded
            .insert(class.name().to_string(), Arc::clone(&class));
        inner.by_type.insert(class.type_id(), Arc::clone(&class));
        Some(class)
    }
}
