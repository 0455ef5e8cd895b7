use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::variant::NativeType;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyMeta {
    pub name: String,
    pub ty: NativeType,
    pub read_only: bool,
    pub constant: bool,
    pub scriptable: bool,
}

impl PropertyMeta {
    pub fn new(name: impl Into<String>, ty: NativeType) -> Self {
        Self {
            name: name.into(),
            ty,
            read_only: false,
            constant: false,
            scriptable: true,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Constant properties are exposed read-only.
    pub fn constant(mut self) -> Self {
        self.constant = true;
        self.read_only = true;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.scriptable = false;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodKind {
    Method,
    Slot,
    Constructor,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodMeta {
    pub name: String,
    pub params: Vec<NativeType>,
    pub ret: NativeType,
    pub kind: MethodKind,
}

impl MethodMeta {
    pub fn new(
        name: impl Into<String>,
        params: impl IntoIterator<Item = NativeType>,
        ret: NativeType,
    ) -> Self {
        Self {
            name: name.into(),
            params: params.into_iter().collect(),
            ret,
            kind: MethodKind::Method,
        }
    }

    pub fn slot(mut self) -> Self {
        self.kind = MethodKind::Slot;
        self
    }

    pub fn constructor(mut self) -> Self {
        self.kind = MethodKind::Constructor;
        self
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }

    /// `name(i32,String)`, used in diagnostics.
    pub fn signature(&self) -> String {
        let params = self
            .params
            .iter()
            .map(NativeType::name)
            .collect::<Vec<_>>()
            .join(",");
        format!("{}({})", self.name, params)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventMeta {
    pub name: String,
    pub params: Vec<NativeType>,
}

impl EventMeta {
    pub fn new(name: impl Into<String>, params: impl IntoIterator<Item = NativeType>) -> Self {
        Self {
            name: name.into(),
            params: params.into_iter().collect(),
        }
    }
}

/// Read-only catalog of one native class. Members inherited from the
/// superclass come first; the `own_*_offset` values mark where the class's
/// own declarations start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeMetadata {
    class_name: String,
    ancestors: Vec<String>,
    properties: Vec<PropertyMeta>,
    methods: Vec<MethodMeta>,
    events: Vec<EventMeta>,
    own_property_offset: usize,
    own_method_offset: usize,
    own_event_offset: usize,
}

impl TypeMetadata {
    pub fn builder(class_name: impl Into<String>) -> TypeMetadataBuilder {
        TypeMetadataBuilder {
            meta: TypeMetadata {
                class_name: class_name.into(),
                ancestors: Vec::new(),
                properties: Vec::new(),
                methods: Vec::new(),
                events: Vec::new(),
                own_property_offset: 0,
                own_method_offset: 0,
                own_event_offset: 0,
            },
        }
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn ancestors(&self) -> &[String] {
        &self.ancestors
    }

    /// True for the class itself and every ancestor.
    pub fn inherits(&self, class_name: &str) -> bool {
        self.class_name == class_name || self.ancestors.iter().any(|name| name == class_name)
    }

    pub fn properties(&self) -> &[PropertyMeta] {
        &self.properties
    }

    pub fn methods(&self) -> &[MethodMeta] {
        &self.methods
    }

    pub fn events(&self) -> &[EventMeta] {
        &self.events
    }

    pub fn own_property_offset(&self) -> usize {
        self.own_property_offset
    }

    pub fn own_method_offset(&self) -> usize {
        self.own_method_offset
    }

    pub fn own_event_offset(&self) -> usize {
        self.own_event_offset
    }
}

pub struct TypeMetadataBuilder {
    meta: TypeMetadata,
}

impl TypeMetadataBuilder {
    /// Copies every member of `parent`; must be called before adding own members.
    pub fn inherits(mut self, parent: &TypeMetadata) -> Self {
        self.meta.ancestors = std::iter::once(parent.class_name.clone())
            .chain(parent.ancestors.iter().cloned())
            .collect();
        self.meta.properties = parent.properties.clone();
        self.meta.methods = parent.methods.clone();
        self.meta.events = parent.events.clone();
        self.meta.own_property_offset = self.meta.properties.len();
        self.meta.own_method_offset = self.meta.methods.len();
        self.meta.own_event_offset = self.meta.events.len();
        self
    }

    pub fn property(mut self, property: PropertyMeta) -> Self {
        self.meta.properties.push(property);
        self
    }

    pub fn method(mut self, method: MethodMeta) -> Self {
        self.meta.methods.push(method);
        self
    }

    pub fn event(mut self, event: EventMeta) -> Self {
        self.meta.events.push(event);
        self
    }

    pub fn build(self) -> Arc<TypeMetadata> {
        Arc::new(self.meta)
    }
}

/// Members left out of a wrapper's reflected surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct WrapOptions {
    pub exclude_superclass_properties: bool,
    /// Also applies to superclass events.
    pub exclude_superclass_methods: bool,
    pub exclude_slots: bool,
    pub skip_methods_in_enumeration: bool,
}

impl WrapOptions {
    pub fn exclude_superclass_contents() -> Self {
        Self {
            exclude_superclass_properties: true,
            exclude_superclass_methods: true,
            ..Self::default()
        }
    }
}

/// Who is responsible for destroying a wrapped native object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ownership {
    /// The native object is released once its wrapper becomes unreachable.
    EngineOwned,
    /// Native code owns the object; the wrapper only observes it.
    NativeOwned,
    /// `NativeOwned` when the object already has an owner elsewhere.
    #[default]
    Auto,
}

#[cfg(test)]
mod meta_tests {
    use super::*;

    #[test]
    fn inheritance_records_offsets_and_ancestors() {
        let base = TypeMetadata::builder("Base")
            .property(PropertyMeta::new("name", NativeType::String))
            .method(MethodMeta::new("ping", [], NativeType::Void))
            .build();
        let derived = TypeMetadata::builder("Derived")
            .inherits(&base)
            .property(PropertyMeta::new("size", NativeType::I32))
            .build();

        assert_eq!(derived.own_property_offset(), 1);
        assert_eq!(derived.own_method_offset(), 1);
        assert_eq!(derived.properties()[1].name, "size");
        assert!(derived.inherits("Base"));
        assert!(derived.inherits("Derived"));
        assert!(!base.inherits("Derived"));
    }

    #[test]
    fn constant_implies_read_only() {
        let property = PropertyMeta::new("id", NativeType::I64).constant();
        assert!(property.read_only);
        assert!(property.constant);
    }

    #[test]
    fn signature_lists_parameter_types() {
        let method = MethodMeta::new("add", [NativeType::I32, NativeType::String], NativeType::Void);
        assert_eq!(method.signature(), "add(i32,String)");
        assert_eq!(method.arity(), 2);
    }

    #[test]
    fn wrap_options_deserialize_with_defaults() {
        let options: WrapOptions =
            serde_json::from_str(r#"{"exclude_slots": true}"#).expect("options should parse");
        assert!(options.exclude_slots);
        assert!(!options.exclude_superclass_methods);
        let ownership: Ownership =
            serde_json::from_str(r#""native_owned""#).expect("ownership should parse");
        assert_eq!(ownership, Ownership::NativeOwned);
    }
}
