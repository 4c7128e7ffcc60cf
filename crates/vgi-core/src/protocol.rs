//! The method registry.

use std::collections::BTreeMap;

use vgi_types::{keys, RpcError};

use crate::method::Method;

/// A named, immutable collection of methods.
///
/// Built once at service startup and shared read-only afterwards. Method
/// names are unique; the sorted map keeps the describe batch stable no
/// matter the registration order.
pub struct Protocol {
    name: String,
    methods: BTreeMap<String, Method>,
}

impl Protocol {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a method under a unique name.
    pub fn register(&mut self, name: impl Into<String>, method: Method) -> Result<(), RpcError> {
        let name = name.into();
        if name == keys::DESCRIBE_METHOD {
            return Err(RpcError::protocol(format!(
                "method name {name:?} is reserved"
            )));
        }
        if self.methods.contains_key(&name) {
            return Err(RpcError::protocol(format!(
                "method {name:?} is already registered"
            )));
        }
        self.methods.insert(name, method);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Method> {
        self.methods.get(name)
    }

    /// Registered names in sorted order.
    pub fn method_names(&self) -> Vec<&str> {
        self.methods.keys().map(String::as_str).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Method)> {
        self.methods.iter().map(|(name, m)| (name.as_str(), m))
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}
