//! Declared shape of a service, shared by client stubs and server definitions.

use std::{collections::HashMap, time::Duration};

use brpc_proto::serializer::SerializerId;

/// Per-method overrides. Anything left unset falls back to the service.
#[derive(Debug, Clone, PartialEq, Eq, bon::Builder)]
pub struct MethodConfig {
    #[builder(into)]
    pub name: String,
    /// Name sent on the wire instead of `name`.
    #[builder(into)]
    pub wire_name: Option<String>,
    pub oneway: Option<bool>,
    pub serializer: Option<SerializerId>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct ServiceInterface {
    name: String,
    oneway: bool,
    serializer: SerializerId,
    methods: HashMap<String, MethodConfig>,
}

#[bon::bon]
impl ServiceInterface {
    #[builder]
    pub fn new(
        #[builder(into)] name: String,
        #[builder(default)] oneway: bool,
        #[builder(default)] serializer: SerializerId,
        #[builder(default)] methods: Vec<MethodConfig>,
    ) -> Self {
        Self {
            name,
            oneway,
            serializer,
            methods: methods
                .into_iter()
                .map(|method| (method.name.clone(), method))
                .collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn serializer(&self) -> SerializerId {
        self.serializer
    }

    pub fn method(&self, name: &str) -> Option<&MethodConfig> {
        self.methods.get(name)
    }

    /// Applies the method's overrides on top of the service defaults.
    /// Undeclared methods get the defaults.
    pub fn resolve(&self, method: &str) -> MethodDescriptor {
        let config = self.methods.get(method);

        MethodDescriptor {
            service_name: self.name.clone(),
            method_name: method.to_string(),
            wire_name: config
                .and_then(|config| config.wire_name.clone())
                .unwrap_or_else(|| method.to_string()),
            oneway: config
                .and_then(|config| config.oneway)
                .unwrap_or(self.oneway),
            serializer: config
                .and_then(|config| config.serializer)
                .unwrap_or(self.serializer),
            timeout: config.and_then(|config| config.timeout),
        }
    }
}

/// A fully resolved method, ready to be put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub service_name: String,
    pub method_name: String,
    pub wire_name: String,
    pub oneway: bool,
    pub serializer: SerializerId,
    pub timeout: Option<Duration>,
}
