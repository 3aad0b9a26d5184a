//! Command modules and their method tables
//!
//! A module is anything implementing [`Service`]. Hosted modules route calls
//! through a [`MethodTable`], which maps method names to typed handler
//! functions registered when the module is built. Every table answers
//! `docs` with a machine-readable description of its methods.

pub mod garage_doors;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;

use crate::config::{ModuleConfig, ModuleKind};
use crate::envelope::{Request, Response};
use crate::{Error, Result};

pub use garage_doors::GarageDoors;

/// Name of the documentation method every module answers
pub const DOCS_METHOD: &str = "docs";

/// A callable command module
#[async_trait]
pub trait Service: Send + Sync {
    /// Module name, used as its topic suffix and socket name
    fn name(&self) -> &str;

    /// Handle one request
    ///
    /// Failures are reported in the response, never as a panic.
    async fn call(&self, request: Request) -> Response;
}

/// Handler for one method of module `M`
pub type Handler<M> = for<'a> fn(&'a M, &'a Request) -> BoxFuture<'a, Response>;

/// Documentation for one method argument
#[derive(Debug, Clone, Serialize)]
pub struct ArgDoc {
    /// Argument name
    pub name: String,
    /// JSON type of the argument
    #[serde(rename = "type")]
    pub kind: String,
    /// Whether the argument must be present
    pub required: bool,
    /// Allowed values, when the argument is an enumeration
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl ArgDoc {
    /// Required argument of a JSON type
    #[must_use]
    pub fn required(name: &str, kind: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: kind.to_string(),
            required: true,
            options: Vec::new(),
        }
    }

    /// Optional argument of a JSON type
    #[must_use]
    pub fn optional(name: &str, kind: &str) -> Self {
        Self {
            required: false,
            ..Self::required(name, kind)
        }
    }

    /// Restrict the argument to a set of values
    #[must_use]
    pub fn with_options(mut self, options: impl IntoIterator<Item = String>) -> Self {
        self.options = options.into_iter().collect();
        self
    }
}

/// Documentation for one method
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodDoc {
    /// Human description
    pub human: String,
    /// Method name as callers spell it
    pub method_name: String,
    /// Accepted arguments
    pub args: Vec<ArgDoc>,
}

struct Method<M> {
    handler: Handler<M>,
    doc: MethodDoc,
}

/// Method name to handler mapping for a module type
pub struct MethodTable<M> {
    module: String,
    methods: HashMap<String, Method<M>>,
    documentation: Value,
}

impl<M> std::fmt::Debug for MethodTable<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodTable")
            .field("module", &self.module)
            .field("methods", &self.method_names())
            .finish()
    }
}

impl<M> MethodTable<M> {
    /// Start a table for the named module
    #[must_use]
    pub fn builder(module: impl Into<String>) -> MethodTableBuilder<M> {
        MethodTableBuilder {
            module: module.into(),
            methods: Vec::new(),
        }
    }

    /// Registered method names, sorted, including `docs`
    #[must_use]
    pub fn method_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.push(DOCS_METHOD);
        names.sort_unstable();
        names
    }

    /// Documentation for every method
    #[must_use]
    pub const fn documentation(&self) -> &Value {
        &self.documentation
    }

    /// Route a request to its handler
    ///
    /// Method names match case-insensitively, so `Trigger` and `trigger`
    /// reach the same handler.
    pub async fn dispatch(&self, module: &M, request: &Request) -> Response {
        let method = request.method.to_ascii_lowercase();

        if method == DOCS_METHOD {
            return Response::ok(self.module.as_str())
                .with("documentation", self.documentation.clone());
        }

        match self.methods.get(&method) {
            Some(entry) => (entry.handler)(module, request).await,
            None => {
                tracing::debug!(module = %self.module, method = %request.method, "method not found");
                Response::error(self.module.as_str(), &request.method, "Method not found.")
            }
        }
    }
}

/// Collects handlers before validation
pub struct MethodTableBuilder<M> {
    module: String,
    methods: Vec<(String, Method<M>)>,
}

impl<M> MethodTableBuilder<M> {
    /// Register a handler with its documentation
    #[must_use]
    pub fn method(mut self, name: &str, human: &str, args: Vec<ArgDoc>, handler: Handler<M>) -> Self {
        self.methods.push((
            name.to_ascii_lowercase(),
            Method {
                handler,
                doc: MethodDoc {
                    human: human.to_string(),
                    method_name: name.to_string(),
                    args,
                },
            },
        ));
        self
    }

    /// Validate and build the table
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a method name is registered twice or
    /// collides with `docs`
    pub fn build(self) -> Result<MethodTable<M>> {
        let mut methods = HashMap::with_capacity(self.methods.len());

        for (name, method) in self.methods {
            if name == DOCS_METHOD {
                return Err(Error::Config(format!(
                    "module '{}' may not register reserved method '{DOCS_METHOD}'",
                    self.module
                )));
            }
            if methods.insert(name.clone(), method).is_some() {
                return Err(Error::Config(format!(
                    "module '{}' registers method '{name}' twice",
                    self.module
                )));
            }
        }

        let mut docs: Vec<&MethodDoc> = methods.values().map(|m| &m.doc).collect();
        docs.sort_by(|a, b| a.method_name.cmp(&b.method_name));
        let documentation = serde_json::to_value(docs)?;

        Ok(MethodTable {
            module: self.module,
            methods,
            documentation,
        })
    }
}

/// Build the service for a configured module
///
/// # Errors
///
/// Returns error if the module's typed section is missing or its hardware
/// cannot be opened
pub fn build_service(config: &ModuleConfig) -> Result<Arc<dyn Service>> {
    match config.kind {
        ModuleKind::GarageDoors => {
            let section = config.garage_doors.as_ref().ok_or_else(|| {
                Error::Config(format!("module '{}' is missing [garage_doors]", config.name))
            })?;
            Ok(Arc::new(GarageDoors::from_config(&config.name, section)?))
        }
    }
}
