//! Tool trait and registry
//!
//! Tools are named operations with a declared input schema and a
//! side-effect class. The registry validates arguments, applies the
//! per-call timeout and converts every failure into a `ToolResult`.

use crate::error::ToolError;
use crate::models::{HandlerId, SideEffect, ToolCall, ToolResult};
use crate::session::{Session, Turn};
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub mod financial;
pub use financial::{create_registry, FinancialApiClient};

/// Default per-call timeout
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

//
// ================= Schema =================
//

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
}

impl FieldType {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Object => value.is_object(),
            FieldType::Array => value.is_array(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub field_type: FieldType,
    pub required: bool,
    pub description: &'static str,
}

/// Declared argument shape of a tool
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolSchema {
    fields: Vec<FieldSpec>,
}

impl ToolSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(
        mut self,
        name: &'static str,
        field_type: FieldType,
        description: &'static str,
    ) -> Self {
        self.fields.push(FieldSpec {
            name,
            field_type,
            required: true,
            description,
        });
        self
    }

    pub fn optional(
        mut self,
        name: &'static str,
        field_type: FieldType,
        description: &'static str,
    ) -> Self {
        self.fields.push(FieldSpec {
            name,
            field_type,
            required: false,
            description,
        });
        self
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// Check that `args` is an object whose declared fields are present and
    /// well-typed. Undeclared fields are allowed through.
    pub fn validate(&self, args: &Value) -> std::result::Result<(), String> {
        let object = args
            .as_object()
            .ok_or_else(|| "arguments must be a JSON object".to_string())?;

        for field in &self.fields {
            match object.get(field.name) {
                None | Some(Value::Null) if field.required => {
                    return Err(format!("missing required field '{}'", field.name));
                }
                None | Some(Value::Null) => {}
                Some(value) if !field.field_type.accepts(value) => {
                    return Err(format!(
                        "field '{}' must be of type {:?}",
                        field.name, field.field_type
                    ));
                }
                Some(_) => {}
            }
        }

        Ok(())
    }

    /// JSON-Schema-like rendering for oracle prompts
    pub fn to_json(&self) -> Value {
        let properties: serde_json::Map<String, Value> = self
            .fields
            .iter()
            .map(|f| {
                (
                    f.name.to_string(),
                    json!({ "type": f.field_type, "description": f.description }),
                )
            })
            .collect();

        let required: Vec<&str> = self
            .fields
            .iter()
            .filter(|f| f.required)
            .map(|f| f.name)
            .collect();

        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

//
// ================= Tool trait =================
//

/// A single executable tool
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn schema(&self) -> &ToolSchema;

    fn side_effect(&self) -> SideEffect {
        SideEffect::ReadOnly
    }

    async fn execute(&self, args: &Value) -> std::result::Result<Value, ToolError>;
}

type ToolFuture = BoxFuture<'static, std::result::Result<Value, ToolError>>;
type Executor = Arc<dyn Fn(Value) -> ToolFuture + Send + Sync>;

/// Tool backed by a closure, for `ToolRegistry::register_fn`
struct FnTool {
    name: String,
    description: String,
    schema: ToolSchema,
    side_effect: SideEffect,
    executor: Executor,
}

#[async_trait::async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    fn side_effect(&self) -> SideEffect {
        self.side_effect
    }

    async fn execute(&self, args: &Value) -> std::result::Result<Value, ToolError> {
        (self.executor)(args.clone()).await
    }
}

/// What a handler is told about a tool it may call
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    pub mutating: bool,
}

//
// ================= Registry =================
//

/// Tool registry for looking up and invoking tools
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
    timeout: Duration,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: BTreeMap::new(),
            timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Register a closure as a tool
    pub fn register_fn<F, Fut>(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        schema: ToolSchema,
        side_effect: SideEffect,
        executor: F,
    ) where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, ToolError>> + Send + 'static,
    {
        let boxed: Executor = Arc::new(move |args| -> ToolFuture {
            Box::pin(executor(args))
        });
        self.register(Arc::new(FnTool {
            name: name.into(),
            description: description.into(),
            schema,
            side_effect,
            executor: boxed,
        }));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn list(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    pub fn side_effect_of(&self, name: &str) -> Option<SideEffect> {
        self.tools.get(name).map(|t| t.side_effect())
    }

    /// Descriptors for the named tools that are registered, in the given order
    pub fn descriptors(&self, names: &[&str]) -> Vec<ToolDescriptor> {
        names
            .iter()
            .filter_map(|name| self.tools.get(*name))
            .map(|tool| ToolDescriptor {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.schema().to_json(),
                mutating: tool.side_effect() == SideEffect::Mutating,
            })
            .collect()
    }

    /// Validate and execute one tool. Never retries.
    pub async fn invoke(&self, name: &str, args: &Value) -> ToolResult {
        match self.try_invoke(name, args).await {
            Ok(value) => ToolResult::Success(value),
            Err(error) => ToolResult::Failure(error.into()),
        }
    }

    async fn try_invoke(&self, name: &str, args: &Value) -> std::result::Result<Value, ToolError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;

        tool.schema()
            .validate(args)
            .map_err(|detail| ToolError::SchemaViolation {
                tool: name.to_string(),
                detail,
            })?;

        match tokio::time::timeout(self.timeout, tool.execute(args)).await {
            Ok(result) => result,
            Err(_) => Err(ToolError::Timeout {
                tool: name.to_string(),
                after_ms: self.timeout.as_millis() as u64,
            }),
        }
    }

    /// Invoke a handler's tool call and append its result to the session
    /// log before returning it.
    pub async fn execute_call(
        &self,
        handler: HandlerId,
        call: &ToolCall,
        session: &mut Session,
    ) -> ToolResult {
        let start = Instant::now();
        let result = self.invoke(&call.tool_name, &call.arguments).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let side_effect = self
            .side_effect_of(&call.tool_name)
            .unwrap_or(SideEffect::ReadOnly);

        let audit = json!({
            "event": "tool_audit",
            "tool": call.tool_name,
            "handler": handler.as_str(),
            "ok": result.is_success(),
            "outcome": result.failure().map(|f| f.kind.to_string()).unwrap_or_else(|| "ok".to_string()),
            "mutating": side_effect == SideEffect::Mutating,
            "duration_ms": duration_ms,
            "args_preview": args_preview(&call.arguments),
        });

        if result.is_success() {
            info!(audit = %audit, "tool");
        } else {
            warn!(audit = %audit, "tool");
        }

        session.append(Turn::tool_result(
            handler,
            call,
            side_effect,
            result.clone(),
            duration_ms,
        ));

        result
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
