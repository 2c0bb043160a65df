//! Program packaging - the self-contained form of a task that a context runs.
//!
//! A computation crosses the isolation boundary only as a plain `fn` pointer,
//! so it cannot capture anything from the caller's scope. The one channel for
//! carrying state into a context is the preparation step, whose arguments are
//! JSON-encoded into the Program when it is built and decoded again inside the
//! context.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TaskError;

mod finite;

/// Ordered argument list of one call.
pub type Args = Vec<Value>;

/// Outcome of one call as seen inside the context.
pub type CallFuture = BoxFuture<'static, Result<Value, String>>;

/// A computation with no captured environment.
///
/// Non-capturing closures coerce to this type:
///
/// ```
/// use futures::FutureExt;
/// use taskwave::program::Computation;
///
/// let sum: Computation = |args| {
///     async move { Ok(args.iter().filter_map(|v| v.as_i64()).sum::<i64>().into()) }.boxed()
/// };
/// # let _ = sum;
/// ```
pub type Computation = fn(Args) -> CallFuture;

/// The computation a preparation step produces. It is built inside the
/// context, so it may capture whatever the preparation computed.
pub type PreparedComputation = Box<dyn Fn(Args) -> CallFuture + Send + Sync>;

/// One-time, per-context initialization producing the actual computation.
pub type Preparation = fn(Args) -> BoxFuture<'static, Result<PreparedComputation, String>>;

/// What a task computes.
#[derive(Clone, Copy)]
pub enum TaskDefinition {
    Direct(Computation),
    Prepared(Preparation),
}

impl TaskDefinition {
    pub fn is_prepared(&self) -> bool {
        matches!(self, Self::Prepared(_))
    }
}

impl std::fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct(_) => f.write_str("Direct"),
            Self::Prepared(_) => f.write_str("Prepared"),
        }
    }
}

/// Serializable form of a Program, for contexts that live in another process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramImage {
    /// Catalog entry the receiving process resolves the definition from.
    pub entry: String,
    /// JSON text of the preparation arguments, exactly as packaged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preparation_args: Option<String>,
}

/// Immutable packaged task: definition plus baked-in preparation arguments.
///
/// Built once per pool and handed unchanged to every spawned context.
#[derive(Clone, Debug)]
pub struct Program {
    inner: Arc<ProgramInner>,
}

#[derive(Debug)]
struct ProgramInner {
    definition: TaskDefinition,
    preparation_args: Option<String>,
    entry: Option<Cow<'static, str>>,
}

impl Program {
    /// Package a definition together with its preparation arguments.
    ///
    /// Prepared definitions without arguments get an empty argument list.
    /// Direct definitions take no arguments.
    pub fn build<A: Serialize + ?Sized>(
        definition: TaskDefinition,
        preparation_args: Option<&A>,
    ) -> Result<Self, TaskError> {
        let preparation_args = match (definition, preparation_args) {
            (TaskDefinition::Direct(_), Some(_)) => {
                return Err(TaskError::invalid_program(
                    "preparation arguments given for a task without a preparation step",
                ));
            }
            (TaskDefinition::Direct(_), None) => None,
            (TaskDefinition::Prepared(_), Some(args)) => Some(encode_preparation_args(args)?),
            (TaskDefinition::Prepared(_), None) => Some("[]".to_string()),
        };

        Ok(Self {
            inner: Arc::new(ProgramInner {
                definition,
                preparation_args,
                entry: None,
            }),
        })
    }

    pub fn direct(computation: Computation) -> Self {
        Self {
            inner: Arc::new(ProgramInner {
                definition: TaskDefinition::Direct(computation),
                preparation_args: None,
                entry: None,
            }),
        }
    }

    pub fn prepared<A: Serialize + ?Sized>(
        preparation: Preparation,
        args: &A,
    ) -> Result<Self, TaskError> {
        Self::build(TaskDefinition::Prepared(preparation), Some(args))
    }

    /// Name this program after its catalog entry so process contexts can
    /// resolve it.
    pub fn with_entry(self, entry: impl Into<Cow<'static, str>>) -> Self {
        Self {
            inner: Arc::new(ProgramInner {
                definition: self.inner.definition,
                preparation_args: self.inner.preparation_args.clone(),
                entry: Some(entry.into()),
            }),
        }
    }

    pub fn definition(&self) -> TaskDefinition {
        self.inner.definition
    }

    pub fn entry(&self) -> Option<&str> {
        self.inner.entry.as_deref()
    }

    /// JSON text of the packaged preparation arguments.
    pub fn preparation_args(&self) -> Option<&str> {
        self.inner.preparation_args.as_deref()
    }

    /// Wire image, or `None` if the program has no catalog entry.
    pub fn image(&self) -> Option<ProgramImage> {
        self.entry().map(|entry| ProgramImage {
            entry: entry.to_string(),
            preparation_args: self.inner.preparation_args.clone(),
        })
    }

    /// Run the preparation step (if any) and produce the callable routine.
    ///
    /// Only ever called inside an execution context, once per context.
    pub async fn load(&self) -> Result<Routine, String> {
        match self.inner.definition {
            TaskDefinition::Direct(computation) => Ok(Routine::Direct(computation)),
            TaskDefinition::Prepared(preparation) => {
                let text = self.inner.preparation_args.as_deref().unwrap_or("[]");
                let args: Args = serde_json::from_str(text)
                    .map_err(|e| format!("invalid preparation arguments: {e}"))?;
                let computation = preparation(args).await?;
                Ok(Routine::Prepared(computation))
            }
        }
    }
}

fn encode_preparation_args<A: Serialize + ?Sized>(args: &A) -> Result<String, TaskError> {
    finite::check(args).map_err(|e| {
        TaskError::invalid_program(format!("preparation arguments do not round-trip: {e}"))
    })?;
    let text = serde_json::to_string(args).map_err(|e| {
        TaskError::invalid_program(format!("preparation arguments are not JSON-safe: {e}"))
    })?;
    let decoded: Value = serde_json::from_str(&text).map_err(|e| {
        TaskError::invalid_program(format!("preparation arguments do not round-trip: {e}"))
    })?;

    if !decoded.is_array() {
        return Err(TaskError::invalid_program(
            "preparation arguments must encode to a JSON array",
        ));
    }
    Ok(text)
}

/// A loaded program, ready to serve calls inside its context.
pub enum Routine {
    Direct(Computation),
    Prepared(PreparedComputation),
}

impl Routine {
    pub fn call(&self, args: Args) -> CallFuture {
        match self {
            Self::Direct(computation) => computation(args),
            Self::Prepared(computation) => computation(args),
        }
    }
}

/// Registry of task definitions by name.
///
/// A process context receives only a [`ProgramImage`]; it rebuilds the
/// Program from its own catalog, which must register the same entries as
/// the coordinator.
#[derive(Debug, Default, Clone)]
pub struct Catalog {
    entries: HashMap<String, TaskDefinition>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, entry: impl Into<String>, definition: TaskDefinition) -> Self {
        self.entries.insert(entry.into(), definition);
        self
    }

    pub fn get(&self, entry: &str) -> Option<TaskDefinition> {
        self.entries.get(entry).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rebuild the Program an image was packaged from.
    pub fn restore(&self, image: &ProgramImage) -> Result<Program, TaskError> {
        let definition = self.get(&image.entry).ok_or_else(|| {
            TaskError::invalid_program(format!("unknown catalog entry '{}'", image.entry))
        })?;

        let program = match (definition, image.preparation_args.as_deref()) {
            (TaskDefinition::Direct(computation), None) => Program::direct(computation),
            (TaskDefinition::Prepared(_), Some(text)) => {
                let args: Value = serde_json::from_str(text).map_err(|e| {
                    TaskError::invalid_program(format!("invalid preparation arguments: {e}"))
                })?;
                Program::build(definition, Some(&args))?
            }
            (TaskDefinition::Direct(_), Some(_)) => {
                return Err(TaskError::invalid_program(format!(
                    "entry '{}' has no preparation step but the image carries arguments",
                    image.entry
                )));
            }
            (TaskDefinition::Prepared(_), None) => {
                return Err(TaskError::invalid_program(format!(
                    "entry '{}' needs preparation arguments but the image carries none",
                    image.entry
                )));
            }
        };

        Ok(program.with_entry(image.entry.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn sum(args: Args) -> CallFuture {
        async move { Ok(args.iter().filter_map(Value::as_i64).sum::<i64>().into()) }.boxed()
    }

    fn add_offset(args: Args) -> BoxFuture<'static, Result<PreparedComputation, String>> {
        async move {
            let offset: i64 = args.iter().filter_map(Value::as_i64).sum();
            let computation: PreparedComputation = Box::new(move |args: Args| {
                let c = args.first().and_then(Value::as_i64).unwrap_or_default();
                async move { Ok(json!(offset + c)) }.boxed()
            });
            Ok(computation)
        }
        .boxed()
    }

    #[test]
    fn direct_program_has_no_preparation_args() {
        let program = Program::direct(sum);
        assert!(program.preparation_args().is_none());
        assert!(!program.definition().is_prepared());
        assert!(program.image().is_none());
    }

    #[test]
    fn prepared_args_are_baked_in_as_json() {
        let program = Program::prepared(add_offset, &(10, 15)).unwrap();
        assert_eq!(program.preparation_args(), Some("[10,15]"));
    }

    #[test]
    fn prepared_without_args_gets_empty_list() {
        let program = Program::build::<Value>(TaskDefinition::Prepared(add_offset), None).unwrap();
        assert_eq!(program.preparation_args(), Some("[]"));
    }

    #[test]
    fn direct_with_args_is_rejected() {
        let err = Program::build(TaskDefinition::Direct(sum), Some(&[1])).unwrap_err();
        assert!(matches!(err, TaskError::InvalidProgram(_)));
    }

    #[test]
    fn non_array_args_are_rejected() {
        let err = Program::prepared(add_offset, &json!({"a": 1})).unwrap_err();
        assert!(matches!(err, TaskError::InvalidProgram(_)));
    }

    #[test]
    fn non_string_map_keys_are_rejected() {
        let mut map = BTreeMap::new();
        map.insert(vec![1u8], 2);
        let err = Program::prepared(add_offset, &(map,)).unwrap_err();
        assert!(matches!(err, TaskError::InvalidProgram(_)));
    }

    #[test]
    fn non_finite_floats_are_rejected() {
        let err = Program::prepared(add_offset, &(f64::NAN, f64::INFINITY)).unwrap_err();
        match err {
            TaskError::InvalidProgram(msg) => assert!(msg.contains("NaN"), "got {msg}"),
            other => panic!("expected invalid program, got {other:?}"),
        }
        assert!(Program::prepared(add_offset, &[1.5, -0.25]).is_ok());
    }

    #[tokio::test]
    async fn load_runs_preparation_with_packaged_args() {
        let program = Program::prepared(add_offset, &(10, 15)).unwrap();
        let routine = program.load().await.unwrap();
        assert_eq!(routine.call(vec![json!(10)]).await.unwrap(), json!(35));
        assert_eq!(routine.call(vec![json!(20)]).await.unwrap(), json!(45));
    }

    #[tokio::test]
    async fn load_direct_calls_computation() {
        let routine = Program::direct(sum).load().await.unwrap();
        assert_eq!(
            routine.call(vec![json!(10), json!(10)]).await.unwrap(),
            json!(20)
        );
    }

    #[test]
    fn image_carries_entry_and_args() {
        let program = Program::prepared(add_offset, &[10, 15])
            .unwrap()
            .with_entry("add_offset");
        assert_eq!(
            program.image(),
            Some(ProgramImage {
                entry: "add_offset".to_string(),
                preparation_args: Some("[10,15]".to_string()),
            })
        );
    }

    #[tokio::test]
    async fn catalog_restores_prepared_program() {
        let catalog = Catalog::new()
            .register("sum", TaskDefinition::Direct(sum))
            .register("add_offset", TaskDefinition::Prepared(add_offset));
        assert_eq!(catalog.len(), 2);

        let image = Program::prepared(add_offset, &[1, 2])
            .unwrap()
            .with_entry("add_offset")
            .image()
            .unwrap();
        let restored = catalog.restore(&image).unwrap();

        assert_eq!(restored.entry(), Some("add_offset"));
        let routine = restored.load().await.unwrap();
        assert_eq!(routine.call(vec![json!(3)]).await.unwrap(), json!(6));
    }

    #[test]
    fn catalog_rejects_unknown_entry() {
        let image = ProgramImage {
            entry: "missing".to_string(),
            preparation_args: None,
        };
        let err = Catalog::new().restore(&image).unwrap_err();
        assert!(matches!(err, TaskError::InvalidProgram(_)));
    }

    #[test]
    fn catalog_rejects_kind_mismatch() {
        let catalog = Catalog::new().register("sum", TaskDefinition::Direct(sum));
        let image = ProgramImage {
            entry: "sum".to_string(),
            preparation_args: Some("[1]".to_string()),
        };
        assert!(catalog.restore(&image).is_err());
    }
}
