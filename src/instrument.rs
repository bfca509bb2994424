//! Method Instrumenter: applies every selector of one class to a
//! [`ClassEditor`], isolating failures per method.

use crate::editor::ClassEditor;
use crate::error::AgentError;
use crate::fragment::LogTemplate;
use crate::selector::{simple_name, MethodSelector};
use tracing::debug;

/// Caught by every failure handler: checked exceptions, runtime exceptions
/// and errors alike.
pub const CAUGHT_EXCEPTION: &str = "java.lang.Throwable";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// The class must be replaced by these bytes.
    Instrumented(Vec<u8>),
    /// The class loads as it is.
    PassThrough,
}

#[derive(Debug)]
pub struct InstrumentationOutcome {
    pub disposition: Disposition,
    /// Selectors, as displayed, whose method was instrumented.
    pub instrumented: Vec<String>,
    pub failures: Vec<AgentError>,
}

impl InstrumentationOutcome {
    pub fn is_instrumented(&self) -> bool {
        matches!(self.disposition, Disposition::Instrumented(_))
    }
}

/// Instruments each selected method of the class behind `editor`.
///
/// A selector that cannot be applied is recorded in `failures` and the rest
/// carry on. The class is rewritten only when at least one method was
/// instrumented.
pub fn instrument_class<E: ClassEditor>(mut editor: E, selectors: &[MethodSelector]) -> InstrumentationOutcome {
    let class = editor.class_name();
    let mut instrumented = Vec::new();
    let mut failures = Vec::new();

    for selector in selectors {
        match instrument_method(&mut editor, &class, selector) {
            Ok(()) => instrumented.push(selector.to_string()),
            Err(e) => failures.push(e),
        }
    }

    if instrumented.is_empty() {
        return InstrumentationOutcome { disposition: Disposition::PassThrough, instrumented, failures };
    }

    match editor.to_bytecode() {
        Ok(bytes) => InstrumentationOutcome { disposition: Disposition::Instrumented(bytes), instrumented, failures },
        Err(e) => {
            failures.push(AgentError::class_failure(class, &e));
            InstrumentationOutcome { disposition: Disposition::PassThrough, instrumented: Vec::new(), failures }
        }
    }
}

fn instrument_method<E: ClassEditor>(editor: &mut E, class: &str, selector: &MethodSelector) -> Result<(), AgentError> {
    let params = selector.resolve_argument_types()?;
    let method = editor
        .find_method(&selector.method_name, &params)
        .ok_or_else(|| AgentError::MethodNotFound { class: class.to_string(), selector: selector.to_string() })?;
    let descriptor = editor.method_descriptor(method)?;

    let owner = simple_name(class);
    debug!("Instrumenting {}::{}", owner, selector.method_name);

    let template = LogTemplate::new(owner, &selector.method_name, descriptor.params);
    let planned = editor
        .insert_after(method, template.success(&descriptor.ret))
        .and_then(|()| editor.add_catch(method, template.failure(), CAUGHT_EXCEPTION));
    if planned.is_err() {
        editor.revert(method);
    }
    planned
}
