//! Interception Entry Point and the agent wired into the JVM.

use crate::config::AgentConfig;
use crate::env::{Jvmti, JvmtiError};
use crate::error::AgentError;
use crate::instrument::{instrument_class, Disposition};
use crate::registry::TransformRegistry;
use crate::sys::{jni, jvmti};
use crate::weaver::ClassFileEditor;
use crate::{logging, Agent, ClassLoadEvent};
use std::sync::{Arc, OnceLock};
use tracing::{debug, error};

/// Routes class-load events to the instrumenter.
///
/// Per event: `Observed -> Routed -> Instrumented | PassThrough`. Only the
/// read-only registry is shared between class-loading threads.
#[derive(Debug, Clone)]
pub struct Interceptor {
    registry: Arc<TransformRegistry>,
}

impl Interceptor {
    pub fn new(registry: Arc<TransformRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &TransformRegistry {
        &self.registry
    }

    pub fn on_class_load(&self, event: &ClassLoadEvent<'_>) -> Disposition {
        // hidden and anonymous classes have no name to route on
        let Some(internal_name) = event.name else {
            return Disposition::PassThrough;
        };
        if event.redefining {
            return Disposition::PassThrough;
        }

        let class = internal_name.replace('/', ".");
        let selectors = self.registry.lookup(&class);
        if selectors.is_empty() {
            return Disposition::PassThrough;
        }

        let editor = match ClassFileEditor::parse(event.bytes) {
            Ok(editor) => editor,
            Err(e) => {
                error!("{}", AgentError::class_failure(class, &e));
                return Disposition::PassThrough;
            }
        };

        let outcome = instrument_class(editor, selectors);
        if outcome.is_instrumented() {
            debug!("Instrumenting {class}");
        }
        for failure in &outcome.failures {
            error!("{failure}");
        }
        outcome.disposition
    }
}

/// The agent exported as `Agent_OnLoad`.
#[derive(Default)]
pub struct DebugAgent {
    interceptor: OnceLock<Interceptor>,
}

impl DebugAgent {
    fn start(vm: *mut jni::JavaVM) -> Result<(), JvmtiError> {
        let jvmti = Jvmti::new(vm)?;

        let mut caps = jvmti::jvmtiCapabilities::default();
        caps.set_can_generate_all_class_hook_events(true);
        caps.set_can_generate_early_class_hook_events(true);
        jvmti.add_capabilities(&caps)?;

        jvmti.set_event_callbacks(crate::event_callbacks())?;
        jvmti.set_event_notification_mode(true, jvmti::JVMTI_EVENT_CLASS_FILE_LOAD_HOOK)
    }
}

impl Agent for DebugAgent {
    fn on_load(&self, vm: *mut jni::JavaVM, options: &str) -> jni::jint {
        let (config, errors) = AgentConfig::from_options(options);
        logging::init(config.debug);
        for e in &errors {
            error!("{e}");
        }
        if !config.unknown_options.is_empty() {
            debug!("Ignoring unknown agent options: {}", config.unknown_options.join(", "));
        }
        if config.using_defaults {
            debug!("No methods configured, using the {} default selectors", config.selectors.len());
        }
        for selector in &config.selectors {
            debug!("Selected {selector}");
        }

        let registry = Arc::new(TransformRegistry::build(config.selectors));
        if self.interceptor.set(Interceptor::new(registry)).is_err() {
            error!("Agent is already loaded");
            return jni::JNI_ERR;
        }

        match Self::start(vm) {
            Ok(()) => jni::JNI_OK,
            Err(e) => {
                error!("Failed to start: {e}");
                jni::JNI_ERR
            }
        }
    }

    fn class_file_load_hook(&self, _jvmti: &Jvmti, event: ClassLoadEvent<'_>) -> Option<Vec<u8>> {
        match self.interceptor.get()?.on_class_load(&event) {
            Disposition::Instrumented(bytes) => Some(bytes),
            Disposition::PassThrough => None,
        }
    }
}
