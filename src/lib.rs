//! # debug-agent
//!
//! A JVMTI agent that logs the arguments and the result (or exception) of
//! selected Java methods, without touching the application's code.
//!
//! ```bash
//! java -agentpath:/path/to/libdebug_agent.so=debug=true;methods=java.net.InetAddress::getByName(java.lang.String) -jar app.jar
//! ```
//!
//! ```text
//! 2024-05-02 10:41:07.113 [main] DebugAgent InetAddress::getByName(example.com) => example.com/93.184.215.14
//! 2024-05-02 10:41:07.120 [main] DebugAgent InetAddress::getByName(nope.invalid) => java.net.UnknownHostException: nope.invalid
//! ```
//!
//! ## How it works
//!
//! 1. `Agent_OnLoad` parses the option string into method selectors
//!    ([`config`], [`selector`]) and groups them by class ([`registry`]).
//! 2. A `ClassFileLoadHook` callback sees every class before it is linked.
//!    Classes with selectors are parsed ([`classfile`]) and logging is woven
//!    into both exits of each selected method ([`instrument`], [`weaver`],
//!    [`bytecode`]); everything else passes through untouched ([`agent`]).
//! 3. The instrumented methods print one line per call to `System.err`.
//!
//! No failure is fatal: bad selectors, missing methods and unparseable
//! classes are reported as `>>> DebugAgent ERROR:` lines ([`logging`]) and
//! the class loads in its original form.

pub mod agent;
pub mod bytecode;
pub mod classfile;
pub mod config;
pub mod descriptor;
pub mod editor;
pub mod env;
pub mod error;
pub mod fragment;
pub mod instrument;
pub mod logging;
pub mod registry;
pub mod selector;
pub mod sys;
pub mod weaver;

pub use agent::{DebugAgent, Interceptor};
pub use error::AgentError;
pub use instrument::{instrument_class, Disposition, InstrumentationOutcome};
pub use registry::TransformRegistry;
pub use selector::MethodSelector;

use env::Jvmti;
use std::ffi::CStr;
use std::os::raw::{c_char, c_uchar};
use std::panic::{self, AssertUnwindSafe};
use std::sync::OnceLock;
use sys::{jni, jvmti};
use tracing::error;

/// One `ClassFileLoadHook` event.
#[derive(Debug, Clone, Copy)]
pub struct ClassLoadEvent<'a> {
    /// Internal name such as `java/net/InetAddress`; `None` for hidden and
    /// anonymous classes.
    pub name: Option<&'a str>,
    /// The class is being redefined or retransformed rather than loaded.
    pub redefining: bool,
    /// The class file as the VM would link it.
    pub bytes: &'a [u8],
}

/// A JVMTI agent.
///
/// One instance lives for the whole VM. Event methods run on whatever thread
/// triggered the event, concurrently with each other.
pub trait Agent: Sync + Send {
    /// Called from `Agent_OnLoad` with the text after `=` in `-agentpath`.
    ///
    /// Return [`jni::JNI_OK`] to continue, [`jni::JNI_ERR`] to abort VM
    /// startup.
    fn on_load(&self, vm: *mut jni::JavaVM, options: &str) -> jni::jint;

    /// Called from `Agent_OnUnload`.
    fn on_unload(&self) {}

    /// Sees a class before it is linked. `Some(bytes)` replaces the class
    /// file, `None` keeps it.
    ///
    /// A panic here is caught and treated as `None`.
    fn class_file_load_hook(&self, _jvmti: &Jvmti, _event: ClassLoadEvent<'_>) -> Option<Vec<u8>> {
        None
    }
}

/// The exported agent, reachable from the `extern "system"` callbacks.
pub static GLOBAL_AGENT: OnceLock<Box<dyn Agent>> = OnceLock::new();

/// Registers the agent instance; fails if one is already registered.
pub fn set_global_agent(agent: Box<dyn Agent>) -> Result<(), Box<dyn Agent>> {
    GLOBAL_AGENT.set(agent)
}

unsafe extern "system" fn trampoline_class_file_load_hook(
    env: *mut jvmti::jvmtiEnv,
    _jni: *mut jni::JNIEnv,
    class_being_redefined: jni::jclass,
    _loader: jni::jobject,
    name: *const c_char,
    _protection_domain: jni::jobject,
    class_data_len: jni::jint,
    class_data: *const c_uchar,
    new_class_data_len: *mut jni::jint,
    new_class_data: *mut *mut c_uchar,
) {
    let Some(agent) = GLOBAL_AGENT.get() else { return };
    if class_data.is_null() || class_data_len <= 0 || new_class_data_len.is_null() || new_class_data.is_null() {
        return;
    }

    // class names arrive in modified UTF-8
    let name = if name.is_null() {
        None
    } else {
        classfile::decode_modified_utf8(CStr::from_ptr(name).to_bytes())
    };
    let event = ClassLoadEvent {
        name: name.as_deref(),
        redefining: !class_being_redefined.is_null(),
        bytes: std::slice::from_raw_parts(class_data, class_data_len as usize),
    };
    let jvmti = Jvmti::from_raw(env);
    let class = || name.as_deref().unwrap_or("<unnamed>").replace('/', ".");

    match panic::catch_unwind(AssertUnwindSafe(|| agent.class_file_load_hook(&jvmti, event))) {
        Ok(Some(bytes)) => match jvmti.install_bytes(&bytes) {
            Ok((len, data)) => {
                *new_class_data_len = len;
                *new_class_data = data;
            }
            Err(e) => error!("{}", AgentError::ClassTransformFailure { class: class(), reason: e.to_string() }),
        },
        Ok(None) => {}
        Err(_) => error!(
            "{}",
            AgentError::ClassTransformFailure { class: class(), reason: "panic while instrumenting".to_string() }
        ),
    }
}

/// Callbacks routing JVMTI events to [`GLOBAL_AGENT`], for
/// [`Jvmti::set_event_callbacks`].
pub fn event_callbacks() -> jvmti::jvmtiEventCallbacks {
    jvmti::jvmtiEventCallbacks {
        ClassFileLoadHook: Some(trampoline_class_file_load_hook),
        ..Default::default()
    }
}

/// Exports an [`Agent`] type as the `Agent_OnLoad` / `Agent_OnUnload` entry
/// points of this library.
///
/// The type must implement [`Default`]. Only one agent can be exported per
/// library.
#[macro_export]
macro_rules! export_agent {
    ($agent_type:ty) => {
        #[no_mangle]
        #[allow(non_snake_case)]
        pub unsafe extern "system" fn Agent_OnLoad(
            vm: *mut $crate::sys::jni::JavaVM,
            options: *mut std::ffi::c_char,
            _reserved: *mut std::ffi::c_void,
        ) -> $crate::sys::jni::jint {
            let agent = Box::new(<$agent_type>::default());
            if $crate::set_global_agent(agent).is_err() {
                return $crate::sys::jni::JNI_ERR;
            }

            let options = if options.is_null() {
                std::borrow::Cow::Borrowed("")
            } else {
                std::ffi::CStr::from_ptr(options).to_string_lossy()
            };

            match $crate::GLOBAL_AGENT.get() {
                Some(agent) => agent.on_load(vm, &options),
                None => $crate::sys::jni::JNI_ERR,
            }
        }

        #[no_mangle]
        #[allow(non_snake_case)]
        pub unsafe extern "system" fn Agent_OnUnload(_vm: *mut $crate::sys::jni::JavaVM) {
            if let Some(agent) = $crate::GLOBAL_AGENT.get() {
                agent.on_unload();
            }
        }
    };
}

export_agent!(agent::DebugAgent);
