//! Safe wrapper around the JVMTI environment.
//!
//! The agent needs only a handful of JVMTI calls: request capabilities, wire
//! event callbacks, enable `ClassFileLoadHook`, and allocate VM-owned memory
//! for rewritten class files. Each returns a `Result` carrying the raw JVMTI
//! error code on failure.

use crate::sys::jni;
use crate::sys::jvmti;
use std::ffi::c_void;
use std::ptr;

/// A JVMTI (or JNI `GetEnv`) call that did not return success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum JvmtiError {
    #[error("JavaVM::GetEnv failed with JNI error {0}")]
    GetEnv(jni::jint),
    #[error("JVMTI function {0} is missing from the function table")]
    MissingFunction(&'static str),
    #[error("JVMTI {function} failed with error {code} ({})", describe(.code))]
    Call { function: &'static str, code: jvmti::jvmtiError },
    #[error("class file of {0} bytes does not fit a jint")]
    TooLarge(usize),
}

fn describe(code: &jvmti::jvmtiError) -> &'static str {
    match *code {
        jvmti::JVMTI_ERROR_NOT_AVAILABLE => "not available",
        jvmti::JVMTI_ERROR_MUST_POSSESS_CAPABILITY => "missing capability",
        jvmti::JVMTI_ERROR_NULL_POINTER => "null pointer",
        jvmti::JVMTI_ERROR_OUT_OF_MEMORY => "out of memory",
        jvmti::JVMTI_ERROR_WRONG_PHASE => "wrong phase",
        jvmti::JVMTI_ERROR_INTERNAL => "internal error",
        _ => "see jvmti.h",
    }
}

fn check(function: &'static str, code: jvmti::jvmtiError) -> Result<(), JvmtiError> {
    if code == jvmti::JVMTI_ERROR_NONE {
        Ok(())
    } else {
        Err(JvmtiError::Call { function, code })
    }
}

/// A safe wrapper around the raw JVMTI Environment pointer.
pub struct Jvmti {
    env: *mut jvmti::jvmtiEnv,
}

impl Jvmti {
    /// Connects to the JVM and retrieves a JVMTI 1.2 environment.
    pub fn new(vm: *mut jni::JavaVM) -> Result<Self, JvmtiError> {
        let mut env_ptr: *mut c_void = ptr::null_mut();

        let res = unsafe {
            // vm: *mut JavaVM = *mut *const JNIInvokeInterface_
            let get_env_fn = (**vm).GetEnv;
            get_env_fn(vm, &mut env_ptr, jvmti::JVMTI_VERSION_1_2)
        };
        if res != jni::JNI_OK || env_ptr.is_null() {
            return Err(JvmtiError::GetEnv(res));
        }

        Ok(Jvmti { env: env_ptr as *mut jvmti::jvmtiEnv })
    }

    /// Create a Jvmti wrapper from a raw jvmtiEnv pointer
    ///
    /// # Safety
    /// The caller must ensure the pointer is valid for the duration of use.
    pub unsafe fn from_raw(env: *mut jvmti::jvmtiEnv) -> Self {
        Jvmti { env }
    }

    fn functions(&self) -> &jvmti::jvmtiInterface_1_ {
        // The VM keeps the function table alive for the lifetime of the env.
        unsafe { &*(*self.env).functions }
    }

    pub fn add_capabilities(&self, caps: &jvmti::jvmtiCapabilities) -> Result<(), JvmtiError> {
        let add_caps_fn = self
            .functions()
            .AddCapabilities
            .ok_or(JvmtiError::MissingFunction("AddCapabilities"))?;
        check("AddCapabilities", unsafe { add_caps_fn(self.env, caps) })
    }

    pub fn set_event_callbacks(&self, callbacks: jvmti::jvmtiEventCallbacks) -> Result<(), JvmtiError> {
        let set_callbacks_fn = self
            .functions()
            .SetEventCallbacks
            .ok_or(JvmtiError::MissingFunction("SetEventCallbacks"))?;
        let size = std::mem::size_of::<jvmti::jvmtiEventCallbacks>() as jni::jint;
        check("SetEventCallbacks", unsafe { set_callbacks_fn(self.env, &callbacks, size) })
    }

    /// Enables or disables an event for all threads.
    pub fn set_event_notification_mode(&self, enable: bool, event_type: u32) -> Result<(), JvmtiError> {
        let set_mode_fn = self
            .functions()
            .SetEventNotificationMode
            .ok_or(JvmtiError::MissingFunction("SetEventNotificationMode"))?;
        let mode = if enable { jvmti::JVMTI_ENABLE } else { jvmti::JVMTI_DISABLE };
        check("SetEventNotificationMode", unsafe {
            set_mode_fn(self.env, mode, event_type, ptr::null_mut())
        })
    }

    pub fn allocate(&self, size: jni::jlong) -> Result<*mut u8, JvmtiError> {
        let allocate_fn = self
            .functions()
            .Allocate
            .ok_or(JvmtiError::MissingFunction("Allocate"))?;
        let mut mem_ptr: *mut u8 = ptr::null_mut();
        check("Allocate", unsafe { allocate_fn(self.env, size, &mut mem_ptr) })?;
        Ok(mem_ptr)
    }

    /// Copies `bytes` into JVMTI-allocated memory, which is what
    /// `ClassFileLoadHook` requires for `new_class_data`. The VM frees it.
    pub fn install_bytes(&self, bytes: &[u8]) -> Result<(jni::jint, *mut u8), JvmtiError> {
        let len = jni::jint::try_from(bytes.len()).map_err(|_| JvmtiError::TooLarge(bytes.len()))?;
        let mem = self.allocate(jni::jlong::from(len))?;
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), mem, bytes.len()) };
        Ok((len, mem))
    }
}
