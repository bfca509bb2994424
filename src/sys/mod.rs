//! Raw FFI declarations for the slice of JNI and JVMTI the agent talks to.
//!
//! Only the entry points the agent calls are typed; every other vtable slot
//! is padding so the layout still matches `jni.h` / `jvmti.h`.

pub mod jni;
pub mod jvmti;
