//! The seam between "what to log" and "how bytecode is rewritten".
//!
//! [`crate::instrument::instrument_class`] only talks to a [`ClassEditor`], so
//! selector matching, templating and failure isolation are testable with a
//! mock editor. [`crate::weaver::ClassFileEditor`] is the real one.

use crate::classfile::ClassFileError;
use crate::descriptor::{JvmType, MethodDescriptor};
use crate::error::AgentError;
use crate::fragment::Fragment;

pub trait ClassEditor {
    /// Handle to a method declared by the class being edited.
    type Method: Copy;

    /// Dotted binary name of the class, e.g. `java.net.InetAddress`.
    fn class_name(&self) -> String;

    /// First declared method with this name and exactly these parameter
    /// types. Return types are ignored; constructors and static
    /// initializers never match.
    fn find_method(&self, name: &str, params: &[JvmType]) -> Option<Self::Method>;

    fn method_descriptor(&self, method: Self::Method) -> Result<MethodDescriptor, AgentError>;

    /// Runs `fragment` after every normal return, before the value reaches
    /// the caller.
    fn insert_after(&mut self, method: Self::Method, fragment: Fragment) -> Result<(), AgentError>;

    /// Runs `fragment` when the body throws an instance of `exception_class`
    /// (dotted name), then rethrows the same exception object.
    fn add_catch(&mut self, method: Self::Method, fragment: Fragment, exception_class: &str) -> Result<(), AgentError>;

    /// Drops every fragment planned for `method`, leaving it as loaded.
    fn revert(&mut self, method: Self::Method);

    fn to_bytecode(self) -> Result<Vec<u8>, ClassFileError>;
}
