//! Log line templates for instrumented methods.
//!
//! A [`Fragment`] describes one call log line as a sequence of pieces; it
//! knows nothing about bytecode. The weaver compiles each piece into
//! `StringBuilder.append` calls, tests and diagnostics render it with
//! `$1..$n` placeholders.
//!
//! ```text
//! {timestamp} [{thread}] DebugAgent InetAddress::getByName($1) => $_
//! {timestamp} [{thread}] DebugAgent InetAddress::getByName($1) => $ex
//! ```

use crate::descriptor::JvmType;
use std::fmt;

/// Product tag between the thread name and the method.
pub const PRODUCT_TAG: &str = "DebugAgent";

/// `java.time.format.DateTimeFormatter` pattern of the timestamp piece.
pub const TIMESTAMP_PATTERN: &str = "yyyy-MM-dd HH:mm:ss.SSS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Piece {
    Timestamp,
    ThreadName,
    Text(String),
    /// Zero-based parameter position, not counting `this`.
    Argument { index: usize, ty: JvmType },
    ReturnValue(JvmType),
    Thrown,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fragment {
    pieces: Vec<Piece>,
}

impl Fragment {
    pub fn pieces(&self) -> &[Piece] {
        &self.pieces
    }

    fn push(&mut self, piece: Piece) {
        if let Piece::Text(text) = &piece {
            if text.is_empty() {
                return;
            }
            if let Some(Piece::Text(last)) = self.pieces.last_mut() {
                last.push_str(text);
                return;
            }
        }
        self.pieces.push(piece);
    }

    fn text(&mut self, text: &str) {
        self.push(Piece::Text(text.to_string()));
    }
}

impl fmt::Display for Fragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for piece in &self.pieces {
            match piece {
                Piece::Timestamp => f.write_str("{timestamp}")?,
                Piece::ThreadName => f.write_str("{thread}")?,
                Piece::Text(text) => f.write_str(text)?,
                Piece::Argument { index, .. } => write!(f, "${}", index + 1)?,
                Piece::ReturnValue(_) => f.write_str("$_")?,
                Piece::Thrown => f.write_str("$ex")?,
            }
        }
        Ok(())
    }
}

/// The shape shared by the success and failure lines of one method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogTemplate {
    owner_simple_name: String,
    method_name: String,
    params: Vec<JvmType>,
}

impl LogTemplate {
    pub fn new(owner_simple_name: &str, method_name: &str, params: Vec<JvmType>) -> Self {
        Self {
            owner_simple_name: owner_simple_name.to_string(),
            method_name: method_name.to_string(),
            params,
        }
    }

    fn prefix(&self) -> Fragment {
        let mut fragment = Fragment::default();
        fragment.push(Piece::Timestamp);
        fragment.text(" [");
        fragment.push(Piece::ThreadName);
        fragment.text(&format!("] {PRODUCT_TAG} {}::{}(", self.owner_simple_name, self.method_name));
        for (index, ty) in self.params.iter().enumerate() {
            if index > 0 {
                fragment.text(", ");
            }
            fragment.push(Piece::Argument { index, ty: ty.clone() });
        }
        fragment.text(") => ");
        fragment
    }

    /// Line logged after a normal return. `void` methods show `null`.
    pub fn success(&self, return_type: &JvmType) -> Fragment {
        let mut fragment = self.prefix();
        match return_type {
            JvmType::Void => fragment.text("null"),
            ty => fragment.push(Piece::ReturnValue(ty.clone())),
        }
        fragment
    }

    /// Line logged when the method throws.
    pub fn failure(&self) -> Fragment {
        let mut fragment = self.prefix();
        fragment.push(Piece::Thrown);
        fragment
    }
}
